//! Transaction timers.
//!
//! RFC 3261 defines the timers that drive retransmission and timeout for the
//! four transaction state machines:
//!
//! ## Client Transaction Timers
//! - **Timer A** (INVITE): request retransmission, unreliable transports only
//! - **Timer B** (INVITE): transaction timeout
//! - **Timer D** (INVITE): wait time for response retransmissions
//! - **Timer E** (non-INVITE): request retransmission, unreliable transports only
//! - **Timer F** (non-INVITE): transaction timeout
//! - **Timer K** (non-INVITE): wait time for response retransmissions
//!
//! ## Server Transaction Timers
//! - **Timer G** (INVITE): response retransmission
//! - **Timer H** (INVITE): wait time for ACK
//! - **Timer I** (INVITE): wait time in Confirmed state
//! - **Timer J** (non-INVITE): wait time for request retransmissions
//!
//! plus the 200 ms timer after which an INVITE server transaction answers
//! `100 Trying` on the TU's behalf.
//!
//! A [`TimerSet`] schedules each timer as a tokio task that posts a
//! [`Command::Timer`] back into the owning transaction's command channel.
//! Every start bumps a generation counter and the runner drops firings whose
//! generation is no longer current, so a timer cancelled while it was
//! already firing never applies a transition.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::config::StackConfig;
use crate::transaction::runner::Command;

/// Delay before an INVITE server transaction sends `100 Trying` itself
pub const TRYING_TIMER_DELAY: Duration = Duration::from_millis(200);

/// Timer D on unreliable transports (RFC 3261 Section 17.1.1.2)
pub const TIMER_D_UNRELIABLE: Duration = Duration::from_secs(32);

/// Identifies a transaction timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerType {
    A,
    B,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
    /// Automatic `100 Trying`
    Trying,
}

impl TimerType {
    /// True for the timers whose expiry is reported to the TU as a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TimerType::B | TimerType::F | TimerType::H)
    }
}

impl fmt::Display for TimerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerType::Trying => f.write_str("100Trying"),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

/// Timer durations for one transaction, derived from [`StackConfig`] and the
/// reliability of the transport it runs over.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimerSettings {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
    pub invite_retransmit_cap: Option<Duration>,
    pub non_invite_retransmit_cap: Duration,
    pub transaction_timeout: Duration,
    pub reliable: bool,
}

impl TimerSettings {
    pub fn new(config: &StackConfig, reliable: bool) -> Self {
        Self {
            t1: config.t1,
            t2: config.t2,
            t4: config.t4,
            invite_retransmit_cap: config.invite_retransmit_cap,
            non_invite_retransmit_cap: config.non_invite_retransmit_cap,
            transaction_timeout: config.transaction_timeout,
            reliable,
        }
    }

    /// Next Timer A interval: doubles, bounded by the optional cap.
    pub fn next_timer_a(&self, current: Duration) -> Duration {
        let doubled = current * 2;
        match self.invite_retransmit_cap {
            Some(cap) => doubled.min(cap),
            None => doubled,
        }
    }

    /// Next Timer E interval. Doubles up to the cap while Trying, and stays
    /// at the cap once a provisional response has arrived.
    pub fn next_timer_e(&self, current: Duration, proceeding: bool) -> Duration {
        if proceeding {
            self.non_invite_retransmit_cap
        } else {
            (current * 2).min(self.non_invite_retransmit_cap)
        }
    }

    /// Next Timer G interval: doubles, bounded by T2.
    pub fn next_timer_g(&self, current: Duration) -> Duration {
        (current * 2).min(self.t2)
    }

    /// Timers B, F and H.
    pub fn timeout(&self) -> Duration {
        self.transaction_timeout
    }

    pub fn timer_d(&self) -> Duration {
        if self.reliable {
            Duration::ZERO
        } else {
            TIMER_D_UNRELIABLE
        }
    }

    /// Timers I and K.
    pub fn timer_i(&self) -> Duration {
        if self.reliable {
            Duration::ZERO
        } else {
            self.t4
        }
    }

    pub fn timer_k(&self) -> Duration {
        self.timer_i()
    }

    pub fn timer_j(&self) -> Duration {
        if self.reliable {
            Duration::ZERO
        } else {
            self.transaction_timeout
        }
    }
}

/// Active timers of one transaction.
pub(crate) struct TimerSet {
    commands: mpsc::UnboundedSender<Command>,
    active: HashMap<TimerType, (u64, JoinHandle<()>)>,
    generation: u64,
}

impl TimerSet {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            commands,
            active: HashMap::new(),
            generation: 0,
        }
    }

    /// Starts (or restarts) a timer.
    pub(crate) fn start(&mut self, timer: TimerType, duration: Duration) {
        self.cancel(timer);
        self.generation += 1;
        let generation = self.generation;
        let commands = self.commands.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = commands.send(Command::Timer { timer, generation });
        });
        trace!(%timer, ?duration, generation, "Timer started");
        self.active.insert(timer, (generation, handle));
    }

    pub(crate) fn cancel(&mut self, timer: TimerType) {
        if let Some((_, handle)) = self.active.remove(&timer) {
            handle.abort();
        }
    }

    pub(crate) fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.active.drain() {
            handle.abort();
        }
    }

    /// Accepts a firing if it belongs to the current generation of that
    /// timer. The timer is no longer active afterwards.
    pub(crate) fn take_fired(&mut self, timer: TimerType, generation: u64) -> bool {
        match self.active.get(&timer) {
            Some((current, _)) if *current == generation => {
                self.active.remove(&timer);
                true
            }
            _ => false,
        }
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_intervals() {
        let config = StackConfig::default();
        let settings = TimerSettings::new(&config, false);
        let t1 = config.t1;

        assert_eq!(settings.next_timer_a(t1), t1 * 2);
        assert_eq!(settings.next_timer_a(Duration::from_secs(2)), config.t2);
        assert_eq!(settings.next_timer_a(Duration::from_secs(4)), config.t2);
        assert_eq!(settings.next_timer_e(Duration::from_secs(2), false), Duration::from_secs(4));
        assert_eq!(settings.next_timer_e(Duration::from_secs(4), false), Duration::from_secs(4));
        assert_eq!(settings.next_timer_e(t1, true), config.t2);
        assert_eq!(settings.next_timer_g(Duration::from_secs(4)), config.t2);
        assert_eq!(settings.timer_d(), TIMER_D_UNRELIABLE);
        assert_eq!(settings.timer_k(), config.t4);
        assert_eq!(settings.timer_j(), Duration::from_secs(32));

        let uncapped = TimerSettings::new(&config.clone().with_invite_retransmit_cap(None), false);
        assert_eq!(uncapped.next_timer_a(Duration::from_secs(16)), Duration::from_secs(32));
    }

    #[test]
    fn test_reliable_transport_zeroes_wait_timers() {
        let settings = TimerSettings::new(&StackConfig::default(), true);
        assert_eq!(settings.timer_d(), Duration::ZERO);
        assert_eq!(settings.timer_i(), Duration::ZERO);
        assert_eq!(settings.timer_j(), Duration::ZERO);
        assert_eq!(settings.timeout(), Duration::from_secs(32));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarted_timer_ignores_stale_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerSet::new(tx);

        timers.start(TimerType::E, Duration::from_millis(500));
        // Let the first timer fire, then restart before its command is consumed.
        tokio::time::sleep(Duration::from_millis(600)).await;
        timers.start(TimerType::E, Duration::from_millis(500));

        let stale = match rx.recv().await {
            Some(Command::Timer { timer, generation }) => (timer, generation),
            _ => panic!("expected timer command"),
        };
        assert!(!timers.take_fired(stale.0, stale.1));

        let current = match rx.recv().await {
            Some(Command::Timer { timer, generation }) => (timer, generation),
            _ => panic!("expected timer command"),
        };
        assert!(timers.take_fired(current.0, current.1));
        // A fired timer is no longer active, so a duplicate is refused.
        assert!(!timers.take_fired(current.0, current.1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerSet::new(tx);

        timers.start(TimerType::B, Duration::from_secs(32));
        timers.cancel(TimerType::B);
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(rx.try_recv().is_err());
    }
}

//! Stack configuration
//!
//! [`StackConfig`] carries the RFC 3261 timer base values, the retransmission
//! caps, the dialog policies and the identity headers the stack stamps on
//! outgoing requests. It deserializes from any serde format with every field
//! optional; durations are expressed in milliseconds.
//!
//! ```rust
//! use std::time::Duration;
//! use sipstack_dialog_core::config::{DialogCleanupPolicy, StackConfig};
//!
//! let config = StackConfig::default()
//!     .with_t1(Duration::from_millis(250))
//!     .with_cleanup_policy(DialogCleanupPolicy::Aggressive)
//!     .with_user_agent("softphone/1.0");
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.transaction_timeout, Duration::from_secs(32));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// RFC 3261 T1: round-trip time estimate
pub const DEFAULT_T1: Duration = Duration::from_millis(500);
/// RFC 3261 T2: maximum retransmit interval for non-INVITE requests and INVITE responses
pub const DEFAULT_T2: Duration = Duration::from_secs(4);
/// RFC 3261 T4: maximum time a message remains in the network
pub const DEFAULT_T4: Duration = Duration::from_secs(5);

/// What happens to dialogs that outlive their usefulness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogCleanupPolicy {
    /// Dialogs live until they are deleted, answered with a BYE, or time out.
    #[default]
    Standard,
    /// Early siblings of a confirmed forked INVITE are evicted when the
    /// forking window closes, and a dialog drops its retained INVITE once
    /// the ACK has been sent.
    Aggressive,
}

/// Configuration for a [`SipStack`](crate::stack::SipStack) and all its providers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    #[serde(with = "duration_ms")]
    pub t1: Duration,
    #[serde(with = "duration_ms")]
    pub t2: Duration,
    #[serde(with = "duration_ms")]
    pub t4: Duration,

    /// Upper bound for the Timer A interval (T2 by default). `None` lets it
    /// double without limit until Timer B fires.
    #[serde(with = "option_duration_ms")]
    pub invite_retransmit_cap: Option<Duration>,

    /// Upper bound for the Timer E interval (T2 in RFC 3261).
    #[serde(with = "duration_ms")]
    pub non_invite_retransmit_cap: Duration,

    /// Timers B, F, H and J (64*T1 by default).
    #[serde(with = "duration_ms")]
    pub transaction_timeout: Duration,

    /// How long a UAS waits for the ACK of its 2xx before giving up on the dialog.
    #[serde(with = "duration_ms")]
    pub dialog_timeout: Duration,

    /// How long after the first 2xx further forked 2xx responses still create dialogs.
    #[serde(with = "duration_ms")]
    pub forking_window: Duration,

    /// Create and track dialogs automatically from dialog-forming exchanges.
    pub automatic_dialog_support: bool,

    /// Create server transactions automatically for incoming requests.
    pub automatic_transaction_creation: bool,

    /// Send `100 Trying` for INVITEs the TU has not answered within 200 ms.
    pub auto_100_trying: bool,

    /// Default for [`Dialog::set_terminate_on_bye`](crate::dialog::Dialog::set_terminate_on_bye).
    pub terminate_dialog_on_bye: bool,

    pub cleanup_policy: DialogCleanupPolicy,

    /// User-Agent header for requests built by dialogs
    pub user_agent: Option<String>,

    /// Max-Forwards for requests built by dialogs
    pub max_forwards: u32,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            t1: DEFAULT_T1,
            t2: DEFAULT_T2,
            t4: DEFAULT_T4,
            invite_retransmit_cap: Some(DEFAULT_T2),
            non_invite_retransmit_cap: DEFAULT_T2,
            transaction_timeout: DEFAULT_T1 * 64,
            dialog_timeout: DEFAULT_T1 * 64,
            forking_window: DEFAULT_T1 * 64,
            automatic_dialog_support: true,
            automatic_transaction_creation: true,
            auto_100_trying: true,
            terminate_dialog_on_bye: true,
            cleanup_policy: DialogCleanupPolicy::Standard,
            user_agent: Some(concat!("sipstack/", env!("CARGO_PKG_VERSION")).to_string()),
            max_forwards: 70,
        }
    }
}

impl StackConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets T1 and rescales the timeouts that default to 64*T1.
    pub fn with_t1(mut self, t1: Duration) -> Self {
        self.t1 = t1;
        self.transaction_timeout = t1 * 64;
        self.dialog_timeout = t1 * 64;
        self.forking_window = t1 * 64;
        self
    }

    /// Sets T2 and the retransmission caps that follow it.
    pub fn with_t2(mut self, t2: Duration) -> Self {
        self.t2 = t2;
        self.non_invite_retransmit_cap = t2;
        if self.invite_retransmit_cap.is_some() {
            self.invite_retransmit_cap = Some(t2);
        }
        self
    }

    pub fn with_t4(mut self, t4: Duration) -> Self {
        self.t4 = t4;
        self
    }

    pub fn with_invite_retransmit_cap(mut self, cap: Option<Duration>) -> Self {
        self.invite_retransmit_cap = cap;
        self
    }

    pub fn with_non_invite_retransmit_cap(mut self, cap: Duration) -> Self {
        self.non_invite_retransmit_cap = cap;
        self
    }

    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn with_dialog_timeout(mut self, timeout: Duration) -> Self {
        self.dialog_timeout = timeout;
        self
    }

    pub fn with_forking_window(mut self, window: Duration) -> Self {
        self.forking_window = window;
        self
    }

    pub fn with_automatic_dialog_support(mut self, enabled: bool) -> Self {
        self.automatic_dialog_support = enabled;
        self
    }

    pub fn with_automatic_transaction_creation(mut self, enabled: bool) -> Self {
        self.automatic_transaction_creation = enabled;
        self
    }

    pub fn with_auto_100_trying(mut self, enabled: bool) -> Self {
        self.auto_100_trying = enabled;
        self
    }

    pub fn with_terminate_dialog_on_bye(mut self, enabled: bool) -> Self {
        self.terminate_dialog_on_bye = enabled;
        self
    }

    pub fn with_cleanup_policy(mut self, policy: DialogCleanupPolicy) -> Self {
        self.cleanup_policy = policy;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_max_forwards(mut self, max_forwards: u32) -> Self {
        self.max_forwards = max_forwards;
        self
    }

    /// Checks that all configuration values are valid and consistent.
    pub fn validate(&self) -> Result<()> {
        if self.t1.is_zero() {
            return Err(Error::Configuration("T1 must be greater than 0".to_string()));
        }
        if self.t2 < self.t1 {
            return Err(Error::Configuration(format!(
                "T2 ({:?}) must not be shorter than T1 ({:?})",
                self.t2, self.t1
            )));
        }
        if self.t4.is_zero() {
            return Err(Error::Configuration("T4 must be greater than 0".to_string()));
        }
        if self.non_invite_retransmit_cap < self.t1 {
            return Err(Error::Configuration(
                "Non-INVITE retransmit cap must not be shorter than T1".to_string(),
            ));
        }
        if matches!(self.invite_retransmit_cap, Some(cap) if cap < self.t1) {
            return Err(Error::Configuration(
                "INVITE retransmit cap must not be shorter than T1".to_string(),
            ));
        }
        for (name, value) in [
            ("Transaction timeout", self.transaction_timeout),
            ("Dialog timeout", self.dialog_timeout),
            ("Forking window", self.forking_window),
        ] {
            if value.is_zero() {
                return Err(Error::Configuration(format!("{} must be greater than 0", name)));
            }
        }
        if self.max_forwards == 0 {
            return Err(Error::Configuration("Max-Forwards must be greater than 0".to_string()));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_rfc3261() {
        let config = StackConfig::default();
        assert_eq!(config.t1, Duration::from_millis(500));
        assert_eq!(config.t2, Duration::from_secs(4));
        assert_eq!(config.t4, Duration::from_secs(5));
        assert_eq!(config.transaction_timeout, Duration::from_secs(32));
        assert_eq!(config.non_invite_retransmit_cap, config.t2);
        assert_eq!(config.invite_retransmit_cap, Some(config.t2));
        assert_eq!(config.cleanup_policy, DialogCleanupPolicy::Standard);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_with_t1_rescales_timeouts() {
        let config = StackConfig::new().with_t1(Duration::from_millis(100));
        assert_eq!(config.transaction_timeout, Duration::from_millis(6400));
        assert_eq!(config.dialog_timeout, Duration::from_millis(6400));
        assert_eq!(config.forking_window, Duration::from_millis(6400));
    }

    #[test]
    fn test_with_t2_moves_both_caps() {
        let config = StackConfig::new().with_t2(Duration::from_secs(8));
        assert_eq!(config.non_invite_retransmit_cap, Duration::from_secs(8));
        assert_eq!(config.invite_retransmit_cap, Some(Duration::from_secs(8)));

        let uncapped = StackConfig::new()
            .with_invite_retransmit_cap(None)
            .with_t2(Duration::from_secs(8));
        assert_eq!(uncapped.invite_retransmit_cap, None);

        let config: StackConfig =
            serde_json::from_str(r#"{ "invite_retransmit_cap": null }"#).unwrap();
        assert_eq!(config.invite_retransmit_cap, None);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(StackConfig::new().with_t1(Duration::ZERO).validate().is_err());
        assert!(StackConfig::new()
            .with_t2(Duration::from_millis(100))
            .validate()
            .is_err());
        assert!(StackConfig::new()
            .with_transaction_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(StackConfig::new()
            .with_dialog_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(matches!(
            StackConfig::new().with_forking_window(Duration::ZERO).validate(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_deserialize_partial_config_in_milliseconds() {
        let config: StackConfig = serde_json::from_str(
            r#"{ "t1": 250, "invite_retransmit_cap": 2000, "cleanup_policy": "aggressive" }"#,
        )
        .unwrap();
        assert_eq!(config.t1, Duration::from_millis(250));
        assert_eq!(config.invite_retransmit_cap, Some(Duration::from_secs(2)));
        assert_eq!(config.cleanup_policy, DialogCleanupPolicy::Aggressive);
        assert_eq!(config.t2, DEFAULT_T2);

        let text = serde_json::to_string(&config).unwrap();
        assert!(text.contains("\"t1\":250"));
    }
}

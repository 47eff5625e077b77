//! Dialog layer (RFC 3261 Sections 12 and 13).
//!
//! Runs inline with dispatch and with server responses so dialog state is
//! updated before the TU hears about the message that changed it:
//!
//! - UAC: tagged 101-299 responses create or confirm dialogs, one per remote
//!   tag of a forked INVITE. Late forked 2xx responses still create dialogs
//!   through the fork table until the forking window closes.
//! - UAS: responses sent through a server transaction create dialogs; a 2xx
//!   to INVITE is retransmitted until its ACK arrives or the dialog times out.
//! - Terminal transitions emit exactly one event and drop the dialog from
//!   both tables.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use sipstack_sip_core::{Address, HeaderAccess, Method, Request, Response, StatusCode};

use super::{AnsweredInvite, MergeKey, ProviderInner};
use crate::config::DialogCleanupPolicy;
use crate::dialog::dialog_impl::DialogData;
use crate::dialog::{Dialog, DialogId, DialogKey, DialogState};
use crate::errors::{Error, Result};
use crate::events::{ResponseEvent, SipEvent};
use crate::transaction::utils::resolve_request_destination;
use crate::transaction::{ClientTransaction, ServerTransaction, SipTransaction, TransactionKey};

/// Identity of a client INVITE across all its forks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ForkKey {
    pub call_id: String,
    pub from_tag: String,
    pub cseq: u32,
}

impl ForkKey {
    pub fn from_request(request: &Request) -> Option<Self> {
        Some(Self {
            call_id: request.call_id()?.to_string(),
            from_tag: request.from_tag()?,
            cseq: request.cseq().ok()?.seq,
        })
    }

    pub fn from_response(response: &Response) -> Option<Self> {
        Some(Self {
            call_id: response.call_id()?.to_string(),
            from_tag: response.from_tag()?,
            cseq: response.cseq().ok()?.seq,
        })
    }
}

/// An initial INVITE whose forks may still create dialogs.
#[derive(Debug, Clone)]
pub(crate) struct ForkContext {
    pub request: Request,
    pub transaction: TransactionKey,
    pub dialogs: Vec<DialogId>,
    /// First 2xx received; the forking window is running
    pub confirmed: bool,
}

/// What dispatch does with a response for a live client transaction.
pub(crate) enum ResponseOutcome {
    Feed(Option<Dialog>),
    /// Handled here; the transaction never sees it
    Consumed,
}

pub(crate) enum AckOutcome {
    Deliver(Option<Dialog>),
    Absorb,
}

pub(crate) enum InDialogOutcome {
    Accepted(Dialog),
    Rejected(StatusCode),
}

/// Dialog touched by a response a server transaction is about to send.
pub(crate) struct ServerDialogUpdate {
    dialog: Dialog,
    /// The response created the dialog
    created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Termination {
    Terminated,
    /// The ACK for a 2xx never arrived
    TimedOut,
}

fn is_dialog_forming(method: &Method) -> bool {
    matches!(method, Method::Invite | Method::Subscribe | Method::Refer)
}

fn is_initial(request: &Request) -> bool {
    request.to_tag().is_none() && is_dialog_forming(&request.method)
}

fn is_dialog_creating(status: StatusCode) -> bool {
    (101..=299).contains(&status.as_u16())
}

fn missing_tag(header: &str) -> Error {
    Error::Parse(sipstack_sip_core::Error::InvalidHeader {
        name: header.to_string(),
        reason: "tag parameter missing".to_string(),
    })
}

/// Remembers an initial INVITE so late forked 2xx responses can be matched.
pub(crate) fn register_fork(inner: &ProviderInner, transaction: &ClientTransaction) {
    let request = transaction.request();
    if !is_initial(request) {
        return;
    }
    if let Some(fork_key) = ForkKey::from_request(request) {
        inner.forks.insert(
            fork_key,
            ForkContext {
                request: request.clone(),
                transaction: transaction.key().clone(),
                dialogs: Vec::new(),
                confirmed: false,
            },
        );
    }
}

fn create_uac_dialog(
    inner: &Arc<ProviderInner>,
    request: &Request,
    response: &Response,
    state: DialogState,
    transaction: TransactionKey,
) -> Result<Dialog> {
    let local_address = request.from_header()?;
    let remote_address = response.to_header()?;
    let local_tag = local_address.tag().ok_or_else(|| missing_tag("From"))?.to_string();
    let remote_tag = remote_address.tag().ok_or_else(|| missing_tag("To"))?.to_string();
    let call_id = request
        .call_id()
        .ok_or_else(|| sipstack_sip_core::Error::MissingHeader("Call-ID".into()))?
        .to_string();

    let remote_target = response
        .contact()
        .map(|contact| contact.uri)
        .unwrap_or_else(|| request.uri.clone());
    let route_set: Vec<Address> = response.record_routes()?.into_iter().rev().collect();

    let mut confirmed_invites = HashSet::new();
    let cseq = request.cseq()?.seq;
    if state == DialogState::Confirmed && request.method == Method::Invite {
        confirmed_invites.insert(cseq);
    }

    Ok(Dialog::new(
        DialogData {
            state,
            call_id,
            local_address,
            remote_address,
            local_tag,
            remote_tag,
            local_cseq: cseq,
            remote_cseq: None,
            remote_target,
            route_set,
            is_server: false,
            initial_transaction: Some(transaction),
            terminate_on_bye: inner.config.terminate_dialog_on_bye,
            confirmed_invites,
            acks: HashMap::new(),
            pending_ack: None,
            answered_invites: Vec::new(),
            retransmission: None,
            invite: (request.method == Method::Invite).then(|| request.clone()),
            application_data: None,
        },
        Arc::downgrade(inner),
    ))
}

fn create_uas_dialog(
    inner: &Arc<ProviderInner>,
    transaction: &ServerTransaction,
    local_tag: &str,
    state: DialogState,
) -> Result<Dialog> {
    let request = transaction.request();
    let mut local_address = request.to_header()?;
    local_address.set_tag(local_tag);
    let remote_address = request.from_header()?;
    let remote_tag = remote_address.tag().ok_or_else(|| missing_tag("From"))?.to_string();
    let call_id = request
        .call_id()
        .ok_or_else(|| sipstack_sip_core::Error::MissingHeader("Call-ID".into()))?
        .to_string();

    let remote_target = request
        .contact()
        .map(|contact| contact.uri)
        .unwrap_or_else(|| remote_address.uri.clone());

    Ok(Dialog::new(
        DialogData {
            state,
            call_id,
            local_address,
            remote_address,
            local_tag: local_tag.to_string(),
            remote_tag,
            local_cseq: 0,
            remote_cseq: Some(request.cseq()?.seq),
            remote_target,
            route_set: request.record_routes()?,
            is_server: true,
            initial_transaction: Some(transaction.key().clone()),
            terminate_on_bye: inner.config.terminate_dialog_on_bye,
            confirmed_invites: HashSet::new(),
            acks: HashMap::new(),
            pending_ack: None,
            answered_invites: Vec::new(),
            retransmission: None,
            invite: (request.method == Method::Invite).then(|| request.clone()),
            application_data: None,
        },
        Arc::downgrade(inner),
    ))
}

/// Adds `dialog` to both tables. When another dialog already owns its key
/// that one is returned instead.
fn insert_dialog(inner: &ProviderInner, dialog: Dialog) -> Dialog {
    let id = dialog.id();
    match inner.dialog_keys.entry(dialog.key()) {
        Entry::Occupied(mut entry) => {
            if let Some(existing) = inner.dialog(entry.get()) {
                return existing;
            }
            entry.insert(id);
        }
        Entry::Vacant(entry) => {
            entry.insert(id);
        }
    }
    inner.dialogs.insert(id, dialog.clone());
    info!(dialog = %id, key = %dialog.key(), state = %dialog.state(), "Dialog created");
    dialog
}

fn add_fork_dialog(inner: &ProviderInner, fork_key: &ForkKey, id: DialogId) {
    if let Some(mut fork) = inner.forks.get_mut(fork_key) {
        if !fork.dialogs.contains(&id) {
            fork.dialogs.push(id);
        }
    }
}

fn fork_confirmed(inner: &ProviderInner, fork_key: &ForkKey) -> bool {
    inner
        .forks
        .get(fork_key)
        .map(|fork| fork.confirmed)
        .unwrap_or(false)
}

/// Marks the fork as answered and starts its forking window on the first 2xx.
fn confirm_fork(inner: &Arc<ProviderInner>, fork_key: &ForkKey) {
    let first = match inner.forks.get_mut(fork_key) {
        Some(mut fork) => !std::mem::replace(&mut fork.confirmed, true),
        None => false,
    };
    if !first {
        return;
    }

    let provider = Arc::downgrade(inner);
    let window = inner.config.forking_window;
    let fork_key = fork_key.clone();
    tokio::spawn(async move {
        sleep(window).await;
        let Some(inner) = provider.upgrade() else {
            return;
        };
        let Some((_, fork)) = inner.forks.remove(&fork_key) else {
            return;
        };
        debug!(call_id = %fork_key.call_id, dialogs = fork.dialogs.len(), "Forking window closed");
        if inner.config.cleanup_policy == DialogCleanupPolicy::Aggressive {
            for id in fork.dialogs {
                if let Some(dialog) = inner.dialog(&id) {
                    if dialog.state() == DialogState::Early {
                        terminate_dialog(&inner, &dialog, "forking window closed", Termination::Terminated);
                    }
                }
            }
        }
    });
}

fn terminate_early_dialogs(inner: &ProviderInner, fork_key: &ForkKey, reason: &str) {
    let dialogs = inner
        .forks
        .get(fork_key)
        .map(|fork| fork.dialogs.clone())
        .unwrap_or_default();
    for id in dialogs {
        if let Some(dialog) = inner.dialog(&id) {
            if dialog.state() == DialogState::Early {
                terminate_dialog(inner, &dialog, reason, Termination::Terminated);
            }
        }
    }
}

fn terminate_bound_early_dialog(inner: &ProviderInner, transaction: &ClientTransaction, reason: &str) {
    if let Some(dialog) = transaction.dialog_id().and_then(|id| inner.dialog(&id)) {
        if dialog.state() == DialogState::Early {
            terminate_dialog(inner, &dialog, reason, Termination::Terminated);
        }
    }
}

/// Updates dialog state for a response matched to a live client
/// transaction.
pub(crate) async fn on_client_response(
    inner: &Arc<ProviderInner>,
    transaction: &ClientTransaction,
    response: &Response,
    source: SocketAddr,
) -> Result<ResponseOutcome> {
    let request = transaction.request();
    let status = response.status;
    let method = &request.method;

    if is_initial(request) {
        let fork_key = ForkKey::from_request(request);
        if status.is_success()
            && *method == Method::Invite
            && fork_key.as_ref().is_some_and(|key| fork_confirmed(inner, key))
        {
            // Another fork already answered; the transaction is done with 2xx.
            on_stray_response(inner, response.clone(), source).await?;
            return Ok(ResponseOutcome::Consumed);
        }

        if is_dialog_creating(status) && response.to_tag().is_some() {
            let state = if status.is_success() {
                DialogState::Confirmed
            } else {
                DialogState::Early
            };
            let key = DialogKey::new(
                request.call_id().unwrap_or_default(),
                request.from_tag().ok_or_else(|| missing_tag("From"))?,
                response.to_tag().unwrap_or_default(),
            );
            let dialog = match inner.find_dialog(&key) {
                Some(dialog) => dialog,
                None => insert_dialog(
                    inner,
                    create_uac_dialog(inner, request, response, state, transaction.key().clone())?,
                ),
            };
            if status.is_success() {
                confirm_uac_dialog(&dialog, request, response)?;
            }
            transaction.bind_dialog_if_unset(dialog.id());

            if let Some(fork_key) = &fork_key {
                add_fork_dialog(inner, fork_key, dialog.id());
                if status.is_success() && *method == Method::Invite {
                    confirm_fork(inner, fork_key);
                }
            }
            return Ok(ResponseOutcome::Feed(Some(dialog)));
        }

        if status.is_failure() {
            let reason = format!("initial request rejected with {}", status);
            if let Some(fork_key) = &fork_key {
                terminate_early_dialogs(inner, fork_key, &reason);
            }
            terminate_bound_early_dialog(inner, transaction, &reason);
        }
        return Ok(ResponseOutcome::Feed(None));
    }

    let dialog = transaction
        .dialog_id()
        .and_then(|id| inner.dialog(&id))
        .or_else(|| {
            let key = DialogKey::new(
                response.call_id()?,
                response.from_tag()?,
                response.to_tag()?,
            );
            inner.find_dialog(&key)
        });

    if let Some(dialog) = &dialog {
        let seq = response.cseq()?.seq;
        if status.is_success() {
            match method {
                Method::Invite => dialog.with_data(|data| {
                    data.confirmed_invites.insert(seq);
                    if let Some(contact) = response.contact() {
                        data.remote_target = contact.uri;
                    }
                }),
                Method::Bye if dialog.terminate_on_bye() => {
                    terminate_dialog(inner, dialog, "BYE completed", Termination::Terminated)
                }
                _ => {}
            }
        } else if status == StatusCode::CALL_TRANSACTION_DOES_NOT_EXIST
            || status == StatusCode::REQUEST_TIMEOUT
        {
            terminate_dialog(
                inner,
                dialog,
                &format!("in-dialog {} failed with {}", method, status),
                Termination::Terminated,
            );
        }
    }
    Ok(ResponseOutcome::Feed(dialog))
}

/// Early → Confirmed on a 2xx; the UAC takes remote target and route set
/// from the 2xx (RFC 3261 Section 13.2.2.4).
fn confirm_uac_dialog(dialog: &Dialog, request: &Request, response: &Response) -> Result<()> {
    let route_set: Vec<Address> = response.record_routes()?.into_iter().rev().collect();
    let seq = request.cseq()?.seq;
    dialog.with_data(|data| {
        if data.state == DialogState::Early {
            data.state = DialogState::Confirmed;
            data.route_set = route_set;
            if let Some(contact) = response.contact() {
                data.remote_target = contact.uri;
            }
            debug!(key = %data.key(), "Dialog confirmed");
        }
        if request.method == Method::Invite {
            data.confirmed_invites.insert(seq);
        }
    });
    Ok(())
}

/// A 2xx to INVITE with no live client transaction: a retransmission, or a
/// forked answer arriving after the transaction terminated.
pub(crate) async fn on_stray_response(
    inner: &Arc<ProviderInner>,
    response: Response,
    source: SocketAddr,
) -> Result<()> {
    let (Some(call_id), Some(local_tag), Some(remote_tag)) =
        (response.call_id(), response.from_tag(), response.to_tag())
    else {
        debug!(status = %response.status, "Dropping untagged stray response");
        return Ok(());
    };
    let key = DialogKey::new(call_id, local_tag, remote_tag);
    let seq = response.cseq()?.seq;

    if let Some(dialog) = inner.find_dialog(&key) {
        enum Action {
            Deliver,
            ResendAck(Request),
            Absorb,
        }
        let route_set: Vec<Address> = response.record_routes()?.into_iter().rev().collect();
        let action = dialog.with_data(|data| match data.state {
            DialogState::Early => {
                data.state = DialogState::Confirmed;
                data.route_set = route_set;
                if let Some(contact) = response.contact() {
                    data.remote_target = contact.uri;
                }
                data.confirmed_invites.insert(seq);
                Action::Deliver
            }
            DialogState::Confirmed => match data.acks.get(&seq) {
                Some(ack) => Action::ResendAck(ack.clone()),
                None => Action::Absorb,
            },
            DialogState::Terminated => Action::Absorb,
        });

        match action {
            Action::Deliver => {
                debug!(%key, "Late 2xx confirmed early dialog");
                inner.deliver(SipEvent::Response(ResponseEvent {
                    response,
                    source,
                    client_transaction: None,
                    dialog: Some(dialog),
                }));
            }
            Action::ResendAck(ack) => {
                debug!(%key, seq, "2xx retransmitted, re-sending ACK");
                let destination = resolve_request_destination(&ack).await?;
                inner.transport.send_message(ack.into(), destination).await?;
            }
            Action::Absorb => trace!(%key, seq, "Absorbing retransmitted 2xx"),
        }
        return Ok(());
    }

    let Some(fork_key) = ForkKey::from_response(&response) else {
        return Ok(());
    };
    let Some((request, transaction)) = inner
        .forks
        .get(&fork_key)
        .map(|fork| (fork.request.clone(), fork.transaction.clone()))
    else {
        debug!(%key, "Stray 2xx matches no forked INVITE, dropping");
        return Ok(());
    };

    let dialog = insert_dialog(
        inner,
        create_uac_dialog(inner, &request, &response, DialogState::Confirmed, transaction)?,
    );
    add_fork_dialog(inner, &fork_key, dialog.id());
    confirm_fork(inner, &fork_key);
    info!(%key, "Forked 2xx created dialog");

    inner.deliver(SipEvent::Response(ResponseEvent {
        response,
        source,
        client_transaction: None,
        dialog: Some(dialog),
    }));
    Ok(())
}

/// Creates or updates the dialog a response is about to establish. Runs
/// before the response is sent so an immediate ACK or in-dialog request
/// finds the dialog.
pub(crate) fn on_server_response(
    inner: &Arc<ProviderInner>,
    transaction: &ServerTransaction,
    response: &Response,
) -> Result<Option<ServerDialogUpdate>> {
    if !inner.config.automatic_dialog_support {
        return Ok(None);
    }
    let request = transaction.request();
    let status = response.status;
    let bound = transaction.dialog_id().and_then(|id| inner.dialog(&id));

    if is_initial(request) {
        let Some(local_tag) = response.to_tag() else {
            return Ok(None);
        };
        if !is_dialog_creating(status) {
            return Ok(bound.map(|dialog| ServerDialogUpdate {
                dialog,
                created: false,
            }));
        }

        let (dialog, created) = match bound {
            Some(dialog) => (dialog, false),
            None => {
                let state = if status.is_success() {
                    DialogState::Confirmed
                } else {
                    DialogState::Early
                };
                let dialog =
                    insert_dialog(inner, create_uas_dialog(inner, transaction, &local_tag, state)?);
                transaction.set_dialog_id(dialog.id());
                (dialog, true)
            }
        };
        if status.is_success() {
            let seq = request.cseq()?.seq;
            dialog.with_data(|data| data.state = DialogState::Confirmed);
            if request.method == Method::Invite {
                record_answered_invite(inner, &dialog, transaction, seq);
            }
        }
        return Ok(Some(ServerDialogUpdate { dialog, created }));
    }

    let Some(dialog) = bound else {
        return Ok(None);
    };
    if status.is_success() && request.method == Method::Invite {
        let seq = request.cseq()?.seq;
        record_answered_invite(inner, &dialog, transaction, seq);
    }
    Ok(Some(ServerDialogUpdate {
        dialog,
        created: false,
    }))
}

/// Marks the INVITE `seq` as answered with 2xx and indexes its server
/// transaction key, so later copies of the INVITE are absorbed or merged
/// rather than reaching the TU again.
fn record_answered_invite(
    inner: &ProviderInner,
    dialog: &Dialog,
    transaction: &ServerTransaction,
    seq: u32,
) {
    let key = transaction.key().clone();
    let merge_key = MergeKey::from_request(transaction.request());
    dialog.with_data(|data| {
        data.confirmed_invites.insert(seq);
        data.pending_ack = Some(seq);
        // Terminated dialogs have already released their index entries.
        if data.state == DialogState::Terminated || data.answered_invites.contains(&key) {
            return;
        }
        data.answered_invites.push(key.clone());
        inner.answered_invites.insert(
            key,
            AnsweredInvite {
                dialog: dialog.id(),
                merge_key,
            },
        );
    });
}

/// INVITE answered with 2xx by a dialog that is still alive.
pub(crate) fn is_answered_invite(inner: &ProviderInner, key: &TransactionKey) -> bool {
    inner.answered_invites.contains_key(key)
}

/// Follows up on a response a server transaction tried to send.
pub(crate) fn after_server_response(
    inner: &Arc<ProviderInner>,
    transaction: &ServerTransaction,
    update: ServerDialogUpdate,
    response: &Response,
    sent: bool,
) {
    let ServerDialogUpdate { dialog, created } = update;
    let request = transaction.request();
    let status = response.status;

    if !sent {
        if created {
            terminate_dialog(inner, &dialog, "response could not be sent", Termination::Terminated);
        }
        return;
    }

    if status.is_success() {
        match request.method {
            Method::Invite => {
                if let Ok(cseq) = request.cseq() {
                    spawn_2xx_retransmission(
                        inner,
                        &dialog,
                        response.clone(),
                        transaction.source(),
                        cseq.seq,
                    );
                }
            }
            Method::Bye if dialog.terminate_on_bye() => {
                terminate_dialog(inner, &dialog, "BYE answered", Termination::Terminated);
            }
            _ => {}
        }
    } else if status.is_failure() && is_initial(request) {
        terminate_dialog(
            inner,
            &dialog,
            &format!("initial request rejected with {}", status),
            Termination::Terminated,
        );
    }
}

/// Retransmits a 2xx to INVITE until its ACK arrives (RFC 3261 Section
/// 13.3.1.4). Without an ACK within the dialog timeout the dialog times out.
fn spawn_2xx_retransmission(
    inner: &Arc<ProviderInner>,
    dialog: &Dialog,
    response: Response,
    destination: SocketAddr,
    seq: u32,
) {
    let provider = Arc::downgrade(inner);
    let task_dialog = dialog.clone();
    let settings = inner.timer_settings();
    let deadline = Instant::now() + inner.config.dialog_timeout;

    let task = tokio::spawn(async move {
        let dialog = task_dialog;
        let mut interval = settings.t1;
        loop {
            let wake = if settings.reliable {
                deadline
            } else {
                (Instant::now() + interval).min(deadline)
            };
            sleep_until(wake).await;

            let Some(inner) = provider.upgrade() else {
                return;
            };
            if dialog.with_data(|data| data.pending_ack != Some(seq)) {
                return;
            }
            if Instant::now() >= deadline {
                warn!(dialog = %dialog.id(), seq, "No ACK received for 2xx");
                terminate_dialog(&inner, &dialog, "no ACK received for 2xx", Termination::TimedOut);
                return;
            }

            trace!(dialog = %dialog.id(), seq, "Retransmitting 2xx");
            if let Err(e) = inner
                .transport
                .send_message(response.clone().into(), destination)
                .await
            {
                warn!(dialog = %dialog.id(), error = %e, "Failed to retransmit 2xx");
            }
            interval = settings.next_timer_g(interval);
        }
    });

    dialog.with_data(|data| {
        if data.pending_ack == Some(seq) && data.state != DialogState::Terminated {
            if let Some(previous) = data.retransmission.replace(task) {
                previous.abort();
            }
        } else {
            task.abort();
        }
    });
}

/// Matches an ACK that has no server transaction to the dialog whose 2xx
/// it acknowledges. Only the first ACK for a 2xx reaches the TU.
pub(crate) fn on_ack(inner: &ProviderInner, ack: &Request) -> Result<AckOutcome> {
    let (Some(call_id), Some(local_tag), Some(remote_tag)) =
        (ack.call_id(), ack.to_tag(), ack.from_tag())
    else {
        return Ok(AckOutcome::Deliver(None));
    };
    let Some(dialog) = inner.find_dialog(&DialogKey::new(call_id, local_tag, remote_tag)) else {
        return Ok(AckOutcome::Deliver(None));
    };

    let seq = ack.cseq()?.seq;
    let aggressive = inner.config.cleanup_policy == DialogCleanupPolicy::Aggressive;
    let first = dialog.with_data(|data| {
        if data.pending_ack != Some(seq) {
            return false;
        }
        data.pending_ack = None;
        if let Some(task) = data.retransmission.take() {
            task.abort();
        }
        if aggressive {
            data.invite = None;
        }
        true
    });

    if first {
        debug!(dialog = %dialog.id(), seq, "ACK received for 2xx");
        Ok(AckOutcome::Deliver(Some(dialog)))
    } else {
        Ok(AckOutcome::Absorb)
    }
}

/// Checks a request carrying a To tag against its dialog (RFC 3261
/// Section 12.2.2): unknown dialogs get 481, stale CSeqs get 500.
pub(crate) fn on_in_dialog_request(inner: &ProviderInner, request: &Request) -> InDialogOutcome {
    let (Some(call_id), Some(local_tag), Some(remote_tag)) =
        (request.call_id(), request.to_tag(), request.from_tag())
    else {
        return InDialogOutcome::Rejected(StatusCode::CALL_TRANSACTION_DOES_NOT_EXIST);
    };
    let Some(dialog) = inner.find_dialog(&DialogKey::new(call_id, local_tag, remote_tag)) else {
        return InDialogOutcome::Rejected(StatusCode::CALL_TRANSACTION_DOES_NOT_EXIST);
    };
    let Ok(cseq) = request.cseq() else {
        return InDialogOutcome::Rejected(StatusCode::BAD_REQUEST);
    };

    let refresh = matches!(
        request.method,
        Method::Invite | Method::Update | Method::Subscribe | Method::Notify | Method::Refer
    );
    let contact = request.contact();
    let verdict = dialog.with_data(|data| {
        if data.state == DialogState::Terminated {
            return Err(StatusCode::CALL_TRANSACTION_DOES_NOT_EXIST);
        }
        if let Some(last) = data.remote_cseq {
            if cseq.seq <= last {
                return Err(StatusCode::SERVER_INTERNAL_ERROR);
            }
        }
        data.remote_cseq = Some(cseq.seq);
        if refresh {
            if let Some(contact) = contact {
                data.remote_target = contact.uri;
            }
        }
        Ok(())
    });

    match verdict {
        Ok(()) => InDialogOutcome::Accepted(dialog),
        Err(status) => InDialogOutcome::Rejected(status),
    }
}

/// Dialog cleanup when a client transaction times out or cannot send.
pub(crate) fn on_transaction_timeout(inner: &ProviderInner, transaction: &SipTransaction) {
    let SipTransaction::Client(transaction) = transaction else {
        return;
    };
    let request = transaction.request();
    if is_initial(request) {
        let reason = format!("{} timed out", request.method);
        if let Some(fork_key) = ForkKey::from_request(request) {
            terminate_early_dialogs(inner, &fork_key, &reason);
        }
        terminate_bound_early_dialog(inner, transaction, &reason);
        return;
    }
    if let Some(dialog) = transaction.dialog_id().and_then(|id| inner.dialog(&id)) {
        terminate_dialog(
            inner,
            &dialog,
            &format!("in-dialog {} timed out", request.method),
            Termination::Terminated,
        );
    }
}

/// Explicit dialog creation for [`SipProvider::get_new_dialog`](super::SipProvider::get_new_dialog).
pub(crate) fn get_new_dialog(inner: &Arc<ProviderInner>, transaction: &SipTransaction) -> Result<Dialog> {
    if let Some(dialog) = transaction.dialog_id().and_then(|id| inner.dialog(&id)) {
        return Ok(dialog);
    }

    match transaction {
        SipTransaction::Server(transaction) => {
            let request = transaction.request();
            if let Some(local_tag) = request.to_tag() {
                let remote_tag = request.from_tag().ok_or_else(|| missing_tag("From"))?;
                let key = DialogKey::new(request.call_id().unwrap_or_default(), local_tag, remote_tag);
                let dialog = inner
                    .find_dialog(&key)
                    .ok_or_else(|| Error::DialogNotFound(key.to_string()))?;
                transaction.set_dialog_id(dialog.id());
                return Ok(dialog);
            }
            let dialog = insert_dialog(
                inner,
                create_uas_dialog(inner, transaction, transaction.local_tag(), DialogState::Early)?,
            );
            transaction.set_dialog_id(dialog.id());
            Ok(dialog)
        }
        SipTransaction::Client(transaction) => {
            let response = transaction
                .last_response()
                .filter(|response| response.to_tag().is_some())
                .ok_or_else(|| Error::invalid_state("no tagged response received yet"))?;
            let state = if response.status.is_success() {
                DialogState::Confirmed
            } else {
                DialogState::Early
            };
            let dialog = insert_dialog(
                inner,
                create_uac_dialog(
                    inner,
                    transaction.request(),
                    &response,
                    state,
                    transaction.key().clone(),
                )?,
            );
            transaction.set_dialog_id(dialog.id());
            Ok(dialog)
        }
    }
}

/// Moves `dialog` to Terminated, drops it from the tables and tells the TU,
/// once.
pub(crate) fn terminate_dialog(
    inner: &ProviderInner,
    dialog: &Dialog,
    reason: &str,
    termination: Termination,
) {
    if !dialog.mark_terminated() {
        return;
    }
    inner.remove_dialog(dialog);

    let id = dialog.id();
    let answered = dialog.with_data(|data| std::mem::take(&mut data.answered_invites));
    for key in answered {
        let removed = inner
            .answered_invites
            .remove_if(&key, |_, answered| answered.dialog == id);
        if let Some((_, AnsweredInvite { merge_key: Some(merge_key), .. })) = removed {
            inner
                .merge_table
                .remove_if(&merge_key, |_, existing| *existing == key);
        }
    }

    let reason = reason.to_string();
    let event = match termination {
        Termination::Terminated => SipEvent::DialogTerminated {
            dialog: dialog.clone(),
            reason,
        },
        Termination::TimedOut => SipEvent::DialogTimeout {
            dialog: dialog.clone(),
            reason,
        },
    };
    inner.deliver(event);
}

//! Inbound message dispatch (RFC 3261 Sections 17.1.3, 17.2.3 and 8.2).
//!
//! Requests are matched to server transactions, responses to client
//! transactions. Unmatched traffic is handled here: ACKs for 2xx, CANCELs
//! without an INVITE, merged requests, in-dialog requests for unknown
//! dialogs, and stray 2xx responses from forking proxies.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use sipstack_sip_core::{HeaderAccess, Message, Method, Request, Response, StatusCode};

use super::dialog_layer::{self, AckOutcome, InDialogOutcome, ResponseOutcome};
use super::ProviderInner;
use crate::errors::Result;
use crate::events::{RequestEvent, SipEvent};
use crate::transaction::utils::{apply_via_fixups, create_stateless_response};
use crate::transaction::{ServerTransaction, SipTransaction, TransactionKey};

pub(crate) async fn process_message(inner: &Arc<ProviderInner>, message: Message, source: SocketAddr) {
    let result = match message {
        Message::Request(request) => process_request(inner, request, source).await,
        Message::Response(response) => process_response(inner, response, source).await,
    };
    if let Err(e) = result {
        warn!(%source, error = %e, "Dropping inbound message");
    }
}

async fn process_request(
    inner: &Arc<ProviderInner>,
    mut request: Request,
    source: SocketAddr,
) -> Result<()> {
    request.validate()?;
    apply_via_fixups(&mut request, source)?;
    let key = TransactionKey::from_request(&request, true)?;
    trace!(id = %key, %source, "Inbound request");

    if let Some(SipTransaction::Server(transaction)) = inner.live_transaction(&key) {
        trace!(id = %key, "Matched server transaction");
        transaction.feed(request.into(), source, None);
        return Ok(());
    }

    match request.method {
        Method::Ack => return process_stray_ack(inner, request, source),
        Method::Cancel => {
            let invite_key = key.with_method(Method::Invite);
            if inner.live_transaction(&invite_key).is_none() {
                debug!(id = %key, "CANCEL matches no INVITE, answering 481");
                return reply_stateless(
                    inner,
                    &request,
                    StatusCode::CALL_TRANSACTION_DOES_NOT_EXIST,
                    source,
                )
                .await;
            }
        }
        _ => {}
    }

    if request.method == Method::Invite
        && inner.config.automatic_dialog_support
        && dialog_layer::is_answered_invite(inner, &key)
    {
        debug!(id = %key, "INVITE retransmitted after 2xx, absorbing");
        return Ok(());
    }

    if inner.is_merged_request(&request, &key) {
        debug!(id = %key, "Merged request, answering 482");
        return reply_stateless(inner, &request, StatusCode::LOOP_DETECTED, source).await;
    }

    let mut dialog = None;
    if request.to_tag().is_some()
        && request.method != Method::Cancel
        && inner.config.automatic_dialog_support
    {
        match dialog_layer::on_in_dialog_request(inner, &request) {
            InDialogOutcome::Accepted(found) => dialog = Some(found),
            InDialogOutcome::Rejected(status) => {
                debug!(id = %key, %status, "Rejecting in-dialog request");
                return reply_stateless(inner, &request, status, source).await;
            }
        }
    }

    if !inner.config.automatic_transaction_creation {
        inner.deliver(SipEvent::Request(RequestEvent {
            request,
            source,
            server_transaction: None,
            dialog,
        }));
        return Ok(());
    }

    let transaction = ServerTransaction::create(inner, request.clone(), source, true)?;
    if let Some(dialog) = &dialog {
        transaction.set_dialog_id(dialog.id());
    }
    transaction.feed(request.into(), source, dialog);
    Ok(())
}

/// ACK with no INVITE server transaction: the ACK for a 2xx.
fn process_stray_ack(inner: &Arc<ProviderInner>, request: Request, source: SocketAddr) -> Result<()> {
    let dialog = if inner.config.automatic_dialog_support {
        match dialog_layer::on_ack(inner, &request)? {
            AckOutcome::Deliver(dialog) => dialog,
            AckOutcome::Absorb => {
                trace!(%source, "Absorbing retransmitted ACK");
                return Ok(());
            }
        }
    } else {
        None
    };

    inner.deliver(SipEvent::Request(RequestEvent {
        request,
        source,
        server_transaction: None,
        dialog,
    }));
    Ok(())
}

async fn process_response(
    inner: &Arc<ProviderInner>,
    response: Response,
    source: SocketAddr,
) -> Result<()> {
    let key = TransactionKey::from_response(&response)?;
    trace!(id = %key, status = %response.status, %source, "Inbound response");

    if let Some(SipTransaction::Client(transaction)) = inner.live_transaction(&key) {
        if !inner.config.automatic_dialog_support {
            transaction.feed(response.into(), source, None);
            return Ok(());
        }
        match dialog_layer::on_client_response(inner, &transaction, &response, source).await? {
            ResponseOutcome::Feed(dialog) => transaction.feed(response.into(), source, dialog),
            ResponseOutcome::Consumed => {}
        }
        return Ok(());
    }

    if response.status.is_success()
        && response.cseq()?.method == Method::Invite
        && inner.config.automatic_dialog_support
    {
        return dialog_layer::on_stray_response(inner, response, source).await;
    }
    debug!(id = %key, status = %response.status, "Dropping stray response");
    Ok(())
}

async fn reply_stateless(
    inner: &ProviderInner,
    request: &Request,
    status: StatusCode,
    source: SocketAddr,
) -> Result<()> {
    let response = create_stateless_response(request, status);
    inner.transport.send_message(response.into(), source).await?;
    Ok(())
}

//! Stateless answers and provider switches: CANCEL matching, merged
//! requests, manual transaction and dialog creation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use common::*;
use sipstack_dialog_core::prelude::*;
use sipstack_sip_core::builder::ResponseBuilder;
use sipstack_sip_core::{HeaderAccess, Method, Request, StatusCode};
use sipstack_sip_transport::MemoryNetwork;

#[tokio::test(start_paused = true)]
async fn test_cancel_without_invite_gets_481() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let mut engine = Engine::start(&network, "10.0.0.1:5060", quiet_config());
    let mut peer = Peer::bind(&network, "10.0.0.2:5060");
    let leg = peer.leg(&engine, "lonely-cancel@test");

    peer.send(leg.request(Method::Cancel, 1, &branch()), engine.addr)
        .await;
    let response = peer.recv_response().await;
    assert_eq!(response.status, StatusCode::CALL_TRANSACTION_DOES_NOT_EXIST);

    sleep(Duration::from_millis(10)).await;
    assert!(engine.drain().is_empty());
    assert_eq!(engine.provider.transaction_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cancel_matches_pending_invite() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let mut engine = Engine::start(&network, "10.0.0.1:5060", quiet_config());
    let mut peer = Peer::bind(&network, "10.0.0.2:5060");
    let leg = peer.leg(&engine, "cancelled@test");
    let invite_branch = branch();

    peer.send(leg.request(Method::Invite, 1, &invite_branch), engine.addr)
        .await;
    let invite = engine.next_request(Method::Invite).await;
    let invite_tx = invite.server_transaction.expect("server transaction");

    peer.send(leg.request(Method::Cancel, 1, &invite_branch), engine.addr)
        .await;
    let cancel = engine.next_request(Method::Cancel).await;
    let cancelled = engine
        .provider
        .find_cancelled_transaction(&cancel.request)
        .expect("INVITE transaction");
    assert_eq!(cancelled.key(), invite_tx.key());

    cancel
        .server_transaction
        .expect("server transaction")
        .send_response(ResponseBuilder::from_request(&cancel.request, StatusCode::OK).build())
        .await?;
    invite_tx
        .send_response(
            ResponseBuilder::from_request(&invite.request, StatusCode::REQUEST_TERMINATED).build(),
        )
        .await?;

    let first = peer.recv_response().await;
    let second = peer.recv_response().await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.cseq()?.method, Method::Cancel);
    assert_eq!(second.status, StatusCode::REQUEST_TERMINATED);
    assert_eq!(invite_tx.state(), TransactionState::Completed);

    let ack = leg
        .with_to_tag(invite_tx.local_tag())
        .request(Method::Ack, 1, &invite_branch);
    peer.send(ack, engine.addr).await;
    sleep(Duration::from_millis(10)).await;
    assert_eq!(invite_tx.state(), TransactionState::Confirmed);
    assert_eq!(engine.provider.dialog_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_merged_request_gets_482() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let mut engine = Engine::start(&network, "10.0.0.1:5060", quiet_config());
    let mut peer = Peer::bind(&network, "10.0.0.2:5060");
    let leg = peer.leg(&engine, "merged@test");

    peer.send(leg.request(Method::Invite, 1, &branch()), engine.addr)
        .await;
    engine.next_request(Method::Invite).await;

    // Same request arriving over a second path: new branch, same
    // Call-ID, From tag and CSeq.
    peer.send(leg.request(Method::Invite, 1, &branch()), engine.addr)
        .await;
    assert_eq!(peer.recv_response().await.status, StatusCode::LOOP_DETECTED);

    sleep(Duration::from_millis(10)).await;
    assert!(engine
        .drain()
        .iter()
        .all(|e| !matches!(e, SipEvent::Request(_))));
    assert_eq!(engine.provider.transaction_count(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_manual_server_transactions() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let config = quiet_config().with_automatic_transaction_creation(false);
    let mut engine = Engine::start(&network, "10.0.0.1:5060", config);
    let mut peer = Peer::bind(&network, "10.0.0.2:5060");
    let leg = peer.leg(&engine, "manual@test");
    let options_branch = branch();

    let options = leg.request(Method::Options, 1, &options_branch);
    peer.send(options.clone(), engine.addr).await;
    let event = engine.next_request(Method::Options).await;
    assert!(event.server_transaction.is_none());

    let tx = engine.provider.new_server_transaction(&event)?;
    assert!(engine.provider.new_server_transaction(&event).is_err());
    tx.send_response(ResponseBuilder::from_request(&event.request, StatusCode::OK).build())
        .await?;
    assert_eq!(peer.recv_response().await.status, StatusCode::OK);

    // The retransmission now matches the transaction.
    peer.send(options, engine.addr).await;
    assert_eq!(peer.recv_response().await.status, StatusCode::OK);
    sleep(Duration::from_millis(10)).await;
    assert!(engine
        .drain()
        .iter()
        .all(|e| !matches!(e, SipEvent::Request(_))));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_manual_dialogs() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let config = quiet_config().with_automatic_dialog_support(false);
    let mut engine = Engine::start(&network, "10.0.0.1:5060", config);
    let mut peer = Peer::bind(&network, "10.0.0.2:5060");
    let leg = peer.leg(&engine, "manual-dialog@test");

    peer.send(leg.request(Method::Invite, 1, &branch()), engine.addr)
        .await;
    let event = engine.next_request(Method::Invite).await;
    let tx = event.server_transaction.expect("server transaction");
    tx.send_response(ResponseBuilder::from_request(&event.request, StatusCode::RINGING).build())
        .await?;
    assert_eq!(peer.recv_response().await.status, StatusCode::RINGING);
    assert_eq!(engine.provider.dialog_count(), 0);
    assert!(tx.dialog_id().is_none());

    let dialog = engine
        .provider
        .get_new_dialog(&SipTransaction::Server(tx.clone()))?;
    assert_eq!(dialog.state(), DialogState::Early);
    assert_eq!(dialog.local_tag(), tx.local_tag());
    assert_eq!(dialog.remote_tag(), leg.from_tag);
    assert_eq!(tx.dialog_id(), Some(dialog.id()));

    let again = engine
        .provider
        .get_new_dialog(&SipTransaction::Server(tx.clone()))?;
    assert_eq!(again.id(), dialog.id());
    assert_eq!(engine.provider.dialog_count(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stateless_sends() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let engine = Engine::start(&network, "10.0.0.1:5060", quiet_config());
    let mut peer = Peer::bind(&network, "10.0.0.2:5060");

    let mut message = engine.request(Method::Message, peer.addr, "stateless@test");
    message
        .headers
        .insert_front(sipstack_sip_core::HeaderName::Via, engine.provider.local_via().to_string());
    engine.provider.send_request_stateless(message).await?;

    let received = peer.recv_request().await;
    assert_eq!(received.method, Method::Message);
    assert_eq!(engine.provider.transaction_count(), 0);

    // Nothing retransmits it.
    assert!(peer.recv_within(Duration::from_secs(10)).await.is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_listener_is_set_once() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let engine = Engine::start(&network, "10.0.0.1:5060", quiet_config());
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let second = engine
        .provider
        .set_listener(Arc::new(RecordingListener::new(tx, false)));
    assert!(matches!(second, Err(Error::Configuration(_))));
    Ok(())
}

/// Calls the peer, gets a tagged 180 back and CANCELs the INVITE.
async fn ring_and_cancel(
    engine: &mut Engine,
    peer: &mut Peer,
    call_id: &str,
) -> Result<(ClientTransaction, ClientTransaction, Dialog, Request, Request)> {
    let invite = engine.request(Method::Invite, peer.addr, call_id);
    let invite_tx = engine.provider.new_client_transaction(invite).await?;
    invite_tx.send_request().await?;
    let invite = peer.recv_request().await;
    peer.respond(&invite, StatusCode::RINGING, Some("callee"), engine.addr)
        .await;
    let early = engine.next_response().await.dialog.expect("early dialog");

    let cancel = invite_tx.create_cancel()?;
    assert_eq!(cancel.method, Method::Cancel);
    assert_eq!(cancel.cseq()?.seq, invite.cseq()?.seq);
    assert_eq!(cancel.top_via()?.branch(), invite.top_via()?.branch());
    assert_eq!(cancel.uri, invite.uri);

    let cancel_tx = engine.provider.new_client_transaction(cancel).await?;
    cancel_tx.send_request().await?;
    let cancel = peer.recv_request().await;
    assert_eq!(cancel.method, Method::Cancel);
    Ok((invite_tx, cancel_tx, early, invite, cancel))
}

#[tokio::test(start_paused = true)]
async fn test_cancel_crossing_a_2xx() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let mut engine = Engine::start(&network, "10.0.0.1:5060", quiet_config());
    let mut peer = Peer::bind(&network, "10.0.0.2:5060");
    let (invite_tx, cancel_tx, early, invite, cancel) =
        ring_and_cancel(&mut engine, &mut peer, "cancel-late@test").await?;

    // The callee answered before the CANCEL reached it.
    peer.respond(&invite, StatusCode::OK, Some("callee"), engine.addr)
        .await;
    peer.respond(&cancel, StatusCode::OK, Some("callee"), engine.addr)
        .await;

    let mut answers = Vec::new();
    while answers.len() < 2 {
        let event = engine.next_response().await;
        answers.push((event.response.cseq()?.method, event.response.status));
    }
    assert!(answers.contains(&(Method::Invite, StatusCode::OK)));
    assert!(answers.contains(&(Method::Cancel, StatusCode::OK)));

    assert_eq!(early.state(), DialogState::Confirmed);
    assert_eq!(invite_tx.state(), TransactionState::Terminated);
    assert_eq!(cancel_tx.state(), TransactionState::Completed);
    assert!(matches!(invite_tx.create_cancel(), Err(Error::InvalidState(_))));

    // The call stands; the 2xx still needs its ACK.
    early.send_ack(early.create_ack(1)?).await?;
    let ack = peer.recv_request().await;
    assert_eq!(ack.method, Method::Ack);
    assert_ne!(ack.top_via()?.branch(), invite.top_via()?.branch());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cancel_answered_before_487() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let mut engine = Engine::start(&network, "10.0.0.1:5060", quiet_config());
    let mut peer = Peer::bind(&network, "10.0.0.2:5060");
    let (invite_tx, cancel_tx, early, invite, cancel) =
        ring_and_cancel(&mut engine, &mut peer, "cancel-won@test").await?;

    peer.respond(&cancel, StatusCode::OK, Some("callee"), engine.addr)
        .await;
    peer.respond(&invite, StatusCode::REQUEST_TERMINATED, Some("callee"), engine.addr)
        .await;

    let (mut cancelled, mut terminated, mut dialog_ended) = (false, false, false);
    while !(cancelled && terminated && dialog_ended) {
        match engine.next_event().await {
            SipEvent::Response(event) => match event.response.cseq()?.method {
                Method::Cancel => {
                    assert_eq!(event.response.status, StatusCode::OK);
                    cancelled = true;
                }
                Method::Invite => {
                    assert_eq!(event.response.status, StatusCode::REQUEST_TERMINATED);
                    terminated = true;
                }
                other => panic!("unexpected response to {}", other),
            },
            SipEvent::DialogTerminated { dialog, .. } => {
                assert_eq!(dialog.id(), early.id());
                dialog_ended = true;
            }
            _ => {}
        }
    }

    // The INVITE transaction ACKs the 487 on its own branch.
    let ack = peer.recv_request().await;
    assert_eq!(ack.method, Method::Ack);
    assert_eq!(ack.top_via()?.branch(), invite.top_via()?.branch());
    assert_eq!(ack.to_tag().as_deref(), Some("callee"));
    assert_eq!(invite_tx.state(), TransactionState::Completed);
    assert_eq!(engine.provider.dialog_count(), 0);

    // Timers D and K run out; both transactions leave the table.
    sleep(Duration::from_secs(40)).await;
    assert!(matches!(
        engine.provider.find_transaction(invite_tx.key()),
        Err(Error::TransactionNotFound(_))
    ));
    assert!(engine.provider.find_transaction(cancel_tx.key()).is_err());
    assert_eq!(engine.provider.transaction_count(), 0);
    Ok(())
}

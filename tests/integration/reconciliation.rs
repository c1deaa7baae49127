//! Clients catching up after an offline period with `sync`, merging the
//! answer into a local thread copy.

mod common;

use common::{connect, is_message, recv_until, send, start_single, text_to};
use parley_proto::event::{ClientEvent, ErrorCode, ServerEvent};
use parley_proto::message::{MessageStatus, ThreadId, Timestamp, UserId};
use parley_proto::reconcile::{LocalThread, MergeOutcome};

fn sync_batch(event: &ServerEvent) -> bool {
    matches!(event, ServerEvent::SyncBatch { .. })
}

#[tokio::test]
async fn offline_receiver_catches_up_in_order() {
    let server = start_single().await;
    let mut alice = connect(&server, "alice").await;

    for i in 0..3 {
        send(
            &mut alice,
            &ClientEvent::Message(text_to("bob", "L1", &format!("while you were out {i}"))),
        )
        .await;
        recv_until(&mut alice, is_message).await;
    }

    let mut bob = connect(&server, "bob").await;
    let mut local = LocalThread::new(ThreadId::new("alice-bob"));
    send(&mut bob, &local.sync_request(None)).await;

    let batch = recv_until(&mut bob, sync_batch).await;
    let ServerEvent::SyncBatch { messages, .. } = &batch else {
        unreachable!();
    };
    let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        contents,
        vec!["while you were out 0", "while you were out 1", "while you were out 2"]
    );
    assert_eq!(local.apply_event(&batch), MergeOutcome::Updated);
    assert_eq!(local.len(), 3);

    // A second sync from the advanced cursor has nothing new.
    send(&mut bob, &local.sync_request(None)).await;
    match recv_until(&mut bob, sync_batch).await {
        ServerEvent::SyncBatch { messages, .. } => assert!(messages.is_empty()),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn sync_carries_status_and_deletions() {
    let server = start_single().await;
    let mut alice = connect(&server, "alice").await;
    let mut bob = connect(&server, "bob").await;
    let mut local = LocalThread::new(ThreadId::new("alice-bob"));

    send(&mut alice, &ClientEvent::Message(text_to("bob", "L1", "keep"))).await;
    let ServerEvent::Message(keep) = recv_until(&mut alice, is_message).await else {
        unreachable!();
    };
    send(&mut alice, &ClientEvent::Message(text_to("bob", "L1", "oops"))).await;
    let ServerEvent::Message(oops) = recv_until(&mut alice, is_message).await else {
        unreachable!();
    };
    local.merge(keep.message.clone());
    local.merge(oops.message.clone());

    recv_until(&mut bob, |e| {
        matches!(e, ServerEvent::Message(m) if m.message.id == oops.message.id)
    })
    .await;
    send(&mut bob, &ClientEvent::MessageRead {
        message_id: keep.message.id,
    })
    .await;

    let deleted = server
        .gateway
        .service()
        .delete(&oops.message.id, &UserId::new("alice"))
        .await
        .unwrap();
    assert!(deleted);

    // The deletion notice reaches bob, not the deleter.
    match recv_until(&mut bob, |e| {
        matches!(e, ServerEvent::Message(m) if m.message.deleted_message_id().is_some())
    })
    .await
    {
        ServerEvent::Message(notice) => {
            assert_eq!(notice.message.deleted_message_id(), Some(oops.message.id));
        }
        _ => unreachable!(),
    }

    // A full re-sync reflects the read receipt and hides the deleted message.
    recv_until(&mut alice, |e| {
        matches!(e, ServerEvent::MessageStatus { status: MessageStatus::Read, .. })
    })
    .await;
    send(&mut alice, &ClientEvent::Sync {
        thread_id: ThreadId::new("alice-bob"),
        since: Timestamp::default(),
        limit: None,
    })
    .await;
    let batch = recv_until(&mut alice, sync_batch).await;
    let ServerEvent::SyncBatch { messages, .. } = &batch else {
        unreachable!();
    };
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, keep.message.id);
    assert_eq!(messages[0].status, MessageStatus::Read);

    local.apply_event(&batch);
    assert_eq!(
        local.get(&keep.message.id).map(|m| m.status),
        Some(MessageStatus::Read)
    );
}

#[tokio::test]
async fn sync_respects_limit() {
    let server = start_single().await;
    let mut alice = connect(&server, "alice").await;
    for i in 0..4 {
        send(
            &mut alice,
            &ClientEvent::Message(text_to("bob", "L1", &format!("n{i}"))),
        )
        .await;
        recv_until(&mut alice, is_message).await;
    }

    let mut local = LocalThread::new(ThreadId::new("alice-bob"));
    let mut bob = connect(&server, "bob").await;
    let mut seen = Vec::new();
    for _ in 0..2 {
        send(&mut bob, &local.sync_request(Some(2))).await;
        let batch = recv_until(&mut bob, sync_batch).await;
        if let ServerEvent::SyncBatch { messages, .. } = &batch {
            assert_eq!(messages.len(), 2);
            seen.extend(messages.iter().map(|m| m.content.clone()));
        }
        local.apply_event(&batch);
    }
    assert_eq!(seen, vec!["n0", "n1", "n2", "n3"]);
}

#[tokio::test]
async fn outsider_cannot_sync_thread() {
    let server = start_single().await;
    let mut carol = connect(&server, "carol").await;

    send(&mut carol, &ClientEvent::Sync {
        thread_id: ThreadId::new("alice-bob"),
        since: Timestamp::default(),
        limit: None,
    })
    .await;
    match recv_until(&mut carol, |e| matches!(e, ServerEvent::Error { .. })).await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::Authorization),
        _ => unreachable!(),
    }
}

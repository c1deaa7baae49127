//! End-to-end socket flows against a single gateway: send, delivery and read
//! receipts, typing, validation, authentication and disconnects.

mod common;

use std::time::Duration;

use common::{
    assert_none, connect, expect_closed, is_message, open, recv, recv_until, send, send_raw,
    start_single, start_with_settings, text_to,
};
use parley_proto::event::{ClientEvent, ErrorCode, ServerEvent};
use parley_proto::message::{MessageStatus, MessageType, ThreadId, UserId};
use parley_server::gateway::GatewaySettings;
use parley_server::store::MessageStore;

fn status_of(event: &ServerEvent) -> Option<MessageStatus> {
    match event {
        ServerEvent::MessageStatus { status, .. } => Some(*status),
        _ => None,
    }
}

fn error_code(event: &ServerEvent) -> Option<ErrorCode> {
    match event {
        ServerEvent::Error { code, .. } => Some(*code),
        _ => None,
    }
}

// ===========================================================================
// Send and deliver
// ===========================================================================

#[tokio::test]
async fn first_message_creates_room_and_reaches_receiver() {
    let server = start_single().await;
    let mut alice = connect(&server, "alice").await;
    let mut bob = connect(&server, "bob").await;

    send(&mut alice, &ClientEvent::Message(text_to("bob", "L1", "Is it available?"))).await;

    match recv(&mut bob).await {
        ServerEvent::RoomCreated {
            room_id,
            participants,
            listing_id,
        } => {
            assert_eq!(room_id, ThreadId::new("alice-bob"));
            assert_eq!(participants, vec![UserId::new("alice"), UserId::new("bob")]);
            assert_eq!(listing_id.as_str(), "L1");
        }
        other => panic!("expected roomCreated, got {other:?}"),
    }
    let ServerEvent::Message(delivered) = recv(&mut bob).await else {
        panic!("expected message");
    };
    assert_eq!(delivered.message.content, "Is it available?");
    assert_eq!(delivered.message.sender_id, UserId::new("alice"));
    assert_eq!(delivered.message.thread_id, ThreadId::new("alice-bob"));
    assert_eq!(delivered.message.message_type, MessageType::Text);
    assert_eq!(delivered.message_id, delivered.message.id);
    assert_eq!(delivered.timestamp, delivered.message.created_at);

    let ServerEvent::Message(echo) = recv_until(&mut alice, is_message).await else {
        unreachable!();
    };
    assert_eq!(echo.message.id, delivered.message.id);
    assert_eq!(echo.message.status, MessageStatus::Sent);

    let status = recv_until(&mut alice, |e| status_of(e).is_some()).await;
    assert_eq!(status_of(&status), Some(MessageStatus::Delivered));
}

#[tokio::test]
async fn reply_uses_the_same_thread() {
    let server = start_single().await;
    let mut alice = connect(&server, "alice").await;
    let mut bob = connect(&server, "bob").await;

    send(&mut alice, &ClientEvent::Message(text_to("bob", "L1", "hello"))).await;
    let ServerEvent::Message(first) = recv_until(&mut bob, is_message).await else {
        unreachable!();
    };

    send(&mut bob, &ClientEvent::Message(text_to("alice", "L1", "hi back"))).await;
    let ServerEvent::Message(reply) = recv_until(&mut alice, |e| {
        matches!(e, ServerEvent::Message(m) if m.message.sender_id.as_str() == "bob")
    })
    .await
    else {
        unreachable!();
    };
    assert_eq!(reply.message.thread_id, first.message.thread_id);

    // The room already exists, so nobody sees a second roomCreated.
    assert_none(&mut alice, Duration::from_millis(200), |e| {
        matches!(e, ServerEvent::RoomCreated { .. })
    })
    .await;
}

#[tokio::test]
async fn message_to_offline_user_stays_sent() {
    let server = start_single().await;
    let mut alice = connect(&server, "alice").await;

    send(&mut alice, &ClientEvent::Message(text_to("bob", "L1", "anyone?"))).await;
    let ServerEvent::Message(echo) = recv_until(&mut alice, is_message).await else {
        unreachable!();
    };
    assert_eq!(echo.message.status, MessageStatus::Sent);
    assert_none(&mut alice, Duration::from_millis(300), |e| status_of(e).is_some()).await;

    let stored = server
        .gateway
        .service()
        .store()
        .find(&echo.message.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, MessageStatus::Sent);
}

// ===========================================================================
// Read receipts
// ===========================================================================

#[tokio::test]
async fn read_receipt_reaches_sender_once() {
    let server = start_single().await;
    let mut alice = connect(&server, "alice").await;
    let mut bob = connect(&server, "bob").await;

    send(&mut alice, &ClientEvent::Message(text_to("bob", "L1", "read me"))).await;
    let ServerEvent::Message(msg) = recv_until(&mut bob, is_message).await else {
        unreachable!();
    };
    recv_until(&mut alice, |e| status_of(e) == Some(MessageStatus::Delivered)).await;

    let read = ClientEvent::MessageRead {
        message_id: msg.message.id,
    };
    send(&mut bob, &read).await;
    let status = recv_until(&mut alice, |e| status_of(e).is_some()).await;
    assert_eq!(status_of(&status), Some(MessageStatus::Read));

    send(&mut bob, &read).await;
    assert_none(&mut alice, Duration::from_millis(300), |e| status_of(e).is_some()).await;
}

#[tokio::test]
async fn sender_cannot_mark_own_message_read() {
    let server = start_single().await;
    let mut alice = connect(&server, "alice").await;

    send(&mut alice, &ClientEvent::Message(text_to("bob", "L1", "mine"))).await;
    let ServerEvent::Message(echo) = recv_until(&mut alice, is_message).await else {
        unreachable!();
    };

    send(&mut alice, &ClientEvent::MessageRead {
        message_id: echo.message.id,
    })
    .await;
    let err = recv_until(&mut alice, |e| error_code(e).is_some()).await;
    assert_eq!(error_code(&err), Some(ErrorCode::Authorization));

    let stored = server
        .gateway
        .service()
        .store()
        .find(&echo.message.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, MessageStatus::Sent);
}

// ===========================================================================
// Typing
// ===========================================================================

#[tokio::test]
async fn typing_is_relayed_to_room_peer() {
    let server = start_single().await;
    let mut alice = connect(&server, "alice").await;
    let mut bob = connect(&server, "bob").await;

    send(&mut alice, &ClientEvent::Message(text_to("bob", "L1", "hey"))).await;
    recv_until(&mut alice, is_message).await;
    recv_until(&mut bob, is_message).await;

    send(&mut alice, &ClientEvent::Typing {
        room_id: ThreadId::new("alice-bob"),
        is_typing: true,
    })
    .await;
    match recv_until(&mut bob, |e| matches!(e, ServerEvent::UserTyping { .. })).await {
        ServerEvent::UserTyping {
            room_id,
            user_id,
            is_typing,
        } => {
            assert_eq!(room_id, ThreadId::new("alice-bob"));
            assert_eq!(user_id, UserId::new("alice"));
            assert!(is_typing);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn typing_in_foreign_room_is_rejected() {
    let server = start_single().await;
    let mut alice = connect(&server, "alice").await;
    let mut bob = connect(&server, "bob").await;
    let mut carol = connect(&server, "carol").await;

    send(&mut alice, &ClientEvent::Message(text_to("bob", "L1", "private"))).await;
    recv_until(&mut bob, is_message).await;

    send(&mut carol, &ClientEvent::Typing {
        room_id: ThreadId::new("alice-bob"),
        is_typing: true,
    })
    .await;
    let err = recv(&mut carol).await;
    assert_eq!(error_code(&err), Some(ErrorCode::Authorization));
    assert_none(&mut bob, Duration::from_millis(200), |e| {
        matches!(e, ServerEvent::UserTyping { .. })
    })
    .await;
}

// ===========================================================================
// Rejections
// ===========================================================================

#[tokio::test]
async fn invalid_token_is_rejected_and_closed() {
    let server = start_single().await;
    let mut ws = open(&server).await;
    send(&mut ws, &ClientEvent::Connect {
        auth_token: "forged".into(),
    })
    .await;
    let err = recv(&mut ws).await;
    assert_eq!(error_code(&err), Some(ErrorCode::Authentication));
    expect_closed(&mut ws).await;
    assert_eq!(server.gateway.connection_count().await, 0);
}

#[tokio::test]
async fn first_frame_must_be_connect() {
    let server = start_single().await;
    let mut ws = open(&server).await;
    send(&mut ws, &ClientEvent::MessageRead {
        message_id: parley_proto::message::MessageId::new(),
    })
    .await;
    let err = recv(&mut ws).await;
    assert_eq!(error_code(&err), Some(ErrorCode::Authentication));
    expect_closed(&mut ws).await;
}

#[tokio::test]
async fn malformed_frame_keeps_connection_open() {
    let server = start_single().await;
    let mut alice = connect(&server, "alice").await;

    send_raw(&mut alice, "{not json").await;
    assert_eq!(error_code(&recv(&mut alice).await), Some(ErrorCode::Malformed));

    send_raw(&mut alice, r#"{"event":"explode","data":{}}"#).await;
    assert_eq!(error_code(&recv(&mut alice).await), Some(ErrorCode::Malformed));

    send(&mut alice, &ClientEvent::Message(text_to("bob", "L1", "still here"))).await;
    recv_until(&mut alice, is_message).await;
}

#[tokio::test]
async fn invalid_message_is_not_persisted() {
    let server = start_single().await;
    let mut alice = connect(&server, "alice").await;

    send(&mut alice, &ClientEvent::Message(text_to("bob", "L1", "   "))).await;
    assert_eq!(error_code(&recv(&mut alice).await), Some(ErrorCode::Validation));

    send(&mut alice, &ClientEvent::Message(text_to("alice", "L1", "me"))).await;
    assert_eq!(error_code(&recv(&mut alice).await), Some(ErrorCode::Validation));

    let mut system = text_to("bob", "L1", "fake notice");
    system.message_type = MessageType::System;
    send(&mut alice, &ClientEvent::Message(system)).await;
    assert_eq!(error_code(&recv(&mut alice).await), Some(ErrorCode::Validation));

    assert!(server.gateway.service().store().is_empty().await);
}

// ===========================================================================
// Disconnects
// ===========================================================================

#[tokio::test]
async fn disconnect_notifies_room_peer() {
    let server = start_single().await;
    let mut alice = connect(&server, "alice").await;
    let mut bob = connect(&server, "bob").await;

    send(&mut alice, &ClientEvent::Message(text_to("bob", "L1", "bye soon"))).await;
    recv_until(&mut bob, is_message).await;
    recv_until(&mut alice, is_message).await;

    bob.close(None).await.unwrap();
    match recv_until(&mut alice, |e| matches!(e, ServerEvent::UserOffline { .. })).await {
        ServerEvent::UserOffline { user_id } => assert_eq!(user_id, UserId::new("bob")),
        _ => unreachable!(),
    }
    assert!(!server.gateway.is_online(&UserId::new("bob")).await);
}

#[tokio::test]
async fn silent_client_is_dropped_after_heartbeat_timeout() {
    let server = start_with_settings(GatewaySettings {
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_millis(300),
        ..GatewaySettings::default()
    })
    .await;
    let mut alice = connect(&server, "alice").await;
    let mut bob = connect(&server, "bob").await;

    send(&mut alice, &ClientEvent::Message(text_to("bob", "L1", "still there?"))).await;
    recv_until(&mut bob, is_message).await;
    assert!(server.gateway.is_online(&UserId::new("bob")).await);

    // Bob keeps the socket open but stops reading, so pings go unanswered.
    // Alice keeps polling and answers them.
    match recv_until(&mut alice, |e| matches!(e, ServerEvent::UserOffline { .. })).await {
        ServerEvent::UserOffline { user_id } => assert_eq!(user_id, UserId::new("bob")),
        _ => unreachable!(),
    }
    assert!(!server.gateway.is_online(&UserId::new("bob")).await);
    assert!(server.gateway.is_online(&UserId::new("alice")).await);
    drop(bob);
}

#[tokio::test]
async fn second_connection_replaces_first() {
    let server = start_single().await;
    let mut first = connect(&server, "alice").await;
    let mut second = connect(&server, "alice").await;

    expect_closed(&mut first).await;
    assert!(server.gateway.is_online(&UserId::new("alice")).await);

    send(&mut second, &ClientEvent::Message(text_to("bob", "L1", "from the new tab"))).await;
    recv_until(&mut second, is_message).await;
}

// ===========================================================================
// Signed identity tokens
// ===========================================================================

#[tokio::test]
async fn signed_tokens_authenticate_until_expiry() {
    use parley_proto::message::Timestamp;
    use parley_server::auth::{SignedTokenVerifier, TokenIssuer};
    use parley_server::fanout::LocalBus;
    use parley_server::store::InMemoryMessageStore;
    use std::sync::Arc;

    let issuer = TokenIssuer::from_seed(&[7u8; 32]);
    let verifier = SignedTokenVerifier::from_base64(&issuer.public_key_base64()).unwrap();
    let (broker, rx) = LocalBus::new().attach("gw-signed");
    let server = common::start_with_broker(
        Arc::new(InMemoryMessageStore::new()),
        Arc::new(broker),
        rx,
        Arc::new(verifier),
    )
    .await;

    let alice = UserId::new("alice");
    let valid = issuer
        .issue(&alice, Timestamp::from_millis(Timestamp::now().as_millis() + 60_000))
        .unwrap();
    let mut ws = open(&server).await;
    send(&mut ws, &ClientEvent::Connect { auth_token: valid }).await;
    match recv(&mut ws).await {
        ServerEvent::Connected { user_id } => assert_eq!(user_id, alice),
        other => panic!("expected connected, got {other:?}"),
    }

    let expired = issuer
        .issue(&alice, Timestamp::from_millis(Timestamp::now().as_millis() - 1))
        .unwrap();
    let mut ws = open(&server).await;
    send(&mut ws, &ClientEvent::Connect { auth_token: expired }).await;
    assert_eq!(error_code(&recv(&mut ws).await), Some(ErrorCode::Authentication));
    expect_closed(&mut ws).await;
}

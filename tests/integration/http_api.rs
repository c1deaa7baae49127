//! Request/response API: authentication, pagination, acknowledgements and
//! deletion over HTTP.

mod common;

use common::{TestServer, start_single, text_to, token};
use parley_proto::message::{Message, MessageId, MessageStatus};
use parley_server::api::{DeleteResponse, ErrorBody, HealthResponse};
use parley_server::service::ThreadPage;
use reqwest::StatusCode;

struct Api {
    client: reqwest::Client,
    server: TestServer,
}

impl Api {
    async fn start() -> Self {
        Self {
            client: reqwest::Client::new(),
            server: start_single().await,
        }
    }

    async fn send(&self, from: &str, to: &str, content: &str) -> Message {
        let response = self
            .client
            .post(self.server.http_url("/messages"))
            .bearer_auth(token(from))
            .json(&text_to(to, "L1", content))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        response.json().await.unwrap()
    }

    async fn page(&self, user: &str, query: &str) -> reqwest::Response {
        self.client
            .get(self.server.http_url(&format!("/listings/L1/messages{query}")))
            .bearer_auth(token(user))
            .send()
            .await
            .unwrap()
    }

    async fn post_as(&self, user: &str, path: &str) -> reqwest::Response {
        self.client
            .post(self.server.http_url(path))
            .bearer_auth(token(user))
            .send()
            .await
            .unwrap()
    }

    async fn delete_as(&self, user: &str, id: MessageId) -> reqwest::Response {
        self.client
            .delete(self.server.http_url(&format!("/messages/{id}")))
            .bearer_auth(token(user))
            .send()
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn health_needs_no_token() {
    let api = Api::start().await;
    let response = api
        .client
        .get(api.server.http_url("/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let health: HealthResponse = response.json().await.unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.instance_id, "gw-single");
    assert_eq!(health.connections, 0);
}

#[tokio::test]
async fn missing_or_bad_token_is_401() {
    let api = Api::start().await;
    let response = api
        .client
        .post(api.server.http_url("/messages"))
        .json(&text_to("bob", "L1", "hi"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: ErrorBody = response.json().await.unwrap();
    assert!(body.error.contains("authentication"));

    let response = api
        .client
        .get(api.server.http_url("/listings/L1/messages"))
        .bearer_auth("forged")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn fifteen_messages_paginate_newest_first() {
    let api = Api::start().await;
    let mut sent = Vec::new();
    for i in 0..15 {
        sent.push(api.send("alice", "bob", &format!("m{i:02}")).await);
    }

    let first: ThreadPage = api.page("bob", "?page=1&limit=10").await.json().await.unwrap();
    assert_eq!(first.total, 15);
    assert!(first.has_more);
    let contents: Vec<_> = first.messages.iter().map(|m| m.content.clone()).collect();
    let expected: Vec<_> = (5..15).rev().map(|i| format!("m{i:02}")).collect();
    assert_eq!(contents, expected);

    let second: ThreadPage = api.page("bob", "?page=2&limit=10").await.json().await.unwrap();
    assert_eq!(second.messages.len(), 5);
    assert!(!second.has_more);
    assert_eq!(second.messages[4].id, sent[0].id);

    let ascending: ThreadPage = api
        .page("alice", "?page=1&limit=3&sort=asc")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(ascending.messages[0].id, sent[0].id);

    // Carol takes part in no thread of this listing.
    let outsider: ThreadPage = api.page("carol", "").await.json().await.unwrap();
    assert_eq!(outsider.total, 0);
}

#[tokio::test]
async fn bad_page_parameters_are_400() {
    let api = Api::start().await;
    for query in ["?limit=0", "?limit=101", "?page=0"] {
        let response = api.page("alice", query).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{query}");
    }
}

#[tokio::test]
async fn read_and_delivered_are_receiver_only() {
    let api = Api::start().await;
    let message = api.send("alice", "bob", "ack me").await;

    let response = api
        .post_as("alice", &format!("/messages/{}/read", message.id))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let response = api
        .post_as("carol", &format!("/messages/{}/delivered", message.id))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = api
        .post_as("bob", &format!("/messages/{}/delivered", message.id))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let delivered: Message = response.json().await.unwrap();
    assert_eq!(delivered.status, MessageStatus::Delivered);

    let read: Message = api
        .post_as("bob", &format!("/messages/{}/read", message.id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(read.status, MessageStatus::Read);
    assert!(read.read_at.is_some());

    // Going back is a no-op.
    let again: Message = api
        .post_as("bob", &format!("/messages/{}/delivered", message.id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(again.status, MessageStatus::Read);

    let response = api
        .post_as("bob", &format!("/messages/{}/read", MessageId::new()))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_hides_message_and_is_participant_only() {
    let api = Api::start().await;
    let keep = api.send("alice", "bob", "keep").await;
    let doomed = api.send("alice", "bob", "doomed").await;

    let response = api.delete_as("carol", doomed.id).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let body: DeleteResponse = api.delete_as("bob", doomed.id).await.json().await.unwrap();
    assert!(body.deleted);
    let body: DeleteResponse = api.delete_as("alice", doomed.id).await.json().await.unwrap();
    assert!(!body.deleted);

    let page: ThreadPage = api.page("alice", "").await.json().await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.messages[0].id, keep.id);

    let synced: Vec<Message> = api
        .client
        .get(api.server.http_url("/threads/alice-bob/messages?since=0"))
        .bearer_auth(token("bob"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(synced.len(), 1);
    assert_eq!(synced[0].id, keep.id);

    let response = api
        .client
        .get(api.server.http_url("/threads/alice-bob/messages"))
        .bearer_auth(token("carol"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn invalid_send_is_400() {
    let api = Api::start().await;
    let response = api
        .client
        .post(api.server.http_url("/messages"))
        .bearer_auth(token("alice"))
        .json(&text_to("bob", "L1", ""))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(api.server.gateway.service().store().is_empty().await);
}

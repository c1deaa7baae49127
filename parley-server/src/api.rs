//! Request/response API over the message service.
//!
//! Every route except `/health` requires `Authorization: Bearer <token>`,
//! verified by the same [`IdentityVerifier`](crate::auth::IdentityVerifier)
//! as socket connections.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parley_proto::message::{
    ListingId, Message, MessageId, SendMessage, ThreadId, Timestamp, UserId,
};
use serde::{Deserialize, Serialize};

use crate::auth::AuthError;
use crate::error::ChatError;
use crate::gateway::Gateway;
use crate::service::{PageRequest, ThreadPage};
use crate::store::MessageStore;

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::Authorization(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable reason.
    pub error: String,
}

/// Response body of `DELETE /messages/{id}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    /// Whether this call deleted the message.
    pub deleted: bool,
}

/// Response body of `GET /health`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"`.
    pub status: String,
    /// Broker id of the answering instance.
    pub instance_id: String,
    /// Live socket connections on the instance.
    pub connections: usize,
}

/// Query string of `GET /threads/{threadId}/messages`.
#[derive(Debug, Default, Deserialize)]
pub struct SyncQuery {
    #[serde(default)]
    since: Timestamp,
    #[serde(default)]
    limit: Option<usize>,
}

/// Routes of the API, to be merged into the gateway router.
pub fn routes<S: MessageStore>() -> Router<Arc<Gateway<S>>> {
    Router::new()
        .route("/health", get(health::<S>))
        .route("/messages", post(send::<S>))
        .route("/messages/{message_id}", axum::routing::delete(delete::<S>))
        .route("/messages/{message_id}/read", post(mark_read::<S>))
        .route("/messages/{message_id}/delivered", post(mark_delivered::<S>))
        .route("/listings/{listing_id}/messages", get(get_thread::<S>))
        .route("/threads/{thread_id}/messages", get(sync::<S>))
}

fn authenticate<S: MessageStore>(
    gateway: &Gateway<S>,
    headers: &HeaderMap,
) -> Result<UserId, ChatError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| AuthError::Malformed("missing bearer token".into()))?;
    Ok(gateway.verifier().verify(token.trim())?)
}

async fn health<S: MessageStore>(State(gateway): State<Arc<Gateway<S>>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        instance_id: gateway.instance_id().to_owned(),
        connections: gateway.connection_count().await,
    })
}

async fn send<S: MessageStore>(
    State(gateway): State<Arc<Gateway<S>>>,
    headers: HeaderMap,
    Json(request): Json<SendMessage>,
) -> Result<(StatusCode, Json<Message>), ChatError> {
    let user = authenticate(&gateway, &headers)?;
    let message = gateway.service().send(request, &user, None).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn get_thread<S: MessageStore>(
    State(gateway): State<Arc<Gateway<S>>>,
    headers: HeaderMap,
    Path(listing_id): Path<String>,
    Query(page): Query<PageRequest>,
) -> Result<Json<ThreadPage>, ChatError> {
    let user = authenticate(&gateway, &headers)?;
    let page = gateway
        .service()
        .get_thread(&ListingId::new(listing_id), &user, page)
        .await?;
    Ok(Json(page))
}

async fn mark_read<S: MessageStore>(
    State(gateway): State<Arc<Gateway<S>>>,
    headers: HeaderMap,
    Path(message_id): Path<MessageId>,
) -> Result<Json<Message>, ChatError> {
    let user = authenticate(&gateway, &headers)?;
    Ok(Json(gateway.service().mark_read(&message_id, &user).await?))
}

async fn mark_delivered<S: MessageStore>(
    State(gateway): State<Arc<Gateway<S>>>,
    headers: HeaderMap,
    Path(message_id): Path<MessageId>,
) -> Result<Json<Message>, ChatError> {
    let user = authenticate(&gateway, &headers)?;
    Ok(Json(
        gateway.service().mark_delivered(&message_id, &user).await?,
    ))
}

async fn delete<S: MessageStore>(
    State(gateway): State<Arc<Gateway<S>>>,
    headers: HeaderMap,
    Path(message_id): Path<MessageId>,
) -> Result<Json<DeleteResponse>, ChatError> {
    let user = authenticate(&gateway, &headers)?;
    let deleted = gateway.service().delete(&message_id, &user).await?;
    Ok(Json(DeleteResponse { deleted }))
}

async fn sync<S: MessageStore>(
    State(gateway): State<Arc<Gateway<S>>>,
    headers: HeaderMap,
    Path(thread_id): Path<String>,
    Query(query): Query<SyncQuery>,
) -> Result<Json<Vec<Message>>, ChatError> {
    let user = authenticate(&gateway, &headers)?;
    let messages = gateway
        .service()
        .sync(&ThreadId::new(thread_id), &user, query.since, query.limit)
        .await?;
    Ok(Json(messages))
}

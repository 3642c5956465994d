//! HTTP surface: four JSON `POST` routes, each carrying the shared secret in
//! its body's `authorization` field.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit, FromRequest, Request, State};
use axum::routing::post;
use axum::{Json, Router, async_trait};
use log::{Level, info};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::TcpListener;

use crate::error::{RelayError, RelayResult};
use crate::relay::{
    ChatCompletionRequest, ChatReply, RegisterUserRequest, Relay, RemoveUserRequest,
    ValidateConversationRequest,
};

const BODY_LIMIT: usize = 10 * 1024 * 1024;

pub type AppState = Arc<Relay>;

/// A JSON body whose `authorization` field matched the shared secret.
///
/// The token is checked before the rest of the payload is validated, so a
/// malformed body without the right token is refused rather than reported.
pub struct Authorized<T>(pub T);

#[async_trait]
impl<T> FromRequest<AppState> for Authorized<T>
where
    T: DeserializeOwned + Send,
{
    type Rejection = RelayError;

    async fn from_request(req: Request, state: &AppState) -> Result<Self, Self::Rejection> {
        let origin = caller_origin(&req);
        let body = Bytes::from_request(req, state).await.ok();
        let value = body.and_then(|body| serde_json::from_slice::<Value>(&body).ok());
        let token = value
            .as_ref()
            .and_then(|v| v.get("authorization"))
            .and_then(Value::as_str);
        state.authorize(token, &origin)?;

        let value = value.ok_or(RelayError::Unauthorized)?;
        serde_json::from_value(value)
            .map(Authorized)
            .map_err(|err| RelayError::Validation(format!("invalid request body: {err}")))
    }
}

/// `x-forwarded-for` when behind a proxy, else the socket peer.
fn caller_origin(req: &Request) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        return forwarded.to_string();
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn register_user(
    State(relay): State<AppState>,
    Authorized(req): Authorized<RegisterUserRequest>,
) -> RelayResult<String> {
    relay.register_user(req).await
}

async fn remove_user(
    State(relay): State<AppState>,
    Authorized(req): Authorized<RemoveUserRequest>,
) -> RelayResult<String> {
    relay.remove_user(req).await
}

async fn validate_conversation(
    State(relay): State<AppState>,
    Authorized(req): Authorized<ValidateConversationRequest>,
) -> RelayResult<String> {
    relay.validate_conversation(req).await
}

async fn chat_completion(
    State(relay): State<AppState>,
    Authorized(req): Authorized<ChatCompletionRequest>,
) -> RelayResult<Json<ChatReply>> {
    relay.chat_completion(req).await.map(Json)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/registeruser", post(register_user))
        .route("/api/removeuser", post(remove_user))
        .route("/api/validateconversation", post(validate_conversation))
        .route("/api/chatcompletion", post(chat_completion))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .with_state(state)
}

/// Binds `addr` and serves until ctrl-c.
pub async fn serve(addr: SocketAddr, state: AppState) -> Result<()> {
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let local = listener.local_addr()?;
    state
        .notifier()
        .notify(Level::Info, format!("[server] listening for requests on {local}"));

    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(err) => {
            log::warn!("Cannot listen for ctrl-c ({err}); serving until killed");
            std::future::pending::<()>().await;
        }
    }
}

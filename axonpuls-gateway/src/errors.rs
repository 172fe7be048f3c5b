use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio::sync::mpsc::error::SendError;

use axonpuls_helpers::http_types::ResponseMessage;

/// Surfaced by the health/drain HTTP surface.
#[derive(Debug)]
pub enum GatewayHttpError {
    Unhealthy(String),
    NotReady(String),
    Internal(String),
}

impl fmt::Display for GatewayHttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayHttpError::Unhealthy(msg) => write!(f, "unhealthy: {msg}"),
            GatewayHttpError::NotReady(msg) => write!(f, "not ready: {msg}"),
            GatewayHttpError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for GatewayHttpError {}

impl IntoResponse for GatewayHttpError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            GatewayHttpError::Unhealthy(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            GatewayHttpError::NotReady(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            GatewayHttpError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };
        (status, Json(ResponseMessage::new(message))).into_response()
    }
}

/// Errors raised while driving a single WebSocket connection.
#[derive(Debug)]
pub enum WebSocketConnError {
    SendMessageError(String),
    RegistrationError(String),
    MalformedFrame(String),
}

impl fmt::Display for WebSocketConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebSocketConnError::SendMessageError(msg) => write!(f, "failed to send frame: {msg}"),
            WebSocketConnError::RegistrationError(msg) => write!(f, "failed to register session: {msg}"),
            WebSocketConnError::MalformedFrame(msg) => write!(f, "malformed frame: {msg}"),
        }
    }
}

impl std::error::Error for WebSocketConnError {}

impl From<axum::Error> for WebSocketConnError {
    fn from(error: axum::Error) -> Self {
        WebSocketConnError::SendMessageError(error.to_string())
    }
}

impl<T> From<SendError<T>> for WebSocketConnError {
    fn from(error: SendError<T>) -> Self {
        WebSocketConnError::SendMessageError(error.to_string())
    }
}

impl From<serde_json::Error> for WebSocketConnError {
    fn from(error: serde_json::Error) -> Self {
        WebSocketConnError::MalformedFrame(error.to_string())
    }
}

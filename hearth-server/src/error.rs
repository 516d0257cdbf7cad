//! Handler and pipeline errors

use crate::context::ContextError;
use crate::render::RenderError;
use crate::session::SessionError;
use crate::store::StoreError;
use hyper::StatusCode;

/// What a handler can fail with. Every variant maps to a response status.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Answer with this status and its standard error page
    #[error("{0}")]
    Status(StatusCode),

    #[error("render: {0}")]
    Render(#[from] RenderError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    pub fn not_found() -> Self {
        Self::Status(StatusCode::NOT_FOUND)
    }

    pub fn unauthorized() -> Self {
        Self::Status(StatusCode::UNAUTHORIZED)
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Status(code) => *code,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Why a request ended without the handler's response
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to read request body: {0}")]
    Body(Box<dyn std::error::Error + Send + Sync>),

    #[error("request body exceeds {0} bytes")]
    TooLarge(usize),

    #[error("failed to build request context: {0}")]
    Context(#[from] ContextError),

    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),

    #[error("handler panicked: {0}")]
    Panic(String),

    #[error("failed to save session: {0}")]
    Session(#[from] SessionError),
}

impl PipelineError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Body(_) => StatusCode::BAD_REQUEST,
            Self::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Handler(e) => e.status(),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Text shown on the error page for `status`
pub fn error_message(status: StatusCode) -> &'static str {
    match status {
        StatusCode::NOT_FOUND => "That page doesn't exist",
        StatusCode::UNAUTHORIZED => "You need to log in first",
        StatusCode::INTERNAL_SERVER_ERROR => "Something is going horribly wrong!",
        StatusCode::BAD_REQUEST => "You can't do that!",
        other => other.canonical_reason().unwrap_or(""),
    }
}

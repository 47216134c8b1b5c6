use rocket::http::Status;
use rocket::request::Request;
use rocket::response::{self, status, Responder};
use rocket::serde::json::Json;
use thiserror::Error;

use crate::models::{DeviceAction, EnrollmentMethod, Platform};

pub type FleetResult<T> = Result<T, FleetError>;

/// Errors surfaced by the orchestration core and the HTTP layer.
#[derive(Error, Debug)]
pub enum FleetError {
    /// The request is a no-op given the current terminal state.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unprocessable: {0}")]
    UnprocessableState(#[from] Unprocessable),

    #[error("{0} not found")]
    NotFound(String),

    /// The external enrollment program API failed; always retryable.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Reasons a request is rejected as invalid for the host's current state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Unprocessable {
    #[error("host already has a pending {0} action")]
    ActionPending(DeviceAction),

    #[error("{0}")]
    InvalidState(String),

    #[error("{action} is not supported for {platform} hosts enrolled {enrollment_method}")]
    UnsupportedPlatform {
        action: DeviceAction,
        platform: Platform,
        enrollment_method: EnrollmentMethod,
    },

    #[error("host is not enrolled in MDM")]
    NotEnrolled,

    #[error("host state changed concurrently, retry the request")]
    ConcurrentUpdate,
}

impl FleetError {
    pub fn not_found(what: impl Into<String>) -> Self {
        FleetError::NotFound(what.into())
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        FleetError::UnprocessableState(Unprocessable::InvalidState(reason.into()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FleetError::Conflict(_) => "conflict",
            FleetError::UnprocessableState(Unprocessable::ActionPending(_)) => "action_pending",
            FleetError::UnprocessableState(Unprocessable::InvalidState(_)) => "invalid_state",
            FleetError::UnprocessableState(Unprocessable::UnsupportedPlatform { .. }) => {
                "unsupported_platform"
            }
            FleetError::UnprocessableState(Unprocessable::NotEnrolled) => "not_enrolled",
            FleetError::UnprocessableState(Unprocessable::ConcurrentUpdate) => "concurrent_update",
            FleetError::NotFound(_) => "not_found",
            FleetError::UpstreamUnavailable(_) => "upstream_unavailable",
            FleetError::Timeout(_) => "timeout",
            FleetError::Database(_)
            | FleetError::Pool(_)
            | FleetError::Serialization(_)
            | FleetError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> Status {
        match self {
            FleetError::Conflict(_) => Status::Conflict,
            FleetError::UnprocessableState(_) => Status::UnprocessableEntity,
            FleetError::NotFound(_) => Status::NotFound,
            FleetError::UpstreamUnavailable(_) => Status::ServiceUnavailable,
            FleetError::Timeout(_) => Status::GatewayTimeout,
            _ => Status::InternalServerError,
        }
    }
}

impl<'r> Responder<'r, 'static> for FleetError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let code = self.status();
        if code == Status::InternalServerError {
            log::error!("{} {} failed: {}", req.method(), req.uri(), self);
        }
        let body = Json(serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));
        status::Custom(code, body).respond_to(req)
    }
}

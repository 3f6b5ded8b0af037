use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use crate::responses::RequestMeta;
use crate::types::{PaymentStatus, UserId, UserRole};

pub const E_BAD_INPUT: &str = "BAD_INPUT";
pub const E_DB_FAILURE: &str = "DB_FAILURE";
pub const E_INVALID_SIGNATURE: &str = "INVALID_SIGNATURE";
pub const E_RULE_NOT_FOUND: &str = "RULE_NOT_FOUND";
pub const E_INVALID_RULE_SET: &str = "INVALID_RULE_SET";
pub const E_INTEGRITY: &str = "HIERARCHY_INTEGRITY";
pub const E_NOT_FOUND: &str = "NOT_FOUND";
pub const E_PAYMENT_CONFLICT: &str = "PAYMENT_CONFLICT";
pub const E_USER_CONFLICT: &str = "USER_CONFLICT";
pub const E_POLICY_MISSING: &str = "POLICY_NOT_CONFIGURED";
pub const E_DEPTH_LIMIT: &str = "DEPTH_LIMIT_EXCEEDED";

/// Failures of the income engine and its stores.
#[derive(Debug, thiserror::Error)]
pub enum IncomeError {
    #[error("no commission rule for type {referral_type}, bucket {total_downline}, layer {layer}")]
    RuleNotFound {
        referral_type: UserRole,
        total_downline: i32,
        layer: i32,
    },

    #[error("invalid commission rule set: {0}")]
    InvalidRuleSet(String),

    #[error("payment signature verification failed")]
    InvalidSignature,

    #[error("ancestor walk from user {user_id} exceeded {bound} levels")]
    CycleDetected { user_id: UserId, bound: usize },

    #[error("user {user_id} points at unknown parent {parent_id}")]
    UnknownParent { user_id: UserId, parent_id: UserId },

    #[error("user {0} already exists")]
    DuplicateUser(UserId),

    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("payment {0} not found")]
    PaymentNotFound(String),

    #[error("payment cannot move from {from} to {to}")]
    InvalidTransition { from: PaymentStatus, to: PaymentStatus },

    #[error("payment {payment_id} is {status}, not captured")]
    PaymentNotCaptured {
        payment_id: Uuid,
        status: PaymentStatus,
    },

    #[error("payment amount mismatch: expected {expected}, got {actual}")]
    AmountMismatch { expected: i64, actual: i64 },

    #[error("policy `{0}` is not configured")]
    PolicyNotConfigured(String),

    #[error("user {parent_id} is at the maximum recruiting depth {max_depth}")]
    DepthLimitExceeded { parent_id: UserId, max_depth: usize },

    #[error("payment {0} was already distributed")]
    DuplicateDistribution(Uuid),

    #[error("{0}")]
    InvalidInput(String),

    #[error(transparent)]
    Storage(#[from] sqlx::Error),
}

impl IncomeError {
    /// Maps a domain failure onto the HTTP error envelope.
    pub fn into_api(self, meta: RequestMeta) -> ApiErrorWithMeta {
        let (error, code) = match self {
            IncomeError::InvalidSignature => (
                ApiError::Unauthorized(self.to_string()),
                E_INVALID_SIGNATURE,
            ),
            IncomeError::RuleNotFound { .. } => {
                error!("distribution blocked: {}", self);
                (ApiError::Unprocessable(self.to_string()), E_RULE_NOT_FOUND)
            }
            IncomeError::InvalidRuleSet(_) => {
                (ApiError::Unprocessable(self.to_string()), E_INVALID_RULE_SET)
            }
            IncomeError::CycleDetected { .. } | IncomeError::UnknownParent { .. } => {
                error!("hierarchy integrity violation: {}", self);
                (ApiError::Internal(self.into()), E_INTEGRITY)
            }
            IncomeError::UserNotFound(_) | IncomeError::PaymentNotFound(_) => {
                (ApiError::NotFound(self.to_string()), E_NOT_FOUND)
            }
            IncomeError::DuplicateUser(_) => {
                (ApiError::Conflict(self.to_string()), E_USER_CONFLICT)
            }
            IncomeError::InvalidTransition { .. }
            | IncomeError::AmountMismatch { .. }
            | IncomeError::PaymentNotCaptured { .. }
            | IncomeError::DuplicateDistribution(_) => {
                (ApiError::Conflict(self.to_string()), E_PAYMENT_CONFLICT)
            }
            IncomeError::PolicyNotConfigured(_) => {
                error!("distribution blocked: {}", self);
                (ApiError::Unprocessable(self.to_string()), E_POLICY_MISSING)
            }
            IncomeError::DepthLimitExceeded { .. } => {
                (ApiError::Unprocessable(self.to_string()), E_DEPTH_LIMIT)
            }
            IncomeError::InvalidInput(msg) => (ApiError::BadRequest(msg), E_BAD_INPUT),
            IncomeError::Storage(e) => (ApiError::Internal(e.into()), E_DB_FAILURE),
        };
        error.with_meta(meta).with_code(code)
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    Unprocessable(String),
    Internal(anyhow::Error),
}

#[derive(Debug)]
pub struct ApiErrorWithMeta {
    error: ApiError,
    meta: RequestMeta,
    code: Option<String>,
}

impl ApiError {
    pub fn with_meta(self, meta: RequestMeta) -> ApiErrorWithMeta {
        ApiErrorWithMeta {
            error: self,
            meta,
            code: None,
        }
    }
}

impl ApiErrorWithMeta {
    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }
}

impl IntoResponse for ApiErrorWithMeta {
    fn into_response(self) -> Response {
        let (status, error_message) = match self.error {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Internal(e) => {
                error!("internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        let mut body = json!({
            "request_id": self.meta.request_id,
            "error": error_message,
        });
        if let Some(code) = self.code {
            body["code"] = json!(code);
        }

        (status, Json(body)).into_response()
    }
}

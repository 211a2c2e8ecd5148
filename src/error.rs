// src/error.rs
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use std::fmt;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unauthorized(String),
    Forbidden(String),
    Conflict(String),
    InternalServerError(String),
    ValidationError(String),
    DatabaseError(sqlx::Error),
    AuthError(String),
    TooManyAttempts(String),
    ServiceUnavailable(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    message: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ApiError::BadRequest(msg) => write!(f, "Bad Request: {}", msg),
            ApiError::NotFound(msg) => write!(f, "Not Found: {}", msg),
            ApiError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            ApiError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            ApiError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            ApiError::InternalServerError(msg) => write!(f, "Internal Server Error: {}", msg),
            ApiError::ValidationError(msg) => write!(f, "Validation Error: {}", msg),
            ApiError::DatabaseError(err) => write!(f, "Database Error: {}", err),
            ApiError::AuthError(msg) => write!(f, "Auth Error: {}", msg),
            ApiError::TooManyAttempts(msg) => write!(f, "Too Many Attempts: {}", msg),
            ApiError::ServiceUnavailable(msg) => write!(f, "Service Unavailable: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    /// Message shown to the user in an inline banner.
    ///
    /// Internal failures collapse to one generic sentence; everything else
    /// carries the message it was built with.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::Forbidden(msg)
            | ApiError::Conflict(msg)
            | ApiError::ValidationError(msg)
            | ApiError::AuthError(msg)
            | ApiError::TooManyAttempts(msg)
            | ApiError::ServiceUnavailable(msg) => msg.clone(),
            ApiError::InternalServerError(_) | ApiError::DatabaseError(_) => {
                "Something went wrong. Please try again.".to_string()
            }
        }
    }
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        if matches!(self, ApiError::InternalServerError(_) | ApiError::DatabaseError(_)) {
            log::error!("{}", self);
        }

        let error_response = ErrorResponse {
            success: false,
            message: self.user_message(),
        };

        match self {
            ApiError::BadRequest(_) => HttpResponse::BadRequest().json(error_response),
            ApiError::NotFound(_) => HttpResponse::NotFound().json(error_response),
            ApiError::Unauthorized(_) => HttpResponse::Unauthorized().json(error_response),
            ApiError::Forbidden(_) => HttpResponse::Forbidden().json(error_response),
            ApiError::Conflict(_) => HttpResponse::Conflict().json(error_response),
            ApiError::ValidationError(_) => HttpResponse::UnprocessableEntity().json(error_response),
            ApiError::DatabaseError(_) => HttpResponse::InternalServerError().json(error_response),
            ApiError::AuthError(_) => HttpResponse::Unauthorized().json(error_response),
            ApiError::TooManyAttempts(_) => HttpResponse::TooManyRequests().json(error_response),
            ApiError::ServiceUnavailable(_) => HttpResponse::ServiceUnavailable().json(error_response),
            ApiError::InternalServerError(_) => HttpResponse::InternalServerError().json(error_response),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::DatabaseError(err)
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(err: validator::ValidationErrors) -> Self {
        let mut messages: Vec<String> = err
            .field_errors()
            .values()
            .flat_map(|errors| errors.iter())
            .filter_map(|e| e.message.as_ref().map(|m| m.to_string()))
            .collect();
        messages.sort();

        if messages.is_empty() {
            ApiError::ValidationError(err.to_string())
        } else {
            ApiError::ValidationError(messages.join("; "))
        }
    }
}

// Domain-specific constructors
impl ApiError {
    pub fn bad_request(msg: &str) -> Self {
        ApiError::BadRequest(msg.to_string())
    }

    pub fn not_found(entity: &str) -> Self {
        ApiError::NotFound(format!("{} not found", entity))
    }

    pub fn soil_test_not_found(id: &str) -> Self {
        ApiError::NotFound(format!("Soil test with ID '{}' not found", id))
    }

    pub fn invalid_credentials() -> Self {
        ApiError::AuthError("Invalid email or password".to_string())
    }

    pub fn too_many_attempts() -> Self {
        ApiError::TooManyAttempts("Too many sign in attempts. Please try again later".to_string())
    }

    pub fn email_taken() -> Self {
        ApiError::Conflict("An account with this email already exists".to_string())
    }

    pub fn invalid_transition(from: &str, to: &str) -> Self {
        ApiError::BadRequest(format!("Invalid status transition from {} to {}", from, to))
    }

    pub fn insufficient_permissions() -> Self {
        ApiError::Forbidden("Insufficient permissions".to_string())
    }
}

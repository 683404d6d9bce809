use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error as ThisError;

use crate::store::StoreError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// The account cannot afford the requested generation. No side effects.
    #[error("Insufficient available credits")]
    InsufficientFunds,

    /// Requested resource not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: &'static str, id: String },

    /// No adapter is registered for the requested (provider, model) pair
    #[error("No provider registered for {provider}/{model}")]
    ProviderNotFound { provider: String, model: String },

    /// The provider adapter rejected the generation input
    #[error("{message}")]
    InvalidInput { message: String },

    /// Invalid request data or business rule violation
    #[error("{message}")]
    BadRequest { message: String },

    /// A webhook whose output count does not match the pending asset count;
    /// applying it partially would be ambiguous, so nothing was applied.
    #[error("Webhook carried {outputs} outputs for {pending} pending assets")]
    WebhookCountMismatch { outputs: usize, pending: usize },

    /// Store operation error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::ProviderNotFound { .. } => StatusCode::NOT_FOUND,
            Error::InvalidInput { .. } | Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::WebhookCountMismatch { .. } => StatusCode::BAD_REQUEST,
            Error::Store(store_err) => match store_err {
                StoreError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
                StoreError::AccountNotFound
                | StoreError::ReservationNotFound
                | StoreError::AssetNotFound
                | StoreError::ModelNotFound
                | StoreError::FilterNotFound => StatusCode::NOT_FOUND,
                // A race-condition guard firing is our bug, not the client's
                StoreError::InvalidReservationState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                StoreError::Database(_) | StoreError::Other(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal details
    pub fn user_message(&self) -> String {
        match self {
            Error::InsufficientFunds => "Insufficient available credits".to_string(),
            Error::NotFound { resource, id } => format!("{resource} with ID {id} not found"),
            Error::ProviderNotFound { provider, model } => {
                format!("Invalid provider or model specified: {provider}/{model}")
            }
            Error::InvalidInput { message } | Error::BadRequest { message } => message.clone(),
            Error::WebhookCountMismatch { outputs, pending } => {
                format!("Output count {outputs} does not match pending asset count {pending}")
            }
            Error::Store(store_err) => match store_err {
                StoreError::InsufficientFunds { .. } => {
                    "Insufficient available credits".to_string()
                }
                StoreError::AccountNotFound => "Account not found".to_string(),
                StoreError::ReservationNotFound => "Reservation not found".to_string(),
                StoreError::AssetNotFound => "Asset not found".to_string(),
                StoreError::ModelNotFound => "Model not found".to_string(),
                StoreError::FilterNotFound => "Filter not found".to_string(),
                _ => "Internal server error".to_string(),
            },
            Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details - level tiered by severity
        match &self {
            Error::Store(StoreError::InvalidReservationState { .. }) => {
                // Should never fire in normal operation; a duplicate
                // transition reached the store. Loud, as a defect.
                tracing::error!("Reservation state guard tripped: {:#}", self);
            }
            Error::Store(StoreError::Database(_))
            | Error::Store(StoreError::Other(_))
            | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::WebhookCountMismatch { .. } => {
                tracing::warn!("Webhook rejected: {}", self);
            }
            _ => {
                tracing::debug!("Client error: {}", self);
            }
        }

        (self.status_code(), self.user_message()).into_response()
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;

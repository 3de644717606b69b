use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use uuid::Uuid;

/// Run-fatal errors from the fetch stage.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl FetchError {
    /// Network failures may succeed on a later attempt; a body that does not
    /// parse will not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Network(_))
    }
}

/// Per-record errors from the process stage. Never fatal to the run.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("Upsert failed for {key}: {source}")]
    Upsert {
        key: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    NotFound(String),

    #[error("Duplicate natural key: {0}")]
    DuplicateKey(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub(crate) fn from_sqlx(e: sqlx::Error, key: &str) -> Self {
        if let sqlx::Error::Database(db_err) = &e
            && db_err.is_unique_violation()
        {
            return StoreError::DuplicateKey(key.to_string());
        }
        StoreError::Database(e)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task {0} not found")]
    NotFound(Uuid),

    #[error("Task {task_id} exhausted {attempts} attempts: {last_error}")]
    RetryExhausted {
        task_id: Uuid,
        attempts: i32,
        last_error: String,
    },
}

/// Errors surfaced by the run trigger API.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Invalid feed URL '{0}'")]
    InvalidFeedUrl(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Invalid cron expression '{expression}': {message}")]
    InvalidCron { expression: String, message: String },

    #[error("Unknown scheduled task '{0}'")]
    UnknownTask(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Import(#[from] ImportError),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        AppError::Import(ImportError::Store(e))
    }
}

impl From<QueueError> for AppError {
    fn from(e: QueueError) -> Self {
        AppError::Import(ImportError::Queue(e))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Import(ImportError::InvalidFeedUrl(_)) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            AppError::Import(ImportError::Store(StoreError::NotFound(msg))) => {
                (StatusCode::NOT_FOUND, msg.clone())
            }
            AppError::Import(ImportError::Store(StoreError::DuplicateKey(_))) => {
                (StatusCode::CONFLICT, "Resource already exists".to_string())
            }
            AppError::Import(e) => {
                tracing::error!("Import error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        };

        let body = axum::Json(json!({ "error": message }));
        (status, body).into_response()
    }
}

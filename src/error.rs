use thiserror::Error;

#[derive(Debug, Error)]
pub enum AiopError {
    #[error("api error ({status}): {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("not authenticated")]
    NotAuthenticated,
}

impl AiopError {
    /// Duplicate-key insert rejected by the row store (Postgres `23505`).
    pub fn is_unique_violation(&self) -> bool {
        match self {
            AiopError::Api { status, body } => {
                *status == reqwest::StatusCode::CONFLICT || body.contains("23505")
            }
            _ => false,
        }
    }

    /// Single-row read that matched no rows (`PGRST116`).
    pub fn is_no_rows(&self) -> bool {
        matches!(self, AiopError::Api { body, .. } if body.contains("PGRST116"))
    }
}

pub type Result<T> = std::result::Result<T, AiopError>;

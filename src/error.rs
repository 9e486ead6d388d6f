use thiserror::Error;

pub const SESSION_EXPIRED: &str = "Session expired. Please log in again.";

#[derive(Error, Debug)]
pub enum ConsultaError {
    #[error("Could not reach the server: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{message}")]
    Api { status: u16, message: String },

    #[error("{}", SESSION_EXPIRED)]
    SessionExpired,

    #[error("Not logged in. Run `consulta login` first.")]
    NotAuthenticated,

    #[error("Not allowed: {0}")]
    Forbidden(String),

    #[error("{0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("{0}")]
    Other(String),
}

impl ConsultaError {
    /// True for failures that mean the stored token is no longer accepted.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, ConsultaError::SessionExpired)
    }
}

pub type Result<T> = std::result::Result<T, ConsultaError>;

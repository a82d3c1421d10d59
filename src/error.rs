use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaErrorCode {
    Io,
    Sqlite,
    InvalidConfig,
    ConfigParse,
    InvalidKey,
    StoreUnavailable,
    Dispatch,
}

impl QuotaErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            QuotaErrorCode::Io => "io",
            QuotaErrorCode::Sqlite => "sqlite",
            QuotaErrorCode::InvalidConfig => "invalid_config",
            QuotaErrorCode::ConfigParse => "config_parse",
            QuotaErrorCode::InvalidKey => "invalid_key",
            QuotaErrorCode::StoreUnavailable => "store_unavailable",
            QuotaErrorCode::Dispatch => "dispatch",
        }
    }
}

/// Errors surfaced to the host. Store failures during normal operation never
/// reach this type; they are logged and folded into neutral defaults.
#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("invalid key '{input}': {reason}")]
    InvalidKey { input: String, reason: String },
    #[error("counter store unavailable: {message}")]
    StoreUnavailable { message: String },
    #[error("dispatch failed: {message}")]
    Dispatch { message: String },
}

impl QuotaError {
    pub fn code(&self) -> QuotaErrorCode {
        match self {
            QuotaError::Io(_) => QuotaErrorCode::Io,
            QuotaError::Sqlite(_) => QuotaErrorCode::Sqlite,
            QuotaError::InvalidConfig { .. } => QuotaErrorCode::InvalidConfig,
            QuotaError::ConfigParse(_) => QuotaErrorCode::ConfigParse,
            QuotaError::InvalidKey { .. } => QuotaErrorCode::InvalidKey,
            QuotaError::StoreUnavailable { .. } => QuotaErrorCode::StoreUnavailable,
            QuotaError::Dispatch { .. } => QuotaErrorCode::Dispatch,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }
}

/// Failure inside the counter store worker. Only ever logged.
#[derive(Debug, Error)]
pub(crate) enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("count out of range: {0}")]
    OutOfRange(i64),
    #[error("store worker gone")]
    WorkerGone,
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GazecapError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Capability error: {message}")]
    Capability { message: String },

    #[error("Transport error on {source_id}: {message}")]
    Transport { source_id: String, message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Invalid state: {message} (current: {current})")]
    InvalidState { current: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GazecapError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn capability<S: Into<String>>(message: S) -> Self {
        Self::Capability {
            message: message.into(),
        }
    }

    pub fn transport<S: Into<String>>(source_id: S, message: S) -> Self {
        Self::Transport {
            source_id: source_id.into(),
            message: message.into(),
        }
    }

    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn invalid_state<S: Into<String>>(current: S, message: S) -> Self {
        Self::InvalidState {
            current: current.into(),
            message: message.into(),
        }
    }

    /// Stable discriminant for programmatic matching across versions.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Capability { .. } => "capability",
            Self::Transport { .. } => "transport",
            Self::Storage { .. } => "storage",
            Self::InvalidState { .. } => "invalid_state",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }
}

impl From<rusqlite::Error> for GazecapError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GazecapError>;

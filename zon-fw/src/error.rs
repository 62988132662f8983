use crate::module::ModuleKind;
use std::fmt::Display;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("there is no rule {0}")]
    NotFound(u32),

    #[error("can't reload {kind} module, {reason}")]
    Reload { kind: ModuleKind, reason: String },

    #[error("invalid state, {0}")]
    InvalidState(String),

    #[error("invalid rule, {0}")]
    InvalidRule(String),
}

impl Error {
    pub fn reload<E: Display>(kind: ModuleKind, e: E) -> Self {
        Self::Reload {
            kind,
            reason: e.to_string(),
        }
    }

    pub fn invalid_state<S: AsRef<str>>(msg: S) -> Self {
        Self::InvalidState(msg.as_ref().to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

use thiserror::Error;

use crate::capabilities::{AdapterError, KvError};
use crate::config::ConfigError;
use crate::model::ItemId;
use crate::store::StoreError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("problem index {index} out of range for {len} problems")]
    ProblemIndexOutOfRange { index: usize, len: usize },

    #[error("no item with id {0}")]
    UnknownItem(ItemId),

    #[error("no solution set for item {0}")]
    NoSolution(ItemId),

    #[error("invalid source {field}: {reason}")]
    InvalidSource { field: &'static str, reason: String },
}

impl ValidationError {
    pub(crate) fn source_field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidSource {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Slot storage error: {0}")]
    Kv(#[from] KvError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type CoreResult<T> = Result<T, CoreError>;

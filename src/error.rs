use thiserror::Error;

use crate::types::{EntityId, RoomId};

/// Errors surfaced at the simulation's API edges. Nothing inside a tick fails.
#[derive(Debug, Error)]
pub enum SimError {
    /// Room transition target does not exist; the avatar stays where it is.
    #[error("unknown room: {0}")]
    UnknownRoom(RoomId),

    #[error("unknown entity: {0}")]
    UnknownEntity(EntityId),

    #[error("entity already registered: {0}")]
    DuplicateEntity(EntityId),

    /// `confirm_interaction` was called with no prompt showing.
    #[error("nothing to confirm")]
    NothingToConfirm,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for simulation operations.
pub type SimResult<T> = Result<T, SimError>;

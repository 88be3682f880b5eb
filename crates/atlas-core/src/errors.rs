use thiserror::Error;

use crate::model::{ConversationId, ParticipantId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AtlasError {
    #[error("index {index} out of range (count {count})")]
    OutOfRange { index: usize, count: usize },
    #[error("participant not found: {0}")]
    ParticipantNotFound(ParticipantId),
    #[error("conversation not found: {0}")]
    ConversationNotFound(ConversationId),
    #[error("no conversation bound")]
    NotBound,
    #[error("invalid draft: {0}")]
    InvalidDraft(String),
    #[error("session error: {0}")]
    Session(String),
}

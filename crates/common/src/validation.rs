// Limits the backend enforces on client intents, checked before queueing.

use thiserror::Error;

/// Maximum message body in bytes (4 KiB).
pub const MAX_MESSAGE_BYTES: usize = 4096;

/// Maximum length of a chat or message identifier.
pub const MAX_ID_BYTES: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("chat id must not be empty")]
    EmptyChatId,
    #[error("{field} exceeds {max} bytes")]
    IdTooLong { field: &'static str, max: usize },
    #[error("message content must not be empty")]
    EmptyContent,
    #[error("message content is {len} bytes; the limit is {max}")]
    ContentTooLarge { len: usize, max: usize },
}

pub fn validate_chat_id(chat_id: &str) -> Result<(), ValidationError> {
    if chat_id.trim().is_empty() {
        return Err(ValidationError::EmptyChatId);
    }
    validate_id_len("chat id", chat_id)
}

pub fn validate_id_len(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.len() > MAX_ID_BYTES {
        return Err(ValidationError::IdTooLong { field, max: MAX_ID_BYTES });
    }
    Ok(())
}

pub fn validate_content(content: &str) -> Result<(), ValidationError> {
    if content.trim().is_empty() {
        return Err(ValidationError::EmptyContent);
    }
    if content.len() > MAX_MESSAGE_BYTES {
        return Err(ValidationError::ContentTooLarge {
            len: content.len(),
            max: MAX_MESSAGE_BYTES,
        });
    }
    Ok(())
}

//! The caller-supplied backend seam.
//!
//! Each producer hands the layer an implementation of [`ProducerBackend`].
//! The layer never talks to the network itself; every fetch goes through
//! this trait and may fail with a [`FetchError`].

use async_trait::async_trait;

use crate::model::{Message, Room, RoomId};

/// Error type for backend fetches that can be sent across channels
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("backend request failed: {0}")]
    Backend(String),

    #[error("backend request timed out")]
    Timeout,

    #[error("coalesced request was abandoned")]
    Abandoned,
}

impl FetchError {
    pub fn backend(msg: impl Into<String>) -> Self {
        FetchError::Backend(msg.into())
    }
}

/// The two async capabilities a producer supplies
#[async_trait]
pub trait ProducerBackend: Send + Sync {
    /// Fetch the producer's full room list
    async fn fetch_room_list(&self) -> Result<Vec<Room>, FetchError>;

    /// Fetch up to `limit` of the most recent messages of a room
    async fn fetch_messages(&self, room: &RoomId, limit: usize) -> Result<Vec<Message>, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_display() {
        assert_eq!(
            FetchError::backend("502 Bad Gateway").to_string(),
            "backend request failed: 502 Bad Gateway"
        );
        assert_eq!(FetchError::Timeout.to_string(), "backend request timed out");
    }
}

//! SSH session lifecycle.
//!
//! - [`SessionEvent`]: what observers see (authenticated, re-keyed, closed)
//! - [`KeepaliveTask`]: periodic SSH_MSG_IGNORE to keep idle sessions up

pub mod keepalive;

pub use keepalive::{create_keepalive_message, KeepaliveTask, KEEPALIVE_DATA_LEN};

use tokio::sync::broadcast;

/// Capacity of the event channel. Slow subscribers miss older events.
pub const EVENT_CAPACITY: usize = 64;

/// Session lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// User authentication succeeded
    Authenticated {
        /// Authenticated user name
        username: String,
    },
    /// The server sent a banner during authentication
    Banner(String),
    /// A key re-exchange completed
    Rekeyed {
        /// Number of re-keys so far
        count: u64,
    },
    /// The session ended
    Disconnected {
        /// Why it ended
        reason: String,
    },
}

/// Creates the broadcast channel used for session events.
pub(crate) fn event_channel() -> broadcast::Sender<SessionEvent> {
    broadcast::channel(EVENT_CAPACITY).0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_reach_every_subscriber() {
        let events = event_channel();
        let mut first = events.subscribe();
        let mut second = events.subscribe();

        events.send(SessionEvent::Rekeyed { count: 1 }).unwrap();
        assert_eq!(first.recv().await.unwrap(), SessionEvent::Rekeyed { count: 1 });
        assert_eq!(second.recv().await.unwrap(), SessionEvent::Rekeyed { count: 1 });
    }
}

use std::fmt;

use futures::stream::BoxStream;

use crate::Digest;

/// What happened to a piece of content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The content became available (or an image now points at it).
    Create,
    /// The content is gone (or no image points at it anymore).
    Delete,
}

/// A change notification from a store that supports live updates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Event {
    /// The change.
    pub kind: EventKind,
    /// The digest the change is about.
    pub digest: Digest,
}

impl Event {
    /// A [`EventKind::Create`] event.
    pub fn create(digest: Digest) -> Self {
        Self {
            kind: EventKind::Create,
            digest,
        }
    }

    /// A [`EventKind::Delete`] event.
    pub fn delete(digest: Digest) -> Self {
        Self {
            kind: EventKind::Delete,
            digest,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EventKind::Create => write!(f, "create {}", self.digest),
            EventKind::Delete => write!(f, "delete {}", self.digest),
        }
    }
}

/// A live stream of content change events.
///
/// The stream ends when the backend stops producing events.
pub type EventStream = BoxStream<'static, Event>;

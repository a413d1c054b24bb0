//! Session data model and the reactive store that holds it.

use std::collections::BTreeMap;

use tokio::sync::watch;

use crate::identity;

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    EnteringSelfId,
    PublishingSelf,
    AwaitingPeer,
    ConnectingPeer,
    Connected,
    SelectMedia,
    CallingPeer,
    Answering,
    CallConnected,
}

impl Status {
    /// A data connection to the peer is open.
    pub fn has_peer(self) -> bool {
        matches!(
            self,
            Status::Connected
                | Status::SelectMedia
                | Status::CallingPeer
                | Status::Answering
                | Status::CallConnected
        )
    }

    /// A call is being negotiated or is live.
    pub fn in_call(self) -> bool {
        matches!(
            self,
            Status::SelectMedia | Status::CallingPeer | Status::Answering | Status::CallConnected
        )
    }
}

/// Role in call negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallRole {
    /// Answering the peer's call.
    Grantor,
    /// Placing the call.
    Requestor,
}

/// One entry of the conversation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    Text {
        sender_id: String,
        created_at: u64,
        msg: String,
    },
    /// Announcement of a file transfer.
    File {
        sender_id: String,
        created_at: u64,
        file_id: String,
        file_name: String,
        total_bytes: u64,
    },
}

impl LogEntry {
    pub fn sender_id(&self) -> &str {
        match self {
            LogEntry::Text { sender_id, .. } | LogEntry::File { sender_id, .. } => sender_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileProgress {
    pub percent: u8,
    /// e.g. `report.pdf 128.00 KB / 200.00 KB`
    pub message: String,
    pub updated_at: u64,
}

/// Everything the UI renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub self_id: String,
    pub peer_id: String,
    pub draft: String,
    pub status: Status,
    pub call_role: Option<CallRole>,
    pub is_peer_typing: bool,
    pub msgs: Vec<LogEntry>,
    pub file_progress: BTreeMap<String, FileProgress>,
    /// Last user-visible failure, cleared on the next successful transition.
    pub notice: Option<String>,
}

impl Session {
    /// Initial values, with a freshly generated self id.
    pub fn initial() -> Self {
        Self::with_self_id(identity::generate_id())
    }

    pub fn with_self_id(self_id: String) -> Self {
        Self {
            self_id,
            peer_id: String::new(),
            draft: String::new(),
            status: Status::EnteringSelfId,
            call_role: None,
            is_peer_typing: false,
            msgs: Vec::new(),
            file_progress: BTreeMap::new(),
            notice: None,
        }
    }
}

/// Holds the [`Session`] and notifies subscribers on every change.
pub struct Store {
    tx: watch::Sender<Session>,
}

impl Store {
    pub fn new(initial: Session) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Snapshot of the current state.
    pub fn get(&self) -> Session {
        self.tx.borrow().clone()
    }

    /// Borrow the current state without cloning. Do not hold across a `set`.
    pub fn borrow(&self) -> watch::Ref<'_, Session> {
        self.tx.borrow()
    }

    /// Mutate the state and notify subscribers.
    pub fn set(&self, f: impl FnOnce(&mut Session)) {
        self.tx.send_modify(f);
    }

    /// Replace the whole state.
    pub fn reset(&self, next: Session) {
        self.tx.send_replace(next);
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.tx.subscribe()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(Session::initial())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state() {
        let s = Session::initial();
        assert_eq!(s.status, Status::EnteringSelfId);
        assert!(!s.self_id.is_empty());
        assert!(s.peer_id.is_empty());
        assert!(s.msgs.is_empty());
    }

    #[test]
    fn set_notifies_subscribers() {
        let store = Store::new(Session::with_self_id("me".into()));
        let mut rx = store.subscribe();
        assert!(!rx.has_changed().unwrap());
        store.set(|s| s.peer_id = "you".into());
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().peer_id, "you");
        assert_eq!(store.get().peer_id, "you");
    }

    #[test]
    fn reset_replaces_everything() {
        let store = Store::new(Session::with_self_id("me".into()));
        store.set(|s| {
            s.status = Status::Connected;
            s.is_peer_typing = true;
        });
        store.reset(Session::with_self_id("me".into()));
        let s = store.get();
        assert_eq!(s.status, Status::EnteringSelfId);
        assert!(!s.is_peer_typing);
    }

    #[test]
    fn status_groups() {
        assert!(Status::CallConnected.has_peer());
        assert!(Status::CallConnected.in_call());
        assert!(Status::Connected.has_peer());
        assert!(!Status::Connected.in_call());
        assert!(!Status::AwaitingPeer.has_peer());
    }
}

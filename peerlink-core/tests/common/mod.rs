//! Loopback host for two sessions: executes their actions against each other over an
//! in-memory data connection with a shared simulated clock.

#![allow(dead_code)]

use std::collections::VecDeque;

use bytes::Bytes;
use peerlink_core::{
    decode_frame, Action, Envelope, PeerSession, PublishOutcome, SessionConfig, Status,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

/// Decides whether a frame travelling from `Side` is lost.
pub type DropFilter = Box<dyn FnMut(Side, &Envelope) -> bool>;

pub struct Pair {
    pub a: PeerSession,
    pub b: PeerSession,
    pub now: u64,
    /// Frames in flight towards each side.
    to_a: VecDeque<Vec<u8>>,
    to_b: VecDeque<Vec<u8>>,
    /// Every non-frame action each side produced, in order.
    pub a_actions: Vec<Action>,
    pub b_actions: Vec<Action>,
    /// Every envelope each side put on the wire (including lost ones).
    pub a_sent: Vec<Envelope>,
    pub b_sent: Vec<Envelope>,
    drop_filter: Option<DropFilter>,
    severed: bool,
}

impl Pair {
    /// Two published sessions, `alice` (a) connected to `bob` (b).
    pub fn connected(config: SessionConfig) -> Self {
        let mut a = PeerSession::with_self_id(config.clone(), "alice");
        let mut b = PeerSession::with_self_id(config, "bob");
        for s in [&mut a, &mut b] {
            s.publish_self();
            s.on_published(PublishOutcome::Connected);
            assert_eq!(s.status(), Status::AwaitingPeer);
        }
        a.set_peer_id("bob");
        assert_eq!(
            a.connect_peer(),
            vec![Action::Connect {
                peer_id: "bob".into()
            }]
        );
        assert!(b.on_incoming_connection("alice", 0).is_empty());
        assert!(a.on_connection_open(0).is_empty());
        assert_eq!(a.status(), Status::Connected);
        assert_eq!(b.status(), Status::Connected);
        Self {
            a,
            b,
            now: 0,
            to_a: VecDeque::new(),
            to_b: VecDeque::new(),
            a_actions: Vec::new(),
            b_actions: Vec::new(),
            a_sent: Vec::new(),
            b_sent: Vec::new(),
            drop_filter: None,
            severed: false,
        }
    }

    pub fn set_drop_filter(&mut self, filter: impl FnMut(Side, &Envelope) -> bool + 'static) {
        self.drop_filter = Some(Box::new(filter));
    }

    /// Lose every frame from now on, in both directions.
    pub fn sever(&mut self) {
        self.severed = true;
    }

    pub fn session(&mut self, side: Side) -> &mut PeerSession {
        match side {
            Side::A => &mut self.a,
            Side::B => &mut self.b,
        }
    }

    /// Execute actions produced by `from`.
    pub fn route(&mut self, from: Side, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::SendData(frame) => {
                    let (envelope, _) = decode_frame(&frame).expect("session emitted a bad frame");
                    let lost = self.severed
                        || self
                            .drop_filter
                            .as_mut()
                            .is_some_and(|f| f(from, &envelope));
                    match from {
                        Side::A => self.a_sent.push(envelope),
                        Side::B => self.b_sent.push(envelope),
                    }
                    if lost {
                        continue;
                    }
                    match from {
                        Side::A => self.to_b.push_back(frame),
                        Side::B => self.to_a.push_back(frame),
                    }
                }
                other => match from {
                    Side::A => self.a_actions.push(other),
                    Side::B => self.b_actions.push(other),
                },
            }
        }
    }

    /// Deliver frames until both directions are quiet.
    pub fn pump(&mut self) {
        loop {
            if let Some(frame) = self.to_b.pop_front() {
                let actions = self.b.on_data(&frame, self.now).expect("b failed on data");
                self.route(Side::B, actions);
            } else if let Some(frame) = self.to_a.pop_front() {
                let actions = self.a.on_data(&frame, self.now).expect("a failed on data");
                self.route(Side::A, actions);
            } else {
                break;
            }
        }
    }

    /// Run a local procedure on `side` and deliver whatever it sent.
    pub fn act(&mut self, side: Side, f: impl FnOnce(&mut PeerSession, u64) -> Vec<Action>) {
        let now = self.now;
        let actions = f(self.session(side), now);
        self.route(side, actions);
        self.pump();
    }

    /// Advance the clock in 100 ms steps, ticking both sides and delivering frames.
    pub fn advance(&mut self, ms: u64) {
        let end = self.now + ms;
        while self.now < end {
            self.now = (self.now + 100).min(end);
            let a = self.a.tick(self.now).expect("a tick failed");
            self.route(Side::A, a);
            let b = self.b.tick(self.now).expect("b tick failed");
            self.route(Side::B, b);
            self.pump();
        }
    }

    pub fn send_file(&mut self, name: &str, blob: Bytes) -> String {
        let (file_id, actions) = self
            .a
            .send_file(name, blob, self.now)
            .expect("send_file failed");
        self.route(Side::A, actions);
        self.pump();
        file_id
    }

    /// Files `side` reported as received.
    pub fn received(&self, side: Side) -> Vec<(String, String, Bytes)> {
        let actions = match side {
            Side::A => &self.a_actions,
            Side::B => &self.b_actions,
        };
        actions
            .iter()
            .filter_map(|a| match a {
                Action::FileReceived {
                    file_id,
                    file_name,
                    bytes,
                } => Some((file_id.clone(), file_name.clone(), bytes.clone())),
                _ => None,
            })
            .collect()
    }
}

pub fn test_config() -> SessionConfig {
    SessionConfig {
        chunk_size: 64_000,
        ..SessionConfig::default()
    }
}

pub fn blob(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

use std::collections::HashMap;
use std::sync::Arc;

use crate::roster::Roster;
use crate::transport::{Link, LinkId, LinkState, Transport};

/// A table entry: the single live link to one peer.
#[derive(Debug)]
pub struct PeerConnection {
    link: Arc<dyn Link>,
    state: LinkState,
}

impl PeerConnection {
    pub fn link_id(&self) -> LinkId {
        self.link.id()
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }
}

/// Result of registering an inbound link.
#[derive(Debug, PartialEq, Eq)]
pub enum AcceptOutcome {
    Registered,
    /// The inbound link won the dial race and displaced an existing entry.
    Replaced,
    /// The link was closed and not registered.
    Rejected(&'static str),
}

/// Owns the peer id -> connection table.
///
/// Invariants: at most one entry per peer id, and the self id is never a key.
/// Outbound dials and inbound accepts share the same registration path.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    self_id: String,
    table: HashMap<String, PeerConnection>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a session as `self_id` with an empty table.
    pub fn reset(&mut self, self_id: &str) {
        self.close_all();
        self.self_id = self_id.to_string();
    }

    /// Dial `peer_id` unless it is self or already in the table. Returns true
    /// if a new link was registered.
    pub fn ensure_connect<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        peer_id: &str,
        roster: &mut Roster,
    ) -> bool {
        if peer_id.is_empty() || peer_id == self.self_id || self.table.contains_key(peer_id) {
            return false;
        }
        match transport.connect(peer_id) {
            Ok(link) => {
                tracing::debug!(self_id = %self.self_id, peer = %peer_id, link = %link.id(), "dialing peer");
                self.register(peer_id, link);
                true
            }
            Err(e) => {
                tracing::warn!(self_id = %self.self_id, peer = %peer_id, error = %e, "dial failed");
                self.on_closed_or_errored(peer_id, roster);
                false
            }
        }
    }

    /// Dial every roster member that has no table entry yet.
    pub fn connect_missing<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        roster: &mut Roster,
    ) -> Vec<String> {
        let missing: Vec<String> = roster
            .others()
            .filter(|id| !self.table.contains_key(*id))
            .map(String::from)
            .collect();
        missing
            .into_iter()
            .filter(|peer_id| self.ensure_connect(transport, peer_id, roster))
            .collect()
    }

    /// Register a link dialed by a remote peer.
    ///
    /// When both sides dialed each other at once, the link initiated by the
    /// lexicographically smaller peer id survives on both ends.
    pub fn accept(&mut self, link: Arc<dyn Link>) -> AcceptOutcome {
        let peer_id = link.peer_id().to_string();
        if peer_id.is_empty() || peer_id == self.self_id {
            link.close();
            return AcceptOutcome::Rejected("self or anonymous link");
        }

        let Some(existing) = self.table.get(&peer_id) else {
            self.register(&peer_id, link);
            return AcceptOutcome::Registered;
        };

        let existing_initiator = existing.link.initiator();
        let keep_existing = existing_initiator != link.initiator()
            && existing_initiator == self.self_id.as_str().min(peer_id.as_str());
        if keep_existing {
            tracing::debug!(self_id = %self.self_id, peer = %peer_id, link = %link.id(), "duplicate inbound link rejected");
            link.close();
            return AcceptOutcome::Rejected("duplicate link");
        }

        if let Some(displaced) = self.table.remove(&peer_id) {
            tracing::debug!(self_id = %self.self_id, peer = %peer_id, link = %displaced.link.id(), "link displaced by inbound dial");
            displaced.link.close();
        }
        self.register(&peer_id, link);
        AcceptOutcome::Replaced
    }

    fn register(&mut self, peer_id: &str, link: Arc<dyn Link>) {
        self.table.insert(
            peer_id.to_string(),
            PeerConnection {
                link,
                state: LinkState::Connecting,
            },
        );
    }

    /// Whether `link_id` is the link currently registered for `peer_id`.
    pub fn is_current(&self, peer_id: &str, link_id: LinkId) -> bool {
        self.table
            .get(peer_id)
            .is_some_and(|conn| conn.link.id() == link_id)
    }

    /// Transition the current link of `peer_id` to Open. Returns false for
    /// stale or unknown links and for links that were already open.
    pub fn mark_open(&mut self, peer_id: &str, link_id: LinkId) -> bool {
        match self.table.get_mut(peer_id) {
            Some(conn) if conn.link.id() == link_id && conn.state == LinkState::Connecting => {
                conn.state = LinkState::Open;
                true
            }
            _ => false,
        }
    }

    /// Drop the table entry and roster membership of `peer_id`. Safe to call
    /// repeatedly and for ids that were never known.
    pub fn on_closed_or_errored(&mut self, peer_id: &str, roster: &mut Roster) -> bool {
        let removed = self.table.remove(peer_id);
        if let Some(conn) = &removed {
            conn.link.close();
        }
        let left_roster = roster.remove(peer_id);
        removed.is_some() || left_roster
    }

    /// Send a frame to one peer if its link is open.
    pub fn send_to(&self, peer_id: &str, frame: &str) -> bool {
        match self.table.get(peer_id) {
            Some(conn) if conn.state.is_open() => match conn.link.send(frame) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(peer = %peer_id, error = %e, "send failed");
                    false
                }
            },
            _ => false,
        }
    }

    /// Best-effort send on every open link. Returns the number of successful
    /// sends; a failure on one link never stops the others.
    pub fn broadcast(&self, frame: &str) -> usize {
        self.table
            .keys()
            .filter(|peer_id| self.send_to(peer_id, frame))
            .count()
    }

    /// Close every link and empty the table.
    pub fn close_all(&mut self) {
        for (_, conn) in self.table.drain() {
            conn.link.close();
        }
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.table.contains_key(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerConnection> {
        self.table.get(peer_id)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Sorted ids of peers whose link is open.
    pub fn open_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .table
            .iter()
            .filter(|(_, conn)| conn.state.is_open())
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }
}

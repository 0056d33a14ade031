//! The mesh coordinator: one owned state machine per session.
//!
//! `Coordinator` is synchronous. It is fed transport events and API calls one
//! at a time by [`crate::session::MeshSession`] (or directly by tests) and is
//! the only thing that mutates the roster, the connection table and the chat
//! history. A generation counter increments on every start and stop so that
//! asynchronous continuations issued under an older session can be dropped.

use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Serializer};

use crate::config::MeshConfig;
use crate::connections::ConnectionManager;
use crate::envelope::{now_millis, ChatEnvelope, Envelope};
use crate::events::{Event, EventBus};
use crate::fanout::{ChatLog, ChatMessage};
use crate::presence::{self, PresenceUpdate};
use crate::roster::Roster;
use crate::transport::{LinkId, Transport, TransportEvent, TransportEvents};

/// Lifecycle status reported to the UI.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum MeshStatus {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error(String),
    Closed,
}

impl fmt::Display for MeshStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshStatus::Idle => f.write_str("idle"),
            MeshStatus::Connecting => f.write_str("connecting"),
            MeshStatus::Connected => f.write_str("connected"),
            MeshStatus::Disconnected => f.write_str("disconnected"),
            MeshStatus::Error(reason) => write!(f, "error:{reason}"),
            MeshStatus::Closed => f.write_str("closed"),
        }
    }
}

impl Serialize for MeshStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Read-only view of a coordinator, published after every handled input.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MeshSnapshot {
    pub self_id: Option<String>,
    pub status: MeshStatus,
    pub is_ready: bool,
    pub active_count: usize,
    pub roster: Vec<String>,
    pub connected_peers: Vec<String>,
    pub messages: Vec<ChatMessage>,
}

/// What the lifecycle layer must do after a transport event.
#[derive(Debug, PartialEq, Eq)]
pub enum TransportOutcome {
    Handled,
    /// The endpoint (re)opened: keep-alive and bootstrap are due.
    EndpointOpened,
    /// The endpoint dropped: schedule a reconnect.
    EndpointLost,
}

pub struct Coordinator<T: Transport> {
    transport: Arc<T>,
    bus: EventBus,
    self_id: Option<String>,
    status: MeshStatus,
    generation: u64,
    roster: Roster,
    connections: ConnectionManager,
    chat: ChatLog,
    history_capacity: usize,
    max_text_chars: usize,
}

impl<T: Transport> Coordinator<T> {
    pub fn new(transport: Arc<T>, config: &MeshConfig, bus: EventBus) -> Self {
        Self {
            transport,
            bus,
            self_id: None,
            status: MeshStatus::Idle,
            generation: 0,
            roster: Roster::new(),
            connections: ConnectionManager::new(),
            chat: ChatLog::with_limits(config.history_capacity, config.max_text_chars),
            history_capacity: config.history_capacity,
            max_text_chars: config.max_text_chars,
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Begin a session as `self_id`. No-op returning false if already running.
    pub fn start(&mut self, self_id: &str, events: TransportEvents) -> bool {
        if self.is_running() || self_id.is_empty() {
            return false;
        }
        self.generation += 1;
        self.self_id = Some(self_id.to_string());
        self.roster.reset(self_id);
        self.connections.reset(self_id);
        self.chat = ChatLog::with_limits(self.history_capacity, self.max_text_chars);
        tracing::info!(%self_id, generation = self.generation, "mesh coordinator starting");

        match self.transport.open_endpoint(self_id, events) {
            Ok(()) => self.set_status(MeshStatus::Connecting),
            Err(e) => {
                tracing::warn!(%self_id, error = %e, "transport endpoint failed to open");
                self.set_status(MeshStatus::Error(e.to_string()));
            }
        }
        true
    }

    /// Say Bye to every open link, tear everything down and invalidate all
    /// in-flight continuations. Returns the id that was running, if any.
    pub fn stop(&mut self) -> Option<String> {
        let self_id = self.self_id.take()?;
        self.generation += 1;

        let sent = self.connections.broadcast(&Envelope::bye(&self_id).encode());
        self.connections.close_all();
        self.transport.close_endpoint();
        self.roster.clear();
        tracing::info!(%self_id, bye_sent = sent, "mesh coordinator stopped");

        self.status = MeshStatus::Closed;
        self.bus.emit(Event::StatusChanged {
            self_id: self_id.clone(),
            status: self.status.to_string(),
        });
        Some(self_id)
    }

    /// Startup guard: report a timeout if the endpoint of `generation` never
    /// opened. Leaves every other piece of state alone.
    pub fn startup_deadline(&mut self, generation: u64) {
        if self.is_current(generation) && self.status == MeshStatus::Connecting {
            tracing::warn!(self_id = ?self.self_id, "transport endpoint did not open in time");
            self.set_status(MeshStatus::Error("timeout".into()));
        }
    }

    /// Re-establish the endpoint after a drop, keeping roster and links.
    pub fn reconnect(&mut self, generation: u64) -> bool {
        if !self.is_current(generation) || self.status == MeshStatus::Connected {
            return false;
        }
        match self.transport.reconnect_endpoint() {
            Ok(()) => {
                tracing::info!(self_id = ?self.self_id, "transport endpoint reconnecting");
                true
            }
            Err(e) => {
                tracing::warn!(self_id = ?self.self_id, error = %e, "transport reconnect failed");
                false
            }
        }
    }

    /// Connectivity went away. Only the status changes.
    pub fn network_offline(&mut self) {
        if self.is_running() {
            self.set_status(MeshStatus::Disconnected);
        }
    }

    /// Dial one bootstrap peer out of the directory's online list. Results
    /// from an older generation are dropped.
    pub fn bootstrap(&mut self, generation: u64, candidates: &[String]) -> Option<String> {
        if !self.is_current(generation) {
            tracing::debug!(generation, current = self.generation, "stale bootstrap result dropped");
            return None;
        }
        let self_id = self.self_id.as_deref()?;
        let target = candidates
            .iter()
            .find(|id| !id.is_empty() && id.as_str() != self_id && !self.connections.contains(id))?
            .clone();

        tracing::info!(%self_id, peer = %target, "bootstrapping via directory peer");
        self.connections
            .ensure_connect(self.transport.as_ref(), &target, &mut self.roster)
            .then_some(target)
    }

    /// Re-send our roster on every open link. Returns the number of links.
    pub fn gossip_roster(&self) -> usize {
        match &self.self_id {
            Some(self_id) => self
                .connections
                .broadcast(&Envelope::roster(self_id, self.roster.ids()).encode()),
            None => 0,
        }
    }

    // -----------------------------------------------------------------------
    // Transport events
    // -----------------------------------------------------------------------

    pub fn handle_transport(&mut self, event: TransportEvent) -> TransportOutcome {
        if !self.is_running() {
            if let TransportEvent::Incoming { link } = event {
                link.close();
            }
            return TransportOutcome::Handled;
        }

        match event {
            TransportEvent::EndpointOpen => {
                self.set_status(MeshStatus::Connected);
                return TransportOutcome::EndpointOpened;
            }
            TransportEvent::EndpointDisconnected => {
                self.set_status(MeshStatus::Disconnected);
                return TransportOutcome::EndpointLost;
            }
            TransportEvent::EndpointError { reason } => {
                self.set_status(MeshStatus::Error(reason));
                return TransportOutcome::EndpointLost;
            }
            TransportEvent::Incoming { link } => {
                let peer_id = link.peer_id().to_string();
                let outcome = self.connections.accept(link);
                tracing::debug!(self_id = ?self.self_id, peer = %peer_id, ?outcome, "inbound link");
            }
            TransportEvent::LinkOpen { peer_id, link_id } => self.on_link_open(&peer_id, link_id),
            TransportEvent::LinkData {
                peer_id,
                link_id,
                frame,
            } => {
                if self.connections.is_current(&peer_id, link_id) {
                    self.on_frame(&peer_id, &frame);
                }
            }
            TransportEvent::LinkClosed { peer_id, link_id } => {
                self.on_link_lost(&peer_id, link_id, "closed")
            }
            TransportEvent::LinkError {
                peer_id,
                link_id,
                reason,
            } => self.on_link_lost(&peer_id, link_id, &reason),
        }
        TransportOutcome::Handled
    }

    fn on_link_open(&mut self, peer_id: &str, link_id: LinkId) {
        if !self.connections.mark_open(peer_id, link_id) {
            return;
        }
        let Some(self_id) = self.self_id.clone() else {
            return;
        };
        for envelope in presence::handshake(&self_id, &self.roster) {
            self.connections.send_to(peer_id, &envelope.encode());
        }
        tracing::info!(%self_id, peer = %peer_id, %link_id, "link open");
        self.bus.emit(Event::LinkEstablished {
            self_id,
            peer_id: peer_id.to_string(),
        });
    }

    fn on_link_lost(&mut self, peer_id: &str, link_id: LinkId, reason: &str) {
        if !self.connections.is_current(peer_id, link_id) {
            return;
        }
        let was_member = self.roster.contains(peer_id);
        self.connections.on_closed_or_errored(peer_id, &mut self.roster);
        let self_id = self.self_id.clone().unwrap_or_default();
        tracing::info!(%self_id, peer = %peer_id, %link_id, %reason, "link lost");
        self.bus.emit(Event::LinkLost {
            self_id: self_id.clone(),
            peer_id: peer_id.to_string(),
            reason: reason.to_string(),
        });
        if was_member {
            self.bus.emit(Event::PeerLeft {
                self_id,
                peer_id: peer_id.to_string(),
            });
        }
    }

    fn on_frame(&mut self, peer_id: &str, frame: &str) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(peer = %peer_id, error = %e, "dropping malformed frame");
                return;
            }
        };
        match envelope {
            Envelope::Chat(chat) => self.on_chat_received(&chat),
            presence_envelope => self.on_presence(&presence_envelope),
        }
    }

    fn on_presence(&mut self, envelope: &Envelope) {
        let Some(self_id) = self.self_id.clone() else {
            return;
        };
        match presence::apply(&self_id, &mut self.roster, envelope) {
            PresenceUpdate::Greeted { peer_id, joined } => {
                if joined {
                    self.peer_joined(&self_id, &peer_id);
                }
            }
            PresenceUpdate::Merged { joined } => {
                if joined.is_empty() {
                    return;
                }
                for peer_id in &joined {
                    self.peer_joined(&self_id, peer_id);
                }
                let dialed = self
                    .connections
                    .connect_missing(self.transport.as_ref(), &mut self.roster);
                tracing::debug!(%self_id, learned = joined.len(), dialed = dialed.len(), "roster merged");
            }
            PresenceUpdate::Departed {
                peer_id,
                was_member,
            } => {
                self.connections
                    .on_closed_or_errored(&peer_id, &mut self.roster);
                tracing::info!(%self_id, peer = %peer_id, "peer said bye");
                if was_member {
                    self.bus.emit(Event::PeerLeft { self_id, peer_id });
                }
            }
            PresenceUpdate::Ignored => {}
        }
    }

    fn peer_joined(&self, self_id: &str, peer_id: &str) {
        tracing::info!(%self_id, peer = %peer_id, "peer joined roster");
        self.bus.emit(Event::PeerJoined {
            self_id: self_id.to_string(),
            peer_id: peer_id.to_string(),
        });
    }

    // -----------------------------------------------------------------------
    // Chat
    // -----------------------------------------------------------------------

    /// Record and broadcast a chat message. Blank input, or a call while not
    /// running, changes nothing and sends nothing.
    pub fn send_chat(&mut self, text: &str) -> Option<ChatMessage> {
        let self_id = self.self_id.as_deref()?;
        let message = self.chat.compose(self_id, text, now_millis())?;
        let frame =
            Envelope::chat(self_id, &message.text, message.timestamp, &message.id).encode();
        let delivered = self.connections.broadcast(&frame);
        tracing::debug!(%self_id, id = %message.id, delivered, "chat sent");
        self.bus.emit(Event::ChatSent {
            message: message.clone(),
            delivered,
        });
        Some(message)
    }

    fn on_chat_received(&mut self, chat: &ChatEnvelope) {
        if self.self_id.as_deref() == Some(chat.from.as_str()) {
            return;
        }
        if let Some(message) = self.chat.receive(chat) {
            tracing::debug!(from = %message.from, id = %message.id, "chat received");
            self.bus.emit(Event::ChatReceived { message });
        }
    }

    // -----------------------------------------------------------------------
    // Read side
    // -----------------------------------------------------------------------

    fn set_status(&mut self, status: MeshStatus) {
        if self.status == status {
            return;
        }
        tracing::info!(self_id = ?self.self_id, from = %self.status, to = %status, "status changed");
        self.status = status;
        self.bus.emit(Event::StatusChanged {
            self_id: self.self_id.clone().unwrap_or_default(),
            status: self.status.to_string(),
        });
    }

    fn is_current(&self, generation: u64) -> bool {
        self.is_running() && generation == self.generation
    }

    pub fn is_running(&self) -> bool {
        self.self_id.is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.status == MeshStatus::Connected
    }

    /// Running with the endpoint down or failed.
    pub fn endpoint_lost(&self) -> bool {
        self.is_running()
            && matches!(self.status, MeshStatus::Disconnected | MeshStatus::Error(_))
    }

    pub fn needs_discovery(&self) -> bool {
        self.is_running() && self.connections.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn self_id(&self) -> Option<&str> {
        self.self_id.as_deref()
    }

    pub fn status(&self) -> &MeshStatus {
        &self.status
    }

    /// Current roster size.
    pub fn active_count(&self) -> usize {
        self.roster.len()
    }

    pub fn roster_ids(&self) -> Vec<String> {
        self.roster.ids()
    }

    pub fn connected_peers(&self) -> Vec<String> {
        self.connections.open_peers()
    }

    pub fn has_connection(&self, peer_id: &str) -> bool {
        self.connections.contains(peer_id)
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.chat.messages()
    }

    pub fn snapshot(&self) -> MeshSnapshot {
        MeshSnapshot {
            self_id: self.self_id.clone(),
            status: self.status.clone(),
            is_ready: self.is_ready(),
            active_count: self.active_count(),
            roster: self.roster_ids(),
            connected_peers: self.connected_peers(),
            messages: self.messages(),
        }
    }
}

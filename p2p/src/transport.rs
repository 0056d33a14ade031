//! Seam between the coordinator and whatever carries bytes between peers.
//!
//! A transport owns one local endpoint per session and dials direct links to
//! other peers. Everything it observes is reported through a single
//! [`TransportEvent`] queue; links never hold a reference back into the
//! coordinator.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

/// Identifies one physical link. Both ends of a link share the same id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Connection state machine of a single link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Closed,
    Error(String),
}

impl LinkState {
    pub fn is_open(&self) -> bool {
        matches!(self, LinkState::Open)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport endpoint is not open")]
    EndpointClosed,
    #[error("link {0} is not open")]
    LinkNotOpen(LinkId),
    #[error("cannot dial self")]
    SelfDial,
    #[error("connect to {0} failed: {1}")]
    ConnectFailed(String, String),
}

/// A direct link to one remote peer.
pub trait Link: Send + Sync {
    fn id(&self) -> LinkId;

    /// The remote peer this link talks to.
    fn peer_id(&self) -> &str;

    /// Which side dialed this link.
    fn initiator(&self) -> &str;

    /// Queue a text frame. Fails without side effects when the link is not open.
    fn send(&self, frame: &str) -> Result<(), TransportError>;

    fn close(&self);
}

impl fmt::Debug for dyn Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id())
            .field("peer_id", &self.peer_id())
            .field("initiator", &self.initiator())
            .finish()
    }
}

/// Everything a transport reports to its owning coordinator.
#[derive(Debug)]
pub enum TransportEvent {
    EndpointOpen,
    EndpointDisconnected,
    EndpointError { reason: String },
    /// A remote peer dialed us. The link opens later via `LinkOpen`.
    Incoming { link: Arc<dyn Link> },
    LinkOpen { peer_id: String, link_id: LinkId },
    LinkData { peer_id: String, link_id: LinkId, frame: String },
    LinkClosed { peer_id: String, link_id: LinkId },
    LinkError { peer_id: String, link_id: LinkId, reason: String },
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// Establishes the local endpoint and direct links.
pub trait Transport: Send + Sync + 'static {
    /// Bring up the local endpoint for `self_id`. Completion is reported as
    /// `EndpointOpen` on `events`; every later event goes to the same queue.
    fn open_endpoint(&self, self_id: &str, events: TransportEvents) -> Result<(), TransportError>;

    /// Re-establish a dropped endpoint without touching existing links.
    fn reconnect_endpoint(&self) -> Result<(), TransportError>;

    fn close_endpoint(&self);

    /// Dial `peer_id`. The returned link is still connecting; `LinkOpen` or
    /// `LinkError` follows on the event queue.
    fn connect(&self, peer_id: &str) -> Result<Arc<dyn Link>, TransportError>;
}

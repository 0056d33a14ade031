pub mod config;
pub mod connections;
pub mod coordinator;
pub mod directory;
pub mod envelope;
pub mod events;
pub mod fanout;
pub mod memory;
pub mod presence;
pub mod roster;
pub mod session;
pub mod transport;

pub use config::MeshConfig;
pub use connections::{AcceptOutcome, ConnectionManager, PeerConnection};
pub use coordinator::{Coordinator, MeshSnapshot, MeshStatus, TransportOutcome};
pub use directory::{Directory, DirectoryError};
pub use envelope::{ChatEnvelope, Envelope, EnvelopeError, CHAT_CHANNEL, MAX_TEXT_CHARS};
pub use events::{Event, EventBus};
pub use fanout::{ChatLog, ChatMessage, HISTORY_CAPACITY};
pub use memory::{LocalDirectory, LocalNetwork, LocalTransport};
pub use presence::PresenceUpdate;
pub use roster::Roster;
pub use session::{LifecycleSignal, MeshHandle, MeshSession, SessionError};
pub use transport::{Link, LinkId, LinkState, Transport, TransportError, TransportEvent, TransportEvents};

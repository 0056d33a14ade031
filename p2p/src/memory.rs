//! In-process transport and directory.
//!
//! `LocalNetwork` is a hub that pairs links between endpoints living in the
//! same process. Each link end pushes frames straight into the other side's
//! event queue, so per-link ordering matches a reliable ordered channel.
//! Used by the gateway to host several sessions and by the test suites.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::RwLock;

use crate::directory::{Directory, DirectoryError};
use crate::transport::{Link, LinkId, Transport, TransportError, TransportEvent, TransportEvents};

#[derive(Default)]
struct Hub {
    endpoints: HashMap<String, TransportEvents>,
    next_link: u64,
    stalled: bool,
}

/// Shared in-memory network. Cheap to clone.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh transport attached to this network.
    pub fn transport(&self) -> LocalTransport {
        LocalTransport {
            network: self.clone(),
            endpoint: Mutex::new(None),
        }
    }

    /// While stalled, endpoints never report `EndpointOpen`.
    pub fn set_stalled(&self, stalled: bool) {
        self.hub().stalled = stalled;
    }

    /// Simulate the signaling connection of `peer_id` dropping. Existing
    /// links stay up; the endpoint becomes undialable until it reconnects.
    pub fn drop_endpoint(&self, peer_id: &str) -> bool {
        let removed = self.hub().endpoints.remove(peer_id);
        match removed {
            Some(events) => {
                let _ = events.send(TransportEvent::EndpointDisconnected);
                tracing::info!(peer = %peer_id, "local endpoint dropped");
                true
            }
            None => false,
        }
    }

    /// Ids of every endpoint currently reachable.
    pub fn endpoint_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.hub().endpoints.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an endpoint and report it open unless the network is stalled.
    fn attach(&self, self_id: &str, events: &TransportEvents) {
        let mut hub = self.hub();
        if hub.stalled {
            tracing::debug!(peer = %self_id, "local network stalled; endpoint stays pending");
            return;
        }
        hub.endpoints.insert(self_id.to_string(), events.clone());
        drop(hub);
        let _ = events.send(TransportEvent::EndpointOpen);
    }

    fn detach(&self, self_id: &str, events: &TransportEvents) {
        let mut hub = self.hub();
        if hub
            .endpoints
            .get(self_id)
            .is_some_and(|current| current.same_channel(events))
        {
            hub.endpoints.remove(self_id);
        }
    }
}

struct Endpoint {
    self_id: String,
    events: TransportEvents,
}

/// One participant's view of a [`LocalNetwork`].
pub struct LocalTransport {
    network: LocalNetwork,
    endpoint: Mutex<Option<Endpoint>>,
}

impl LocalTransport {
    fn endpoint(&self) -> MutexGuard<'_, Option<Endpoint>> {
        self.endpoint.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for LocalTransport {
    fn open_endpoint(&self, self_id: &str, events: TransportEvents) -> Result<(), TransportError> {
        let mut endpoint = self.endpoint();
        if let Some(previous) = endpoint.take() {
            self.network.detach(&previous.self_id, &previous.events);
        }
        self.network.attach(self_id, &events);
        *endpoint = Some(Endpoint {
            self_id: self_id.to_string(),
            events,
        });
        Ok(())
    }

    fn reconnect_endpoint(&self) -> Result<(), TransportError> {
        let endpoint = self.endpoint();
        let endpoint = endpoint.as_ref().ok_or(TransportError::EndpointClosed)?;
        self.network.detach(&endpoint.self_id, &endpoint.events);
        self.network.attach(&endpoint.self_id, &endpoint.events);
        Ok(())
    }

    fn close_endpoint(&self) {
        if let Some(endpoint) = self.endpoint().take() {
            self.network.detach(&endpoint.self_id, &endpoint.events);
        }
    }

    fn connect(&self, peer_id: &str) -> Result<Arc<dyn Link>, TransportError> {
        let endpoint = self.endpoint();
        let endpoint = endpoint.as_ref().ok_or(TransportError::EndpointClosed)?;
        if endpoint.self_id == peer_id {
            return Err(TransportError::SelfDial);
        }

        let mut hub = self.network.hub();
        if !hub.endpoints.contains_key(&endpoint.self_id) {
            return Err(TransportError::EndpointClosed);
        }
        hub.next_link += 1;
        let link_id = LinkId(hub.next_link);
        let remote_events = hub.endpoints.get(peer_id).cloned();
        drop(hub);

        let Some(remote_events) = remote_events else {
            let link = LocalLink::detached(link_id, &endpoint.self_id, peer_id, &endpoint.events);
            let _ = endpoint.events.send(TransportEvent::LinkError {
                peer_id: peer_id.to_string(),
                link_id,
                reason: "peer unreachable".into(),
            });
            return Ok(Arc::new(link));
        };

        let shared = Arc::new(LinkShared::open());
        let local: Arc<dyn Link> = Arc::new(LocalLink {
            id: link_id,
            local_id: endpoint.self_id.clone(),
            peer_id: peer_id.to_string(),
            initiator: endpoint.self_id.clone(),
            shared: shared.clone(),
            local_events: endpoint.events.clone(),
            remote_events: remote_events.clone(),
        });
        let remote: Arc<dyn Link> = Arc::new(LocalLink {
            id: link_id,
            local_id: peer_id.to_string(),
            peer_id: endpoint.self_id.clone(),
            initiator: endpoint.self_id.clone(),
            shared,
            local_events: remote_events.clone(),
            remote_events: endpoint.events.clone(),
        });

        let _ = remote_events.send(TransportEvent::Incoming { link: remote });
        let _ = remote_events.send(TransportEvent::LinkOpen {
            peer_id: endpoint.self_id.clone(),
            link_id,
        });
        let _ = endpoint.events.send(TransportEvent::LinkOpen {
            peer_id: peer_id.to_string(),
            link_id,
        });
        tracing::debug!(from = %endpoint.self_id, to = %peer_id, %link_id, "local link paired");
        Ok(local)
    }
}

struct LinkShared {
    open: AtomicBool,
    closed: AtomicBool,
}

impl LinkShared {
    fn open() -> Self {
        Self {
            open: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }
}

/// One end of a paired in-memory link.
struct LocalLink {
    id: LinkId,
    local_id: String,
    peer_id: String,
    initiator: String,
    shared: Arc<LinkShared>,
    local_events: TransportEvents,
    remote_events: TransportEvents,
}

impl LocalLink {
    /// A link that never opens, for dials to unknown peers.
    fn detached(id: LinkId, local_id: &str, peer_id: &str, events: &TransportEvents) -> Self {
        let shared = LinkShared::open();
        shared.open.store(false, Ordering::SeqCst);
        shared.closed.store(true, Ordering::SeqCst);
        Self {
            id,
            local_id: local_id.to_string(),
            peer_id: peer_id.to_string(),
            initiator: local_id.to_string(),
            shared: Arc::new(shared),
            local_events: events.clone(),
            remote_events: events.clone(),
        }
    }
}

impl Link for LocalLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn initiator(&self) -> &str {
        &self.initiator
    }

    fn send(&self, frame: &str) -> Result<(), TransportError> {
        if !self.shared.open.load(Ordering::SeqCst) {
            return Err(TransportError::LinkNotOpen(self.id));
        }
        self.remote_events
            .send(TransportEvent::LinkData {
                peer_id: self.local_id.clone(),
                link_id: self.id,
                frame: frame.to_string(),
            })
            .map_err(|_| TransportError::LinkNotOpen(self.id))
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.open.store(false, Ordering::SeqCst);
        let _ = self.remote_events.send(TransportEvent::LinkClosed {
            peer_id: self.local_id.clone(),
            link_id: self.id,
        });
        let _ = self.local_events.send(TransportEvent::LinkClosed {
            peer_id: self.peer_id.clone(),
            link_id: self.id,
        });
    }
}

/// In-process online-peer directory.
#[derive(Clone, Default)]
pub struct LocalDirectory {
    online: Arc<RwLock<BTreeSet<String>>>,
    failing: Arc<AtomicBool>,
}

impl LocalDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail until switched back.
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn online_ids(&self) -> Vec<String> {
        self.online.read().await.iter().cloned().collect()
    }

    fn check(&self) -> Result<(), DirectoryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable("local directory offline".into()));
        }
        Ok(())
    }
}

impl Directory for LocalDirectory {
    async fn list_online(&self) -> Result<Vec<String>, DirectoryError> {
        self.check()?;
        Ok(self.online_ids().await)
    }

    async fn register_online(&self, peer_id: &str) -> Result<(), DirectoryError> {
        self.check()?;
        if peer_id.is_empty() {
            return Err(DirectoryError::Rejected("empty peer id".into()));
        }
        self.online.write().await.insert(peer_id.to_string());
        Ok(())
    }

    async fn unregister_online(&self, peer_id: &str) -> Result<(), DirectoryError> {
        self.check()?;
        self.online.write().await.remove(peer_id);
        Ok(())
    }
}

//! Integration tests for roster gossip, full-mesh convergence and chat
//! deduplication, driving several coordinators over one in-process network.
//!
//! Coordinators are pumped by hand so every interleaving is deterministic.

use std::sync::Arc;

use tokio::sync::mpsc;

use meshtalk_p2p::{
    Coordinator, Envelope, EventBus, Link, LocalNetwork, LocalTransport, MeshConfig, Transport,
    TransportEvent, MAX_TEXT_CHARS,
};

struct Node {
    coordinator: Coordinator<LocalTransport>,
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Node {
    fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.rx.try_recv() {
            self.coordinator.handle_transport(event);
            handled += 1;
        }
        handled
    }
}

/// A hand-driven endpoint that speaks raw frames, for injecting traffic.
struct RawPeer {
    transport: LocalTransport,
    rx: mpsc::UnboundedReceiver<TransportEvent>,
    link: Arc<dyn Link>,
}

impl RawPeer {
    fn frames(&mut self) -> Vec<Envelope> {
        std::iter::from_fn(|| self.rx.try_recv().ok())
            .filter_map(|event| match event {
                TransportEvent::LinkData { frame, .. } => Envelope::decode(&frame).ok(),
                _ => None,
            })
            .collect()
    }

    fn send(&self, envelope: &Envelope) {
        self.link.send(&envelope.encode()).expect("raw peer link closed");
    }
}

struct Mesh {
    network: LocalNetwork,
    nodes: Vec<Node>,
}

impl Mesh {
    fn new() -> Self {
        Self {
            network: LocalNetwork::new(),
            nodes: Vec::new(),
        }
    }

    fn spawn(&mut self, id: &str) -> usize {
        let mut coordinator = Coordinator::new(
            Arc::new(self.network.transport()),
            &MeshConfig::default(),
            EventBus::default(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        assert!(coordinator.start(id, tx));
        self.nodes.push(Node { coordinator, rx });
        self.settle();
        self.nodes.len() - 1
    }

    fn raw_peer(&mut self, id: &str, target: usize) -> RawPeer {
        let transport = self.network.transport();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.open_endpoint(id, tx).unwrap();
        rx.try_recv().unwrap();
        let target_id = self.node(target).self_id().unwrap().to_string();
        let link = transport.connect(&target_id).unwrap();
        link.send(&Envelope::hello(id).encode()).unwrap();
        self.settle();
        RawPeer {
            transport,
            rx,
            link,
        }
    }

    /// Dial `to` from `from`, as a directory bootstrap would.
    fn bootstrap(&mut self, from: usize, to: usize) {
        let target = self.node(to).self_id().unwrap().to_string();
        let coordinator = &mut self.nodes[from].coordinator;
        let generation = coordinator.generation();
        assert_eq!(coordinator.bootstrap(generation, &[target.clone()]), Some(target));
        self.settle();
    }

    fn settle(&mut self) {
        for _ in 0..256 {
            let handled: usize = self.nodes.iter_mut().map(Node::pump).sum();
            if handled == 0 {
                return;
            }
        }
        panic!("mesh did not settle");
    }

    fn node(&self, index: usize) -> &Coordinator<LocalTransport> {
        &self.nodes[index].coordinator
    }

    fn node_mut(&mut self, index: usize) -> &mut Coordinator<LocalTransport> {
        &mut self.nodes[index].coordinator
    }

    fn assert_full_mesh(&self, ids: &[&str]) {
        for node in &self.nodes {
            let coordinator = &node.coordinator;
            let self_id = coordinator.self_id().unwrap();
            assert_eq!(coordinator.roster_ids(), ids, "roster of {self_id}");
            let others: Vec<&str> = ids.iter().copied().filter(|id| *id != self_id).collect();
            assert_eq!(coordinator.connected_peers(), others, "links of {self_id}");
        }
    }
}

#[test]
fn joiner_and_seed_learn_each_other() {
    let mut mesh = Mesh::new();
    let a = mesh.spawn("peer:a");
    let b = mesh.spawn("peer:b");
    assert_eq!(mesh.node(a).roster_ids(), vec!["peer:a"]);

    mesh.bootstrap(b, a);
    mesh.assert_full_mesh(&["peer:a", "peer:b"]);
}

#[test]
fn third_peer_is_reached_through_gossip_alone() {
    let mut mesh = Mesh::new();
    let a = mesh.spawn("peer:a");
    let b = mesh.spawn("peer:b");
    let c = mesh.spawn("peer:c");

    mesh.bootstrap(b, a);
    mesh.bootstrap(c, a);

    // B never looked C up; the roster gossip through A was enough.
    assert!(mesh.node(b).has_connection("peer:c"));
    assert!(mesh.node(c).has_connection("peer:b"));
    mesh.assert_full_mesh(&["peer:a", "peer:b", "peer:c"]);
}

#[test]
fn chain_of_bootstraps_converges_to_full_mesh() {
    let mut mesh = Mesh::new();
    let ids = ["peer:a", "peer:b", "peer:c", "peer:d", "peer:e"];
    let nodes: Vec<usize> = ids.iter().map(|id| mesh.spawn(id)).collect();

    for pair in nodes.windows(2).rev() {
        mesh.bootstrap(pair[1], pair[0]);
    }
    mesh.assert_full_mesh(&ids);
}

#[test]
fn two_islands_merge_through_one_bridge() {
    let mut mesh = Mesh::new();
    let a = mesh.spawn("peer:a");
    let b = mesh.spawn("peer:b");
    let c = mesh.spawn("peer:c");
    let d = mesh.spawn("peer:d");
    mesh.bootstrap(b, a);
    mesh.bootstrap(d, c);

    mesh.bootstrap(c, b);
    mesh.assert_full_mesh(&["peer:a", "peer:b", "peer:c", "peer:d"]);
}

#[test]
fn periodic_roster_gossip_spreads_late_knowledge() {
    let mut mesh = Mesh::new();
    let a = mesh.spawn("peer:a");
    let b = mesh.spawn("peer:b");
    mesh.bootstrap(b, a);

    // X greets A only; B hears of it through the next roster round.
    let mut peer = mesh.raw_peer("peer:x", a);
    assert!(!mesh.node(b).roster_ids().contains(&"peer:x".to_string()));
    assert!(mesh.node(a).roster_ids().contains(&"peer:x".to_string()));

    assert!(mesh.node(a).gossip_roster() >= 1);
    mesh.settle();
    assert!(mesh.node(b).roster_ids().contains(&"peer:x".to_string()));
    assert!(peer
        .frames()
        .iter()
        .any(|envelope| matches!(envelope, Envelope::RosterSnapshot { .. })));
}

#[test]
fn duplicate_chat_envelopes_store_once() {
    let mut mesh = Mesh::new();
    let a = mesh.spawn("peer:a");
    let peer = mesh.raw_peer("peer:x", a);

    let chat = Envelope::chat("peer:x", "same message", 1_000, "peer:x-1000-r");
    for _ in 0..4 {
        peer.send(&chat);
    }
    mesh.settle();

    let messages = mesh.node(a).messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, "peer:x-1000-r");
    assert_eq!(messages[0].from, "peer:x");
    assert!(!messages[0].is_self);
}

#[test]
fn chat_without_id_dedups_on_sender_and_timestamp() {
    let mut mesh = Mesh::new();
    let a = mesh.spawn("peer:a");
    let peer = mesh.raw_peer("peer:x", a);

    let frame = r#"{"kind":"chat","channel":"global","text":"hi","from":"peer:x","ts":77}"#;
    peer.link.send(frame).unwrap();
    peer.link.send(frame).unwrap();
    mesh.settle();

    let messages = mesh.node(a).messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, "peer:x-77");
}

#[test]
fn chat_without_timestamp_is_dropped() {
    let mut mesh = Mesh::new();
    let a = mesh.spawn("peer:a");
    let peer = mesh.raw_peer("peer:x", a);

    peer
        .link
        .send(r#"{"kind":"chat","channel":"global","text":"first","from":"peer:x"}"#)
        .unwrap();
    peer
        .link
        .send(r#"{"kind":"chat","channel":"global","text":"second","from":"peer:x"}"#)
        .unwrap();
    peer.send(&Envelope::chat("peer:x", "third", 5, "peer:x-5-r"));
    mesh.settle();

    let messages = mesh.node(a).messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].text, "third");
    assert!(mesh.node(a).has_connection("peer:x"));
}

#[test]
fn bye_once_or_twice_ends_in_same_state() {
    let mut mesh = Mesh::new();
    let a = mesh.spawn("peer:a");
    let x = mesh.raw_peer("peer:x", a);
    let y = mesh.raw_peer("peer:y", a);
    assert_eq!(mesh.node(a).roster_ids(), vec!["peer:a", "peer:x", "peer:y"]);

    x.send(&Envelope::bye("peer:x"));
    mesh.settle();
    let after_one = (mesh.node(a).roster_ids(), mesh.node(a).has_connection("peer:x"));

    y.send(&Envelope::bye("peer:x"));
    mesh.settle();
    let after_two = (mesh.node(a).roster_ids(), mesh.node(a).has_connection("peer:x"));

    assert_eq!(after_one, (vec!["peer:a".to_string(), "peer:y".to_string()], false));
    assert_eq!(after_one, after_two);
}

#[test]
fn long_chat_is_truncated_in_history_and_on_the_wire() {
    let mut mesh = Mesh::new();
    let a = mesh.spawn("peer:a");
    let mut peer = mesh.raw_peer("peer:x", a);
    peer.frames();

    let stored = mesh.node_mut(a).send_chat(&"z".repeat(5000)).unwrap();
    assert_eq!(stored.text.chars().count(), MAX_TEXT_CHARS);

    let chats: Vec<_> = peer
        .frames()
        .into_iter()
        .filter_map(|envelope| match envelope {
            Envelope::Chat(chat) => Some(chat),
            _ => None,
        })
        .collect();
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].text.chars().count(), MAX_TEXT_CHARS);
    assert_eq!(chats[0].id.as_deref(), Some(stored.id.as_str()));
}

#[test]
fn blank_chat_sends_nothing() {
    let mut mesh = Mesh::new();
    let a = mesh.spawn("peer:a");
    let mut peer = mesh.raw_peer("peer:x", a);
    peer.frames();

    assert!(mesh.node_mut(a).send_chat("").is_none());
    assert!(mesh.node_mut(a).send_chat(" \n\t ").is_none());
    assert!(mesh.node(a).messages().is_empty());
    assert!(peer.frames().is_empty());
}

#[test]
fn history_keeps_latest_three_hundred() {
    let mut mesh = Mesh::new();
    let a = mesh.spawn("peer:a");
    let peer = mesh.raw_peer("peer:x", a);

    for i in 0..301 {
        peer.send(&Envelope::chat("peer:x", "m", i, &format!("id-{i}")));
    }
    mesh.settle();

    let messages = mesh.node(a).messages();
    assert_eq!(messages.len(), 300);
    assert_eq!(messages[0].id, "id-1");
    assert_eq!(messages[299].id, "id-300");
}

#[test]
fn handshake_precedes_chat_on_a_new_link() {
    let mut mesh = Mesh::new();
    let a = mesh.spawn("peer:a");
    let mut peer = mesh.raw_peer("peer:x", a);
    mesh.node_mut(a).send_chat("after open");

    let frames = peer.frames();
    assert!(matches!(frames[0], Envelope::Hello { .. }));
    assert!(matches!(frames[1], Envelope::RosterSnapshot { .. }));
    assert!(matches!(frames[2], Envelope::Chat(_)));
    peer.transport.close_endpoint();
}

#[test]
fn chat_spreads_to_every_peer_once_in_a_full_mesh() {
    let mut mesh = Mesh::new();
    let a = mesh.spawn("peer:a");
    let b = mesh.spawn("peer:b");
    let c = mesh.spawn("peer:c");
    mesh.bootstrap(b, a);
    mesh.bootstrap(c, b);

    let sent = mesh.node_mut(c).send_chat("to everyone").unwrap();
    mesh.settle();
    for index in [a, b] {
        let messages = mesh.node(index).messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, sent.id);
    }
    assert_eq!(mesh.node(c).messages().len(), 1);
}

use std::collections::BTreeSet;

/// The set of peer ids this coordinator believes belong to the mesh.
///
/// Once reset for a session the roster always contains the self id. It grows
/// through gossip merges and shrinks only on an explicit Bye or a lost link.
#[derive(Clone, Debug, Default)]
pub struct Roster {
    self_id: Option<String>,
    members: BTreeSet<String>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh session roster containing only `self_id`.
    pub fn reset(&mut self, self_id: &str) {
        self.members.clear();
        self.members.insert(self_id.to_string());
        self.self_id = Some(self_id.to_string());
    }

    /// Drop every member, including self.
    pub fn clear(&mut self) {
        self.members.clear();
        self.self_id = None;
    }

    /// Add a single id. Returns true if it was not already present.
    pub fn insert(&mut self, peer_id: &str) -> bool {
        if peer_id.is_empty() || self.members.contains(peer_id) {
            return false;
        }
        self.members.insert(peer_id.to_string())
    }

    /// Set union of `ids` into the roster. Returns the ids that were newly
    /// added; an empty result means the roster did not change.
    pub fn merge<I, S>(&mut self, ids: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        ids.into_iter()
            .filter_map(|id| {
                let id = id.as_ref();
                self.insert(id).then(|| id.to_string())
            })
            .collect()
    }

    /// Remove a peer. The self id is never removed this way.
    pub fn remove(&mut self, peer_id: &str) -> bool {
        if self.self_id.as_deref() == Some(peer_id) {
            return false;
        }
        self.members.remove(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.members.contains(peer_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Sorted snapshot of every member id.
    pub fn ids(&self) -> Vec<String> {
        self.members.iter().cloned().collect()
    }

    /// Members other than self.
    pub fn others(&self) -> impl Iterator<Item = &str> {
        let self_id = self.self_id.as_deref();
        self.members
            .iter()
            .map(String::as_str)
            .filter(move |id| Some(*id) != self_id)
    }
}

//! Roster merge rules driven by Hello / Bye / RosterSnapshot envelopes.
//!
//! Every link that opens receives our Hello followed by our full roster, and
//! every merge that grows the roster makes the caller dial the newcomers. As
//! long as some path of links joins two coordinators, both end up in each
//! other's roster with a direct link between them.

use crate::envelope::Envelope;
use crate::roster::Roster;

/// What an incoming presence envelope did to the roster.
#[derive(Debug, PartialEq, Eq)]
pub enum PresenceUpdate {
    /// A Hello was applied. `joined` is true if the sender was new.
    Greeted { peer_id: String, joined: bool },
    /// A roster snapshot was merged. Non-empty `joined` means the caller
    /// must run connect-missing.
    Merged { joined: Vec<String> },
    /// A Bye was applied; the caller closes the departing peer's link.
    Departed { peer_id: String, was_member: bool },
    /// Not a presence envelope, or nothing to do.
    Ignored,
}

/// The frames sent, in this order, on a link as soon as it opens.
pub fn handshake(self_id: &str, roster: &Roster) -> [Envelope; 2] {
    [Envelope::hello(self_id), Envelope::roster(self_id, roster.ids())]
}

/// Apply a presence envelope to `roster`.
pub fn apply(self_id: &str, roster: &mut Roster, envelope: &Envelope) -> PresenceUpdate {
    match envelope {
        Envelope::Hello { from, .. } => PresenceUpdate::Greeted {
            peer_id: from.clone(),
            joined: roster.insert(from),
        },
        Envelope::RosterSnapshot { ids, from, .. } => {
            let mut joined = roster.merge(ids);
            if roster.insert(from) {
                joined.push(from.clone());
            }
            PresenceUpdate::Merged { joined }
        }
        Envelope::Bye { from, .. } if from != self_id => PresenceUpdate::Departed {
            peer_id: from.clone(),
            was_member: roster.remove(from),
        },
        Envelope::Bye { .. } | Envelope::Chat(_) => PresenceUpdate::Ignored,
    }
}

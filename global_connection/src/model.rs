// Read-only snapshots of cluster members handed out to callers.
//
// The live tables live in `presence.rs` behind the client's lock. Everything
// returned from `GlobalClient` accessors and carried in events is one of
// these owned copies, so holding on to one never blocks or observes later
// mutation.

use std::collections::BTreeSet;

use global_connection_protocol::{PlayerId, ServerId};

/// One node of the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Server {
    pub(crate) id: ServerId,
    pub(crate) connected: bool,
    pub(crate) this_server: bool,
}

impl Server {
    pub fn id(&self) -> &ServerId {
        &self.id
    }

    /// Whether the node currently has a live link. Remote nodes are evicted
    /// when they disconnect, so this is only ever false for snapshots taken
    /// at disconnect time or for this node while its link is down.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// True for the node this process runs as.
    pub fn is_this_server(&self) -> bool {
        self.this_server
    }
}

/// A player visible somewhere in the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Player {
    pub(crate) id: PlayerId,
    pub(crate) name: String,
    pub(crate) joined_at: u64,
    pub(crate) servers: BTreeSet<ServerId>,
}

impl Player {
    pub fn id(&self) -> PlayerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unix epoch milliseconds of the report that first made the player
    /// visible in the cluster.
    pub fn joined_at(&self) -> u64 {
        self.joined_at
    }

    pub fn servers(&self) -> &BTreeSet<ServerId> {
        &self.servers
    }

    pub fn is_on_server(&self, server: &ServerId) -> bool {
        self.servers.contains(server)
    }

    pub fn is_on_any_server(&self) -> bool {
        !self.servers.is_empty()
    }
}

// Cluster presence tables: which nodes exist and where each player is seen.
//
// `ClusterState` is plain data driven by `client.rs`. It is only mutated from
// executor tasks (under the client's write lock) and has no locking or I/O of
// its own. Every mutator returns the events it implies; the caller dispatches
// them after releasing the lock.
//
// Invariant: a player has an entry iff its set of visible servers is
// non-empty. Entries are created by the first online report from any server
// and removed when the last server reports the player gone.
//
// Transitions:
// - first server added to a player's set   → joined, `joined_network = true`
// - another server added                    → joined, `joined_network = false`
// - a server removed, others remain         → disconnected, `left_network = false`
// - last server removed                     → disconnected, `left_network = true`
// Repeated reports (online twice from the same server, offline for a server
// the player is not on) change nothing and produce no event.

use std::collections::{BTreeSet, HashMap};

use global_connection_protocol::{PlayerId, PlayerInfo, ServerId};

use crate::events::ClusterEvent;
use crate::model::{Player, Server};

struct PlayerEntry {
    name: String,
    joined_at: u64,
    servers: BTreeSet<ServerId>,
}

impl PlayerEntry {
    fn snapshot(&self, id: PlayerId) -> Player {
        Player {
            id,
            name: self.name.clone(),
            joined_at: self.joined_at,
            servers: self.servers.clone(),
        }
    }
}

pub(crate) struct ClusterState {
    this_server: ServerId,
    this_connected: bool,
    remote: BTreeSet<ServerId>,
    players: HashMap<PlayerId, PlayerEntry>,
}

impl ClusterState {
    pub(crate) fn new(this_server: ServerId) -> Self {
        Self {
            this_server,
            this_connected: false,
            remote: BTreeSet::new(),
            players: HashMap::new(),
        }
    }

    pub(crate) fn this_server_id(&self) -> &ServerId {
        &self.this_server
    }

    pub(crate) fn this_server(&self) -> Server {
        Server {
            id: self.this_server.clone(),
            connected: self.this_connected,
            this_server: true,
        }
    }

    pub(crate) fn set_this_connected(&mut self, connected: bool) {
        self.this_connected = connected;
    }

    fn is_known(&self, server: &ServerId) -> bool {
        *server == self.this_server || self.remote.contains(server)
    }

    pub(crate) fn server(&self, id: &ServerId) -> Option<Server> {
        if *id == self.this_server {
            Some(self.this_server())
        } else if self.remote.contains(id) {
            Some(remote_server(id.clone(), true))
        } else {
            None
        }
    }

    /// This server first, then remote servers by name.
    pub(crate) fn servers(&self) -> Vec<Server> {
        let mut servers = vec![self.this_server()];
        servers.extend(self.remote.iter().cloned().map(|id| remote_server(id, true)));
        servers
    }

    pub(crate) fn remote_servers(&self) -> Vec<ServerId> {
        self.remote.iter().cloned().collect()
    }

    pub(crate) fn player(&self, id: &PlayerId) -> Option<Player> {
        self.players.get(id).map(|entry| entry.snapshot(*id))
    }

    pub(crate) fn players(&self) -> Vec<Player> {
        self.players
            .iter()
            .map(|(id, entry)| entry.snapshot(*id))
            .collect()
    }

    pub(crate) fn players_on(&self, server: &ServerId) -> Vec<PlayerId> {
        self.players
            .iter()
            .filter(|(_, entry)| entry.servers.contains(server))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Register a remote node. `None` if it is already known or is this node.
    pub(crate) fn add_server(&mut self, id: ServerId) -> Option<ClusterEvent> {
        if id == self.this_server || !self.remote.insert(id.clone()) {
            return None;
        }
        Some(ClusterEvent::ServerConnected {
            server: remote_server(id, true),
        })
    }

    /// Evict a remote node: every player on it goes offline there first,
    /// then the node itself disconnects.
    pub(crate) fn remove_server(&mut self, id: &ServerId) -> Vec<ClusterEvent> {
        if !self.remote.contains(id) {
            return Vec::new();
        }
        let mut events = self.drop_players_on(id);
        self.remote.remove(id);
        events.push(ClusterEvent::ServerDisconnected {
            server: remote_server(id.clone(), false),
        });
        events
    }

    /// Evict every remote node, as when the relay link is lost.
    pub(crate) fn remove_remote_servers(&mut self) -> Vec<ClusterEvent> {
        let ids = self.remote_servers();
        ids.iter().flat_map(|id| self.remove_server(id)).collect()
    }

    /// Switch this node to a new identity. Players recorded under the old
    /// identity move to the new one without leaving the network: each joins
    /// the new identity before leaving the old, then the old identity
    /// disconnects.
    pub(crate) fn rename_this_server(&mut self, new_id: ServerId) -> Vec<ClusterEvent> {
        if new_id == self.this_server {
            return Vec::new();
        }
        let old = self.this_server.clone();
        // The new name may have been a remote node a moment ago (e.g. a
        // stale link of this same process); this node owns it now.
        let mut events = self.remove_server(&new_id);
        let carried = self.players_on(&old);
        self.this_server = new_id.clone();
        self.this_connected = false;
        for id in carried {
            let Some(entry) = self.players.get_mut(&id) else {
                continue;
            };
            if entry.servers.insert(new_id.clone()) {
                events.push(ClusterEvent::PlayerJoined {
                    server: new_id.clone(),
                    player: entry.snapshot(id),
                    joined_network: false,
                });
            }
            entry.servers.remove(&old);
            events.push(ClusterEvent::PlayerDisconnected {
                server: old.clone(),
                player: entry.snapshot(id),
                left_network: false,
            });
        }
        events.push(ClusterEvent::ServerDisconnected {
            server: Server {
                id: old,
                connected: false,
                this_server: true,
            },
        });
        events
    }

    fn drop_players_on(&mut self, server: &ServerId) -> Vec<ClusterEvent> {
        self.players_on(server)
            .into_iter()
            .filter_map(|player| self.player_offline(server, &player))
            .collect()
    }

    /// Record `player` as visible on `server`. `None` when `server` is
    /// unknown or the player was already recorded there.
    pub(crate) fn player_online(
        &mut self,
        server: &ServerId,
        player: &PlayerInfo,
    ) -> Option<ClusterEvent> {
        if !self.is_known(server) {
            return None;
        }
        let entry = self
            .players
            .entry(player.id)
            .or_insert_with(|| PlayerEntry {
                name: player.name.clone(),
                joined_at: player.joined_at,
                servers: BTreeSet::new(),
            });
        let joined_network = entry.servers.is_empty();
        if !entry.servers.insert(server.clone()) {
            return None;
        }
        Some(ClusterEvent::PlayerJoined {
            server: server.clone(),
            player: entry.snapshot(player.id),
            joined_network,
        })
    }

    /// Record `player` as gone from `server`. `None` when it was not there.
    pub(crate) fn player_offline(
        &mut self,
        server: &ServerId,
        player: &PlayerId,
    ) -> Option<ClusterEvent> {
        let entry = self.players.get_mut(player)?;
        if !entry.servers.remove(server) {
            return None;
        }
        let snapshot = entry.snapshot(*player);
        let left_network = entry.servers.is_empty();
        if left_network {
            self.players.remove(player);
        }
        Some(ClusterEvent::PlayerDisconnected {
            server: server.clone(),
            player: snapshot,
            left_network,
        })
    }

    #[cfg(test)]
    fn assert_invariant(&self) {
        for (id, entry) in &self.players {
            assert!(!entry.servers.is_empty(), "player {id} has no servers");
            for server in &entry.servers {
                assert!(self.is_known(server), "player {id} on unknown {server}");
            }
        }
    }
}

fn remote_server(id: ServerId, connected: bool) -> Server {
    Server {
        id,
        connected,
        this_server: false,
    }
}

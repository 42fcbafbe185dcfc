// Roster state for the relay hub.
//
// `Roster` is the data structure `server.rs` drives. It tracks the logged-in
// nodes, the players each node has announced, and the write half of each
// node's stream. All mutation happens from the server's single-threaded main
// loop; there is no internal locking.
//
// Responsibilities:
// - Login: check protocol version and credentials, answer with `Welcome`
//   (listing every other node and its players) or `Rejected`, and tell the
//   other nodes about the newcomer.
// - Presence: remember each node's announced players and forward
//   online/offline reports to every other node.
// - Data: forward channel payloads. A `target_server` restricts delivery to
//   that node; a `target_player` restricts it to nodes that announced the
//   player; otherwise every other node receives it.
// - Logout: drop the node and tell the others.
//
// A second login under an account that is already connected takes over: the
// old connection is closed and reported disconnected first. Events from the
// old connection's reader are then ignored because they carry its
// `ConnectionId`.
//
// Write errors to a single node are logged and otherwise ignored; that node's
// reader thread sees the broken stream and reports the disconnect.

use std::collections::BTreeMap;
use std::io::BufWriter;
use std::net::{Shutdown, TcpStream};

use global_connection_protocol::{
    NodeMessage, PROTOCOL_VERSION, PlayerId, PlayerInfo, RelayMessage, ServerId, ServerInfo,
    send_message,
};
use tracing::{debug, info, warn};

/// Identifies one accepted TCP connection for the lifetime of the relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

struct NodeState {
    connection: ConnectionId,
    writer: BufWriter<TcpStream>,
    players: BTreeMap<PlayerId, PlayerInfo>,
}

impl NodeState {
    fn close(&self) {
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
    }
}

pub struct Roster {
    /// Account → password. Empty accepts any credentials.
    accounts: BTreeMap<String, String>,
    nodes: BTreeMap<ServerId, NodeState>,
    next_connection: u64,
}

impl Roster {
    pub fn new(accounts: BTreeMap<String, String>) -> Self {
        Self {
            accounts,
            nodes: BTreeMap::new(),
            next_connection: 0,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_connected(&self, server: &ServerId) -> bool {
        self.nodes.contains_key(server)
    }

    /// Players a node has announced, in id order.
    pub fn players_of(&self, server: &ServerId) -> Vec<PlayerId> {
        self.nodes
            .get(server)
            .map(|node| node.players.keys().copied().collect())
            .unwrap_or_default()
    }

    fn server_of(&self, connection: ConnectionId) -> Option<ServerId> {
        self.nodes
            .iter()
            .find(|(_, node)| node.connection == connection)
            .map(|(id, _)| id.clone())
    }

    fn check_credentials(
        &self,
        protocol_version: u32,
        account: &str,
        password: &str,
    ) -> Result<(), String> {
        if protocol_version != PROTOCOL_VERSION {
            return Err(format!(
                "unsupported protocol version {protocol_version} (relay speaks {PROTOCOL_VERSION})"
            ));
        }
        if account.is_empty() {
            return Err("empty account name".into());
        }
        if self.accounts.is_empty() {
            return Ok(());
        }
        match self.accounts.get(account) {
            Some(expected) if expected == password => Ok(()),
            Some(_) => Err("incorrect password".into()),
            None => Err("unknown account".into()),
        }
    }

    /// Log a node in. On success the node has been sent its `Welcome` and
    /// every other node has been told it connected. On failure the caller
    /// sends `Rejected` with the returned reason.
    pub fn login(
        &mut self,
        protocol_version: u32,
        account: &str,
        password: &str,
        stream: TcpStream,
    ) -> Result<ConnectionId, String> {
        self.check_credentials(protocol_version, account, password)?;

        let server = ServerId::new(account);
        if let Some(previous) = self.nodes.get(&server).map(|node| node.connection) {
            info!(server = %server, "account logged in again; dropping previous connection");
            self.logout(previous);
        }

        let connection = ConnectionId(self.next_connection);
        self.next_connection += 1;

        let servers: Vec<ServerInfo> = self
            .nodes
            .iter()
            .map(|(id, node)| ServerInfo {
                id: id.clone(),
                players: node.players.values().cloned().collect(),
            })
            .collect();

        self.broadcast_except(
            &server,
            &RelayMessage::ServerConnected {
                server: server.clone(),
            },
        );
        self.nodes.insert(
            server.clone(),
            NodeState {
                connection,
                writer: BufWriter::new(stream),
                players: BTreeMap::new(),
            },
        );
        self.send_to(
            &server,
            &RelayMessage::Welcome {
                server: server.clone(),
                servers,
            },
        );
        info!(server = %server, nodes = self.nodes.len(), "node logged in");
        Ok(connection)
    }

    /// Remove the node on `connection`, if it is still the current one for
    /// its account, and tell the others.
    pub fn logout(&mut self, connection: ConnectionId) {
        let Some(server) = self.server_of(connection) else {
            debug!(connection = connection.0, "ignoring logout of a replaced connection");
            return;
        };
        if let Some(node) = self.nodes.remove(&server) {
            node.close();
        }
        info!(server = %server, "node logged out");
        self.broadcast_except(&server, &RelayMessage::ServerDisconnected { server: server.clone() });
    }

    /// Close a node's stream from the relay side, as if its link failed.
    pub fn kick(&mut self, server: &ServerId) -> bool {
        match self.nodes.get(server).map(|node| node.connection) {
            Some(connection) => {
                self.logout(connection);
                true
            }
            None => false,
        }
    }

    /// Close every stream. Used on relay shutdown.
    pub fn close_all(&mut self) {
        for node in self.nodes.values() {
            node.close();
        }
        self.nodes.clear();
    }

    /// Apply one message from a logged-in node.
    pub fn handle(&mut self, connection: ConnectionId, message: NodeMessage) {
        let Some(source) = self.server_of(connection) else {
            return;
        };
        match message {
            NodeMessage::PlayerOnline { player } => {
                if let Some(node) = self.nodes.get_mut(&source) {
                    node.players.insert(player.id, player.clone());
                }
                self.broadcast_except(
                    &source,
                    &RelayMessage::PlayerOnline {
                        server: source.clone(),
                        player,
                    },
                );
            }
            NodeMessage::PlayerOffline { player } => {
                let removed = self
                    .nodes
                    .get_mut(&source)
                    .and_then(|node| node.players.remove(&player))
                    .is_some();
                if removed {
                    self.broadcast_except(
                        &source,
                        &RelayMessage::PlayerOffline {
                            server: source.clone(),
                            player,
                        },
                    );
                }
            }
            NodeMessage::Data {
                channel,
                target_player,
                target_server,
                payload,
            } => {
                let recipients: Vec<ServerId> = self
                    .nodes
                    .iter()
                    .filter(|(id, node)| {
                        **id != source
                            && target_server.as_ref().is_none_or(|target| target == *id)
                            && target_player.is_none_or(|player| node.players.contains_key(&player))
                    })
                    .map(|(id, _)| id.clone())
                    .collect();
                debug!(
                    source = %source,
                    channel = %channel,
                    recipients = recipients.len(),
                    "forwarding data"
                );
                let message = RelayMessage::Data {
                    source,
                    channel,
                    target_player,
                    payload,
                };
                for recipient in &recipients {
                    self.send_to(recipient, &message);
                }
            }
            NodeMessage::Hello { .. } => {
                warn!(source = %source, "ignoring repeated Hello");
            }
            NodeMessage::Goodbye => self.logout(connection),
        }
    }

    fn send_to(&mut self, server: &ServerId, message: &RelayMessage) {
        if let Some(node) = self.nodes.get_mut(server) {
            if let Err(e) = send_message(&mut node.writer, message) {
                debug!(server = %server, error = %e, "write to node failed");
            }
        }
    }

    fn broadcast_except(&mut self, except: &ServerId, message: &RelayMessage) {
        for (id, node) in &mut self.nodes {
            if id == except {
                continue;
            }
            if let Err(e) = send_message(&mut node.writer, message) {
                debug!(server = %id, error = %e, "write to node failed");
            }
        }
    }
}

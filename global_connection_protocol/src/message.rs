// Messages exchanged between a node and the relay hub.
//
// Two enums define the link vocabulary:
// - `NodeMessage`:  sent by a node (proxy process) to the relay.
// - `RelayMessage`: sent by the relay to a node.
//
// The relay keeps a roster of connected nodes and the players each one has
// announced, so a node that logs in late can be told the full cluster state in
// its `Welcome`. Everything else is forwarded as-is.
//
// Channel payloads are opaque `Vec<u8>`; the relay never inspects them. Higher
// layers (player properties, plugin channels) define their own binary formats
// with `data_io.rs`.

use serde::{Deserialize, Serialize};

use crate::types::{PlayerId, ServerId};

/// Link protocol version sent in `Hello`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent by a node to the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeMessage {
    /// Log in. `account` becomes this node's `ServerId`.
    Hello {
        protocol_version: u32,
        account: String,
        password: String,
    },
    /// A player is now visible on this node.
    PlayerOnline { player: PlayerInfo },
    /// A player is no longer visible on this node.
    PlayerOffline { player: PlayerId },
    /// Channel data for other nodes. With no target it goes to every other
    /// node; `target_server` narrows it to one node, `target_player` to the
    /// nodes the player is visible on.
    Data {
        channel: String,
        target_player: Option<PlayerId>,
        target_server: Option<ServerId>,
        payload: Vec<u8>,
    },
    /// Clean logout.
    Goodbye,
}

/// Messages sent by the relay to a node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RelayMessage {
    /// Login accepted. `servers` lists every *other* connected node with the
    /// players it has announced.
    Welcome {
        server: ServerId,
        servers: Vec<ServerInfo>,
    },
    /// Login refused.
    Rejected { reason: String },
    /// Another node logged in.
    ServerConnected { server: ServerId },
    /// Another node logged out or lost its link.
    ServerDisconnected { server: ServerId },
    /// A player became visible on another node.
    PlayerOnline { server: ServerId, player: PlayerInfo },
    /// A player is no longer visible on another node.
    PlayerOffline { server: ServerId, player: PlayerId },
    /// Channel data from another node.
    Data {
        source: ServerId,
        channel: String,
        target_player: Option<PlayerId>,
        payload: Vec<u8>,
    },
}

/// A player as announced by the node it is visible on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub id: PlayerId,
    pub name: String,
    /// Unix epoch milliseconds at which the player appeared on the node.
    pub joined_at: u64,
}

/// One node in a `Welcome` roster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: ServerId,
    pub players: Vec<PlayerInfo>,
}

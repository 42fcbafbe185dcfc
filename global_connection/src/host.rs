// What the embedding proxy must provide.

use global_connection_protocol::PlayerId;

/// A player currently connected to this proxy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalPlayer {
    pub id: PlayerId,
    pub name: String,
}

impl LocalPlayer {
    pub fn new(id: PlayerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Enumerates the players connected to this proxy right now. Called from the
/// client thread after every successful handshake to resynchronize local
/// presence, so it must not block on the host's main thread.
///
/// The list is authoritative: players recorded on this server but missing
/// from it are reported offline during the resync.
pub trait LocalPlayers: Send + Sync {
    fn local_players(&self) -> Vec<LocalPlayer>;
}

impl<F> LocalPlayers for F
where
    F: Fn() -> Vec<LocalPlayer> + Send + Sync,
{
    fn local_players(&self) -> Vec<LocalPlayer> {
        self()
    }
}

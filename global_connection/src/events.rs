// Notifications published by the client and the property layer.
//
// One tagged enum covers every notification kind; listeners match on the
// variants they care about. Listeners are called on the thread that produced
// the event (the executor worker for presence and inbound data, the caller's
// thread for local property writes), always after the producer has released
// its state locks, so a listener may freely query the client.

use std::sync::{Arc, RwLock};

use global_connection_protocol::{PlayerId, ServerId};

use crate::client::GlobalClient;
use crate::model::{Player, Server};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterEvent {
    /// `player` became visible on `server`. `joined_network` is true only
    /// when no other server had the player.
    PlayerJoined {
        server: ServerId,
        player: Player,
        joined_network: bool,
    },
    /// `player` is no longer visible on `server`. `left_network` is true when
    /// that was the last server. The snapshot is taken after the removal.
    PlayerDisconnected {
        server: ServerId,
        player: Player,
        left_network: bool,
    },
    /// A node joined the cluster, or this node finished its handshake.
    ServerConnected { server: Server },
    /// A node left the cluster.
    ServerDisconnected { server: Server },
    /// Channel data from another node.
    Data {
        source: ServerId,
        channel: String,
        target_player: Option<PlayerId>,
        payload: Vec<u8>,
    },
    /// A replicated player property changed. `value` is `None` on removal.
    PlayerPropertyChanged {
        source: ServerId,
        player: PlayerId,
        property: String,
        value: Option<String>,
    },
}

/// Receives `ClusterEvent`s.
pub trait ClusterListener: Send + Sync {
    fn on_event(&self, client: &GlobalClient, event: &ClusterEvent);
}

impl<F> ClusterListener for F
where
    F: Fn(&GlobalClient, &ClusterEvent) + Send + Sync,
{
    fn on_event(&self, client: &GlobalClient, event: &ClusterEvent) {
        self(client, event)
    }
}

/// Registered listeners, called in registration order.
#[derive(Default)]
pub(crate) struct Listeners {
    inner: RwLock<Vec<Arc<dyn ClusterListener>>>,
}

impl Listeners {
    pub(crate) fn add(&self, listener: Arc<dyn ClusterListener>) {
        self.inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(listener);
    }

    pub(crate) fn dispatch(&self, client: &GlobalClient, event: &ClusterEvent) {
        // Snapshot first so a listener can register another listener.
        let listeners: Vec<_> = self
            .inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener.on_event(client, event);
        }
    }
}

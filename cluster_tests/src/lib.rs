// Test-only cluster node for end-to-end tests.
//
// Wraps a real `GlobalClient` with its `PlayerProperties` layer, a recorder
// listener that keeps every `ClusterEvent`, and a fake host player list that
// the client reads on each handshake. Nodes talk to an in-process relay from
// `global_connection_relay` over localhost TCP.
//
// The only test-specific code here is the polling helpers. Networking,
// presence and property replication all run the same code paths a proxy
// would.
//
// See also: `tests/cluster_sync.rs` for the scenarios.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use global_connection::config::ReconnectPolicy;
use global_connection::{
    ClientConfig, ClusterEvent, ConnectionState, GlobalClient, LocalPlayer, LocalPlayers,
    PlayerId, PlayerProperties, ServerId,
};
use global_connection_relay::{RelayConfig, RelayHandle, start_relay};

/// Default timeout for blocking waits.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

static TRACING: Once = Once::new();

/// Route `tracing` output to the test harness. Filtered by `RUST_LOG`,
/// `warn` when unset.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Start an open relay (any account, any password) on a free port.
pub fn start_test_relay() -> RelayHandle {
    init_tracing();
    start_relay(RelayConfig {
        port: 0,
        accounts: BTreeMap::new(),
    })
    .expect("start_relay failed")
}

/// Poll `condition` until it holds or `WAIT_TIMEOUT` passes.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

pub fn player(n: u128) -> PlayerId {
    PlayerId::from_u128(n)
}

pub fn sid(name: &str) -> ServerId {
    ServerId::new(name)
}

/// The proxy's own player list, as the client sees it during a resync.
#[derive(Clone, Default)]
pub struct HostPlayers {
    players: Arc<Mutex<Vec<LocalPlayer>>>,
}

impl LocalPlayers for HostPlayers {
    fn local_players(&self) -> Vec<LocalPlayer> {
        self.players.lock().unwrap().clone()
    }
}

/// Client config pointing at `relay` with short reconnect delays.
pub fn node_config(relay: SocketAddr, account: &str) -> ClientConfig {
    let mut config = ClientConfig::new(relay.ip().to_string(), relay.port(), account, "");
    config.reconnect = ReconnectPolicy {
        initial_delay_ms: 50,
        max_delay_ms: 200,
    };
    config
}

/// A cluster node under test.
pub struct TestNode {
    pub client: GlobalClient,
    pub properties: Arc<PlayerProperties>,
    host: HostPlayers,
    events: Arc<Mutex<Vec<ClusterEvent>>>,
}

impl TestNode {
    /// Build the node without connecting it.
    pub fn new(config: ClientConfig) -> Self {
        init_tracing();
        let host = HostPlayers::default();
        let client =
            GlobalClient::new(config, host.clone()).expect("GlobalClient::new failed");
        let properties = PlayerProperties::install(&client);
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&events);
        client.add_listener(Arc::new(
            move |_client: &GlobalClient, event: &ClusterEvent| {
                recorder.lock().unwrap().push(event.clone());
            },
        ));
        Self {
            client,
            properties,
            host,
            events,
        }
    }

    /// Build the node, connect it to `relay` as `account`, and wait for the
    /// handshake.
    pub fn connect(relay: SocketAddr, account: &str) -> Self {
        let node = Self::new(node_config(relay, account));
        node.client
            .reconnect()
            .expect("connect failed");
        assert!(node.wait_connected(), "{account} did not connect");
        node
    }

    pub fn wait_connected(&self) -> bool {
        wait_until(|| self.client.connection_state() == ConnectionState::Connected)
    }

    /// A player logs in to this proxy.
    pub fn join(&self, id: PlayerId, name: &str) {
        self.host
            .players
            .lock()
            .unwrap()
            .push(LocalPlayer::new(id, name));
        self.client.player_connected(id, name);
        assert!(self.client.wait_idle(WAIT_TIMEOUT));
    }

    /// A player leaves this proxy.
    pub fn leave(&self, id: PlayerId) {
        self.host.players.lock().unwrap().retain(|p| p.id != id);
        self.client.player_disconnected(id);
        assert!(self.client.wait_idle(WAIT_TIMEOUT));
    }

    pub fn sees_server(&self, name: &str) -> bool {
        self.client.get_server(&sid(name)).is_some()
    }

    pub fn sees_player_on(&self, id: PlayerId, server: &str) -> bool {
        self.client
            .get_player(&id)
            .is_some_and(|p| p.is_on_server(&sid(server)))
    }

    pub fn events(&self) -> Vec<ClusterEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn count_events(&self, matches: impl Fn(&ClusterEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| matches(e)).count()
    }

    /// Wait until at least one recorded event satisfies `matches`.
    pub fn wait_for_event(&self, matches: impl Fn(&ClusterEvent) -> bool) -> bool {
        wait_until(|| self.count_events(&matches) > 0)
    }

    /// Payloads received on `channel`, in arrival order.
    pub fn data_on(&self, channel: &str) -> Vec<Vec<u8>> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                ClusterEvent::Data {
                    channel: c,
                    payload,
                    ..
                } if c == channel => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.client.shutdown();
    }
}

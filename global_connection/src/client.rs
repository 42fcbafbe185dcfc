// GlobalClient: the session core.
//
// Owns the relay link, the cluster presence tables and the listener list, and
// turns the raw link into a consistent, serialized view of the cluster.
//
// Threads:
// - the executor worker runs every state mutation: connect attempts, relay
//   messages, local presence reports, link loss;
// - one reader thread per link decodes frames and schedules them as tasks;
// - a short-lived timer thread per pending retry sleeps out the backoff delay
//   and schedules the next attempt;
// - host threads call the accessors, `send_data` and `schedule`.
//
// Locks, always taken in this order and never held while calling listeners:
// `Control` (connection state, config, retry epoch) → `outbound` (link
// writer and reliable outbox) → `cluster` (presence tables, read-mostly).
//
// Connection lifecycle:
//
//     Disconnected ──connect──► Connecting ──handshake──► Connected
//                                   ▲                          │
//                                   └──── link lost / retry ◄──┘
//     any ──shutdown──► Stopped (terminal)
//
// After every successful handshake, in order: apply the Welcome roster,
// resynchronize local presence with the host, flush buffered reliable data,
// then report this server connected. Listeners reacting to that last event
// (the property layer's snapshot) therefore see a fully populated cluster.
//
// Stale work is recognized by two counters. The retry epoch changes on every
// `connect` and on shutdown, cancelling sleeping retry timers. The link id
// changes per opened link, so events from a replaced link are ignored.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{
    Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use global_connection_protocol::framing::{self, FrameError};
use global_connection_protocol::{
    MAX_FRAME_SIZE, NodeMessage, PlayerId, PlayerInfo, RelayMessage, ServerId,
};
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::{ClientConfig, DeliveryPolicy};
use crate::error::ClientError;
use crate::events::{ClusterEvent, ClusterListener, Listeners};
use crate::executor::TaskExecutor;
use crate::host::LocalPlayers;
use crate::link::{Link, LinkEvent, Welcome};
use crate::model::{Player, Server};
use crate::presence::ClusterState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

/// How a payload behaves when the link is down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Still meaningful after a reconnect; buffered while down unless the
    /// config disables buffering.
    Reliable,
    /// Dropped while down.
    Unreliable,
}

/// Which nodes receive a payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// Every other node.
    AllServers,
    Server(ServerId),
    /// The nodes the player is visible on.
    Player(PlayerId),
}

/// What `send_data` did with a payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Buffered,
    Dropped,
}

struct Status {
    connection: ConnectionState,
    epoch: u64,
    config: ClientConfig,
    backoff: Backoff,
}

struct Control {
    status: Mutex<Status>,
    changed: Condvar,
}

impl Control {
    fn lock(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enter `Stopped`. False if already stopped.
    fn stop(&self) -> bool {
        let mut status = self.lock();
        if status.connection == ConnectionState::Stopped {
            return false;
        }
        status.connection = ConnectionState::Stopped;
        status.epoch += 1;
        self.changed.notify_all();
        true
    }

    fn is_current(status: &Status, epoch: u64) -> bool {
        status.epoch == epoch && status.connection != ConnectionState::Stopped
    }

    /// Sleep for `delay` unless the epoch moves on first. True when the
    /// retry is still wanted.
    fn wait_retry(&self, epoch: u64, delay: Duration) -> bool {
        let status = self.lock();
        let (status, _) = self
            .changed
            .wait_timeout_while(status, delay, |status| Self::is_current(status, epoch))
            .unwrap_or_else(PoisonError::into_inner);
        Self::is_current(&status, epoch)
    }
}

struct Outbound {
    link: Option<(u64, Link)>,
    /// Data may go straight to the link. False until the post-handshake
    /// resync has flushed the outbox.
    open: bool,
    /// Encoded `Data` frames, oldest first.
    outbox: VecDeque<Vec<u8>>,
    policy: DeliveryPolicy,
}

impl Outbound {
    fn current_link(&self) -> Option<u64> {
        self.link.as_ref().map(|(id, _)| *id)
    }
}

struct Shared {
    executor: TaskExecutor,
    control: Arc<Control>,
    outbound: Mutex<Outbound>,
    cluster: RwLock<ClusterState>,
    listeners: Listeners,
    local_players: Box<dyn LocalPlayers>,
    next_link_id: AtomicU64,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.control.stop();
        let link = lock(&self.outbound).link.take();
        if let Some((_, link)) = link {
            link.close();
        }
    }
}

/// Handle to one node's cluster session. Cheap to clone; all clones share
/// the same session.
#[derive(Clone)]
pub struct GlobalClient {
    shared: Arc<Shared>,
}

/// Non-owning handle, for components the client itself keeps alive.
#[derive(Clone)]
pub struct WeakClient {
    shared: Weak<Shared>,
}

impl WeakClient {
    pub fn upgrade(&self) -> Option<GlobalClient> {
        self.shared.upgrade().map(|shared| GlobalClient { shared })
    }
}

/// Access to the presence entry points, handed to tasks run by
/// `GlobalClient::schedule`. Only exists on the client thread.
pub struct TaskScope<'a> {
    client: &'a GlobalClient,
}

impl TaskScope<'_> {
    pub fn client(&self) -> &GlobalClient {
        self.client
    }

    /// Record a player as visible on this server and announce it. Returns
    /// false when it was already recorded here.
    pub fn on_player_online(&self, id: PlayerId, name: &str, joined_at: u64) -> bool {
        self.client.local_online(PlayerInfo {
            id,
            name: name.to_owned(),
            joined_at,
        })
    }

    /// Record a player as gone from this server and announce it. Returns
    /// false when it was not recorded here.
    pub fn on_player_offline(&self, id: PlayerId) -> bool {
        self.client.local_offline(id)
    }
}

impl GlobalClient {
    /// Start the client thread. Nothing connects until `connect` or
    /// `reconnect` is called; until then the client tracks local presence
    /// only.
    pub fn new<L>(config: ClientConfig, local_players: L) -> Result<Self, ClientError>
    where
        L: LocalPlayers + 'static,
    {
        config.validate()?;
        let executor = TaskExecutor::start(&format!("global-client-{}", config.client.account))
            .map_err(ClientError::Spawn)?;
        let this_server = ServerId::new(config.client.account.clone());
        Ok(Self {
            shared: Arc::new(Shared {
                executor,
                control: Arc::new(Control {
                    status: Mutex::new(Status {
                        connection: ConnectionState::Disconnected,
                        epoch: 0,
                        backoff: Backoff::new(&config.reconnect),
                        config: config.clone(),
                    }),
                    changed: Condvar::new(),
                }),
                outbound: Mutex::new(Outbound {
                    link: None,
                    open: false,
                    outbox: VecDeque::new(),
                    policy: config.delivery,
                }),
                cluster: RwLock::new(ClusterState::new(this_server)),
                listeners: Listeners::default(),
                local_players: Box::new(local_players),
                next_link_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn downgrade(&self) -> WeakClient {
        WeakClient {
            shared: Arc::downgrade(&self.shared),
        }
    }

    // --- Session control ---

    /// Connect (or reconnect) to a relay under the given credentials,
    /// keeping the configured reconnect and delivery policies. Returns
    /// immediately; the attempt runs on the client thread.
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        account: &str,
        password: &str,
    ) -> Result<(), ClientError> {
        let mut config = self.shared.control.lock().config.clone();
        config.server.host = host.to_owned();
        config.server.port = port;
        config.client.account = account.to_owned();
        config.client.password = password.to_owned();
        self.connect_with_config(config)
    }

    /// Like `connect`, replacing the whole config. A changed account retires
    /// the old server identity: its players move to the new one without
    /// leaving the network.
    pub fn connect_with_config(&self, config: ClientConfig) -> Result<(), ClientError> {
        config.validate()?;
        if self.connection_state() == ConnectionState::Stopped {
            return Err(ClientError::Stopped);
        }
        let client = self.clone();
        self.shared
            .executor
            .schedule(move || client.start_session(config));
        Ok(())
    }

    /// Reconnect with the current config, e.g. after the relay was
    /// restarted by hand.
    pub fn reconnect(&self) -> Result<(), ClientError> {
        let config = self.shared.control.lock().config.clone();
        self.connect_with_config(config)
    }

    /// Log out, close the link and stop the client thread. Tasks queued but
    /// not started are dropped. Terminal.
    pub fn shutdown(&self) {
        if !self.shared.control.stop() {
            return;
        }
        let link = {
            let mut outbound = lock(&self.shared.outbound);
            outbound.open = false;
            outbound.outbox.clear();
            outbound.link.take()
        };
        if let Some((_, link)) = link {
            link.close();
        }
        self.shared.executor.shutdown();
        self.shared.executor.join();
        info!(server = %self.this_server().id(), "global client stopped");
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.control.lock().connection
    }

    pub fn config(&self) -> ClientConfig {
        self.shared.control.lock().config.clone()
    }

    // --- Ordering domain ---

    /// Run `task` on the client thread, after everything scheduled before
    /// it. Silently dropped after shutdown.
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce(&TaskScope<'_>) + Send + 'static,
    {
        let client = self.clone();
        self.shared.executor.schedule(move || {
            let scope = TaskScope { client: &client };
            task(&scope);
        });
    }

    /// Host hook: a player logged in to this proxy. Ignored if already
    /// recorded here.
    pub fn player_connected(&self, id: PlayerId, name: &str) {
        let name = name.to_owned();
        self.schedule(move |scope| {
            scope.on_player_online(id, &name, now_millis());
        });
    }

    /// Host hook: a player left this proxy. Ignored if not recorded here.
    pub fn player_disconnected(&self, id: PlayerId) {
        self.schedule(move |scope| {
            scope.on_player_offline(id);
        });
    }

    /// Block until every task scheduled before this call has run. False on
    /// timeout or after shutdown. Returns true immediately on the client
    /// thread itself.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        if self.shared.executor.is_worker_thread() {
            return true;
        }
        let (tx, rx) = std::sync::mpsc::channel();
        self.shared.executor.schedule(move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(timeout).is_ok()
    }

    // --- Queries ---

    pub fn this_server(&self) -> Server {
        read(&self.shared.cluster).this_server()
    }

    pub fn get_server(&self, id: &ServerId) -> Option<Server> {
        read(&self.shared.cluster).server(id)
    }

    /// This server first, then every known remote server.
    pub fn servers(&self) -> Vec<Server> {
        read(&self.shared.cluster).servers()
    }

    pub fn get_player(&self, id: &PlayerId) -> Option<Player> {
        read(&self.shared.cluster).player(id)
    }

    pub fn players(&self) -> Vec<Player> {
        read(&self.shared.cluster).players()
    }

    // --- Listeners and data ---

    pub fn add_listener(&self, listener: Arc<dyn ClusterListener>) {
        self.shared.listeners.add(listener);
    }

    /// Send a payload to every other node.
    pub fn send_data(
        &self,
        channel: &str,
        payload: Vec<u8>,
        delivery: Delivery,
    ) -> Result<SendOutcome, ClientError> {
        self.send_data_to(channel, payload, delivery, Target::AllServers)
    }

    /// Send a payload to the nodes `target` selects. A payload whose frame
    /// would exceed `MAX_FRAME_SIZE` is rejected before anything is queued.
    pub fn send_data_to(
        &self,
        channel: &str,
        payload: Vec<u8>,
        delivery: Delivery,
        target: Target,
    ) -> Result<SendOutcome, ClientError> {
        if channel.is_empty() {
            return Err(ClientError::InvalidArgument("channel must not be empty"));
        }
        if self.connection_state() == ConnectionState::Stopped {
            return Err(ClientError::Stopped);
        }
        let (target_player, target_server) = match target {
            Target::AllServers => (None, None),
            Target::Server(server) => (None, Some(server)),
            Target::Player(player) => (Some(player), None),
        };
        let frame = framing::encode(&NodeMessage::Data {
            channel: channel.to_owned(),
            target_player,
            target_server,
            payload,
        })
        .map_err(ClientError::Encode)?;
        if frame.len() > MAX_FRAME_SIZE as usize {
            return Err(ClientError::PayloadTooLarge {
                len: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let mut outbound = lock(&self.shared.outbound);
        if outbound.open {
            if let Some((_, link)) = &outbound.link {
                match link.send_encoded(&frame) {
                    Ok(()) => return Ok(SendOutcome::Sent),
                    Err(e) if breaks_stream(&e) => {
                        debug!(channel, error = %e, "send failed; link is going down");
                    }
                    Err(e) => {
                        warn!(channel, error = %e, "payload not sent");
                        return Ok(SendOutcome::Dropped);
                    }
                }
            }
            outbound.open = false;
        }
        if delivery == Delivery::Unreliable || !outbound.policy.buffer_reliable {
            debug!(channel, "link down; dropping payload");
            return Ok(SendOutcome::Dropped);
        }
        if outbound.outbox.len() >= outbound.policy.reliable_buffer_limit {
            warn!(
                channel,
                limit = outbound.policy.reliable_buffer_limit,
                "reliable outbox full; dropping payload"
            );
            return Ok(SendOutcome::Dropped);
        }
        outbound.outbox.push_back(frame);
        Ok(SendOutcome::Buffered)
    }

    /// Reliable payloads waiting for the next handshake.
    pub fn buffered_len(&self) -> usize {
        lock(&self.shared.outbound).outbox.len()
    }

    pub(crate) fn emit(&self, event: &ClusterEvent) {
        self.shared.listeners.dispatch(self, event);
    }

    fn emit_all(&self, events: &[ClusterEvent]) {
        for event in events {
            self.emit(event);
        }
    }

    // --- Client-thread internals ---

    fn start_session(&self, config: ClientConfig) {
        let epoch = {
            let mut status = self.shared.control.lock();
            if status.connection == ConnectionState::Stopped {
                return;
            }
            status.epoch += 1;
            status.connection = ConnectionState::Connecting;
            status.backoff = Backoff::new(&config.reconnect);
            status.config = config.clone();
            self.shared.control.changed.notify_all();
            status.epoch
        };

        let old_link = {
            let mut outbound = lock(&self.shared.outbound);
            outbound.policy = config.delivery.clone();
            outbound.open = false;
            outbound.link.take()
        };
        if let Some((_, link)) = old_link {
            info!(relay = %link.peer(), "replacing relay link");
            link.close();
        }

        let events = {
            let mut cluster = write(&self.shared.cluster);
            let mut events = cluster.remove_remote_servers();
            cluster.set_this_connected(false);
            events.extend(retire_identity(
                &mut cluster,
                ServerId::new(config.client.account.clone()),
            ));
            events
        };
        self.emit_all(&events);

        info!(
            host = %config.server.host,
            port = config.server.port,
            account = %config.client.account,
            "connecting to relay"
        );
        self.attempt(epoch);
    }

    fn attempt(&self, epoch: u64) {
        let config = {
            let status = self.shared.control.lock();
            if !Control::is_current(&status, epoch) {
                return;
            }
            status.config.clone()
        };

        let link_id = self.shared.next_link_id.fetch_add(1, Ordering::Relaxed);
        let weak = self.downgrade();
        let opened = Link::open(&config.server, &config.client, move |event| {
            if let Some(client) = weak.upgrade() {
                let handler = client.clone();
                client
                    .shared
                    .executor
                    .schedule(move || handler.handle_link_event(link_id, event));
            }
        });

        match opened {
            Ok((link, welcome)) => self.established(epoch, link_id, link, welcome),
            Err(e) => {
                if e.is_rejection() {
                    error!(account = %config.client.account, error = %e, "relay refused login");
                } else {
                    warn!(host = %config.server.host, port = config.server.port, error = %e, "relay connection failed");
                }
                self.schedule_retry(epoch);
            }
        }
    }

    fn established(&self, epoch: u64, link_id: u64, link: Link, welcome: Welcome) {
        let peer = link.peer();
        {
            let mut status = self.shared.control.lock();
            if !Control::is_current(&status, epoch) {
                drop(status);
                link.close();
                return;
            }
            status.backoff.reset();
            let mut outbound = lock(&self.shared.outbound);
            outbound.link = Some((link_id, link));
            outbound.open = false;
        }
        info!(
            relay = %peer,
            server = %welcome.server,
            servers = welcome.servers.len(),
            "logged in to relay"
        );

        let events = {
            let mut cluster = write(&self.shared.cluster);
            let mut events = Vec::new();
            if *cluster.this_server_id() != welcome.server {
                warn!(
                    expected = %cluster.this_server_id(),
                    assigned = %welcome.server,
                    "relay assigned a different server id"
                );
                events.extend(retire_identity(&mut cluster, welcome.server.clone()));
            }
            for server in &welcome.servers {
                events.extend(cluster.add_server(server.id.clone()));
                for player in &server.players {
                    events.extend(cluster.player_online(&server.id, player));
                }
            }
            cluster.set_this_connected(true);
            events
        };
        self.emit_all(&events);

        self.resync_local_presence();
        if !self.flush_outbox() {
            // The link died during the resync; its Closed event is queued.
            return;
        }

        {
            let mut status = self.shared.control.lock();
            if !Control::is_current(&status, epoch) {
                return;
            }
            status.connection = ConnectionState::Connected;
        }
        let this = self.this_server();
        self.emit(&ClusterEvent::ServerConnected { server: this });
    }

    /// Make the relay's view of this server match the host's player list.
    fn resync_local_presence(&self) {
        let host = self.shared.local_players.local_players();
        let host_ids: HashSet<PlayerId> = host.iter().map(|p| p.id).collect();
        let recorded: Vec<Player> = {
            let cluster = read(&self.shared.cluster);
            let this = cluster.this_server_id().clone();
            cluster
                .players_on(&this)
                .iter()
                .filter_map(|id| cluster.player(id))
                .collect()
        };
        let recorded_ids: HashSet<PlayerId> = recorded.iter().map(Player::id).collect();

        for player in recorded.iter().filter(|p| host_ids.contains(&p.id())) {
            self.announce(&NodeMessage::PlayerOnline {
                player: PlayerInfo {
                    id: player.id(),
                    name: player.name().to_owned(),
                    joined_at: player.joined_at(),
                },
            });
        }
        for player in host.iter().filter(|p| !recorded_ids.contains(&p.id)) {
            self.local_online(PlayerInfo {
                id: player.id,
                name: player.name.clone(),
                joined_at: now_millis(),
            });
        }
        for player in recorded.iter().filter(|p| !host_ids.contains(&p.id())) {
            self.local_offline(player.id());
        }
    }

    /// Send buffered reliable payloads in order, then open the link for
    /// direct sends. False if the link failed part way; a payload the link
    /// refuses without breaking is dropped instead.
    fn flush_outbox(&self) -> bool {
        let mut guard = lock(&self.shared.outbound);
        let outbound = &mut *guard;
        let Some((_, link)) = &outbound.link else {
            return false;
        };
        let mut flushed = 0usize;
        while let Some(frame) = outbound.outbox.front() {
            match link.send_encoded(frame) {
                Ok(()) => flushed += 1,
                Err(e) if breaks_stream(&e) => {
                    warn!(
                        remaining = outbound.outbox.len(),
                        error = %e,
                        "flushing reliable outbox failed"
                    );
                    return false;
                }
                Err(e) => warn!(error = %e, "dropping buffered payload"),
            }
            outbound.outbox.pop_front();
        }
        if flushed > 0 {
            debug!(flushed, "flushed reliable outbox");
        }
        outbound.open = true;
        true
    }

    fn schedule_retry(&self, epoch: u64) {
        let delay = {
            let mut status = self.shared.control.lock();
            if !Control::is_current(&status, epoch) {
                return;
            }
            status.backoff.next_delay()
        };
        debug!(?delay, "scheduling relay reconnect");
        let control = Arc::clone(&self.shared.control);
        let weak = self.downgrade();
        let spawned = thread::Builder::new()
            .name("relay-reconnect".into())
            .spawn(move || {
                if !control.wait_retry(epoch, delay) {
                    return;
                }
                if let Some(client) = weak.upgrade() {
                    let retry = client.clone();
                    client
                        .shared
                        .executor
                        .schedule(move || retry.attempt(epoch));
                }
            });
        if let Err(e) = spawned {
            error!(error = %e, "could not start reconnect timer; staying disconnected");
        }
    }

    fn handle_link_event(&self, link_id: u64, event: LinkEvent) {
        if lock(&self.shared.outbound).current_link() != Some(link_id) {
            debug!(link_id, "ignoring event from a replaced link");
            return;
        }
        match event {
            LinkEvent::Message(message) => self.handle_relay_message(message),
            LinkEvent::Closed(reason) => self.link_lost(link_id, &reason),
        }
    }

    fn handle_relay_message(&self, message: RelayMessage) {
        let events: Vec<ClusterEvent> = {
            let mut cluster = write(&self.shared.cluster);
            let this = cluster.this_server_id().clone();
            match message {
                RelayMessage::ServerConnected { server } => {
                    cluster.add_server(server).into_iter().collect()
                }
                RelayMessage::ServerDisconnected { server } => cluster.remove_server(&server),
                RelayMessage::PlayerOnline { server, .. } | RelayMessage::PlayerOffline { server, .. }
                    if server == this =>
                {
                    debug!("ignoring presence report relayed back to its origin");
                    Vec::new()
                }
                RelayMessage::PlayerOnline { server, player } => {
                    let event = cluster.player_online(&server, &player);
                    if event.is_none() && cluster.server(&server).is_none() {
                        debug!(server = %server, player = %player.id, "presence report from unknown server");
                    }
                    event.into_iter().collect()
                }
                RelayMessage::PlayerOffline { server, player } => {
                    cluster.player_offline(&server, &player).into_iter().collect()
                }
                RelayMessage::Data {
                    source,
                    channel,
                    target_player,
                    payload,
                } => vec![ClusterEvent::Data {
                    source,
                    channel,
                    target_player,
                    payload,
                }],
                RelayMessage::Welcome { .. } | RelayMessage::Rejected { .. } => {
                    warn!("ignoring handshake message on an established link");
                    Vec::new()
                }
            }
        };
        self.emit_all(&events);
    }

    fn link_lost(&self, link_id: u64, reason: &str) {
        let link = {
            let mut outbound = lock(&self.shared.outbound);
            if outbound.current_link() != Some(link_id) {
                return;
            }
            outbound.open = false;
            outbound.link.take()
        };
        if let Some((_, link)) = link {
            link.close();
        }
        let epoch = {
            let mut status = self.shared.control.lock();
            if status.connection == ConnectionState::Stopped {
                return;
            }
            status.connection = ConnectionState::Connecting;
            status.epoch
        };
        warn!(reason, "lost relay link; reconnecting");

        let events = {
            let mut cluster = write(&self.shared.cluster);
            let events = cluster.remove_remote_servers();
            cluster.set_this_connected(false);
            events
        };
        self.emit_all(&events);
        self.schedule_retry(epoch);
    }

    fn local_online(&self, player: PlayerInfo) -> bool {
        let event = {
            let mut cluster = write(&self.shared.cluster);
            let this = cluster.this_server_id().clone();
            cluster.player_online(&this, &player)
        };
        let Some(event) = event else {
            return false;
        };
        self.announce(&NodeMessage::PlayerOnline { player });
        self.emit(&event);
        true
    }

    fn local_offline(&self, id: PlayerId) -> bool {
        let event = {
            let mut cluster = write(&self.shared.cluster);
            let this = cluster.this_server_id().clone();
            cluster.player_offline(&this, &id)
        };
        let Some(event) = event else {
            return false;
        };
        self.announce(&NodeMessage::PlayerOffline { player: id });
        self.emit(&event);
        true
    }

    /// Send a presence message if a link is up. While down, the next resync
    /// re-announces everything.
    fn announce(&self, message: &NodeMessage) {
        let outbound = lock(&self.shared.outbound);
        if let Some((_, link)) = &outbound.link {
            if let Err(e) = link.send(message) {
                debug!(error = %e, "presence announcement not sent");
            }
        }
    }
}

/// Move this node to `new_id`, carrying its players over. No-op when the id
/// is unchanged.
fn retire_identity(cluster: &mut ClusterState, new_id: ServerId) -> Vec<ClusterEvent> {
    if *cluster.this_server_id() == new_id {
        return Vec::new();
    }
    info!(old = %cluster.this_server_id(), new = %new_id, "server identity changed");
    cluster.rename_this_server(new_id)
}

/// Only I/O failures leave a half-written frame behind. An oversized or
/// unencodable message is refused before any byte is written.
fn breaks_stream(error: &FrameError) -> bool {
    matches!(error, FrameError::Io(_))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

// Replicated per-player key/value properties.
//
// Every node holds a full copy of the property table and keeps it in sync
// over the `GlobalClient.playerProperties` data channel (`property_wire.rs`):
// - a local write updates the table, then broadcasts SET or DELETE;
// - inbound SET/DELETE/MULTISET messages update the table;
// - when this node finishes a handshake it broadcasts a MULTISET snapshot of
//   the players it hosts, and when another node connects it sends that node
//   the same snapshot. Inbound blocks for players not currently visible are
//   skipped;
// - when a player leaves the network every node drops that player's
//   properties locally. There is no wire message for this.
//
// Conflicts resolve as last write wins per node; SETs are idempotent upserts,
// so receiving one twice (e.g. once directly and once inside a snapshot) is
// harmless.
//
// The table sits behind its own `RwLock` so host threads can read without
// going through the client thread. Writers hold the lock only for the map
// mutation: encoding, sending and listener calls happen after release. An
// inbound MULTISET is decoded in full before anything is applied, and each
// player's block is applied under one write-lock acquisition, so readers see
// either none or all of a block.
//
// The layer is itself a `ClusterListener`. The client keeps it alive through
// its listener list and it only holds a weak handle back.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use global_connection_protocol::data_io::{MAX_UTF_LEN, modified_utf8_len};
use global_connection_protocol::{DataError, PlayerId, ServerId};
use tracing::{debug, warn};

use crate::client::{ConnectionState, Delivery, GlobalClient, Target, WeakClient};
use crate::error::{ClientError, PropertyError};
use crate::events::{ClusterEvent, ClusterListener};
use crate::property_wire::{CHANNEL, PropertyBlock, PropertyMessage};

type PropertyTable = HashMap<PlayerId, HashMap<String, String>>;

/// Read and write access to replicated player properties.
pub trait PlayerPropertiesApi {
    fn has_property(&self, player: &PlayerId, property: &str) -> bool;

    fn get_property_value(&self, player: &PlayerId, property: &str) -> Option<String>;

    /// Copy of every property the player has; empty if none.
    fn get_all_properties(&self, player: &PlayerId) -> HashMap<String, String>;

    /// Set (`Some`) or delete (`None`) a property and replicate the change.
    /// The player must be visible on some server.
    fn set_property_value(
        &self,
        player: &PlayerId,
        property: &str,
        value: Option<&str>,
    ) -> Result<(), PropertyError>;
}

pub struct PlayerProperties {
    client: WeakClient,
    table: RwLock<PropertyTable>,
}

impl PlayerProperties {
    /// Create the layer and register it with `client`.
    pub fn install(client: &GlobalClient) -> Arc<Self> {
        let properties = Arc::new(Self {
            client: client.downgrade(),
            table: RwLock::new(HashMap::new()),
        });
        client.add_listener(Arc::clone(&properties) as Arc<dyn ClusterListener>);
        properties
    }

    fn read(&self) -> RwLockReadGuard<'_, PropertyTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, PropertyTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Players with at least one property.
    pub fn players_with_properties(&self) -> Vec<PlayerId> {
        self.read().keys().copied().collect()
    }

    /// Properties of the players this node hosts. Players on other nodes are
    /// left to their own hosts, whose reports are ordered with their presence.
    fn snapshot(&self, client: &GlobalClient) -> PropertyMessage {
        let this = client.this_server().id().clone();
        let local: HashSet<PlayerId> = client
            .players()
            .iter()
            .filter(|player| player.is_on_server(&this))
            .map(|player| player.id())
            .collect();
        let table = self.read();
        PropertyMessage::MultiSet(
            table
                .iter()
                .filter(|(player, _)| local.contains(*player))
                .map(|(player, properties)| PropertyBlock {
                    player: *player,
                    entries: properties
                        .iter()
                        .map(|(name, value)| (name.clone(), value.clone()))
                        .collect(),
                })
                .collect(),
        )
    }

    fn send_snapshot(&self, client: &GlobalClient, target: Target) {
        let bytes = match self.snapshot(client).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "could not encode property snapshot");
                return;
            }
        };
        debug!(?target, len = bytes.len(), "sending property snapshot");
        if let Err(e) = client.send_data_to(CHANNEL, bytes, Delivery::Reliable, target) {
            debug!(error = %e, "property snapshot not sent");
        }
    }

    fn apply_inbound(&self, client: &GlobalClient, source: &ServerId, payload: &[u8]) {
        let message = match PropertyMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(source = %source, error = %e, "could not parse player properties message");
                return;
            }
        };
        let changed = |player: PlayerId, property: String, value: Option<String>| {
            ClusterEvent::PlayerPropertyChanged {
                source: source.clone(),
                player,
                property,
                value,
            }
        };

        match message {
            PropertyMessage::Set {
                player,
                property,
                value,
            } => {
                self.write()
                    .entry(player)
                    .or_default()
                    .insert(property.clone(), value.clone());
                client.emit(&changed(player, property, Some(value)));
            }
            PropertyMessage::Delete { player, property } => {
                if remove_property(&mut self.write(), &player, &property) {
                    client.emit(&changed(player, property, None));
                }
            }
            PropertyMessage::MultiSet(blocks) => {
                for block in blocks {
                    if block.entries.is_empty() {
                        continue;
                    }
                    // A block may trail the player's departure from a third
                    // node; without presence it would never be purged.
                    if client.get_player(&block.player).is_none() {
                        debug!(
                            source = %source,
                            player = %block.player,
                            "skipping snapshot block for an unseen player"
                        );
                        continue;
                    }
                    {
                        let mut table = self.write();
                        let properties = table.entry(block.player).or_default();
                        for (name, value) in &block.entries {
                            properties.insert(name.clone(), value.clone());
                        }
                    }
                    for (name, value) in block.entries {
                        client.emit(&changed(block.player, name, Some(value)));
                    }
                }
            }
        }
    }
}

/// Remove one property, dropping the player's map once empty. True if a
/// value was removed.
fn remove_property(table: &mut PropertyTable, player: &PlayerId, property: &str) -> bool {
    let Some(properties) = table.get_mut(player) else {
        return false;
    };
    let removed = properties.remove(property).is_some();
    if properties.is_empty() {
        table.remove(player);
    }
    removed
}

fn check_len(field: &'static str, text: &str) -> Result<(), PropertyError> {
    let len = modified_utf8_len(text);
    if len > MAX_UTF_LEN {
        return Err(PropertyError::TooLong {
            field,
            source: DataError::StringTooLong { len },
        });
    }
    Ok(())
}

impl PlayerPropertiesApi for PlayerProperties {
    fn has_property(&self, player: &PlayerId, property: &str) -> bool {
        self.read()
            .get(player)
            .is_some_and(|properties| properties.contains_key(property))
    }

    fn get_property_value(&self, player: &PlayerId, property: &str) -> Option<String> {
        self.read()
            .get(player)
            .and_then(|properties| properties.get(property).cloned())
    }

    fn get_all_properties(&self, player: &PlayerId) -> HashMap<String, String> {
        self.read().get(player).cloned().unwrap_or_default()
    }

    fn set_property_value(
        &self,
        player: &PlayerId,
        property: &str,
        value: Option<&str>,
    ) -> Result<(), PropertyError> {
        if property.is_empty() {
            return Err(PropertyError::EmptyName);
        }
        check_len("name", property)?;
        if let Some(value) = value {
            check_len("value", value)?;
        }
        let client = self.client.upgrade().ok_or(PropertyError::Detached)?;
        if client.connection_state() == ConnectionState::Stopped {
            return Err(ClientError::Stopped.into());
        }
        if !client
            .get_player(player)
            .is_some_and(|p| p.is_on_any_server())
        {
            return Err(PropertyError::PlayerNotOnline(*player));
        }

        let message = match value {
            Some(value) => PropertyMessage::Set {
                player: *player,
                property: property.to_owned(),
                value: value.to_owned(),
            },
            None => PropertyMessage::Delete {
                player: *player,
                property: property.to_owned(),
            },
        };
        let bytes = message.encode()?;

        {
            let mut table = self.write();
            match value {
                Some(value) => {
                    table
                        .entry(*player)
                        .or_default()
                        .insert(property.to_owned(), value.to_owned());
                }
                None => {
                    remove_property(&mut table, player, property);
                }
            }
        }

        client.send_data(CHANNEL, bytes, Delivery::Reliable)?;
        client.emit(&ClusterEvent::PlayerPropertyChanged {
            source: client.this_server().id().clone(),
            player: *player,
            property: property.to_owned(),
            value: value.map(str::to_owned),
        });
        Ok(())
    }
}

impl ClusterListener for PlayerProperties {
    fn on_event(&self, client: &GlobalClient, event: &ClusterEvent) {
        match event {
            ClusterEvent::PlayerDisconnected {
                player,
                left_network: true,
                ..
            } => {
                self.write().remove(&player.id());
            }
            ClusterEvent::ServerConnected { server } if server.is_this_server() => {
                self.send_snapshot(client, Target::AllServers);
            }
            ClusterEvent::ServerConnected { server } => {
                self.send_snapshot(client, Target::Server(server.id().clone()));
            }
            ClusterEvent::Data {
                source,
                channel,
                payload,
                ..
            } if channel == CHANNEL => {
                self.apply_inbound(client, source, payload);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::config::ClientConfig;
    use crate::host::LocalPlayer;
    use crate::model::Server;

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        client: GlobalClient,
        properties: Arc<PlayerProperties>,
        changes: Arc<Mutex<Vec<(PlayerId, String, Option<String>)>>>,
    }

    impl Fixture {
        fn new() -> Self {
            let client = GlobalClient::new(
                ClientConfig::new("127.0.0.1", 1, "lobby", "pw"),
                Vec::<LocalPlayer>::new,
            )
            .unwrap();
            let properties = PlayerProperties::install(&client);
            let changes = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&changes);
            client.add_listener(Arc::new(move |_: &GlobalClient, event: &ClusterEvent| {
                if let ClusterEvent::PlayerPropertyChanged {
                    player,
                    property,
                    value,
                    ..
                } = event
                {
                    sink.lock()
                        .unwrap()
                        .push((*player, property.clone(), value.clone()));
                }
            }));
            Self {
                client,
                properties,
                changes,
            }
        }

        fn online(&self, player: PlayerId) {
            self.client.player_connected(player, "someone");
            assert!(self.client.wait_idle(WAIT));
        }

        fn inbound(&self, message: &PropertyMessage) {
            self.inbound_raw(message.encode().unwrap());
        }

        fn inbound_raw(&self, payload: Vec<u8>) {
            self.properties.on_event(
                &self.client,
                &ClusterEvent::Data {
                    source: ServerId::new("survival"),
                    channel: CHANNEL.into(),
                    target_player: None,
                    payload,
                },
            );
        }

        fn change_count(&self) -> usize {
            self.changes.lock().unwrap().len()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.client.shutdown();
        }
    }

    fn p1() -> PlayerId {
        Uuid::from_u128(1)
    }

    #[test]
    fn local_set_and_delete() {
        let fx = Fixture::new();
        fx.online(p1());

        fx.properties
            .set_property_value(&p1(), "rank", Some("vip"))
            .unwrap();
        assert!(fx.properties.has_property(&p1(), "rank"));
        assert_eq!(
            fx.properties.get_property_value(&p1(), "rank").as_deref(),
            Some("vip")
        );
        assert_eq!(fx.client.buffered_len(), 1);

        fx.properties.set_property_value(&p1(), "rank", None).unwrap();
        assert!(!fx.properties.has_property(&p1(), "rank"));
        assert!(fx.properties.players_with_properties().is_empty());
        assert_eq!(
            *fx.changes.lock().unwrap(),
            vec![
                (p1(), "rank".to_owned(), Some("vip".to_owned())),
                (p1(), "rank".to_owned(), None),
            ]
        );
    }

    #[test]
    fn set_rejects_bad_arguments() {
        let fx = Fixture::new();
        assert!(matches!(
            fx.properties.set_property_value(&p1(), "rank", Some("vip")),
            Err(PropertyError::PlayerNotOnline(id)) if id == p1()
        ));
        fx.online(p1());
        assert!(matches!(
            fx.properties.set_property_value(&p1(), "", Some("x")),
            Err(PropertyError::EmptyName)
        ));
        let huge = "€".repeat(30_000);
        assert!(matches!(
            fx.properties.set_property_value(&p1(), "rank", Some(&huge)),
            Err(PropertyError::TooLong { field: "value", .. })
        ));
        assert!(fx.properties.get_all_properties(&p1()).is_empty());
        assert_eq!(fx.change_count(), 0);
    }

    #[test]
    fn set_after_shutdown_leaves_the_table_alone() {
        let fx = Fixture::new();
        fx.online(p1());
        fx.properties.set_property_value(&p1(), "rank", Some("vip")).unwrap();
        fx.client.shutdown();

        assert!(matches!(
            fx.properties.set_property_value(&p1(), "rank", Some("mod")),
            Err(PropertyError::Client(ClientError::Stopped))
        ));
        assert!(matches!(
            fx.properties.set_property_value(&p1(), "rank", None),
            Err(PropertyError::Client(ClientError::Stopped))
        ));
        assert_eq!(
            fx.properties.get_property_value(&p1(), "rank").as_deref(),
            Some("vip")
        );
        assert_eq!(fx.change_count(), 1);
    }

    #[test]
    fn snapshot_copy_does_not_follow_later_writes() {
        let fx = Fixture::new();
        fx.online(p1());
        fx.properties.set_property_value(&p1(), "a", Some("1")).unwrap();
        let copy = fx.properties.get_all_properties(&p1());
        fx.properties.set_property_value(&p1(), "b", Some("2")).unwrap();
        assert_eq!(copy.len(), 1);
        assert_eq!(fx.properties.get_all_properties(&p1()).len(), 2);
    }

    #[test]
    fn inbound_set_is_idempotent() {
        let fx = Fixture::new();
        let set = PropertyMessage::Set {
            player: p1(),
            property: "rank".into(),
            value: "vip".into(),
        };
        fx.inbound(&set);
        let once = fx.properties.get_all_properties(&p1());
        fx.inbound(&set);
        assert_eq!(fx.properties.get_all_properties(&p1()), once);
        assert_eq!(once.get("rank").map(String::as_str), Some("vip"));
    }

    #[test]
    fn inbound_delete_of_missing_property_is_a_quiet_no_op() {
        let fx = Fixture::new();
        fx.inbound(&PropertyMessage::Delete {
            player: p1(),
            property: "rank".into(),
        });
        assert_eq!(fx.change_count(), 0);

        fx.inbound(&PropertyMessage::Set {
            player: p1(),
            property: "a".into(),
            value: "1".into(),
        });
        fx.inbound(&PropertyMessage::Delete {
            player: p1(),
            property: "other".into(),
        });
        assert_eq!(fx.change_count(), 1);
        fx.inbound(&PropertyMessage::Delete {
            player: p1(),
            property: "a".into(),
        });
        assert_eq!(fx.change_count(), 2);
        assert!(fx.properties.players_with_properties().is_empty());
    }

    #[test]
    fn inbound_multiset_upserts_and_reports_each_property() {
        let fx = Fixture::new();
        fx.online(p1());
        fx.inbound(&PropertyMessage::MultiSet(vec![
            PropertyBlock {
                player: p1(),
                entries: vec![("a".into(), "1".into()), ("b".into(), "2".into())],
            },
            PropertyBlock {
                player: Uuid::from_u128(2),
                entries: vec![],
            },
        ]));
        assert_eq!(fx.properties.get_all_properties(&p1()).len(), 2);
        assert_eq!(fx.properties.players_with_properties(), vec![p1()]);
        assert_eq!(fx.change_count(), 2);
    }

    #[test]
    fn inbound_multiset_skips_players_that_are_not_visible() {
        let fx = Fixture::new();
        fx.inbound(&PropertyMessage::MultiSet(vec![PropertyBlock {
            player: Uuid::from_u128(9),
            entries: vec![("rank".into(), "vip".into())],
        }]));
        assert!(fx.properties.players_with_properties().is_empty());
        assert_eq!(fx.change_count(), 0);
    }

    #[test]
    fn snapshot_carries_only_players_hosted_here() {
        let fx = Fixture::new();
        fx.online(p1());
        fx.properties.set_property_value(&p1(), "rank", Some("vip")).unwrap();
        // Learned from another node for a player this node does not host.
        fx.inbound(&PropertyMessage::Set {
            player: Uuid::from_u128(2),
            property: "rank".into(),
            value: "mod".into(),
        });
        assert_eq!(fx.properties.players_with_properties().len(), 2);

        let PropertyMessage::MultiSet(blocks) = fx.properties.snapshot(&fx.client) else {
            panic!("snapshot is not a MULTISET");
        };
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].player, p1());
        assert_eq!(blocks[0].entries, vec![("rank".to_owned(), "vip".to_owned())]);
    }

    #[test]
    fn malformed_payload_changes_nothing() {
        let fx = Fixture::new();
        let mut bytes = PropertyMessage::MultiSet(vec![PropertyBlock {
            player: p1(),
            entries: vec![("a".into(), "1".into())],
        }])
        .encode()
        .unwrap();
        bytes.pop();
        bytes.pop();
        fx.inbound_raw(bytes);
        fx.inbound_raw(vec![42]);
        assert!(fx.properties.players_with_properties().is_empty());
        assert_eq!(fx.change_count(), 0);
    }

    #[test]
    fn other_channels_are_ignored() {
        let fx = Fixture::new();
        fx.properties.on_event(
            &fx.client,
            &ClusterEvent::Data {
                source: ServerId::new("survival"),
                channel: "Chat.global".into(),
                target_player: None,
                payload: vec![1],
            },
        );
        assert_eq!(fx.change_count(), 0);
    }

    #[test]
    fn leaving_the_network_purges_properties() {
        let fx = Fixture::new();
        fx.online(p1());
        fx.properties.set_property_value(&p1(), "rank", Some("vip")).unwrap();
        fx.client.player_disconnected(p1());
        assert!(fx.client.wait_idle(WAIT));
        assert!(fx.properties.get_all_properties(&p1()).is_empty());
    }

    #[test]
    fn server_connected_sends_a_snapshot() {
        let fx = Fixture::new();
        fx.inbound(&PropertyMessage::Set {
            player: p1(),
            property: "rank".into(),
            value: "vip".into(),
        });
        fx.properties.on_event(
            &fx.client,
            &ClusterEvent::ServerConnected {
                server: fx.client.this_server(),
            },
        );
        fx.properties.on_event(
            &fx.client,
            &ClusterEvent::ServerConnected {
                server: Server {
                    id: ServerId::new("creative"),
                    connected: true,
                    this_server: false,
                },
            },
        );
        // Disconnected client: both snapshots wait in the reliable outbox.
        assert_eq!(fx.client.buffered_len(), 2);
    }

    #[test]
    fn readers_never_see_half_a_block() {
        const KEYS: usize = 20;
        let fx = Fixture::new();
        fx.online(p1());
        let block = |generation: usize| {
            PropertyMessage::MultiSet(vec![PropertyBlock {
                player: p1(),
                entries: (0..KEYS)
                    .map(|k| (format!("k{k}"), format!("g{generation}")))
                    .collect(),
            }])
            .encode()
            .unwrap()
        };
        fx.inbound_raw(block(0));

        let done = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let properties = Arc::clone(&fx.properties);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    while !done.load(Ordering::SeqCst) {
                        let all = properties.get_all_properties(&p1());
                        assert_eq!(all.len(), KEYS);
                        let first = all.values().next().unwrap().clone();
                        assert!(all.values().all(|v| *v == first), "torn block: {all:?}");
                    }
                })
            })
            .collect();

        for generation in 1..200 {
            fx.inbound_raw(block(generation));
        }
        done.store(true, Ordering::SeqCst);
        for reader in readers {
            reader.join().unwrap();
        }
    }
}

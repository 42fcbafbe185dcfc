// global_connection — cluster-wide player presence and replicated player
// properties for proxy nodes sharing one relay hub.
//
// Each proxy process embeds one `GlobalClient`. The client holds a TCP link
// to the relay, learns which other nodes exist and which players each of them
// has, and derives a single view of "who is online where" that every node
// agrees on. Higher layers talk to other nodes through channel-addressed
// byte payloads; `PlayerProperties` is one such layer.
//
// Module overview:
// - `executor.rs`:      single-worker FIFO task queue; the one ordering
//                       domain for cluster state.
// - `client.rs`:        `GlobalClient`: session lifecycle, reconnects,
//                       local presence, relay message handling, data sends.
// - `link.rs`:          TCP connect, Hello/Welcome handshake, reader thread.
// - `presence.rs`:      server and player tables with the join/leave rules.
// - `model.rs`:         `Server` and `Player` snapshots handed to callers.
// - `events.rs`:        `ClusterEvent` and the `ClusterListener` trait.
// - `properties.rs`:    `PlayerProperties`, the replicated property table.
// - `property_wire.rs`: binary SET/DELETE/MULTISET format of the property
//                       channel.
// - `config.rs`:        TOML-loaded `ClientConfig`.
// - `backoff.rs`:       reconnect delay schedule.
// - `host.rs`:          `LocalPlayers`, what the embedding proxy provides.
// - `error.rs`:         error enums.
//
// Design decisions:
// - **Everything mutates on one thread.** Relay messages, host reports and
//   connection changes are all tasks on the executor, so presence changes
//   apply in the order they were produced and readers never see half of
//   one.
// - **Reads go around the queue.** Accessors take short read locks and
//   return owned snapshots, so host threads can query from anywhere.
// - **Transport trouble is internal.** Link failures are logged and retried;
//   only misuse of the API returns an error.

mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod host;
mod link;
pub mod model;
mod presence;
pub mod properties;
pub mod property_wire;

pub use client::{ConnectionState, Delivery, GlobalClient, SendOutcome, Target, TaskScope, WeakClient};
pub use config::ClientConfig;
pub use error::{ClientError, ConfigError, LinkError, PropertyError};
pub use events::{ClusterEvent, ClusterListener};
pub use global_connection_protocol::{PlayerId, ServerId};
pub use host::{LocalPlayer, LocalPlayers};
pub use model::{Player, Server};
pub use properties::{PlayerProperties, PlayerPropertiesApi};

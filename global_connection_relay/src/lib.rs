// global_connection_relay — a minimal relay hub for `global_connection`
// nodes.
//
// The relay is a thin broker. Each node logs in with an account name that
// becomes its `ServerId`, reports which players it hosts, and sends
// channel-addressed data. The relay keeps the roster, forwards presence to
// every other node, and routes data to the nodes a message targets. It keeps
// no player properties and runs no game logic.
//
// Module overview:
// - `session.rs`:  `Roster`, the login/presence/routing state that
//                  `server.rs` drives.
// - `server.rs`:   TCP listener, reader threads (one per node), and the
//                  main event loop. Uses `std::net` with a thread-per-reader
//                  architecture and an `mpsc` channel to funnel events into
//                  the single-threaded `Roster`.
//
// Dependencies: `global_connection_protocol` (shared message types and
// framing) and `tracing`. The cluster integration tests embed it through
// `start_relay`.

pub mod server;
pub mod session;

pub use server::{RelayConfig, RelayHandle, start_relay};
pub use session::{ConnectionId, Roster};

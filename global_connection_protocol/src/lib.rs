// global_connection_protocol — wire formats shared by cluster nodes and the
// relay hub.
//
// A cluster of proxy processes stays in sync by each holding one TCP link to a
// relay. This crate defines what travels over that link and the binary
// encoding used inside channel payloads. It has no threads and no state.
//
// Module overview:
// - `types.rs`:    `ServerId` (a node's relay account name) and `PlayerId`.
// - `message.rs`:  `NodeMessage` (node → relay) and `RelayMessage`
//                  (relay → node), plus roster structs `PlayerInfo` and
//                  `ServerInfo`.
// - `framing.rs`:  4-byte big-endian length prefix + JSON payload, with
//                  decode errors kept separate from transport errors.
// - `data_io.rs`:  `DataWriter`/`DataReader`, byte-compatible with Java's
//                  `DataOutputStream`/`DataInputStream`, for channel payloads
//                  that JVM-based nodes must also understand.
//
// Design decisions:
// - **JSON link messages.** The link format is private to this project, so
//   readability wins over compactness there.
// - **Java encodings for channel payloads.** Channel payloads are the
//   interoperable surface between nodes, and existing nodes write them with
//   JVM streams.

pub mod data_io;
pub mod framing;
pub mod message;
pub mod types;

pub use data_io::{DataError, DataReader, DataWriter};
pub use framing::{FrameError, MAX_FRAME_SIZE, read_frame, send_message, write_frame};
pub use message::{NodeMessage, PROTOCOL_VERSION, PlayerInfo, RelayMessage, ServerInfo};
pub use types::{PlayerId, ServerId};

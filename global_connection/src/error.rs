// Error types for the client crate.
//
// - `ClientError`:   API misuse and lifecycle failures returned to callers.
// - `LinkError`:     why a relay connection attempt failed. Never returned
//                    from the public API; the client logs it and retries.
// - `ConfigError`:   loading `ClientConfig` from TOML.
// - `PropertyError`: rejected `set_property_value` calls.

use std::io;
use std::path::PathBuf;

use global_connection_protocol::{DataError, FrameError, PlayerId};
use thiserror::Error;

use crate::property_wire::PropertyWireError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client has been shut down")]
    Stopped,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("payload encodes to a {len} byte frame (max {max})")]
    PayloadTooLarge { len: usize, max: u32 },
    #[error("could not encode message: {0}")]
    Encode(#[source] FrameError),
    #[error("failed to spawn client thread: {0}")]
    Spawn(#[source] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("could not resolve relay address {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("could not connect to relay: {0}")]
    Connect(#[source] io::Error),
    #[error("relay rejected login: {reason}")]
    Rejected { reason: String },
    #[error("handshake failed: {0}")]
    Frame(#[from] FrameError),
    #[error("unexpected handshake response: {0}")]
    UnexpectedResponse(String),
    #[error("failed to spawn link reader: {0}")]
    Spawn(#[source] io::Error),
}

impl LinkError {
    /// Credentials problems will not fix themselves, but the operator may
    /// fix the relay side, so they are retried like any other failure. This
    /// only decides the log level.
    pub(crate) fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Error)]
pub enum PropertyError {
    #[error("player {0} is not online on any server")]
    PlayerNotOnline(PlayerId),
    #[error("property name must not be empty")]
    EmptyName,
    #[error("property {field} is too long for the wire encoding")]
    TooLong {
        field: &'static str,
        #[source]
        source: DataError,
    },
    #[error("property layer is detached from its client")]
    Detached,
    #[error(transparent)]
    Encode(#[from] PropertyWireError),
    #[error(transparent)]
    Client(#[from] ClientError),
}

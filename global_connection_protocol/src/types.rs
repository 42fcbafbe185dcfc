// Identity types shared by the relay link and the channel protocols.
//
// A node (one proxy process) is identified by the account name it logs in
// with; the relay uses that same name when it tells other nodes where a
// message came from. Players are identified by their Minecraft UUID, which is
// stable across every node in the cluster.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Globally unique player id.
pub type PlayerId = uuid::Uuid;

/// Name of one node in the cluster (its relay account).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerId {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_id_serializes_as_bare_string() {
        let id = ServerId::new("lobby-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"lobby-1\"");
        assert_eq!(id.to_string(), "lobby-1");
    }
}

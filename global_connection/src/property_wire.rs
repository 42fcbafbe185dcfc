// Binary format of the player-properties channel.
//
// Every message starts with one unsigned kind byte. Player ids are two
// big-endian i64 halves (most significant first); strings use Java's
// `writeUTF` encoding (u16 length, modified UTF-8).
//
//     SET       (1): uuid, utf property, utf value
//     DELETE    (2): uuid, utf property
//     MULTISET  (3): { bool true, uuid, i32 count, count × (utf, utf) }*, bool false
//
// A MULTISET block with a count of zero or less carries no entries. Nodes
// on the JVM read and write this format, so it must not change.

use global_connection_protocol::{DataError, DataReader, DataWriter, PlayerId};
use thiserror::Error;

/// Channel the property layer sends and listens on.
pub const CHANNEL: &str = "GlobalClient.playerProperties";

const KIND_SET: u8 = 1;
const KIND_DELETE: u8 = 2;
const KIND_MULTISET: u8 = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropertyMessage {
    Set {
        player: PlayerId,
        property: String,
        value: String,
    },
    Delete {
        player: PlayerId,
        property: String,
    },
    /// Full snapshot, one block per player.
    MultiSet(Vec<PropertyBlock>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyBlock {
    pub player: PlayerId,
    pub entries: Vec<(String, String)>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PropertyWireError {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("unknown property message kind {0}")]
    UnknownKind(u8),
    #[error("too many properties for one player: {0}")]
    TooManyEntries(usize),
}

impl PropertyMessage {
    pub fn encode(&self) -> Result<Vec<u8>, PropertyWireError> {
        let mut out = DataWriter::new();
        match self {
            Self::Set {
                player,
                property,
                value,
            } => {
                out.write_u8(KIND_SET);
                out.write_uuid(player);
                out.write_utf(property)?;
                out.write_utf(value)?;
            }
            Self::Delete { player, property } => {
                out.write_u8(KIND_DELETE);
                out.write_uuid(player);
                out.write_utf(property)?;
            }
            Self::MultiSet(blocks) => {
                out.write_u8(KIND_MULTISET);
                for block in blocks {
                    let count = i32::try_from(block.entries.len())
                        .map_err(|_| PropertyWireError::TooManyEntries(block.entries.len()))?;
                    out.write_bool(true);
                    out.write_uuid(&block.player);
                    out.write_i32(count);
                    for (property, value) in &block.entries {
                        out.write_utf(property)?;
                        out.write_utf(value)?;
                    }
                }
                out.write_bool(false);
            }
        }
        Ok(out.into_bytes())
    }

    /// Decode a whole message. Nothing is returned unless every byte up to
    /// the end of the message parsed.
    pub fn decode(bytes: &[u8]) -> Result<Self, PropertyWireError> {
        let mut input = DataReader::new(bytes);
        match input.read_u8()? {
            KIND_SET => Ok(Self::Set {
                player: input.read_uuid()?,
                property: input.read_utf()?,
                value: input.read_utf()?,
            }),
            KIND_DELETE => Ok(Self::Delete {
                player: input.read_uuid()?,
                property: input.read_utf()?,
            }),
            KIND_MULTISET => {
                let mut blocks = Vec::new();
                while input.read_bool()? {
                    let player = input.read_uuid()?;
                    let count = input.read_i32()?;
                    let mut entries = Vec::new();
                    for _ in 0..count.max(0) {
                        let property = input.read_utf()?;
                        let value = input.read_utf()?;
                        entries.push((property, value));
                    }
                    blocks.push(PropertyBlock { player, entries });
                }
                Ok(Self::MultiSet(blocks))
            }
            other => Err(PropertyWireError::UnknownKind(other)),
        }
    }
}

// src/core/protocol/command.rs

//! Command opcodes, behavioral flags and the object key carried by every header.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Size of the opaque object identifier, in bytes.
pub const ID_SIZE: usize = 64;

/// Protocol version announced in the AUTH exchange. The first two components
/// are load-bearing: a mismatch there makes peers incompatible.
pub const PROTOCOL_VERSION: [u32; 4] = [2, 26, 0, 0];

bitflags! {
    /// Behavioral command flags, transferred verbatim on the wire.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CommandFlags: u64 {
        /// The frame is a response to a previously issued request.
        const REPLY = 1 << 0;
        /// More reply frames follow; the last frame of a transaction clears it.
        const MORE = 1 << 1;
        /// The transaction is being torn down. Terminal.
        const DESTROY = 1 << 2;
        /// The command belongs to the non-blocking service class.
        const NOLOCK = 1 << 3;
        /// Routing uses the header's backend id verbatim, bypassing key lookup.
        const DIRECT_BACKEND = 1 << 4;
        /// Enables per-trace observability for this command.
        const TRACE_BIT = 1 << 5;
    }
}

/// Command opcodes. The numbering is part of the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    Lookup = 1,
    Read = 2,
    Write = 3,
    Remove = 4,
    Auth = 5,
    Status = 6,
    ReverseLookup = 7,
    Join = 8,
    RouteList = 9,
    Iterator = 10,
    MonitorStat = 11,
    BackendControl = 12,
    BackendStatus = 13,
    BulkReadNew = 14,
    BulkRemoveNew = 15,
}

impl Opcode {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Opcode::Lookup,
            2 => Opcode::Read,
            3 => Opcode::Write,
            4 => Opcode::Remove,
            5 => Opcode::Auth,
            6 => Opcode::Status,
            7 => Opcode::ReverseLookup,
            8 => Opcode::Join,
            9 => Opcode::RouteList,
            10 => Opcode::Iterator,
            11 => Opcode::MonitorStat,
            12 => Opcode::BackendControl,
            13 => Opcode::BackendStatus,
            14 => Opcode::BulkReadNew,
            15 => Opcode::BulkRemoveNew,
            _ => return None,
        })
    }

    /// Commands that are served by the node core itself and never touch a
    /// storage backend. Keep in sync with the dispatcher's global routing.
    pub fn is_backendless(self) -> bool {
        matches!(
            self,
            Opcode::Auth
                | Opcode::Status
                | Opcode::ReverseLookup
                | Opcode::Join
                | Opcode::RouteList
                | Opcode::MonitorStat
                | Opcode::BackendControl
                | Opcode::BackendStatus
                | Opcode::BulkReadNew
                | Opcode::BulkRemoveNew
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Lookup => "LOOKUP",
            Opcode::Read => "READ",
            Opcode::Write => "WRITE",
            Opcode::Remove => "REMOVE",
            Opcode::Auth => "AUTH",
            Opcode::Status => "STATUS",
            Opcode::ReverseLookup => "REVERSE_LOOKUP",
            Opcode::Join => "JOIN",
            Opcode::RouteList => "ROUTE_LIST",
            Opcode::Iterator => "ITERATOR",
            Opcode::MonitorStat => "MONITOR_STAT",
            Opcode::BackendControl => "BACKEND_CONTROL",
            Opcode::BackendStatus => "BACKEND_STATUS",
            Opcode::BulkReadNew => "BULK_READ_NEW",
            Opcode::BulkRemoveNew => "BULK_REMOVE_NEW",
        }
    }
}

/// The object key: an opaque 64-byte identifier plus routing metadata.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    /// Opaque identifier bytes, usually a content hash.
    #[serde(with = "serde_id_bytes")]
    pub id: [u8; ID_SIZE],
    /// The replication group this key is addressed to.
    pub group_id: u32,
    /// Reserved for column addressing.
    pub kind: u32,
}

impl Key {
    pub fn new(id: [u8; ID_SIZE], group_id: u32) -> Self {
        Self {
            id,
            group_id,
            kind: 0,
        }
    }

    /// Builds a key whose identifier starts with the given prefix bytes.
    pub fn from_prefix(prefix: &[u8], group_id: u32) -> Self {
        let mut id = [0u8; ID_SIZE];
        let len = prefix.len().min(ID_SIZE);
        id[..len].copy_from_slice(&prefix[..len]);
        Self::new(id, group_id)
    }

    /// The leading eight identifier bytes as a big-endian integer, used by
    /// the route table for interval lookup.
    pub fn route_prefix(&self) -> u64 {
        u64::from_be_bytes(self.id[..8].try_into().expect("id has at least 8 bytes"))
    }

    /// Hex dump of the leading identifier bytes for log lines.
    pub fn short_hex(&self) -> String {
        self.id[..6].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl Default for Key {
    fn default() -> Self {
        Self {
            id: [0u8; ID_SIZE],
            group_id: 0,
            kind: 0,
        }
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key({}.../{})", self.short_hex(), self.group_id)
    }
}

mod serde_id_bytes {
    use super::ID_SIZE;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &[u8; ID_SIZE], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_bytes(id)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; ID_SIZE], D::Error> {
        let raw: Vec<u8> = Vec::deserialize(de)?;
        let mut id = [0u8; ID_SIZE];
        let len = raw.len().min(ID_SIZE);
        id[..len].copy_from_slice(&raw[..len]);
        Ok(id)
    }
}

//! Binary snapshot persistence.
//!
//! Layout: a 12-byte little-endian header (magic, format version, minimum
//! reader version) followed by a `bitcode` body. The body is a list of
//! tagged sections, each itself bitcode-encoded, so a reader skips tags it
//! does not know and defaults optional sections that are absent.
//!
//! A writer bumps the format version for additive changes and the minimum
//! reader version only when older readers would misread the data. Data
//! older than [`FORMAT_VERSION`] goes through a [`MigrationRegistry`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::clock::StateHash;
use crate::fixed::Ticks;
use crate::flow::Connection;
use crate::migration::MigrationRegistry;
use crate::planner::Planner;
use crate::snapshot::{TickSnapshot, WorldExtent};
use crate::spatial::ChunkCoord;
use crate::store::EntityStore;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// "COGW" read as a little-endian u32.
pub const SNAPSHOT_MAGIC: u32 = u32::from_le_bytes(*b"COGW");

/// Version written by this build.
pub const FORMAT_VERSION: u32 = 1;

/// Oldest reader that can decode what this build writes.
pub const MIN_READER_VERSION: u32 = 1;

pub const HEADER_LEN: usize = 12;

/// Section tags.
pub mod tag {
    pub const META: u16 = 1;
    pub const STORE: u16 = 2;
    pub const CONNECTIONS: u16 = 3;
    pub const PLANNER: u16 = 4;
    pub const EXTENSIONS: u16 = 5;
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("bitcode encoding failed: {0}")]
    Encode(String),
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DeserializeError {
    #[error("data too short for snapshot header")]
    TooShort,
    #[error("invalid magic number: expected 0x{:08X}, got 0x{:08X}", SNAPSHOT_MAGIC, .0)]
    InvalidMagic(u32),
    #[error("format version {0} predates {FORMAT_VERSION} and needs migration")]
    UnsupportedVersion(u32),
    #[error("snapshot needs reader version {0} (this build reads {FORMAT_VERSION})")]
    FutureVersion(u32),
    #[error("missing required section {0}")]
    MissingSection(u16),
    #[error("bitcode decoding failed: {0}")]
    Decode(String),
    #[error("snapshot is inconsistent: {0}")]
    Inconsistent(String),
    #[error("migration failed: {0}")]
    Migration(String),
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub magic: u32,
    pub version: u32,
    pub min_reader_version: u32,
}

impl SnapshotHeader {
    pub fn current() -> Self {
        Self {
            magic: SNAPSHOT_MAGIC,
            version: FORMAT_VERSION,
            min_reader_version: MIN_READER_VERSION,
        }
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..12].copy_from_slice(&self.min_reader_version.to_le_bytes());
        out
    }

    pub fn read(data: &[u8]) -> Result<Self, DeserializeError> {
        let word = |i: usize| -> Result<u32, DeserializeError> {
            data.get(i..i + 4)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_le_bytes)
                .ok_or(DeserializeError::TooShort)
        };
        Ok(Self {
            magic: word(0)?,
            version: word(4)?,
            min_reader_version: word(8)?,
        })
    }

    /// Magic and reader-version checks. Older format versions pass; they
    /// are routed to migration by the caller.
    pub fn validate(&self) -> Result<(), DeserializeError> {
        if self.magic != SNAPSHOT_MAGIC {
            return Err(DeserializeError::InvalidMagic(self.magic));
        }
        if self.min_reader_version > FORMAT_VERSION {
            return Err(DeserializeError::FutureVersion(self.min_reader_version));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub tag: u16,
    pub data: Vec<u8>,
}

impl Section {
    pub fn encode<T: Serialize>(tag: u16, value: &T) -> Result<Self, SerializeError> {
        let data = bitcode::serialize(value).map_err(|e| SerializeError::Encode(e.to_string()))?;
        Ok(Self { tag, data })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Meta {
    tick: Ticks,
    extent: WorldExtent,
    next_connection_id: u64,
    seeded_chunks: BTreeSet<ChunkCoord>,
}

/// The section list of `snapshot`, in tag order.
pub fn encode_sections(snapshot: &TickSnapshot) -> Result<Vec<Section>, SerializeError> {
    Ok(vec![
        Section::encode(
            tag::META,
            &Meta {
                tick: snapshot.tick,
                extent: snapshot.extent,
                next_connection_id: snapshot.next_connection_id,
                seeded_chunks: snapshot.seeded_chunks.clone(),
            },
        )?,
        Section::encode(tag::STORE, &snapshot.store)?,
        Section::encode(tag::CONNECTIONS, &snapshot.connections)?,
        Section::encode(tag::PLANNER, &snapshot.planner)?,
        Section::encode(tag::EXTENSIONS, &snapshot.extensions)?,
    ])
}

/// The canonical body bytes, without header.
pub fn encode_body(snapshot: &TickSnapshot) -> Result<Vec<u8>, SerializeError> {
    let sections = encode_sections(snapshot)?;
    bitcode::serialize(&sections).map_err(|e| SerializeError::Encode(e.to_string()))
}

/// FNV-1a over the canonical body.
pub fn state_hash(snapshot: &TickSnapshot) -> Result<StateHash, SerializeError> {
    Ok(StateHash::of(&encode_body(snapshot)?))
}

fn decode_section<T: DeserializeOwned>(section: &Section) -> Result<T, DeserializeError> {
    bitcode::deserialize(&section.data).map_err(|e| {
        DeserializeError::Decode(format!("section {}: {e}", section.tag))
    })
}

fn decode_body(body: &[u8]) -> Result<TickSnapshot, DeserializeError> {
    let sections: Vec<Section> =
        bitcode::deserialize(body).map_err(|e| DeserializeError::Decode(e.to_string()))?;
    let mut by_tag: BTreeMap<u16, &Section> = BTreeMap::new();
    for section in &sections {
        if by_tag.insert(section.tag, section).is_some() {
            return Err(DeserializeError::Inconsistent(format!(
                "section {} appears twice",
                section.tag
            )));
        }
    }
    for unknown in by_tag.keys().filter(|t| !(tag::META..=tag::EXTENSIONS).contains(*t)) {
        tracing::debug!(tag = unknown, "skipping unknown snapshot section");
    }

    fn required<'a>(
        by_tag: &BTreeMap<u16, &'a Section>,
        t: u16,
    ) -> Result<&'a Section, DeserializeError> {
        by_tag.get(&t).copied().ok_or(DeserializeError::MissingSection(t))
    }
    fn optional<T: DeserializeOwned + Default>(
        by_tag: &BTreeMap<u16, &Section>,
        t: u16,
    ) -> Result<T, DeserializeError> {
        by_tag
            .get(&t)
            .map_or(Ok(T::default()), |s| decode_section(s))
    }

    let meta: Meta = decode_section(required(&by_tag, tag::META)?)?;
    let store: EntityStore = decode_section(required(&by_tag, tag::STORE)?)?;
    let connections: Vec<Connection> = optional(&by_tag, tag::CONNECTIONS)?;
    let planner: Planner = optional(&by_tag, tag::PLANNER)?;
    let extensions: BTreeMap<String, Vec<u8>> = optional(&by_tag, tag::EXTENSIONS)?;

    let mut snapshot = TickSnapshot {
        tick: meta.tick,
        extent: meta.extent,
        store,
        next_connection_id: meta.next_connection_id,
        connections,
        planner,
        seeded_chunks: meta.seeded_chunks,
        extensions,
        blocked: HashSet::new(),
        units: HashMap::new(),
    };
    snapshot.rebuild_derived();
    Ok(snapshot)
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn serialize(snapshot: &TickSnapshot) -> Result<Vec<u8>, SerializeError> {
    let body = encode_body(snapshot)?;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&SnapshotHeader::current().to_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode data written at the current format version or a newer one that
/// this build can still read.
pub fn deserialize(data: &[u8]) -> Result<TickSnapshot, DeserializeError> {
    let header = SnapshotHeader::read(data)?;
    header.validate()?;
    if header.version < FORMAT_VERSION {
        return Err(DeserializeError::UnsupportedVersion(header.version));
    }
    let snapshot = decode_body(&data[HEADER_LEN..])?;
    // Connections must still satisfy the port invariant.
    snapshot
        .restore()
        .map_err(|e| DeserializeError::Inconsistent(e.to_string()))?;
    Ok(snapshot)
}

/// Like [`deserialize`], but bodies from older versions are first passed
/// through `migrations`.
pub fn deserialize_with_migrations(
    data: &[u8],
    migrations: &MigrationRegistry,
) -> Result<TickSnapshot, DeserializeError> {
    let header = SnapshotHeader::read(data)?;
    header.validate()?;
    if header.version >= FORMAT_VERSION {
        return deserialize(data);
    }
    let body = migrations
        .migrate(&data[HEADER_LEN..], header.version, FORMAT_VERSION)
        .map_err(|e| DeserializeError::Migration(e.to_string()))?;
    let mut upgraded = Vec::with_capacity(HEADER_LEN + body.len());
    upgraded.extend_from_slice(&SnapshotHeader::current().to_bytes());
    upgraded.extend_from_slice(&body);
    deserialize(&upgraded)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Write to a sibling temp file, then rename over `path`. A failure leaves
/// any existing file at `path` untouched.
pub fn save_to_path(snapshot: &TickSnapshot, path: &Path) -> Result<(), SerializeError> {
    let bytes = serialize(snapshot)?;
    let tmp = temp_path(path);
    let written = (|| -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();
    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    tracing::info!(path = %path.display(), tick = snapshot.tick, bytes = bytes.len(), "snapshot saved");
    Ok(())
}

pub fn load_from_path(path: &Path) -> Result<TickSnapshot, DeserializeError> {
    let data = std::fs::read(path)?;
    deserialize(&data)
}

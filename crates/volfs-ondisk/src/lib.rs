#![forbid(unsafe_code)]
//! On-disk structures for volfs.
//!
//! The volume header (cluster 0) and the fixed-size directory entry, with
//! explicit little-endian codecs. Layout, left to right with no gaps:
//! `[header = 1][bitmap][FAT][root dir = 1][data …]`.

use serde::Serialize;
use volfs_types::{
    CLUSTER_SIZE, CLUSTER_SIZE_BYTES, ENTRY_DELETED, ENTRY_NEVER_USED, FAT_FREE, MAX_NAME_BYTES,
    MIN_TOTAL_CLUSTERS, ParseError, ROOT_DIR_CLUSTER_COUNT, VOLUME_SIGNATURE, ensure_slice,
    read_fixed, read_le_u32, read_le_u64, trim_nul_padded, write_le_u32, write_le_u64,
};

// ── Header ──────────────────────────────────────────────────────────────────

/// Byte offsets of the header fields within cluster 0.
const SIGNATURE_OFFSET: usize = 0;
const VOLUME_SIZE_OFFSET: usize = 16;
const CLUSTER_SIZE_OFFSET: usize = 24;
const TOTAL_CLUSTERS_OFFSET: usize = 28;
const HEADER_CLUSTERS_OFFSET: usize = 32;
const BITMAP_START_OFFSET: usize = 36;
const BITMAP_SIZE_OFFSET: usize = 40;
const FAT_START_OFFSET: usize = 44;
const FAT_SIZE_OFFSET: usize = 48;
const ROOT_DIR_START_OFFSET: usize = 52;
const ROOT_DIR_SIZE_OFFSET: usize = 56;
const DATA_START_OFFSET: usize = 60;

/// Encoded header size; the remainder of cluster 0 is zero.
pub const HEADER_ENCODED_SIZE: usize = 64;

/// The volume superblock, stored in cluster 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Header {
    pub volume_size_bytes: u64,
    pub cluster_size_bytes: u32,
    pub total_clusters: u32,
    pub header_cluster_count: u32,
    pub bitmap_start_cluster: u32,
    pub bitmap_size_clusters: u32,
    pub fat_start_cluster: u32,
    pub fat_size_clusters: u32,
    pub root_dir_start_cluster: u32,
    pub root_dir_size_clusters: u32,
    pub data_start_cluster: u32,
}

impl Header {
    /// Compute the format-time geometry for a volume of `volume_size_bytes`.
    ///
    /// The metadata regions are packed left to right; formatting fails when
    /// the volume is too small to leave at least one data cluster.
    pub fn compute(volume_size_bytes: u64) -> Result<Self, ParseError> {
        if volume_size_bytes == 0 {
            return Err(ParseError::InvalidField {
                field: "volume_size_bytes",
                reason: "must be non-zero",
            });
        }

        let total_clusters = u32::try_from(volume_size_bytes / u64::from(CLUSTER_SIZE_BYTES))
            .map_err(|_| ParseError::InvalidField {
                field: "total_clusters",
                reason: "volume too large",
            })?;
        if total_clusters < MIN_TOTAL_CLUSTERS {
            return Err(ParseError::InvalidField {
                field: "total_clusters",
                reason: "volume smaller than the 10-cluster minimum",
            });
        }

        let header_cluster_count = 1_u32;

        let bitmap_start_cluster = header_cluster_count;
        let bitmap_size_bytes = total_clusters.div_ceil(8);
        let bitmap_size_clusters = bitmap_size_bytes.div_ceil(CLUSTER_SIZE_BYTES);

        let fat_start_cluster = bitmap_start_cluster + bitmap_size_clusters;
        let fat_size_bytes = u64::from(total_clusters) * 4;
        let fat_size_clusters = u32::try_from(fat_size_bytes.div_ceil(u64::from(
            CLUSTER_SIZE_BYTES,
        )))
        .map_err(|_| ParseError::InvalidField {
            field: "fat_size_clusters",
            reason: "FAT region too large",
        })?;

        let root_dir_start_cluster = fat_start_cluster + fat_size_clusters;
        let root_dir_size_clusters = ROOT_DIR_CLUSTER_COUNT;

        let data_start_cluster = root_dir_start_cluster + root_dir_size_clusters;
        if data_start_cluster >= total_clusters {
            return Err(ParseError::InvalidField {
                field: "data_start_cluster",
                reason: "metadata leaves no room for data clusters",
            });
        }

        Ok(Self {
            volume_size_bytes,
            cluster_size_bytes: CLUSTER_SIZE_BYTES,
            total_clusters,
            header_cluster_count,
            bitmap_start_cluster,
            bitmap_size_clusters,
            fat_start_cluster,
            fat_size_clusters,
            root_dir_start_cluster,
            root_dir_size_clusters,
            data_start_cluster,
        })
    }

    /// Decode and validate a header from the raw contents of cluster 0.
    pub fn parse(cluster: &[u8]) -> Result<Self, ParseError> {
        let signature = read_fixed::<16>(cluster, SIGNATURE_OFFSET)?;
        if signature != *VOLUME_SIGNATURE {
            return Err(ParseError::InvalidSignature);
        }

        let header = Self {
            volume_size_bytes: read_le_u64(cluster, VOLUME_SIZE_OFFSET)?,
            cluster_size_bytes: read_le_u32(cluster, CLUSTER_SIZE_OFFSET)?,
            total_clusters: read_le_u32(cluster, TOTAL_CLUSTERS_OFFSET)?,
            header_cluster_count: read_le_u32(cluster, HEADER_CLUSTERS_OFFSET)?,
            bitmap_start_cluster: read_le_u32(cluster, BITMAP_START_OFFSET)?,
            bitmap_size_clusters: read_le_u32(cluster, BITMAP_SIZE_OFFSET)?,
            fat_start_cluster: read_le_u32(cluster, FAT_START_OFFSET)?,
            fat_size_clusters: read_le_u32(cluster, FAT_SIZE_OFFSET)?,
            root_dir_start_cluster: read_le_u32(cluster, ROOT_DIR_START_OFFSET)?,
            root_dir_size_clusters: read_le_u32(cluster, ROOT_DIR_SIZE_OFFSET)?,
            data_start_cluster: read_le_u32(cluster, DATA_START_OFFSET)?,
        };

        if header.cluster_size_bytes != CLUSTER_SIZE_BYTES {
            return Err(ParseError::InvalidField {
                field: "cluster_size_bytes",
                reason: "unsupported cluster size",
            });
        }
        if header.data_start_cluster >= header.total_clusters {
            return Err(ParseError::InvalidField {
                field: "data_start_cluster",
                reason: "data region starts beyond the volume",
            });
        }

        Ok(header)
    }

    /// Encode this header into a cluster-sized buffer.
    pub fn encode_into(&self, cluster: &mut [u8]) -> Result<(), ParseError> {
        if cluster.len() < CLUSTER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: CLUSTER_SIZE,
                offset: 0,
                actual: cluster.len(),
            });
        }
        cluster[..CLUSTER_SIZE].fill(0);
        cluster[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 16].copy_from_slice(VOLUME_SIGNATURE);
        write_le_u64(cluster, VOLUME_SIZE_OFFSET, self.volume_size_bytes);
        write_le_u32(cluster, CLUSTER_SIZE_OFFSET, self.cluster_size_bytes);
        write_le_u32(cluster, TOTAL_CLUSTERS_OFFSET, self.total_clusters);
        write_le_u32(cluster, HEADER_CLUSTERS_OFFSET, self.header_cluster_count);
        write_le_u32(cluster, BITMAP_START_OFFSET, self.bitmap_start_cluster);
        write_le_u32(cluster, BITMAP_SIZE_OFFSET, self.bitmap_size_clusters);
        write_le_u32(cluster, FAT_START_OFFSET, self.fat_start_cluster);
        write_le_u32(cluster, FAT_SIZE_OFFSET, self.fat_size_clusters);
        write_le_u32(cluster, ROOT_DIR_START_OFFSET, self.root_dir_start_cluster);
        write_le_u32(cluster, ROOT_DIR_SIZE_OFFSET, self.root_dir_size_clusters);
        write_le_u32(cluster, DATA_START_OFFSET, self.data_start_cluster);
        Ok(())
    }
}

// ── Directory entries ───────────────────────────────────────────────────────

/// On-disk directory entry layout: `name[255]` at 0, `type` at 255,
/// `reserved[3]` at 256, `first_cluster` at 259, `file_size_bytes` at 263.
const ENTRY_KIND_OFFSET: usize = 255;
const ENTRY_FIRST_CLUSTER_OFFSET: usize = 259;
const ENTRY_SIZE_OFFSET: usize = 263;

/// Encoded size of one directory entry.
pub const DIR_ENTRY_SIZE: usize = 267;

/// Whole entries per directory cluster; the cluster tail is zero padding.
pub const DIR_ENTRIES_PER_CLUSTER: usize = CLUSTER_SIZE / DIR_ENTRY_SIZE;

/// What a directory entry names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::File => 0,
            Self::Directory => 1,
        }
    }

    pub fn from_byte(value: u8) -> Result<Self, ParseError> {
        match value {
            0 => Ok(Self::File),
            1 => Ok(Self::Directory),
            _ => Err(ParseError::InvalidField {
                field: "entry_kind",
                reason: "not a file or directory tag",
            }),
        }
    }
}

/// A live directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub first_cluster: u32,
    pub file_size_bytes: u32,
}

impl DirEntry {
    /// A fresh entry with no storage attached.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            name: name.into(),
            kind,
            first_cluster: FAT_FREE,
            file_size_bytes: 0,
        }
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Encode into one entry slot. The name must be 1..=254 bytes and must
    /// not start with a sentinel byte.
    pub fn encode_into(&self, slot: &mut [u8]) -> Result<(), ParseError> {
        if slot.len() < DIR_ENTRY_SIZE {
            return Err(ParseError::InsufficientData {
                needed: DIR_ENTRY_SIZE,
                offset: 0,
                actual: slot.len(),
            });
        }
        let name = self.name.as_bytes();
        if name.is_empty() {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: "empty",
            });
        }
        if name.len() >= MAX_NAME_BYTES {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: "longer than 254 bytes",
            });
        }
        if name[0] == ENTRY_NEVER_USED || name[0] == ENTRY_DELETED {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: "starts with a sentinel byte",
            });
        }

        slot[..DIR_ENTRY_SIZE].fill(0);
        slot[..name.len()].copy_from_slice(name);
        slot[ENTRY_KIND_OFFSET] = self.kind.as_byte();
        write_le_u32(slot, ENTRY_FIRST_CLUSTER_OFFSET, self.first_cluster);
        write_le_u32(slot, ENTRY_SIZE_OFFSET, self.file_size_bytes);
        Ok(())
    }
}

/// One decoded slot of a directory cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirSlot {
    /// Slot never held an entry (first name byte 0x00).
    NeverUsed,
    /// Slot held an entry that was deleted (first name byte 0xE5).
    Deleted,
    Live(DirEntry),
}

impl DirSlot {
    /// Whether `add_entry` may place a new entry here.
    #[must_use]
    pub fn is_reusable(&self) -> bool {
        matches!(self, Self::NeverUsed | Self::Deleted)
    }

    /// Decode one slot.
    pub fn parse(slot: &[u8]) -> Result<Self, ParseError> {
        let raw = ensure_slice(slot, 0, DIR_ENTRY_SIZE)?;
        match raw[0] {
            ENTRY_NEVER_USED => Ok(Self::NeverUsed),
            ENTRY_DELETED => Ok(Self::Deleted),
            _ => {
                let name = trim_nul_padded(&raw[..MAX_NAME_BYTES]);
                let kind = EntryKind::from_byte(raw[ENTRY_KIND_OFFSET])?;
                Ok(Self::Live(DirEntry {
                    name,
                    kind,
                    first_cluster: read_le_u32(raw, ENTRY_FIRST_CLUSTER_OFFSET)?,
                    file_size_bytes: read_le_u32(raw, ENTRY_SIZE_OFFSET)?,
                }))
            }
        }
    }
}

/// Overwrite a slot with the never-used pattern. Used when removing an
/// entry and when zero-initialising fresh directory clusters.
pub fn clear_slot(slot: &mut [u8]) {
    let len = slot.len().min(DIR_ENTRY_SIZE);
    slot[..len].fill(0);
}

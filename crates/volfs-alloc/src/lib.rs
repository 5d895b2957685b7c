#![forbid(unsafe_code)]
//! Cluster allocation.
//!
//! Two cooperating structures: `ClusterBitmap` tracks which clusters are in
//! use (one bit each, LSB-first within each byte), and `Fat` links the
//! clusters of a file or directory into chains. Both keep an in-memory
//! mirror of their on-disk region and persist the whole region after every
//! successful mutation, rolling the mirror back when the flush fails, so
//! that memory and disk always agree.

use tracing::{debug, trace, warn};
use volfs_block::Volume;
use volfs_error::{FsError, Result};
use volfs_types::{CLUSTER_SIZE, FAT_EOF, FAT_FREE, is_fat_sentinel};

// ── Bitmap bit operations ───────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut free = 0_u32;

    for &byte in bitmap.iter().take(full_bytes) {
        free += byte.count_zeros();
    }
    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        for bit in 0..remainder {
            if (byte >> bit) & 1 == 0 {
                free += 1;
            }
        }
    }
    free
}

// ── Cluster bitmap ──────────────────────────────────────────────────────────

/// Per-cluster allocation state, mirrored in memory and flushed whole.
#[derive(Debug)]
pub struct ClusterBitmap {
    data: Vec<u8>,
    total_clusters: u32,
    region_start_cluster: u32,
    region_size_clusters: u32,
    data_start_cluster: u32,
}

impl ClusterBitmap {
    /// Build the format-time bitmap: every metadata cluster (header, bitmap,
    /// FAT, root directory) marked allocated, everything else free. Flushed
    /// before returning.
    pub fn format(volume: &Volume) -> Result<Self> {
        let header = volume.header();
        let mut bitmap = Self {
            data: vec![0_u8; header.total_clusters.div_ceil(8) as usize],
            total_clusters: header.total_clusters,
            region_start_cluster: header.bitmap_start_cluster,
            region_size_clusters: header.bitmap_size_clusters,
            data_start_cluster: header.data_start_cluster,
        };

        let regions = [
            (0, header.header_cluster_count),
            (header.bitmap_start_cluster, header.bitmap_size_clusters),
            (header.fat_start_cluster, header.fat_size_clusters),
            (header.root_dir_start_cluster, header.root_dir_size_clusters),
        ];
        for (start, len) in regions {
            for cluster in start..start.saturating_add(len) {
                if cluster < bitmap.total_clusters {
                    bitmap_set(&mut bitmap.data, cluster);
                }
            }
        }

        bitmap.flush(volume)?;
        debug!(
            event = "bitmap_formatted",
            total_clusters = bitmap.total_clusters
        );
        Ok(bitmap)
    }

    /// Load the bitmap region from an already-formatted volume.
    pub fn load(volume: &Volume) -> Result<Self> {
        let header = volume.header();
        let size_bytes = header.total_clusters.div_ceil(8) as usize;
        let mut region = Vec::with_capacity(header.bitmap_size_clusters as usize * CLUSTER_SIZE);
        for i in 0..header.bitmap_size_clusters {
            region.extend_from_slice(&volume.read_cluster(header.bitmap_start_cluster + i)?);
        }
        if region.len() < size_bytes {
            return Err(FsError::Corruption {
                cluster: header.bitmap_start_cluster,
                detail: "bitmap region shorter than one bit per cluster".to_owned(),
            });
        }
        region.truncate(size_bytes);

        debug!(event = "bitmap_loaded", total_clusters = header.total_clusters);
        Ok(Self {
            data: region,
            total_clusters: header.total_clusters,
            region_start_cluster: header.bitmap_start_cluster,
            region_size_clusters: header.bitmap_size_clusters,
            data_start_cluster: header.data_start_cluster,
        })
    }

    /// Find the lowest free data cluster, mark it allocated, and flush.
    ///
    /// The scan starts at `data_start_cluster`; metadata clusters are never
    /// handed out. On flush failure the in-memory bit is cleared again.
    pub fn allocate(&mut self, volume: &Volume) -> Result<u32> {
        for cluster in self.data_start_cluster..self.total_clusters {
            if bitmap_get(&self.data, cluster) {
                continue;
            }
            bitmap_set(&mut self.data, cluster);
            if let Err(err) = self.flush(volume) {
                bitmap_clear(&mut self.data, cluster);
                return Err(err);
            }
            trace!(event = "cluster_allocated", cluster);
            return Ok(cluster);
        }
        warn!(event = "bitmap_exhausted", total_clusters = self.total_clusters);
        Err(FsError::NoSpace)
    }

    /// Mark `cluster` free and flush. Metadata clusters are protected;
    /// freeing an already-free cluster is a warning, not an error.
    pub fn free(&mut self, volume: &Volume, cluster: u32) -> Result<()> {
        if cluster >= self.total_clusters {
            return Err(FsError::OutOfBounds {
                cluster,
                total: self.total_clusters,
            });
        }
        if cluster < self.data_start_cluster {
            return Err(FsError::Format(format!(
                "refusing to free metadata cluster {cluster}"
            )));
        }
        if bitmap_get(&self.data, cluster) {
            bitmap_clear(&mut self.data, cluster);
            if let Err(err) = self.flush(volume) {
                bitmap_set(&mut self.data, cluster);
                return Err(err);
            }
            trace!(event = "cluster_freed", cluster);
        } else {
            warn!(event = "double_free", cluster);
        }
        Ok(())
    }

    /// Read-only bit query. Out-of-range clusters report as not free.
    #[must_use]
    pub fn is_free(&self, cluster: u32) -> bool {
        cluster < self.total_clusters && !bitmap_get(&self.data, cluster)
    }

    /// Number of free clusters on the volume.
    #[must_use]
    pub fn free_cluster_count(&self) -> u32 {
        bitmap_count_free(&self.data, self.total_clusters)
    }

    /// Write the whole bitmap region, zero-padded to the cluster boundary.
    fn flush(&self, volume: &Volume) -> Result<()> {
        let mut region = vec![0_u8; self.region_size_clusters as usize * CLUSTER_SIZE];
        region[..self.data.len()].copy_from_slice(&self.data);
        for (i, chunk) in region.chunks_exact(CLUSTER_SIZE).enumerate() {
            let cluster = self.region_start_cluster + u32::try_from(i).unwrap_or(u32::MAX);
            volume.write_cluster(cluster, chunk)?;
        }
        Ok(())
    }
}

// ── FAT ─────────────────────────────────────────────────────────────────────

/// The file allocation table: one `u32` per cluster mapping it to the next
/// cluster of its chain, `FAT_EOF` at chain ends, `FAT_FREE` elsewhere.
#[derive(Debug)]
pub struct Fat {
    entries: Vec<u32>,
    region_start_cluster: u32,
    region_size_clusters: u32,
}

impl Fat {
    /// Build the format-time table: all clusters free except the root
    /// directory cluster, which starts as a one-cluster chain. Flushed
    /// before returning.
    pub fn format(volume: &Volume) -> Result<Self> {
        let header = volume.header();
        let mut fat = Self {
            entries: vec![FAT_FREE; header.total_clusters as usize],
            region_start_cluster: header.fat_start_cluster,
            region_size_clusters: header.fat_size_clusters,
        };
        if header.root_dir_size_clusters > 0
            && header.root_dir_start_cluster < header.total_clusters
        {
            fat.entries[header.root_dir_start_cluster as usize] = FAT_EOF;
        }
        fat.flush(volume)?;
        debug!(event = "fat_formatted", total_clusters = header.total_clusters);
        Ok(fat)
    }

    /// Load the FAT region from an already-formatted volume.
    pub fn load(volume: &Volume) -> Result<Self> {
        let header = volume.header();
        let mut region = Vec::with_capacity(header.fat_size_clusters as usize * CLUSTER_SIZE);
        for i in 0..header.fat_size_clusters {
            region.extend_from_slice(&volume.read_cluster(header.fat_start_cluster + i)?);
        }
        let needed = header.total_clusters as usize * 4;
        if region.len() < needed {
            return Err(FsError::Corruption {
                cluster: header.fat_start_cluster,
                detail: "FAT region shorter than one entry per cluster".to_owned(),
            });
        }

        let entries = region[..needed]
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        debug!(event = "fat_loaded", total_clusters = header.total_clusters);
        Ok(Self {
            entries,
            region_start_cluster: header.fat_start_cluster,
            region_size_clusters: header.fat_size_clusters,
        })
    }

    fn total_clusters(&self) -> u32 {
        u32::try_from(self.entries.len()).unwrap_or(u32::MAX)
    }

    /// Bounds-checked entry read.
    pub fn get(&self, cluster: u32) -> Result<u32> {
        self.entries
            .get(cluster as usize)
            .copied()
            .ok_or(FsError::OutOfBounds {
                cluster,
                total: self.total_clusters(),
            })
    }

    /// Set `cluster`'s entry to `value` and persist the whole table. On
    /// persist failure the in-memory entry is rolled back.
    ///
    /// `value` is not validated beyond being a `u32`: callers pass a cluster
    /// index, `FAT_FREE`, or `FAT_EOF`.
    pub fn set(&mut self, volume: &Volume, cluster: u32, value: u32) -> Result<()> {
        let total = self.total_clusters();
        let Some(slot) = self.entries.get_mut(cluster as usize) else {
            return Err(FsError::OutOfBounds { cluster, total });
        };
        let previous = *slot;
        *slot = value;
        if let Err(err) = self.flush(volume) {
            self.entries[cluster as usize] = previous;
            return Err(err);
        }
        trace!(event = "fat_set", cluster, value);
        Ok(())
    }

    /// Walk the chain rooted at `start` in order.
    ///
    /// A sentinel or out-of-range start yields an empty chain. If the walk
    /// emits more clusters than the volume holds, the table is cyclic; the
    /// walk aborts and reports an empty chain so read paths degrade instead
    /// of spinning.
    #[must_use]
    pub fn chain(&self, start: u32) -> Vec<u32> {
        let total = self.total_clusters();
        if is_fat_sentinel(start) || start >= total {
            return Vec::new();
        }

        let mut chain = Vec::new();
        let mut current = start;
        while !is_fat_sentinel(current) && current < total {
            chain.push(current);
            if chain.len() > total as usize {
                warn!(event = "fat_cycle", start);
                return Vec::new();
            }
            current = self.entries[current as usize];
        }
        chain
    }

    /// Free every entry of the chain rooted at `start`.
    ///
    /// A sentinel start is a no-op. A cycle is corruption and nothing is
    /// freed. Individual entry writes are all attempted; the first failure
    /// is reported after the rest have been tried.
    pub fn free_chain(&mut self, volume: &Volume, start: u32) -> Result<()> {
        let total = self.total_clusters();
        if is_fat_sentinel(start) || start >= total {
            warn!(event = "free_chain_noop", start);
            return Ok(());
        }

        let mut clusters = Vec::new();
        let mut current = start;
        while !is_fat_sentinel(current) && current < total {
            clusters.push(current);
            if clusters.len() > total as usize {
                return Err(FsError::Corruption {
                    cluster: start,
                    detail: "cycle detected while freeing chain".to_owned(),
                });
            }
            current = self.entries[current as usize];
        }

        let mut first_failure = None;
        for cluster in clusters {
            if let Err(err) = self.set(volume, cluster, FAT_FREE) {
                warn!(event = "free_chain_entry_failed", cluster);
                first_failure.get_or_insert(err);
            }
        }
        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Link `new_cluster` onto the end of a chain: mark it `FAT_EOF`, then
    /// point `last_in_chain` at it. Passing a sentinel as `last_in_chain`
    /// means the chain has no predecessor (first cluster of a file). On
    /// link failure the new entry is rolled back to free.
    pub fn append_to_chain(
        &mut self,
        volume: &Volume,
        last_in_chain: u32,
        new_cluster: u32,
    ) -> Result<()> {
        let total = self.total_clusters();
        if is_fat_sentinel(new_cluster) || new_cluster >= total {
            return Err(FsError::OutOfBounds {
                cluster: new_cluster,
                total,
            });
        }
        if !is_fat_sentinel(last_in_chain) && last_in_chain >= total {
            return Err(FsError::OutOfBounds {
                cluster: last_in_chain,
                total,
            });
        }

        self.set(volume, new_cluster, FAT_EOF)?;
        if !is_fat_sentinel(last_in_chain) {
            if let Err(err) = self.set(volume, last_in_chain, new_cluster) {
                if let Err(undo) = self.set(volume, new_cluster, FAT_FREE) {
                    warn!(event = "append_rollback_failed", cluster = new_cluster, error = %undo);
                }
                return Err(err);
            }
        }
        trace!(event = "fat_appended", last_in_chain, new_cluster);
        Ok(())
    }

    /// Write the whole FAT region, zero-padded to the cluster boundary.
    fn flush(&self, volume: &Volume) -> Result<()> {
        let mut region = vec![0_u8; self.region_size_clusters as usize * CLUSTER_SIZE];
        for (entry, slot) in self.entries.iter().zip(region.chunks_exact_mut(4)) {
            slot.copy_from_slice(&entry.to_le_bytes());
        }
        for (i, chunk) in region.chunks_exact(CLUSTER_SIZE).enumerate() {
            let cluster = self.region_start_cluster + u32::try_from(i).unwrap_or(u32::MAX);
            volume.write_cluster(cluster, chunk)?;
        }
        Ok(())
    }
}

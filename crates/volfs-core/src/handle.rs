//! Open-file handles.
//!
//! A handle carries a snapshot of the file's directory entry (authoritative
//! for size growth while the handle is open), the byte position, and a
//! one-cluster buffer mediating all data transfer.

use volfs_block::Volume;
use volfs_error::{FsError, Result};
use volfs_ondisk::DirEntry;
use volfs_types::{CLUSTER_SIZE, FAT_EOF, FAT_FREE, is_fat_sentinel};

#[derive(Debug)]
pub(crate) struct FileHandle {
    pub id: u32,
    pub path: String,
    /// Directory-entry snapshot; flushed back on close when `modified`.
    pub entry: DirEntry,
    /// Absolute byte position of the next read/write.
    pub pos: u64,
    /// One-cluster staging buffer.
    pub buffer: Vec<u8>,
    /// Cluster currently held in `buffer`; `FAT_EOF` when the buffer is
    /// empty.
    pub buffered_cluster: u32,
    pub buffer_dirty: bool,
    /// Cluster of the chain containing `pos`; `FAT_FREE`/`FAT_EOF` when the
    /// position is not backed by a cluster yet.
    pub current_cluster: u32,
    /// Offset of `pos` within `current_cluster`.
    pub offset_in_cluster: usize,
    pub writable: bool,
    /// Size or first-cluster changed; the directory entry needs rewriting.
    pub modified: bool,
}

impl FileHandle {
    pub(crate) fn new(id: u32, path: String, entry: DirEntry, writable: bool) -> Self {
        Self {
            id,
            path,
            entry,
            pos: 0,
            buffer: vec![0_u8; CLUSTER_SIZE],
            buffered_cluster: FAT_EOF,
            buffer_dirty: false,
            current_cluster: FAT_FREE,
            offset_in_cluster: 0,
            writable,
            modified: false,
        }
    }

    /// Write the buffered cluster back if it is dirty.
    pub(crate) fn flush_buffer(&mut self, volume: &Volume) -> Result<()> {
        if self.buffer_dirty && !is_fat_sentinel(self.buffered_cluster) {
            volume.write_cluster(self.buffered_cluster, &self.buffer)?;
            self.buffer_dirty = false;
        }
        Ok(())
    }

    /// Make `buffer` hold `cluster`, flushing whatever it held before.
    pub(crate) fn load_cluster(&mut self, volume: &Volume, cluster: u32) -> Result<()> {
        if is_fat_sentinel(cluster) {
            return Err(FsError::Format(format!(
                "cannot buffer sentinel cluster {cluster:#x}"
            )));
        }
        if self.buffered_cluster == cluster {
            return Ok(());
        }
        self.flush_buffer(volume)?;
        volume.read_cluster_into(cluster, &mut self.buffer)?;
        self.buffered_cluster = cluster;
        self.buffer_dirty = false;
        Ok(())
    }

    /// Point the buffer at a freshly allocated cluster without reading the
    /// stale bytes it holds on disk. The zeroed buffer is marked dirty so
    /// the cluster's content is defined once it is flushed.
    pub(crate) fn attach_fresh_cluster(&mut self, volume: &Volume, cluster: u32) -> Result<()> {
        self.flush_buffer(volume)?;
        self.buffer.fill(0);
        self.buffered_cluster = cluster;
        self.buffer_dirty = true;
        Ok(())
    }

    /// Drop whatever the buffer holds (after flushing); used by seek.
    pub(crate) fn invalidate_buffer(&mut self, volume: &Volume) -> Result<()> {
        self.flush_buffer(volume)?;
        self.buffered_cluster = FAT_EOF;
        Ok(())
    }
}

#![forbid(unsafe_code)]
//! File-backed cluster device.
//!
//! A `Volume` owns the backing file for the lifetime of a mount and moves
//! whole clusters by index. Positional I/O (`pread`/`pwrite` semantics) is
//! used throughout; there is no shared seek cursor and no userspace write
//! buffer, so every cluster write reaches the file before the call returns.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};
use volfs_error::{FsError, Result};
use volfs_ondisk::Header;
use volfs_types::CLUSTER_SIZE;

/// An open volume: the backing file plus its validated header.
#[derive(Debug)]
pub struct Volume {
    file: File,
    path: PathBuf,
    header: Header,
}

impl Volume {
    /// Create `path` (truncating any previous contents), size it to
    /// `size_bytes`, and write a fresh header. The volume is left open.
    ///
    /// The file is extended by writing a single zero byte at
    /// `size_bytes - 1`; geometry validation happens in `Header::compute`
    /// before anything is written.
    pub fn create_and_format(path: impl AsRef<Path>, size_bytes: u64) -> Result<Self> {
        let path = path.as_ref();
        let header = Header::compute(size_bytes)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all_at(&[0_u8], size_bytes - 1)?;

        let volume = Self {
            file,
            path: path.to_path_buf(),
            header,
        };

        let mut cluster = vec![0_u8; CLUSTER_SIZE];
        header.encode_into(&mut cluster)?;
        volume.write_cluster(0, &cluster)?;

        info!(
            event = "volume_formatted",
            path = %volume.path.display(),
            size_bytes,
            total_clusters = header.total_clusters,
        );
        Ok(volume)
    }

    /// Open an existing volume read-write and validate its header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut cluster = vec![0_u8; CLUSTER_SIZE];
        file.read_exact_at(&mut cluster, 0).map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                FsError::Format("volume shorter than one cluster".to_owned())
            } else {
                FsError::Io(err)
            }
        })?;
        let header = Header::parse(&cluster)?;

        info!(
            event = "volume_opened",
            path = %path.display(),
            total_clusters = header.total_clusters,
        );
        Ok(Self {
            file,
            path: path.to_path_buf(),
            header,
        })
    }

    /// The header cached at format/open time.
    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cluster_offset(&self, cluster: u32) -> Result<u64> {
        if cluster >= self.header.total_clusters {
            return Err(FsError::OutOfBounds {
                cluster,
                total: self.header.total_clusters,
            });
        }
        Ok(u64::from(cluster) * u64::from(self.header.cluster_size_bytes))
    }

    /// Read cluster `cluster` into `buf`, which must be exactly one cluster.
    pub fn read_cluster_into(&self, cluster: u32, buf: &mut [u8]) -> Result<()> {
        if buf.len() != CLUSTER_SIZE {
            return Err(FsError::Format(format!(
                "read buffer is {} bytes, expected {CLUSTER_SIZE}",
                buf.len()
            )));
        }
        let offset = self.cluster_offset(cluster)?;
        self.file.read_exact_at(buf, offset)?;
        trace!(event = "cluster_read", cluster);
        Ok(())
    }

    /// Read cluster `cluster` into a fresh buffer.
    pub fn read_cluster(&self, cluster: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; CLUSTER_SIZE];
        self.read_cluster_into(cluster, &mut buf)?;
        Ok(buf)
    }

    /// Write `buf` (exactly one cluster) to cluster `cluster`.
    pub fn write_cluster(&self, cluster: u32, buf: &[u8]) -> Result<()> {
        if buf.len() != CLUSTER_SIZE {
            return Err(FsError::Format(format!(
                "write buffer is {} bytes, expected {CLUSTER_SIZE}",
                buf.len()
            )));
        }
        let offset = self.cluster_offset(cluster)?;
        self.file.write_all_at(buf, offset)?;
        trace!(event = "cluster_write", cluster);
        Ok(())
    }

    /// Flush file contents to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        debug!(event = "volume_synced", path = %self.path.display());
        Ok(())
    }
}

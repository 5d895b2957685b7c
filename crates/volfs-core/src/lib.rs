#![forbid(unsafe_code)]
//! Filesystem core.
//!
//! `FsCore` owns the four lower layers for the duration of a mount: the
//! volume, the cluster bitmap, the FAT, and the directory store. Every
//! operation runs to completion before the next begins; there is no
//! locking because nothing is concurrent.
//!
//! File names resolve flat: whatever the leading path components say, the
//! final component is looked up in the root directory. Directories can be
//! created, listed and removed, but do not nest resolution.

mod handle;
mod mode;

pub use mode::{OpenMode, Whence};

use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};
use volfs_alloc::{ClusterBitmap, Fat};
use volfs_block::Volume;
use volfs_dir as dir;
use volfs_error::{FsError, Result};
use volfs_ondisk::{DirEntry, EntryKind, Header};
use volfs_types::{CLUSTER_SIZE, FAT_EOF, FAT_FREE, MAX_NAME_BYTES, is_fat_sentinel};

use handle::FileHandle;

/// Final path component; resolution is flat so this is all that matters.
#[must_use]
pub fn filename_from_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Everything that exists only while a volume is mounted.
#[derive(Debug)]
struct Mounted {
    volume: Volume,
    header: Header,
    bitmap: ClusterBitmap,
    fat: Fat,
    handles: BTreeMap<u32, FileHandle>,
    /// Monotonic per mount; never reused, so handles stay unambiguous in
    /// logs.
    next_handle_id: u32,
}

/// The filesystem core: mount lifecycle, handle table, buffered file I/O,
/// and file/directory lifecycle.
#[derive(Debug, Default)]
pub struct FsCore {
    mounted: Option<Mounted>,
}

impl FsCore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.mounted.is_some()
    }

    fn state(&self) -> Result<&Mounted> {
        self.mounted.as_ref().ok_or(FsError::NotMounted)
    }

    fn state_mut(&mut self) -> Result<&mut Mounted> {
        self.mounted.as_mut().ok_or(FsError::NotMounted)
    }

    /// The mounted volume's header.
    pub fn header(&self) -> Result<Header> {
        Ok(self.state()?.header)
    }

    /// Number of free clusters on the mounted volume.
    pub fn free_cluster_count(&self) -> Result<u32> {
        Ok(self.state()?.bitmap.free_cluster_count())
    }

    // ── Mount / format lifecycle ────────────────────────────────────────

    /// Create and format a volume of `size_mb` MiB at `path`.
    ///
    /// The freshly formatted volume is closed again; `mount` is explicit.
    pub fn format(&mut self, path: impl AsRef<Path>, size_mb: u64) -> Result<()> {
        self.unmount()?;

        let size_bytes = size_mb
            .checked_mul(1024 * 1024)
            .ok_or_else(|| FsError::Format("volume size overflows".to_owned()))?;
        if size_bytes == 0 {
            return Err(FsError::Format("volume size cannot be zero".to_owned()));
        }

        let volume = Volume::create_and_format(path.as_ref(), size_bytes)?;
        ClusterBitmap::format(&volume)?;
        Fat::format(&volume)?;
        dir::init_root(&volume)?;
        volume.sync()?;

        info!(event = "formatted", path = %path.as_ref().display(), size_mb);
        Ok(())
    }

    /// Mount the volume at `path`, replacing any current mount.
    pub fn mount(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.unmount()?;

        let volume = Volume::open(path.as_ref())?;
        let bitmap = ClusterBitmap::load(&volume)?;
        let fat = Fat::load(&volume)?;
        let header = *volume.header();

        self.mounted = Some(Mounted {
            volume,
            header,
            bitmap,
            fat,
            handles: BTreeMap::new(),
            next_handle_id: 1,
        });
        info!(event = "mounted", path = %path.as_ref().display());
        Ok(())
    }

    /// Close every open handle, sync, and release the volume.
    ///
    /// Per-handle flush failures are logged and do not stop the unmount.
    pub fn unmount(&mut self) -> Result<()> {
        let Some(state) = self.mounted.as_ref() else {
            return Ok(());
        };
        let ids: Vec<u32> = state.handles.keys().copied().collect();
        for id in ids {
            if let Err(err) = self.close_file(id) {
                warn!(event = "unmount_close_failed", handle = id, error = %err);
            }
        }
        if let Some(state) = self.mounted.take() {
            state.volume.sync()?;
            info!(event = "unmounted", path = %state.volume.path().display());
        }
        Ok(())
    }

    // ── File operations ─────────────────────────────────────────────────

    /// Open (and possibly create or truncate) the file named by the final
    /// component of `path`, returning a handle id.
    pub fn open_file(&mut self, path: &str, mode: &str) -> Result<u32> {
        let state = self.state_mut()?;
        let mode = OpenMode::parse(mode)?;
        let Mounted {
            volume,
            header,
            bitmap,
            fat,
            handles,
            next_handle_id,
        } = state;
        let root = header.root_dir_start_cluster;

        let name = filename_from_path(path);
        if name.is_empty() {
            return Err(FsError::EmptyName);
        }
        if name.len() >= MAX_NAME_BYTES {
            return Err(FsError::NameTooLong);
        }

        let entry = match dir::find_entry(volume, fat, root, name)? {
            Some(mut entry) => {
                if entry.is_directory() {
                    return Err(FsError::IsDirectory(name.to_owned()));
                }
                if mode.truncate {
                    if !is_fat_sentinel(entry.first_cluster) {
                        let chain = fat.chain(entry.first_cluster);
                        fat.free_chain(volume, entry.first_cluster)?;
                        for cluster in chain {
                            bitmap.free(volume, cluster)?;
                        }
                    }
                    entry.first_cluster = FAT_FREE;
                    entry.file_size_bytes = 0;
                    dir::update_entry(volume, fat, root, name, &entry)?;
                }
                entry
            }
            None if mode.create_if_not_exists => {
                let entry = DirEntry::new(name, EntryKind::File);
                dir::add_entry(volume, fat, bitmap, root, &entry)?;
                entry
            }
            None => return Err(FsError::NotFound(name.to_owned())),
        };

        let id = *next_handle_id;
        *next_handle_id += 1;
        let initial_pos = if mode.append {
            i64::from(entry.file_size_bytes)
        } else {
            0
        };
        handles.insert(
            id,
            FileHandle::new(id, path.to_owned(), entry, mode.writable()),
        );

        if let Err(err) = self.seek(id, initial_pos, Whence::Set) {
            warn!(event = "open_initial_seek_failed", handle = id, error = %err);
            if let Some(state) = self.mounted.as_mut() {
                state.handles.remove(&id);
            }
            return Err(err);
        }
        debug!(event = "file_opened", handle = id, path);
        Ok(id)
    }

    /// Flush the handle's buffer, write back the directory entry if the
    /// file changed, and drop the handle. The handle is gone afterwards
    /// even when flushing failed; the first failure is still reported.
    pub fn close_file(&mut self, handle_id: u32) -> Result<()> {
        let state = self.state_mut()?;
        let Mounted {
            volume,
            header,
            fat,
            handles,
            ..
        } = state;
        let mut handle = handles
            .remove(&handle_id)
            .ok_or(FsError::BadHandle(handle_id))?;

        let mut outcome = Ok(());
        if let Err(err) = handle.flush_buffer(volume) {
            warn!(event = "close_flush_failed", handle = handle_id, error = %err);
            outcome = Err(err);
        }
        if handle.modified {
            let name = handle.entry.name.clone();
            if let Err(err) = dir::update_entry(
                volume,
                fat,
                header.root_dir_start_cluster,
                &name,
                &handle.entry,
            ) {
                warn!(event = "close_update_entry_failed", handle = handle_id, error = %err);
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        }
        debug!(event = "file_closed", handle = handle_id);
        outcome
    }

    /// Read up to `buf.len()` bytes at the current position. Returns the
    /// number of bytes read; 0 means end of file.
    ///
    /// When the FAT chain ends before `file_size_bytes` says it should,
    /// the read comes back short with a warning.
    pub fn read_file(&mut self, handle_id: u32, buf: &mut [u8]) -> Result<usize> {
        let state = self.state_mut()?;
        let Mounted {
            volume,
            fat,
            handles,
            ..
        } = state;
        let handle = handles
            .get_mut(&handle_id)
            .ok_or(FsError::BadHandle(handle_id))?;

        let file_size = u64::from(handle.entry.file_size_bytes);
        let remaining_in_file = file_size.saturating_sub(handle.pos);
        let effective = usize::try_from(remaining_in_file.min(buf.len() as u64))
            .unwrap_or(usize::MAX);
        if effective == 0 {
            return Ok(0);
        }

        let mut copied = 0_usize;
        while copied < effective {
            if is_fat_sentinel(handle.current_cluster) {
                warn!(
                    event = "short_read",
                    handle = handle_id,
                    requested = effective,
                    got = copied,
                    "chain ends before file_size_bytes"
                );
                break;
            }
            let current = handle.current_cluster;
            handle.load_cluster(volume, current)?;

            let chunk = (CLUSTER_SIZE - handle.offset_in_cluster).min(effective - copied);
            buf[copied..copied + chunk].copy_from_slice(
                &handle.buffer[handle.offset_in_cluster..handle.offset_in_cluster + chunk],
            );
            handle.pos += chunk as u64;
            handle.offset_in_cluster += chunk;
            copied += chunk;

            if handle.offset_in_cluster == CLUSTER_SIZE {
                handle.offset_in_cluster = 0;
                handle.current_cluster = fat.get(current)?;
            }
        }
        Ok(copied)
    }

    /// Write `buf` at the current position, allocating and linking clusters
    /// as the file grows. Returns the number of bytes written.
    pub fn write_file(&mut self, handle_id: u32, buf: &[u8]) -> Result<usize> {
        let state = self.state_mut()?;
        let Mounted {
            volume,
            bitmap,
            fat,
            handles,
            ..
        } = state;
        let handle = handles
            .get_mut(&handle_id)
            .ok_or(FsError::BadHandle(handle_id))?;
        if !handle.writable {
            return Err(FsError::ReadOnly(handle_id));
        }

        let mut written = 0_usize;
        while written < buf.len() {
            if is_fat_sentinel(handle.current_cluster) {
                let new_cluster = allocate_and_link(volume, fat, bitmap, handle)?;
                handle.current_cluster = new_cluster;
                handle.attach_fresh_cluster(volume, new_cluster)?;
            } else {
                let current = handle.current_cluster;
                handle.load_cluster(volume, current)?;
            }

            let chunk = (CLUSTER_SIZE - handle.offset_in_cluster).min(buf.len() - written);
            handle.buffer[handle.offset_in_cluster..handle.offset_in_cluster + chunk]
                .copy_from_slice(&buf[written..written + chunk]);
            handle.buffer_dirty = true;
            handle.pos += chunk as u64;
            handle.offset_in_cluster += chunk;
            written += chunk;

            if handle.pos > u64::from(handle.entry.file_size_bytes) {
                handle.entry.file_size_bytes = u32::try_from(handle.pos)
                    .map_err(|_| FsError::Format("file larger than 4 GiB".to_owned()))?;
                handle.modified = true;
            }

            if handle.offset_in_cluster == CLUSTER_SIZE {
                handle.flush_buffer(volume)?;
                handle.offset_in_cluster = 0;
                let next = fat.get(handle.current_cluster)?;
                handle.current_cluster = if is_fat_sentinel(next) { FAT_EOF } else { next };
            }
        }
        Ok(written)
    }

    /// Move the position of `handle_id`. Negative absolute targets are
    /// rejected; read-only handles clamp to the file size with a warning.
    /// Returns the new position.
    pub fn seek(&mut self, handle_id: u32, offset: i64, whence: Whence) -> Result<u64> {
        let state = self.state_mut()?;
        let Mounted {
            volume,
            fat,
            handles,
            ..
        } = state;
        let handle = handles
            .get_mut(&handle_id)
            .ok_or(FsError::BadHandle(handle_id))?;

        let file_size = u64::from(handle.entry.file_size_bytes);
        let base: i128 = match whence {
            Whence::Set => 0,
            Whence::Cur => i128::try_from(handle.pos).unwrap_or(i128::MAX),
            Whence::End => i128::from(file_size),
        };
        let target = base + i128::from(offset);
        if target < 0 {
            return Err(FsError::NegativeSeek(offset));
        }
        let mut new_pos = u64::try_from(target)
            .map_err(|_| FsError::Format("seek target overflows".to_owned()))?;

        if !handle.writable && new_pos > file_size {
            warn!(
                event = "seek_clamped",
                handle = handle_id,
                requested = new_pos,
                file_size
            );
            new_pos = file_size;
        }

        handle.invalidate_buffer(volume)?;
        handle.pos = new_pos;

        if is_fat_sentinel(handle.entry.first_cluster) {
            handle.current_cluster = FAT_FREE;
            handle.offset_in_cluster = 0;
            return Ok(new_pos);
        }

        let mut current = handle.entry.first_cluster;
        let hops = new_pos / CLUSTER_SIZE as u64;
        for _ in 0..hops {
            let next = fat.get(current)?;
            if is_fat_sentinel(next) {
                // Chain ends before the target; a later write extends it.
                current = FAT_EOF;
                break;
            }
            current = next;
        }
        handle.current_cluster = current;
        handle.offset_in_cluster = usize::try_from(new_pos % CLUSTER_SIZE as u64)
            .unwrap_or(0);
        Ok(new_pos)
    }

    /// Delete the file named by `path`: free its FAT chain, release its
    /// clusters, and clear the directory slot, in that order.
    pub fn remove_file(&mut self, path: &str) -> Result<()> {
        let state = self.state_mut()?;
        let Mounted {
            volume,
            header,
            bitmap,
            fat,
            ..
        } = state;
        let root = header.root_dir_start_cluster;
        let name = filename_from_path(path);

        let entry = dir::find_entry(volume, fat, root, name)?
            .ok_or_else(|| FsError::NotFound(name.to_owned()))?;
        if entry.is_directory() {
            return Err(FsError::IsDirectory(name.to_owned()));
        }

        if !is_fat_sentinel(entry.first_cluster) {
            // Snapshot the chain while it can still be walked.
            let chain = fat.chain(entry.first_cluster);
            fat.free_chain(volume, entry.first_cluster)?;
            for cluster in chain {
                bitmap.free(volume, cluster)?;
            }
        }
        dir::remove_entry(volume, fat, root, name)?;
        debug!(event = "file_removed", name);
        Ok(())
    }

    /// Rename `old_path` to `new_path` in place. Open handles on the file
    /// follow the rename.
    pub fn rename_file(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        let state = self.state_mut()?;
        let Mounted {
            volume,
            header,
            fat,
            handles,
            ..
        } = state;
        let root = header.root_dir_start_cluster;
        let old_name = filename_from_path(old_path);
        let new_name = filename_from_path(new_path);

        if new_name.is_empty() {
            return Err(FsError::EmptyName);
        }
        if new_name.len() >= MAX_NAME_BYTES {
            return Err(FsError::NameTooLong);
        }

        let location = dir::entry_location(volume, fat, root, old_name)?
            .ok_or_else(|| FsError::NotFound(old_name.to_owned()))?;
        let mut updated = location.entry;
        updated.name = new_name.to_owned();
        dir::update_entry(volume, fat, root, old_name, &updated)?;

        for handle in handles.values_mut() {
            if handle.path == old_path {
                handle.path = new_path.to_owned();
                handle.entry.name = new_name.to_owned();
            }
        }
        debug!(event = "file_renamed", old = old_name, new = new_name);
        Ok(())
    }

    /// The directory entry for `path`'s final component, if any.
    pub fn stat(&self, path: &str) -> Result<DirEntry> {
        let state = self.state()?;
        let name = filename_from_path(path);
        dir::find_entry(
            &state.volume,
            &state.fat,
            state.header.root_dir_start_cluster,
            name,
        )?
        .ok_or_else(|| FsError::NotFound(name.to_owned()))
    }

    // ── Directory operations ────────────────────────────────────────────

    /// Create an empty sub-directory under the root.
    ///
    /// Side-effect order: bitmap reserve, FAT terminator, cluster zeroing,
    /// directory publish; failures unwind in reverse.
    pub fn create_directory(&mut self, path: &str) -> Result<()> {
        let state = self.state_mut()?;
        let Mounted {
            volume,
            header,
            bitmap,
            fat,
            ..
        } = state;
        let root = header.root_dir_start_cluster;
        let name = filename_from_path(path);
        if name.is_empty() {
            return Err(FsError::EmptyName);
        }
        if name.len() >= MAX_NAME_BYTES {
            return Err(FsError::NameTooLong);
        }
        if dir::find_entry(volume, fat, root, name)?.is_some() {
            return Err(FsError::Exists(name.to_owned()));
        }

        let cluster = bitmap.allocate(volume)?;

        if let Err(err) = fat.set(volume, cluster, FAT_EOF) {
            undo_free(volume, bitmap, cluster);
            return Err(err);
        }
        if let Err(err) = dir::write_empty_cluster(volume, cluster) {
            undo_unlink(volume, fat, cluster);
            undo_free(volume, bitmap, cluster);
            return Err(err);
        }

        let mut entry = DirEntry::new(name, EntryKind::Directory);
        entry.first_cluster = cluster;
        if let Err(err) = dir::add_entry(volume, fat, bitmap, root, &entry) {
            undo_unlink(volume, fat, cluster);
            undo_free(volume, bitmap, cluster);
            return Err(err);
        }
        debug!(event = "directory_created", name, cluster);
        Ok(())
    }

    /// Remove an empty sub-directory.
    pub fn remove_directory(&mut self, path: &str) -> Result<()> {
        let state = self.state_mut()?;
        let Mounted {
            volume,
            header,
            bitmap,
            fat,
            ..
        } = state;
        let root = header.root_dir_start_cluster;
        let name = filename_from_path(path);

        let entry = dir::find_entry(volume, fat, root, name)?
            .ok_or_else(|| FsError::NotFound(name.to_owned()))?;
        if !entry.is_directory() {
            return Err(FsError::NotDirectory(name.to_owned()));
        }

        if !is_fat_sentinel(entry.first_cluster) {
            if !dir::list_entries(volume, fat, entry.first_cluster)?.is_empty() {
                return Err(FsError::NotEmpty(name.to_owned()));
            }
            let chain = fat.chain(entry.first_cluster);
            fat.free_chain(volume, entry.first_cluster)?;
            for cluster in chain {
                bitmap.free(volume, cluster)?;
            }
        }
        dir::remove_entry(volume, fat, root, name)?;
        debug!(event = "directory_removed", name);
        Ok(())
    }

    /// List `/` (the root) or a named sub-directory.
    pub fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>> {
        let state = self.state()?;
        let root = state.header.root_dir_start_cluster;

        let name = filename_from_path(path);
        if path == "/" || name.is_empty() {
            return dir::list_entries(&state.volume, &state.fat, root);
        }

        let entry = dir::find_entry(&state.volume, &state.fat, root, name)?
            .ok_or_else(|| FsError::NotFound(name.to_owned()))?;
        if !entry.is_directory() {
            return Err(FsError::NotDirectory(name.to_owned()));
        }
        if is_fat_sentinel(entry.first_cluster) {
            return Ok(Vec::new());
        }
        dir::list_entries(&state.volume, &state.fat, entry.first_cluster)
    }
}

/// Reserve a cluster and link it to the end of the handle's chain. For a
/// file with no storage yet the new cluster becomes `first_cluster`; the
/// bitmap reservation is released again when linking fails.
fn allocate_and_link(
    volume: &Volume,
    fat: &mut Fat,
    bitmap: &mut ClusterBitmap,
    handle: &mut FileHandle,
) -> Result<u32> {
    if !handle.writable {
        return Err(FsError::ReadOnly(handle.id));
    }

    let new_cluster = bitmap.allocate(volume)?;

    if is_fat_sentinel(handle.entry.first_cluster) {
        if let Err(err) = fat.append_to_chain(volume, FAT_EOF, new_cluster) {
            undo_free(volume, bitmap, new_cluster);
            return Err(err);
        }
        handle.entry.first_cluster = new_cluster;
    } else {
        let mut last = handle.current_cluster;
        if is_fat_sentinel(last) {
            let chain = fat.chain(handle.entry.first_cluster);
            match chain.last() {
                Some(&tail) => last = tail,
                None => {
                    undo_free(volume, bitmap, new_cluster);
                    return Err(FsError::Corruption {
                        cluster: handle.entry.first_cluster,
                        detail: "file has a first cluster but its chain is empty".to_owned(),
                    });
                }
            }
        }
        if let Err(err) = fat.append_to_chain(volume, last, new_cluster) {
            undo_free(volume, bitmap, new_cluster);
            return Err(err);
        }
    }

    handle.modified = true;
    Ok(new_cluster)
}

/// Best-effort bitmap release during compensation; a failing undo is logged
/// and the outer error still wins.
fn undo_free(volume: &Volume, bitmap: &mut ClusterBitmap, cluster: u32) {
    if let Err(err) = bitmap.free(volume, cluster) {
        warn!(event = "undo_free_failed", cluster, error = %err);
    }
}

/// Best-effort FAT unlink during compensation.
fn undo_unlink(volume: &Volume, fat: &mut Fat, cluster: u32) {
    if let Err(err) = fat.set(volume, cluster, FAT_FREE) {
        warn!(event = "undo_unlink_failed", cluster, error = %err);
    }
}

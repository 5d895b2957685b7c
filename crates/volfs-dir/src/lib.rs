#![forbid(unsafe_code)]
//! Directory storage.
//!
//! A directory is a FAT chain of clusters, each holding
//! `DIR_ENTRIES_PER_CLUSTER` fixed-size entry slots. The operations here
//! take the volume and allocators they work through as explicit parameters;
//! nothing holds back-references.

use tracing::{debug, trace, warn};
use volfs_alloc::{ClusterBitmap, Fat};
use volfs_block::Volume;
use volfs_error::{FsError, Result};
use volfs_ondisk::{DIR_ENTRIES_PER_CLUSTER, DIR_ENTRY_SIZE, DirEntry, DirSlot, clear_slot};
use volfs_types::{CLUSTER_SIZE, FAT_EOF, FAT_FREE, MAX_NAME_BYTES, is_fat_sentinel};

/// Where a live entry sits: which cluster of the chain and which slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryLocation {
    pub cluster: u32,
    pub slot: usize,
    pub entry: DirEntry,
}

fn slot_range(slot: usize) -> std::ops::Range<usize> {
    let start = slot * DIR_ENTRY_SIZE;
    start..start + DIR_ENTRY_SIZE
}

fn check_dir_start(dir_start: u32) -> Result<()> {
    if is_fat_sentinel(dir_start) {
        return Err(FsError::Format(format!(
            "invalid directory start cluster {dir_start:#x}"
        )));
    }
    Ok(())
}

/// Overwrite `cluster` with a full set of never-used entry slots.
pub fn write_empty_cluster(volume: &Volume, cluster: u32) -> Result<()> {
    volume.write_cluster(cluster, &vec![0_u8; CLUSTER_SIZE])
}

/// Initialise the root directory cluster named by the header.
pub fn init_root(volume: &Volume) -> Result<()> {
    let root = volume.header().root_dir_start_cluster;
    write_empty_cluster(volume, root)?;
    debug!(event = "root_dir_initialized", cluster = root);
    Ok(())
}

/// All live entries of the directory rooted at `dir_start`, in chain order.
///
/// Never-used and deleted slots are skipped; a slot that fails to decode is
/// reported as corruption rather than silently dropped.
pub fn list_entries(volume: &Volume, fat: &Fat, dir_start: u32) -> Result<Vec<DirEntry>> {
    check_dir_start(dir_start)?;
    let mut entries = Vec::new();
    for cluster in fat.chain(dir_start) {
        let raw = volume.read_cluster(cluster)?;
        for slot in 0..DIR_ENTRIES_PER_CLUSTER {
            match DirSlot::parse(&raw[slot_range(slot)]) {
                Ok(DirSlot::Live(entry)) => entries.push(entry),
                Ok(_) => {}
                Err(err) => {
                    return Err(FsError::Corruption {
                        cluster,
                        detail: format!("directory slot {slot}: {err}"),
                    });
                }
            }
        }
    }
    Ok(entries)
}

/// Locate `name` in the directory rooted at `dir_start`.
///
/// Comparison is exact and case-sensitive; names of 255 bytes or more are
/// rejected up front.
pub fn entry_location(
    volume: &Volume,
    fat: &Fat,
    dir_start: u32,
    name: &str,
) -> Result<Option<EntryLocation>> {
    if name.len() >= MAX_NAME_BYTES {
        return Err(FsError::NameTooLong);
    }
    check_dir_start(dir_start)?;

    for cluster in fat.chain(dir_start) {
        let raw = volume.read_cluster(cluster)?;
        for slot in 0..DIR_ENTRIES_PER_CLUSTER {
            match DirSlot::parse(&raw[slot_range(slot)]) {
                Ok(DirSlot::Live(entry)) if entry.name == name => {
                    return Ok(Some(EntryLocation {
                        cluster,
                        slot,
                        entry,
                    }));
                }
                Ok(_) => {}
                Err(err) => {
                    return Err(FsError::Corruption {
                        cluster,
                        detail: format!("directory slot {slot}: {err}"),
                    });
                }
            }
        }
    }
    Ok(None)
}

/// Convenience over `entry_location` returning just the entry.
pub fn find_entry(
    volume: &Volume,
    fat: &Fat,
    dir_start: u32,
    name: &str,
) -> Result<Option<DirEntry>> {
    Ok(entry_location(volume, fat, dir_start, name)?.map(|loc| loc.entry))
}

/// Add `entry` to the directory rooted at `dir_start`.
///
/// The first reusable slot (never used or deleted) in chain order is taken;
/// when the chain has no free slot it is extended by exactly one cluster and
/// the entry becomes slot 0 of the new cluster.
pub fn add_entry(
    volume: &Volume,
    fat: &mut Fat,
    bitmap: &mut ClusterBitmap,
    dir_start: u32,
    entry: &DirEntry,
) -> Result<()> {
    if entry.name.is_empty() {
        return Err(FsError::EmptyName);
    }
    check_dir_start(dir_start)?;
    if find_entry(volume, fat, dir_start, &entry.name)?.is_some() {
        return Err(FsError::Exists(entry.name.clone()));
    }

    let chain = fat.chain(dir_start);
    let last_cluster = chain.last().copied().unwrap_or(dir_start);

    for cluster in chain {
        let mut raw = volume.read_cluster(cluster)?;
        for slot in 0..DIR_ENTRIES_PER_CLUSTER {
            let range = slot_range(slot);
            if DirSlot::parse(&raw[range.clone()])?.is_reusable() {
                entry.encode_into(&mut raw[range])?;
                volume.write_cluster(cluster, &raw)?;
                trace!(event = "dir_entry_added", name = %entry.name, cluster, slot);
                return Ok(());
            }
        }
    }

    // Every slot in the chain is live: grow by one cluster.
    let new_cluster = extend_directory(volume, fat, bitmap, last_cluster)?;
    let mut raw = volume.read_cluster(new_cluster)?;
    entry.encode_into(&mut raw[slot_range(0)])?;
    volume.write_cluster(new_cluster, &raw)?;
    trace!(event = "dir_entry_added", name = %entry.name, cluster = new_cluster, slot = 0_usize);
    Ok(())
}

/// Remove `name` from the directory, leaving a never-used slot behind.
pub fn remove_entry(volume: &Volume, fat: &Fat, dir_start: u32, name: &str) -> Result<()> {
    let location = entry_location(volume, fat, dir_start, name)?
        .ok_or_else(|| FsError::NotFound(name.to_owned()))?;

    let mut raw = volume.read_cluster(location.cluster)?;
    clear_slot(&mut raw[slot_range(location.slot)]);
    volume.write_cluster(location.cluster, &raw)?;
    trace!(event = "dir_entry_removed", name, cluster = location.cluster, slot = location.slot);
    Ok(())
}

/// Replace the entry named `old_name` with `updated` in place.
///
/// A rename (differing names) is rejected when the new name is already
/// taken elsewhere in the directory.
pub fn update_entry(
    volume: &Volume,
    fat: &Fat,
    dir_start: u32,
    old_name: &str,
    updated: &DirEntry,
) -> Result<()> {
    let location = entry_location(volume, fat, dir_start, old_name)?
        .ok_or_else(|| FsError::NotFound(old_name.to_owned()))?;

    if old_name != updated.name
        && find_entry(volume, fat, dir_start, &updated.name)?.is_some()
    {
        return Err(FsError::Exists(updated.name.clone()));
    }

    let mut raw = volume.read_cluster(location.cluster)?;
    updated.encode_into(&mut raw[slot_range(location.slot)])?;
    volume.write_cluster(location.cluster, &raw)?;
    trace!(event = "dir_entry_updated", old = old_name, new = %updated.name);
    Ok(())
}

/// Grow a directory chain by one zero-initialised cluster.
///
/// Side-effect order: bitmap reserve, FAT link, cluster zeroing. Each later
/// step failing unwinds the earlier ones in reverse; a failing undo is
/// logged and the original error still wins.
pub fn extend_directory(
    volume: &Volume,
    fat: &mut Fat,
    bitmap: &mut ClusterBitmap,
    last_cluster: u32,
) -> Result<u32> {
    let new_cluster = bitmap.allocate(volume)?;

    if let Err(err) = fat.append_to_chain(volume, last_cluster, new_cluster) {
        if let Err(undo) = bitmap.free(volume, new_cluster) {
            warn!(event = "extend_undo_failed", cluster = new_cluster, error = %undo);
        }
        return Err(err);
    }

    if let Err(err) = write_empty_cluster(volume, new_cluster) {
        if let Err(undo) = fat.set(volume, last_cluster, FAT_EOF) {
            warn!(event = "extend_undo_failed", cluster = last_cluster, error = %undo);
        }
        if let Err(undo) = fat.set(volume, new_cluster, FAT_FREE) {
            warn!(event = "extend_undo_failed", cluster = new_cluster, error = %undo);
        }
        if let Err(undo) = bitmap.free(volume, new_cluster) {
            warn!(event = "extend_undo_failed", cluster = new_cluster, error = %undo);
        }
        return Err(err);
    }

    debug!(event = "dir_extended", last_cluster, new_cluster);
    Ok(new_cluster)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use volfs_ondisk::EntryKind;

    const ONE_MIB: u64 = 1024 * 1024;

    struct Fixture {
        volume: Volume,
        fat: Fat,
        bitmap: ClusterBitmap,
        root: u32,
    }

    fn fixture(dir: &TempDir) -> Fixture {
        let volume = Volume::create_and_format(dir.path().join("v.img"), ONE_MIB).unwrap();
        let bitmap = ClusterBitmap::format(&volume).unwrap();
        let fat = Fat::format(&volume).unwrap();
        init_root(&volume).unwrap();
        let root = volume.header().root_dir_start_cluster;
        Fixture {
            volume,
            fat,
            bitmap,
            root,
        }
    }

    fn file_entry(name: &str) -> DirEntry {
        DirEntry::new(name, EntryKind::File)
    }

    #[test]
    fn fresh_root_lists_empty() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir);
        assert!(list_entries(&fx.volume, &fx.fat, fx.root).unwrap().is_empty());
    }

    #[test]
    fn add_then_find_then_remove() {
        let dir = TempDir::new().unwrap();
        let mut fx = fixture(&dir);

        add_entry(
            &fx.volume,
            &mut fx.fat,
            &mut fx.bitmap,
            fx.root,
            &file_entry("a.txt"),
        )
        .unwrap();
        let found = find_entry(&fx.volume, &fx.fat, fx.root, "a.txt")
            .unwrap()
            .unwrap();
        assert_eq!(found.name, "a.txt");
        assert_eq!(found.first_cluster, FAT_FREE);
        assert_eq!(found.file_size_bytes, 0);

        remove_entry(&fx.volume, &fx.fat, fx.root, "a.txt").unwrap();
        assert!(find_entry(&fx.volume, &fx.fat, fx.root, "a.txt")
            .unwrap()
            .is_none());
        assert!(list_entries(&fx.volume, &fx.fat, fx.root).unwrap().is_empty());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let mut fx = fixture(&dir);
        add_entry(
            &fx.volume,
            &mut fx.fat,
            &mut fx.bitmap,
            fx.root,
            &file_entry("dup"),
        )
        .unwrap();
        assert!(matches!(
            add_entry(
                &fx.volume,
                &mut fx.fat,
                &mut fx.bitmap,
                fx.root,
                &file_entry("dup"),
            ),
            Err(FsError::Exists(_))
        ));
    }

    #[test]
    fn empty_and_overlong_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let mut fx = fixture(&dir);
        assert!(matches!(
            add_entry(
                &fx.volume,
                &mut fx.fat,
                &mut fx.bitmap,
                fx.root,
                &file_entry(""),
            ),
            Err(FsError::EmptyName)
        ));
        let long = "x".repeat(255);
        assert!(matches!(
            find_entry(&fx.volume, &fx.fat, fx.root, &long),
            Err(FsError::NameTooLong)
        ));
    }

    #[test]
    fn names_are_case_sensitive_and_exact() {
        let dir = TempDir::new().unwrap();
        let mut fx = fixture(&dir);
        add_entry(
            &fx.volume,
            &mut fx.fat,
            &mut fx.bitmap,
            fx.root,
            &file_entry("File"),
        )
        .unwrap();
        assert!(find_entry(&fx.volume, &fx.fat, fx.root, "file")
            .unwrap()
            .is_none());
        assert!(find_entry(&fx.volume, &fx.fat, fx.root, "Fil")
            .unwrap()
            .is_none());
    }

    #[test]
    fn deleted_slots_are_reused() {
        let dir = TempDir::new().unwrap();
        let mut fx = fixture(&dir);
        add_entry(
            &fx.volume,
            &mut fx.fat,
            &mut fx.bitmap,
            fx.root,
            &file_entry("first"),
        )
        .unwrap();
        add_entry(
            &fx.volume,
            &mut fx.fat,
            &mut fx.bitmap,
            fx.root,
            &file_entry("second"),
        )
        .unwrap();
        remove_entry(&fx.volume, &fx.fat, fx.root, "first").unwrap();
        add_entry(
            &fx.volume,
            &mut fx.fat,
            &mut fx.bitmap,
            fx.root,
            &file_entry("third"),
        )
        .unwrap();

        // "third" landed in the slot "first" vacated: still one cluster.
        assert_eq!(fx.fat.chain(fx.root).len(), 1);
        let location = entry_location(&fx.volume, &fx.fat, fx.root, "third")
            .unwrap()
            .unwrap();
        assert_eq!(location.slot, 0);
    }

    #[test]
    fn full_cluster_extends_chain_by_one() {
        let dir = TempDir::new().unwrap();
        let mut fx = fixture(&dir);
        let free_before = fx.bitmap.free_cluster_count();

        for i in 0..DIR_ENTRIES_PER_CLUSTER {
            add_entry(
                &fx.volume,
                &mut fx.fat,
                &mut fx.bitmap,
                fx.root,
                &file_entry(&format!("file-{i:02}")),
            )
            .unwrap();
        }
        assert_eq!(fx.fat.chain(fx.root).len(), 1);

        add_entry(
            &fx.volume,
            &mut fx.fat,
            &mut fx.bitmap,
            fx.root,
            &file_entry("overflow"),
        )
        .unwrap();
        let chain = fx.fat.chain(fx.root);
        assert_eq!(chain.len(), 2);
        assert_eq!(fx.bitmap.free_cluster_count(), free_before - 1);

        let location = entry_location(&fx.volume, &fx.fat, fx.root, "overflow")
            .unwrap()
            .unwrap();
        assert_eq!(location.cluster, chain[1]);
        assert_eq!(location.slot, 0);
        assert_eq!(
            list_entries(&fx.volume, &fx.fat, fx.root).unwrap().len(),
            DIR_ENTRIES_PER_CLUSTER + 1
        );
    }

    #[test]
    fn update_entry_replaces_in_place() {
        let dir = TempDir::new().unwrap();
        let mut fx = fixture(&dir);
        add_entry(
            &fx.volume,
            &mut fx.fat,
            &mut fx.bitmap,
            fx.root,
            &file_entry("data"),
        )
        .unwrap();

        let mut updated = file_entry("data");
        updated.first_cluster = 17;
        updated.file_size_bytes = 9000;
        update_entry(&fx.volume, &fx.fat, fx.root, "data", &updated).unwrap();

        let found = find_entry(&fx.volume, &fx.fat, fx.root, "data")
            .unwrap()
            .unwrap();
        assert_eq!(found.first_cluster, 17);
        assert_eq!(found.file_size_bytes, 9000);
    }

    #[test]
    fn update_entry_rename_collision_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut fx = fixture(&dir);
        for name in ["a", "b"] {
            add_entry(
                &fx.volume,
                &mut fx.fat,
                &mut fx.bitmap,
                fx.root,
                &file_entry(name),
            )
            .unwrap();
        }
        let renamed = file_entry("b");
        assert!(matches!(
            update_entry(&fx.volume, &fx.fat, fx.root, "a", &renamed),
            Err(FsError::Exists(_))
        ));
        // Both originals untouched.
        assert!(find_entry(&fx.volume, &fx.fat, fx.root, "a").unwrap().is_some());
        assert!(find_entry(&fx.volume, &fx.fat, fx.root, "b").unwrap().is_some());
    }

    #[test]
    fn update_of_missing_entry_is_not_found() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(&dir);
        assert!(matches!(
            update_entry(&fx.volume, &fx.fat, fx.root, "ghost", &file_entry("ghost")),
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(
            remove_entry(&fx.volume, &fx.fat, fx.root, "ghost"),
            Err(FsError::NotFound(_))
        ));
    }
}

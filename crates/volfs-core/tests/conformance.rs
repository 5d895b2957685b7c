#![forbid(unsafe_code)]
//! End-to-end behaviour of the filesystem core against a real backing file.

use std::path::PathBuf;
use tempfile::TempDir;
use volfs_alloc::Fat;
use volfs_block::Volume;
use volfs_core::{FsCore, Whence};
use volfs_error::FsError;
use volfs_ondisk::EntryKind;

const CLUSTER: usize = 4096;

fn mounted_fs(size_mb: u64) -> (TempDir, PathBuf, FsCore) {
    let dir = TempDir::new().expect("tempdir");
    let image = dir.path().join("v.img");
    let mut fs = FsCore::new();
    fs.format(&image, size_mb).expect("format");
    fs.mount(&image).expect("mount");
    (dir, image, fs)
}

fn write_all(fs: &mut FsCore, handle: u32, data: &[u8]) {
    let written = fs.write_file(handle, data).expect("write");
    assert_eq!(written, data.len());
}

fn read_exact(fs: &mut FsCore, handle: u32, len: usize) -> Vec<u8> {
    let mut buf = vec![0_u8; len];
    let read = fs.read_file(handle, &mut buf).expect("read");
    buf.truncate(read);
    buf
}

#[test]
fn format_then_inspect() {
    let (_dir, _image, fs) = mounted_fs(1);
    let header = fs.header().unwrap();

    assert_eq!(header.cluster_size_bytes, 4096);
    assert_eq!(header.total_clusters, 256);
    assert_eq!(header.header_cluster_count, 1);
    assert_eq!(header.bitmap_start_cluster, 1);
    assert_eq!(
        header.fat_start_cluster,
        header.bitmap_start_cluster + header.bitmap_size_clusters
    );
    assert_eq!(
        header.root_dir_start_cluster,
        header.fat_start_cluster + header.fat_size_clusters
    );
    assert_eq!(header.root_dir_size_clusters, 1);
    assert_eq!(
        header.data_start_cluster,
        header.root_dir_start_cluster + 1
    );

    assert!(fs.list_directory("/").unwrap().is_empty());
}

#[test]
fn write_read_round_trip_survives_remount() {
    let (_dir, image, mut fs) = mounted_fs(1);

    let handle = fs.open_file("/a.txt", "w+").unwrap();
    write_all(&mut fs, handle, b"hello");
    fs.seek(handle, 0, Whence::Set).unwrap();
    assert_eq!(read_exact(&mut fs, handle, 5), b"hello");
    fs.close_file(handle).unwrap();

    fs.unmount().unwrap();
    fs.mount(&image).unwrap();

    let handle = fs.open_file("/a.txt", "r").unwrap();
    assert_eq!(read_exact(&mut fs, handle, 5), b"hello");
    // EOF afterwards.
    assert_eq!(fs.read_file(handle, &mut [0_u8; 8]).unwrap(), 0);
    fs.close_file(handle).unwrap();
}

#[test]
fn extend_across_clusters() {
    let (_dir, image, mut fs) = mounted_fs(1);
    let free_before = fs.free_cluster_count().unwrap();

    let handle = fs.open_file("/big", "w+").unwrap();
    write_all(&mut fs, handle, &vec![b'A'; CLUSTER]);
    write_all(&mut fs, handle, &[b'B'; 100]);
    fs.close_file(handle).unwrap();

    let entry = fs.stat("/big").unwrap();
    assert_eq!(entry.file_size_bytes, 4196);
    assert_eq!(fs.free_cluster_count().unwrap(), free_before - 2);

    let handle = fs.open_file("/big", "r").unwrap();
    let data = read_exact(&mut fs, handle, 4196);
    assert_eq!(data.len(), 4196);
    assert!(data[..CLUSTER].iter().all(|b| *b == b'A'));
    assert!(data[CLUSTER..].iter().all(|b| *b == b'B'));
    fs.close_file(handle).unwrap();

    // The on-disk chain is exactly two clusters long.
    let first_cluster = entry.first_cluster;
    fs.unmount().unwrap();
    let volume = Volume::open(&image).unwrap();
    let fat = Fat::load(&volume).unwrap();
    assert_eq!(fat.chain(first_cluster).len(), 2);
}

#[test]
fn delete_frees_storage() {
    let (_dir, _image, mut fs) = mounted_fs(1);

    let handle = fs.open_file("/big", "w+").unwrap();
    write_all(&mut fs, handle, &vec![0x42_u8; CLUSTER + 100]);
    fs.close_file(handle).unwrap();

    let free_after_write = fs.free_cluster_count().unwrap();
    fs.remove_file("/big").unwrap();

    assert!(matches!(fs.stat("/big"), Err(FsError::NotFound(_))));
    assert_eq!(fs.free_cluster_count().unwrap(), free_after_write + 2);
}

#[test]
fn rename_collision_leaves_both_files() {
    let (_dir, _image, mut fs) = mounted_fs(1);

    for path in ["/a", "/b"] {
        let handle = fs.open_file(path, "w").unwrap();
        fs.close_file(handle).unwrap();
    }
    assert!(matches!(
        fs.rename_file("/a", "/b"),
        Err(FsError::Exists(_))
    ));
    assert!(fs.stat("/a").is_ok());
    assert!(fs.stat("/b").is_ok());
}

#[test]
fn truncate_on_reopen_releases_clusters() {
    let (_dir, _image, mut fs) = mounted_fs(1);

    let handle = fs.open_file("/a.txt", "w+").unwrap();
    write_all(&mut fs, handle, &vec![b'x'; CLUSTER + 1]);
    fs.close_file(handle).unwrap();
    let free_full = fs.free_cluster_count().unwrap();

    // Reopening in `w` truncates to zero bytes and frees the old chain.
    let handle = fs.open_file("/a.txt", "w").unwrap();
    fs.close_file(handle).unwrap();

    let entry = fs.stat("/a.txt").unwrap();
    assert_eq!(entry.file_size_bytes, 0);
    assert_eq!(fs.free_cluster_count().unwrap(), free_full + 2);

    let handle = fs.open_file("/a.txt", "r").unwrap();
    assert_eq!(fs.read_file(handle, &mut [0_u8; 16]).unwrap(), 0);
    fs.close_file(handle).unwrap();

    // `w+` truncates as well.
    let handle = fs.open_file("/a.txt", "w+").unwrap();
    write_all(&mut fs, handle, b"again");
    fs.close_file(handle).unwrap();
    let handle = fs.open_file("/a.txt", "w+").unwrap();
    assert_eq!(fs.stat("/a.txt").unwrap().file_size_bytes, 0);
    fs.close_file(handle).unwrap();
}

#[test]
fn append_mode_starts_at_file_end() {
    let (_dir, _image, mut fs) = mounted_fs(1);

    let handle = fs.open_file("/log", "w+").unwrap();
    write_all(&mut fs, handle, b"one");
    fs.close_file(handle).unwrap();

    let handle = fs.open_file("/log", "a+").unwrap();
    assert_eq!(fs.seek(handle, 0, Whence::Cur).unwrap(), 3);
    write_all(&mut fs, handle, b"two");
    fs.seek(handle, 0, Whence::Set).unwrap();
    assert_eq!(read_exact(&mut fs, handle, 6), b"onetwo");
    fs.close_file(handle).unwrap();

    // Plain `a` appends as well.
    let handle = fs.open_file("/log", "a").unwrap();
    write_all(&mut fs, handle, b"three");
    fs.close_file(handle).unwrap();
    assert_eq!(fs.stat("/log").unwrap().file_size_bytes, 11);
}

#[test]
fn read_at_eof_returns_zero() {
    let (_dir, _image, mut fs) = mounted_fs(1);
    let handle = fs.open_file("/f", "w+").unwrap();
    write_all(&mut fs, handle, b"data");
    // Position is at EOF after the write.
    assert_eq!(fs.read_file(handle, &mut [0_u8; 4]).unwrap(), 0);
    fs.close_file(handle).unwrap();
}

#[test]
fn read_only_seek_clamps_to_eof() {
    let (_dir, _image, mut fs) = mounted_fs(1);
    let handle = fs.open_file("/f", "w+").unwrap();
    write_all(&mut fs, handle, b"0123456789");
    fs.close_file(handle).unwrap();

    let handle = fs.open_file("/f", "r").unwrap();
    assert_eq!(fs.seek(handle, 100, Whence::Set).unwrap(), 10);
    assert_eq!(fs.read_file(handle, &mut [0_u8; 4]).unwrap(), 0);
    assert_eq!(fs.seek(handle, -4, Whence::End).unwrap(), 6);
    assert_eq!(read_exact(&mut fs, handle, 4), b"6789");
    fs.close_file(handle).unwrap();
}

#[test]
fn negative_seek_is_rejected() {
    let (_dir, _image, mut fs) = mounted_fs(1);
    let handle = fs.open_file("/f", "w+").unwrap();
    write_all(&mut fs, handle, b"abc");
    assert!(matches!(
        fs.seek(handle, -4, Whence::Cur),
        Err(FsError::NegativeSeek(-4))
    ));
    assert!(matches!(
        fs.seek(handle, -1, Whence::Set),
        Err(FsError::NegativeSeek(-1))
    ));
    // Position unchanged by the rejected seeks.
    assert_eq!(fs.seek(handle, 0, Whence::Cur).unwrap(), 3);
    fs.close_file(handle).unwrap();
}

#[test]
fn overwrite_in_the_middle() {
    let (_dir, _image, mut fs) = mounted_fs(1);
    let handle = fs.open_file("/f", "w+").unwrap();
    write_all(&mut fs, handle, b"hello world");
    fs.seek(handle, 6, Whence::Set).unwrap();
    write_all(&mut fs, handle, b"earth");
    fs.seek(handle, 0, Whence::Set).unwrap();
    assert_eq!(read_exact(&mut fs, handle, 11), b"hello earth");
    fs.close_file(handle).unwrap();
    // Overwriting inside the file does not grow it.
    assert_eq!(fs.stat("/f").unwrap().file_size_bytes, 11);
}

#[test]
fn multi_cluster_pattern_round_trip() {
    let (_dir, image, mut fs) = mounted_fs(1);

    let pattern: Vec<u8> = (0..3 * CLUSTER + 123)
        .map(|i| u8::try_from(i % 251).unwrap())
        .collect();
    let handle = fs.open_file("/pat", "w+").unwrap();
    write_all(&mut fs, handle, &pattern);
    fs.seek(handle, 0, Whence::Set).unwrap();
    assert_eq!(read_exact(&mut fs, handle, pattern.len()), pattern);
    fs.close_file(handle).unwrap();

    fs.unmount().unwrap();
    fs.mount(&image).unwrap();
    let handle = fs.open_file("/pat", "r").unwrap();
    assert_eq!(read_exact(&mut fs, handle, pattern.len()), pattern);
    fs.close_file(handle).unwrap();
}

#[test]
fn mount_unmount_is_a_no_op_on_disk() {
    let (_dir, image, mut fs) = mounted_fs(1);
    let handle = fs.open_file("/keep", "w+").unwrap();
    write_all(&mut fs, handle, b"stable bytes");
    fs.close_file(handle).unwrap();
    fs.unmount().unwrap();

    let before = std::fs::read(&image).unwrap();
    fs.mount(&image).unwrap();
    fs.unmount().unwrap();
    let after = std::fs::read(&image).unwrap();
    assert_eq!(before, after);
}

#[test]
fn rename_preserves_contents_and_placement() {
    let (_dir, _image, mut fs) = mounted_fs(1);
    let handle = fs.open_file("/a", "w+").unwrap();
    write_all(&mut fs, handle, b"payload");
    fs.close_file(handle).unwrap();
    let before = fs.stat("/a").unwrap();

    fs.rename_file("/a", "/b").unwrap();
    assert!(matches!(fs.stat("/a"), Err(FsError::NotFound(_))));
    let after = fs.stat("/b").unwrap();
    assert_eq!(after.first_cluster, before.first_cluster);
    assert_eq!(after.file_size_bytes, before.file_size_bytes);

    let handle = fs.open_file("/b", "r").unwrap();
    assert_eq!(read_exact(&mut fs, handle, 7), b"payload");
    fs.close_file(handle).unwrap();
}

#[test]
fn rename_follows_open_handles() {
    let (_dir, _image, mut fs) = mounted_fs(1);
    let handle = fs.open_file("/old", "w+").unwrap();
    write_all(&mut fs, handle, b"before rename");
    fs.rename_file("/old", "/new").unwrap();
    // The still-open handle keeps working and flushes under the new name.
    write_all(&mut fs, handle, b" and after");
    fs.close_file(handle).unwrap();

    assert_eq!(fs.stat("/new").unwrap().file_size_bytes, 23);
    assert!(matches!(fs.stat("/old"), Err(FsError::NotFound(_))));
}

#[test]
fn directory_lifecycle() {
    let (_dir, image, mut fs) = mounted_fs(1);

    fs.create_directory("/docs").unwrap();
    assert!(matches!(
        fs.create_directory("/docs"),
        Err(FsError::Exists(_))
    ));

    let listing = fs.list_directory("/").unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name, "docs");
    assert_eq!(listing[0].kind, EntryKind::Directory);
    assert!(fs.list_directory("/docs").unwrap().is_empty());

    // Directories survive a remount.
    fs.unmount().unwrap();
    fs.mount(&image).unwrap();
    assert!(fs.list_directory("/docs").unwrap().is_empty());

    fs.remove_directory("/docs").unwrap();
    assert!(matches!(
        fs.list_directory("/docs"),
        Err(FsError::NotFound(_))
    ));
    assert!(fs.list_directory("/").unwrap().is_empty());
}

#[test]
fn directory_misuse_errors() {
    let (_dir, _image, mut fs) = mounted_fs(1);

    fs.create_directory("/d").unwrap();
    let handle = fs.open_file("/f", "w").unwrap();
    fs.close_file(handle).unwrap();

    // A directory cannot be opened as a file or removed as one.
    assert!(matches!(
        fs.open_file("/d", "r"),
        Err(FsError::IsDirectory(_))
    ));
    assert!(matches!(
        fs.remove_file("/d"),
        Err(FsError::IsDirectory(_))
    ));
    // A file cannot be listed or removed as a directory.
    assert!(matches!(
        fs.list_directory("/f"),
        Err(FsError::NotDirectory(_))
    ));
    assert!(matches!(
        fs.remove_directory("/f"),
        Err(FsError::NotDirectory(_))
    ));
    assert!(matches!(
        fs.open_file("/missing", "r"),
        Err(FsError::NotFound(_))
    ));
    assert!(matches!(
        fs.open_file("/f", "x"),
        Err(FsError::InvalidMode(_))
    ));
}

#[test]
fn write_requires_a_writable_handle() {
    let (_dir, _image, mut fs) = mounted_fs(1);
    let handle = fs.open_file("/f", "w").unwrap();
    fs.close_file(handle).unwrap();

    let handle = fs.open_file("/f", "r").unwrap();
    assert!(matches!(
        fs.write_file(handle, b"nope"),
        Err(FsError::ReadOnly(_))
    ));
    fs.close_file(handle).unwrap();
}

#[test]
fn many_files_extend_the_root_directory() {
    let (_dir, image, mut fs) = mounted_fs(1);

    // 15 entries fill the root cluster; the 16th forces an extension.
    for i in 0..16 {
        let handle = fs.open_file(&format!("/file-{i:02}"), "w").unwrap();
        fs.close_file(handle).unwrap();
    }
    assert_eq!(fs.list_directory("/").unwrap().len(), 16);

    fs.unmount().unwrap();
    let volume = Volume::open(&image).unwrap();
    let fat = Fat::load(&volume).unwrap();
    let root = volume.header().root_dir_start_cluster;
    assert_eq!(fat.chain(root).len(), 2);
}

#[test]
fn volume_fills_up_cleanly() {
    // Ten clusters: six for data.
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("tiny.img");
    let mut fs = FsCore::new();
    // 10 clusters is below 1 MiB, so format through the byte-level API.
    {
        let volume = Volume::create_and_format(&image, 10 * 4096).unwrap();
        volfs_alloc::ClusterBitmap::format(&volume).unwrap();
        Fat::format(&volume).unwrap();
        volfs_dir::init_root(&volume).unwrap();
    }
    fs.mount(&image).unwrap();

    let handle = fs.open_file("/fill", "w+").unwrap();
    // Six data clusters hold 24576 bytes; ask for more.
    let big = vec![0x7F_u8; 7 * 4096];
    let result = fs.write_file(handle, &big);
    assert!(matches!(result, Err(FsError::NoSpace)));
    fs.close_file(handle).unwrap();
}

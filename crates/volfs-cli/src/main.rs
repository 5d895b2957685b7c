#![forbid(unsafe_code)]
//! Interactive shell over a volfs volume.
//!
//! Lifecycle commands (`format`, `mount`, `unmount`) manage the backing
//! image; the remaining verbs operate on the mounted filesystem. Errors are
//! printed one per line with the failing verb as prefix; only startup
//! failures affect the exit code.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use volfs_core::FsCore;
use volfs_error::FsError;
use volfs_types::CLUSTER_SIZE;

#[derive(Parser)]
#[command(name = "volfs", about = "volfs — single-volume filesystem shell")]
struct Cli {
    /// Volume image to mount on startup.
    volume: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut fs = FsCore::new();
    let mut mounted_path: Option<String> = None;

    if let Some(volume) = &cli.volume {
        let display = volume.display().to_string();
        match fs.mount(volume) {
            Ok(()) => {
                println!("Volume '{display}' auto-mounted.");
                mounted_path = Some(display);
            }
            Err(err) => {
                println!("Failed to auto-mount '{display}': {err}");
                println!("Use 'format' or 'mount' to continue.");
            }
        }
    }

    println!("volfs shell. Type 'help' for commands.");
    let stdin = std::io::stdin();
    let mut line = String::new();

    loop {
        match &mounted_path {
            Some(path) => print!("[{path}] > "),
            None => print!("volfs> "),
        }
        std::io::stdout().flush().context("flush prompt")?;

        line.clear();
        if stdin.lock().read_line(&mut line).context("read stdin")? == 0 {
            break; // EOF
        }
        let tokens = tokenize(&line);
        if tokens.is_empty() {
            continue;
        }

        let command = tokens[0].to_ascii_lowercase();
        match command.as_str() {
            "exit" | "quit" => break,
            "help" => print_help(),
            "format" => cmd_format(&mut fs, &tokens, &mut mounted_path),
            "mount" => cmd_mount(&mut fs, &tokens, &mut mounted_path),
            "unmount" => cmd_unmount(&mut fs, &mut mounted_path),
            _ if !fs.is_mounted() => {
                println!("No volume mounted. Use 'format' or 'mount' first.");
            }
            "info" => cmd_info(&fs, &tokens),
            "ls" => cmd_ls(&fs, &tokens),
            "mkdir" => cmd_one_path(&tokens, "mkdir <dir>", |path| fs.create_directory(path)),
            "rmdir" => cmd_one_path(&tokens, "rmdir <dir>", |path| fs.remove_directory(path)),
            "create" => cmd_create(&mut fs, &tokens),
            "rm" => cmd_one_path(&tokens, "rm <file>", |path| fs.remove_file(path)),
            "write" => cmd_write(&mut fs, &tokens, "w+"),
            "append" => cmd_write(&mut fs, &tokens, "a+"),
            "cat" => cmd_cat(&mut fs, &tokens),
            "rename" => cmd_rename(&mut fs, &tokens),
            "cp_to_fs" => cmd_cp_to_fs(&mut fs, &tokens),
            "cp_from_fs" => cmd_cp_from_fs(&mut fs, &tokens),
            other => println!("Unknown command '{other}'. Type 'help' for commands."),
        }
    }

    if fs.is_mounted()
        && let Err(err) = fs.unmount()
    {
        report("unmount", &err);
    }
    println!("Exiting volfs shell.");
    Ok(())
}

/// Split a command line on whitespace, keeping double-quoted stretches
/// together (quotes removed).
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in line.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn report(verb: &str, err: &FsError) {
    println!("{verb}: {err}");
}

fn print_help() {
    println!();
    println!("volfs shell commands:");
    println!("  format <volume_file> <size_MB>            Format a new volume");
    println!("  mount <volume_file>                       Mount an existing volume");
    println!("  unmount                                   Unmount the current volume");
    println!("  info [--json]                             Show the volume header");
    println!("  ls [path] [--json]                        List a directory (default /)");
    println!("  mkdir <dir>                               Create a directory");
    println!("  rmdir <dir>                               Remove an empty directory");
    println!("  create <file>                             Create or truncate a file");
    println!("  rm <file>                                 Remove a file");
    println!("  write <file> \"text\"                       Overwrite a file with text");
    println!("  append <file> \"text\"                      Append text to a file");
    println!("  cat <file>                                Print file contents");
    println!("  rename <old> <new>                        Rename a file or directory");
    println!("  cp_to_fs <host_file> <fs_file>            Copy from the host into the volume");
    println!("  cp_from_fs <fs_file> <host_file>          Copy from the volume to the host");
    println!("  help                                      This message");
    println!("  exit | quit                               Leave the shell");
    println!();
}

fn cmd_format(fs: &mut FsCore, tokens: &[String], mounted_path: &mut Option<String>) {
    let [_, volume, size] = tokens else {
        println!("Usage: format <volume_file> <size_MB>");
        return;
    };
    if mounted_path.as_deref() == Some(volume.as_str()) {
        println!("Cannot format the mounted volume. Unmount first.");
        return;
    }
    let Ok(size_mb) = size.parse::<u64>() else {
        println!("Invalid size_MB value: {size}");
        return;
    };
    match fs.format(volume, size_mb) {
        Ok(()) => {
            // Formatting unmounts whatever was mounted before.
            *mounted_path = None;
            println!("Volume '{volume}' formatted ({size_mb} MB).");
        }
        Err(err) => report("format", &err),
    }
}

fn cmd_mount(fs: &mut FsCore, tokens: &[String], mounted_path: &mut Option<String>) {
    let [_, volume] = tokens else {
        println!("Usage: mount <volume_file>");
        return;
    };
    match fs.mount(volume) {
        Ok(()) => {
            println!("Volume '{volume}' mounted.");
            *mounted_path = Some(volume.clone());
        }
        Err(err) => report("mount", &err),
    }
}

fn cmd_unmount(fs: &mut FsCore, mounted_path: &mut Option<String>) {
    if !fs.is_mounted() {
        println!("No volume is currently mounted.");
        return;
    }
    match fs.unmount() {
        Ok(()) => {
            println!("Volume unmounted.");
            *mounted_path = None;
        }
        Err(err) => report("unmount", &err),
    }
}

fn cmd_info(fs: &FsCore, tokens: &[String]) {
    let header = match fs.header() {
        Ok(header) => header,
        Err(err) => return report("info", &err),
    };
    let free = fs.free_cluster_count().unwrap_or(0);

    if tokens.iter().any(|t| t == "--json") {
        match serde_json::to_string_pretty(&header) {
            Ok(json) => println!("{json}"),
            Err(err) => println!("info: {err}"),
        }
        return;
    }

    println!("--- Volume header ---");
    println!("Volume size (B):   {}", header.volume_size_bytes);
    println!("Cluster size (B):  {}", header.cluster_size_bytes);
    println!("Total clusters:    {}", header.total_clusters);
    println!("Bitmap start:      {}", header.bitmap_start_cluster);
    println!("Bitmap size:       {}", header.bitmap_size_clusters);
    println!("FAT start:         {}", header.fat_start_cluster);
    println!("FAT size:          {}", header.fat_size_clusters);
    println!("Root dir start:    {}", header.root_dir_start_cluster);
    println!("Root dir size:     {}", header.root_dir_size_clusters);
    println!("Data start:        {}", header.data_start_cluster);
    println!("Free clusters:     {free}");
    println!("---------------------");
}

fn cmd_ls(fs: &FsCore, tokens: &[String]) {
    let json = tokens.iter().any(|t| t == "--json");
    let path = tokens
        .iter()
        .skip(1)
        .find(|t| *t != "--json")
        .map_or("/", String::as_str);

    match fs.list_directory(path) {
        Ok(entries) => {
            if json {
                match serde_json::to_string_pretty(&entries) {
                    Ok(out) => println!("{out}"),
                    Err(err) => println!("ls: {err}"),
                }
                return;
            }
            for entry in &entries {
                let tag = if entry.is_directory() { "D" } else { "F" };
                println!(
                    "{tag} {:<40} {:>10} B  (Cl: {})",
                    entry.name, entry.file_size_bytes, entry.first_cluster
                );
            }
        }
        Err(err) => report("ls", &err),
    }
}

fn cmd_one_path(
    tokens: &[String],
    usage: &str,
    op: impl FnOnce(&str) -> volfs_error::Result<()>,
) {
    let [_, path] = tokens else {
        println!("Usage: {usage}");
        return;
    };
    let verb = usage.split_whitespace().next().unwrap_or("fs");
    match op(path) {
        Ok(()) => println!("OK."),
        Err(err) => report(verb, &err),
    }
}

fn cmd_create(fs: &mut FsCore, tokens: &[String]) {
    let [_, path] = tokens else {
        println!("Usage: create <file>");
        return;
    };
    match fs.open_file(path, "w") {
        Ok(handle) => {
            if let Err(err) = fs.close_file(handle) {
                report("create", &err);
            } else {
                println!("File '{path}' created/truncated.");
            }
        }
        Err(err) => report("create", &err),
    }
}

fn cmd_write(fs: &mut FsCore, tokens: &[String], mode: &str) {
    let verb = if mode == "w+" { "write" } else { "append" };
    if tokens.len() < 3 {
        println!("Usage: {verb} <file> \"text\"");
        return;
    }
    let path = &tokens[1];
    let text = tokens[2..].join(" ");

    let handle = match fs.open_file(path, mode) {
        Ok(handle) => handle,
        Err(err) => return report(verb, &err),
    };
    match fs.write_file(handle, text.as_bytes()) {
        Ok(written) => println!("{written} bytes written to '{path}'."),
        Err(err) => report(verb, &err),
    }
    if let Err(err) = fs.close_file(handle) {
        report(verb, &err);
    }
}

fn cmd_cat(fs: &mut FsCore, tokens: &[String]) {
    let [_, path] = tokens else {
        println!("Usage: cat <file>");
        return;
    };
    let handle = match fs.open_file(path, "r") {
        Ok(handle) => handle,
        Err(err) => return report("cat", &err),
    };
    let mut buf = vec![0_u8; CLUSTER_SIZE];
    loop {
        match fs.read_file(handle, &mut buf) {
            Ok(0) => break,
            Ok(n) => print!("{}", String::from_utf8_lossy(&buf[..n])),
            Err(err) => {
                report("cat", &err);
                break;
            }
        }
    }
    println!();
    if let Err(err) = fs.close_file(handle) {
        report("cat", &err);
    }
}

fn cmd_rename(fs: &mut FsCore, tokens: &[String]) {
    let [_, old, new] = tokens else {
        println!("Usage: rename <old> <new>");
        return;
    };
    match fs.rename_file(old, new) {
        Ok(()) => println!("Renamed '{old}' to '{new}'."),
        Err(err) => report("rename", &err),
    }
}

fn cmd_cp_to_fs(fs: &mut FsCore, tokens: &[String]) {
    let [_, host_src, fs_dest] = tokens else {
        println!("Usage: cp_to_fs <host_file> <fs_file>");
        return;
    };
    let data = match std::fs::read(host_src) {
        Ok(data) => data,
        Err(err) => {
            println!("cp_to_fs: cannot read host file '{host_src}': {err}");
            return;
        }
    };
    let handle = match fs.open_file(fs_dest, "w+") {
        Ok(handle) => handle,
        Err(err) => return report("cp_to_fs", &err),
    };
    match fs.write_file(handle, &data) {
        Ok(written) if written == data.len() => {
            println!("Copied {host_src} to {fs_dest} ({written} bytes).");
        }
        Ok(written) => println!("cp_to_fs: short write ({written} of {} bytes)", data.len()),
        Err(err) => report("cp_to_fs", &err),
    }
    if let Err(err) = fs.close_file(handle) {
        report("cp_to_fs", &err);
    }
}

fn cmd_cp_from_fs(fs: &mut FsCore, tokens: &[String]) {
    let [_, fs_src, host_dest] = tokens else {
        println!("Usage: cp_from_fs <fs_file> <host_file>");
        return;
    };
    let handle = match fs.open_file(fs_src, "r") {
        Ok(handle) => handle,
        Err(err) => return report("cp_from_fs", &err),
    };
    let mut content = Vec::new();
    let mut buf = vec![0_u8; CLUSTER_SIZE];
    loop {
        match fs.read_file(handle, &mut buf) {
            Ok(0) => break,
            Ok(n) => content.extend_from_slice(&buf[..n]),
            Err(err) => {
                report("cp_from_fs", &err);
                let _ = fs.close_file(handle);
                return;
            }
        }
    }
    if let Err(err) = fs.close_file(handle) {
        report("cp_from_fs", &err);
    }
    match std::fs::write(host_dest, &content) {
        Ok(()) => println!("Copied {fs_src} to {host_dest} ({} bytes).", content.len()),
        Err(err) => println!("cp_from_fs: cannot write host file '{host_dest}': {err}"),
    }
}

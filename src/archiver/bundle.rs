//! Zip bundle creation and extraction.
//!
//! Everything here is blocking file I/O; async callers run it inside
//! `tokio::task::spawn_blocking`.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Entries at or above this size need zip64 headers.
const LARGE_FILE_THRESHOLD: u64 = u32::MAX as u64;

/// Build the flat entry name for a fetched file.
///
/// Every run of non-alphanumeric characters in the path (directory separators
/// included) becomes one underscore, leading and trailing underscores are
/// dropped, the extension of the last component is kept verbatim and `prefix`
/// is prepended.
#[must_use]
pub fn normalize_entry_name(relative: &str, prefix: &str) -> String {
    let (stem, ext) = normalized_parts(relative, prefix);
    format!("{stem}{ext}")
}

fn normalized_parts(relative: &str, prefix: &str) -> (String, String) {
    let (body, ext) = split_extension(relative);

    let mut collapsed = String::with_capacity(body.len());
    let mut in_run = false;
    for c in body.chars() {
        if c.is_alphanumeric() {
            collapsed.push(c);
            in_run = false;
        } else if !in_run {
            collapsed.push('_');
            in_run = true;
        }
    }

    (
        format!("{prefix}{}", collapsed.trim_matches('_')),
        ext.to_string(),
    )
}

/// Split off the extension of the last path component.
///
/// Leading dots of the component do not start an extension, so `.hidden`
/// and `dir/.hidden` have none.
fn split_extension(relative: &str) -> (&str, &str) {
    let name_start = relative.rfind(['/', '\\']).map_or(0, |pos| pos + 1);
    let name = &relative[name_start..];
    let leading_dots = name.len() - name.trim_start_matches('.').len();

    match name.rfind('.') {
        Some(dot) if dot >= leading_dots => {
            let split = name_start + dot;
            (&relative[..split], &relative[split..])
        }
        _ => (relative, ""),
    }
}

/// Recursively list regular files under `root`, sorted.
///
/// # Errors
///
/// Returns an error if a directory cannot be read.
pub fn collect_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to read directory: {}", dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Relative path of `file` under `root`, `/`-separated.
fn relative_name(root: &Path, file: &Path) -> Result<String> {
    let relative = file
        .strip_prefix(root)
        .with_context(|| format!("{} is outside {}", file.display(), root.display()))?;
    Ok(relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

fn entry_options(size: u64) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(size >= LARGE_FILE_THRESHOLD)
}

/// Zip every file under `source_dir` into `zip_path` with normalized names.
///
/// Names that collide after normalization get `_1`, `_2`, ... before the
/// extension. Returns the number of entries written; when `source_dir` holds
/// no files nothing is created and `0` is returned.
///
/// # Errors
///
/// Returns an error on any I/O or zip failure.
pub fn write_bundle(source_dir: &Path, zip_path: &Path, prefix: &str) -> Result<usize> {
    let files = collect_files(source_dir)?;
    if files.is_empty() {
        return Ok(0);
    }

    let out = File::create(zip_path)
        .with_context(|| format!("Failed to create bundle: {}", zip_path.display()))?;
    let mut zip = ZipWriter::new(BufWriter::new(out));
    let mut used = HashSet::new();

    for file in &files {
        let relative = relative_name(source_dir, file)?;
        let (stem, ext) = normalized_parts(&relative, prefix);
        let mut name = format!("{stem}{ext}");
        let mut suffix = 0;
        while used.contains(&name) {
            suffix += 1;
            name = format!("{stem}_{suffix}{ext}");
        }

        let size = file.metadata()?.len();
        zip.start_file(name.as_str(), entry_options(size))
            .with_context(|| format!("Failed to start entry {name}"))?;
        let mut reader = BufReader::new(File::open(file)?);
        std::io::copy(&mut reader, &mut zip)
            .with_context(|| format!("Failed to write {} into bundle", file.display()))?;

        debug!(source = %relative, entry = %name, "Bundled file");
        used.insert(name);
    }

    zip.finish().context("Failed to finalize bundle")?;
    Ok(files.len())
}

/// Zip every file under `source_dir` into `zip_path`, keeping relative paths.
///
/// Each source file is deleted right after it has been written, so the data
/// is never held on disk twice. Returns the number of entries; nothing is
/// created when there are none.
///
/// # Errors
///
/// Returns an error on any I/O or zip failure.
pub fn pack_directory(source_dir: &Path, zip_path: &Path) -> Result<usize> {
    let files = collect_files(source_dir)?;
    if files.is_empty() {
        return Ok(0);
    }

    let out = File::create(zip_path)
        .with_context(|| format!("Failed to create pack: {}", zip_path.display()))?;
    let mut zip = ZipWriter::new(BufWriter::new(out));

    for file in &files {
        let name = relative_name(source_dir, file)?;
        let size = file.metadata()?.len();
        zip.start_file(name.as_str(), entry_options(size))
            .with_context(|| format!("Failed to start entry {name}"))?;
        let mut reader = BufReader::new(File::open(file)?);
        std::io::copy(&mut reader, &mut zip)
            .with_context(|| format!("Failed to write {} into pack", file.display()))?;
        drop(reader);
        std::fs::remove_file(file)?;
    }

    zip.finish().context("Failed to finalize pack")?;
    Ok(files.len())
}

/// Extract a zip archive into `dest` and return the number of entries.
///
/// Entry names escaping `dest` are rejected by the zip reader.
///
/// # Errors
///
/// Returns an error if the archive is unreadable or extraction fails.
pub fn extract_zip(zip_path: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(zip_path)
        .with_context(|| format!("Failed to open archive: {}", zip_path.display()))?;
    let mut archive = ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("Not a valid zip archive: {}", zip_path.display()))?;
    let count = archive.len();
    archive
        .extract(dest)
        .with_context(|| format!("Failed to extract {}", zip_path.display()))?;
    Ok(count)
}

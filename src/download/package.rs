//! Expansion of downloaded packages (multi-file bundles).
//!
//! The remote delivers a package as a single archive. The archive type is
//! recognized from its leading bytes. Zip archives are unpacked into a
//! staging directory next to the destination, and the stale package
//! directory is swapped out only once staging has fully succeeded. Gzip
//! wrappers are peeled off and the result inspected again.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;

use super::error::DownloadError;
use crate::unicode::{nfc, nfc_os, nfc_path};

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const MAX_GZIP_LAYERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Gzip,
}

pub fn sniff(path: &Path) -> io::Result<Option<ArchiveKind>> {
    let mut head = [0u8; 4];
    let mut file = File::open(path)?;
    let mut filled = 0;
    while filled < head.len() {
        match file.read(&mut head[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    let head = &head[..filled];
    Ok(if head.starts_with(ZIP_MAGIC) {
        Some(ArchiveKind::Zip)
    } else if head.starts_with(GZIP_MAGIC) {
        Some(ArchiveKind::Gzip)
    } else {
        None
    })
}

/// Replace the package directory `dest` with the contents of `archive`.
/// The archive file itself is consumed.
pub fn expand_package(archive: &Path, dest: &Path) -> Result<(), DownloadError> {
    let staging = archive.with_extension("staging");
    let mut scratch = Vec::new();
    let result = expand_into(archive, dest, &staging, &mut scratch);

    for path in &scratch {
        discard(path, fs::remove_file(path));
    }
    discard(&staging, fs::remove_dir_all(&staging));
    discard(archive, fs::remove_file(archive));
    result
}

/// Log a failed cleanup step. Paths that are already gone are expected.
fn discard(path: &Path, removed: io::Result<()>) {
    match removed {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::debug!(path = %path.display(), error = %e, "Could not remove scratch data"),
    }
}

fn expand_into(
    archive: &Path,
    dest: &Path,
    staging: &Path,
    scratch: &mut Vec<PathBuf>,
) -> Result<(), DownloadError> {
    let display = dest.display().to_string();
    let extraction = |reason: String| DownloadError::Extraction {
        path: display.clone(),
        reason,
    };

    let mut current = archive.to_path_buf();
    let mut layers = 0;
    loop {
        match sniff(&current)? {
            Some(ArchiveKind::Zip) => break,
            Some(ArchiveKind::Gzip) if layers < MAX_GZIP_LAYERS => {
                let out = archive.with_extension(format!("gunzip{layers}"));
                gunzip(&current, &out)?;
                scratch.push(out.clone());
                current = out;
                layers += 1;
            }
            Some(ArchiveKind::Gzip) => {
                return Err(extraction("too many nested gzip layers".into()));
            }
            None => return Err(extraction("content is neither zip nor gzip".into())),
        }
    }

    if staging.exists() {
        fs::remove_dir_all(staging)?;
    }
    fs::create_dir_all(staging)?;
    extract_zip(&current, staging).map_err(|e| match e {
        ExtractError::Zip(z) => extraction(z.to_string()),
        ExtractError::Unsafe(name) => DownloadError::UnsafeEntry(name),
        ExtractError::Io(io) => DownloadError::Disk(io),
    })?;

    let package_name = dest
        .file_name()
        .map(nfc_os)
        .unwrap_or_default();
    let root = single_root_named(staging, &package_name)?.unwrap_or_else(|| staging.to_path_buf());

    match fs::symlink_metadata(dest) {
        Ok(m) if m.is_dir() => fs::remove_dir_all(dest)?,
        Ok(_) => fs::remove_file(dest)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    fs::rename(&root, dest)?;
    tracing::debug!(package = %dest.display(), "Expanded package");
    Ok(())
}

fn gunzip(src: &Path, out: &Path) -> io::Result<()> {
    let mut decoder = GzDecoder::new(File::open(src)?);
    let mut target = File::create(out)?;
    io::copy(&mut decoder, &mut target)?;
    Ok(())
}

enum ExtractError {
    Zip(zip::result::ZipError),
    Unsafe(String),
    Io(io::Error),
}

impl From<io::Error> for ExtractError {
    fn from(e: io::Error) -> Self {
        ExtractError::Io(e)
    }
}

impl From<zip::result::ZipError> for ExtractError {
    fn from(e: zip::result::ZipError) -> Self {
        ExtractError::Zip(e)
    }
}

fn extract_zip(archive: &Path, staging: &Path) -> Result<(), ExtractError> {
    let mut zip = zip::ZipArchive::new(File::open(archive)?)?;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(ExtractError::Unsafe(entry.name().to_string()));
        };
        let relative = nfc_path(&relative);
        if relative.as_os_str().is_empty() {
            continue;
        }
        let out = staging.join(&relative);
        if !out.starts_with(staging) {
            return Err(ExtractError::Unsafe(nfc(entry.name())));
        }
        if entry.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&out)?;
        io::copy(&mut entry, &mut file)?;
    }
    Ok(())
}

/// The archive's only top-level entry, if it is a directory named after
/// the package.
fn single_root_named(staging: &Path, name: &str) -> io::Result<Option<PathBuf>> {
    let mut entries = fs::read_dir(staging)?.collect::<io::Result<Vec<_>>>()?;
    if entries.len() != 1 {
        return Ok(None);
    }
    let entry = entries.remove(0);
    if entry.file_type()?.is_dir() && nfc_os(&entry.file_name()) == name {
        Ok(Some(entry.path()))
    } else {
        Ok(None)
    }
}

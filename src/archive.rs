use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use anyhow::{Context, Result};
use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use tar::Archive;
use tracing::{info, warn};
use xz2::read::XzDecoder;
use zip::ZipArchive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    TarXz,
    TarBz2,
    Tar,
    Zip,
}

/// Identifies an archive by its first bytes, regardless of the file name.
pub fn detect(path: &Path) -> Result<Option<ArchiveKind>> {
    let mut header = Vec::with_capacity(262);
    fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?
        .take(262)
        .read_to_end(&mut header)?;

    let kind = if header.starts_with(&[0x1f, 0x8b]) {
        Some(ArchiveKind::TarGz)
    } else if header.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
        Some(ArchiveKind::TarXz)
    } else if header.starts_with(b"BZh") {
        Some(ArchiveKind::TarBz2)
    } else if header.starts_with(b"PK\x03\x04") || header.starts_with(b"PK\x05\x06") {
        Some(ArchiveKind::Zip)
    } else if header.get(257..262) == Some(b"ustar".as_slice()) {
        Some(ArchiveKind::Tar)
    } else {
        None
    };
    Ok(kind)
}

/// Extracts `source` into `target`, returning the paths of the extracted members.
pub fn extract(source: &Path, kind: ArchiveKind, target: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(target)
        .with_context(|| format!("Failed to create extraction directory: {}", target.display()))?;
    let file = fs::File::open(source)
        .with_context(|| format!("Failed to open archive: {}", source.display()))?;

    let members = match kind {
        ArchiveKind::TarGz => extract_tar(GzDecoder::new(file), source, target)?,
        ArchiveKind::TarXz => extract_tar(XzDecoder::new(file), source, target)?,
        ArchiveKind::TarBz2 => extract_tar(BzDecoder::new(file), source, target)?,
        ArchiveKind::Tar => extract_tar(file, source, target)?,
        ArchiveKind::Zip => extract_zip(file, source, target)?,
    };
    info!("Extracted {} members of {} to {}", members.len(), source.display(), target.display());
    Ok(members.into_iter().map(|member| target.join(member)).collect())
}

/// Absolute names and names climbing out with `..` are never extracted.
fn is_safe_member(name: &Path) -> bool {
    !name.has_root()
        && !name
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
}

fn extract_tar<R: Read>(reader: R, source: &Path, target: &Path) -> Result<Vec<PathBuf>> {
    let mut archive = Archive::new(reader);
    let mut extracted = Vec::new();
    let mut skipped = Vec::new();

    for entry in archive
        .entries()
        .with_context(|| format!("Failed to read entries of {}", source.display()))?
    {
        let mut entry =
            entry.with_context(|| format!("Failed to read an entry of {}", source.display()))?;
        let name = entry.path().context("Failed to get entry path")?.into_owned();
        if !is_safe_member(&name) {
            skipped.push(name.display().to_string());
            continue;
        }
        entry
            .unpack_in(target)
            .with_context(|| format!("Failed to extract {}", name.display()))?;
        extracted.push(name);
    }

    if !skipped.is_empty() {
        warn!(
            "{}: The archive contains unsafe members which were not extracted: {}",
            source.display(),
            skipped.join(", ")
        );
    }
    Ok(extracted)
}

fn extract_zip(file: fs::File, source: &Path, target: &Path) -> Result<Vec<PathBuf>> {
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("Failed to read zip archive {}", source.display()))?;
    let names: Vec<PathBuf> = archive.file_names().map(PathBuf::from).collect();
    archive
        .extract(target)
        .with_context(|| format!("Failed to extract {}", source.display()))?;
    Ok(names)
}

//! Archive ingestion from JAR/WAR files on disk.
//!
//! Opens the archive through a read-only memory map, decodes every
//! application class into a [`CompiledUnit`] and reads the manifest's main
//! section. Entries that fail to decode are logged and skipped; the archive
//! as a whole only fails to load when the zip structure itself is unreadable.

use anyhow::{Context, Result};
use log::{debug, warn};
use memmap2::Mmap;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;
use zip::ZipArchive;

use crate::classfile::ClassFile;
use crate::model::{Archive, ArchiveLocation, CompiledUnit, Manifest};
use crate::scan::entry_class_name;

pub const MANIFEST_ENTRY: &str = "META-INF/MANIFEST.MF";

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Decode method bodies into instruction streams up front.
    pub deep: bool,
}

pub fn load_archive(path: &Path, options: LoadOptions) -> Result<Archive> {
    let file = File::open(path).with_context(|| format!("Failed to open archive: {}", path.display()))?;
    // SAFETY: The file is opened read-only and outlives the map within this function.
    let mmap = unsafe { Mmap::map(&file) }
        .with_context(|| format!("Failed to mmap archive: {}", path.display()))?;
    let mut zip = ZipArchive::new(Cursor::new(&mmap[..]))
        .with_context(|| format!("Failed to read zip structure: {}", path.display()))?;

    let mut units: BTreeMap<String, CompiledUnit> = BTreeMap::new();
    let mut manifest = Manifest::default();
    let mut skipped = 0usize;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let name = entry.name().to_string();

        if name == MANIFEST_ENTRY {
            let mut text = String::new();
            entry
                .read_to_string(&mut text)
                .with_context(|| format!("Failed to read manifest of {}", path.display()))?;
            manifest = Manifest::parse(&text);
            continue;
        }

        let Some(class_name) = entry_class_name(&name) else {
            continue;
        };
        if units.contains_key(&class_name) {
            continue;
        }

        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes)?;
        match ClassFile::parse(&bytes).and_then(|c| c.to_unit(options.deep)) {
            Ok(unit) => {
                units.insert(class_name, unit);
            }
            Err(e) => {
                skipped += 1;
                warn!("{}: skipping {name}: {e}", path.display());
            }
        }
    }

    debug!(
        "{}: loaded {} units ({} skipped), {} manifest keys",
        path.display(),
        units.len(),
        skipped,
        manifest.len()
    );

    Ok(Archive::new(
        ArchiveLocation::from_path(path),
        units.into_values().collect(),
        manifest,
    ))
}

pub fn archive_contains_entry(archive_path: &Path, entry: &str) -> Result<bool> {
    with_zip(archive_path, |zip| Ok(zip.by_name(entry).is_ok()))
}

/// Reads the first of `entries` present in the archive.
pub fn read_first_entry(archive_path: &Path, entries: &[String]) -> Result<Option<Vec<u8>>> {
    with_zip(archive_path, |zip| {
        for name in entries {
            if let Ok(mut entry) = zip.by_name(name) {
                let mut bytes = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut bytes)?;
                return Ok(Some(bytes));
            }
        }
        Ok(None)
    })
}

fn with_zip<T>(
    archive_path: &Path,
    f: impl FnOnce(&mut ZipArchive<Cursor<&[u8]>>) -> Result<T>,
) -> Result<T> {
    let file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive: {}", archive_path.display()))?;
    // SAFETY: The file is opened read-only and outlives the map within this function.
    let mmap = unsafe { Mmap::map(&file) }
        .with_context(|| format!("Failed to mmap archive: {}", archive_path.display()))?;
    let mut zip = ZipArchive::new(Cursor::new(&mmap[..]))
        .with_context(|| format!("Failed to read zip structure: {}", archive_path.display()))?;
    f(&mut zip)
}

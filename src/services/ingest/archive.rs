//! Zip expansion for bundled profile uploads. Each entry is processed as an
//! independent file with its own outcome in the job summary.

use anyhow::{Context, Result};
use std::io::{Cursor, Read};

#[derive(Debug)]
pub struct ArchiveEntry {
    pub name: String,
    pub bytes: Vec<u8>,
}

pub fn is_profile_filename(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".nc") || lower.ends_with(".nc4")
}

pub fn is_zip_filename(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".zip")
}

/// Extracts the profile files from a zip archive, preserving entry order.
/// Entries that are not `.nc`/`.nc4` files are ignored.
pub fn extract_profile_entries(bytes: &[u8]) -> Result<Vec<ArchiveEntry>> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).context("failed to open zip archive")?;
    let mut entries = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read zip entry {index}"))?;
        if entry.is_dir() || !is_profile_filename(entry.name()) {
            continue;
        }
        // Strip any interior directories; entry names become object suffixes.
        let name = entry
            .name()
            .rsplit('/')
            .next()
            .unwrap_or(entry.name())
            .to_string();
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut bytes)
            .with_context(|| format!("failed to decompress zip entry {name}"))?;
        entries.push(ArchiveEntry { name, bytes });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, bytes) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn filename_classification() {
        assert!(is_profile_filename("R2902746_012.nc"));
        assert!(is_profile_filename("float.NC4"));
        assert!(!is_profile_filename("readme.txt"));
        assert!(is_zip_filename("bundle.ZIP"));
        assert!(!is_zip_filename("bundle.tar.gz"));
    }

    #[test]
    fn extracts_only_profile_entries() {
        let zip = build_zip(&[
            ("a.nc", b"CDF\x01fake".as_slice()),
            ("notes/readme.txt", b"ignored".as_slice()),
            ("nested/b.nc4", b"CDF\x01fake2".as_slice()),
        ]);
        let entries = extract_profile_entries(&zip).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.nc");
        assert_eq!(entries[1].name, "b.nc4");
        assert_eq!(entries[1].bytes, b"CDF\x01fake2");
    }

    #[test]
    fn garbage_is_not_an_archive() {
        assert!(extract_profile_entries(b"not a zip").is_err());
    }
}

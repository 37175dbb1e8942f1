// Axel '0vercl0k' Souchet - October 18 2026
//! This loads process snapshots into [`Mappings`].
//!
//! A snapshot is a directory or a (gzip-compressed or not) tar archive. It has
//! an index file named `mappings` listing one region per line:
//!
//! ```text
//! 0x08048000-0x08049000,/usr/bin/true
//! 0x0804a000-0x0806b000,[heap]
//! ```
//!
//! and, for every region whose content was captured, a file named after the
//! range (the text before the comma) holding the raw bytes of the region.
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::debug;

use crate::addr::{Address, WordSize};
use crate::error::{HaystackError, Result};
use crate::space::{Mappings, MemoryRegion};

/// Name of the index file.
pub const INDEX_NAME: &str = "mappings";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// A line of the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// The name of the file holding the content of the region.
    pub name: String,
    pub start: Address,
    pub end: Address,
    pub label: Option<String>,
}

/// Parse an index file.
///
/// # Errors
///
/// Returns [`HaystackError::InvalidIndex`] on the first malformed line.
pub fn parse_index(index: &str) -> Result<Vec<IndexEntry>> {
    let mut entries = Vec::new();
    for (idx, line) in index.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let invalid = |reason: &str| HaystackError::InvalidIndex {
            line: idx + 1,
            reason: reason.to_string(),
        };

        let (name, label) = line
            .split_once(',')
            .ok_or_else(|| invalid("expected <start>-<end>,<label>"))?;
        let name = name.trim();
        let (start, end) = name
            .split_once('-')
            .ok_or_else(|| invalid("expected a <start>-<end> range"))?;
        let start = start
            .parse::<Address>()
            .map_err(|_| invalid("the start address isn't hexadecimal"))?;
        let end = end
            .parse::<Address>()
            .map_err(|_| invalid("the end address isn't hexadecimal"))?;
        if end <= start {
            return Err(invalid("the range is empty"));
        }

        let label = label.trim();
        entries.push(IndexEntry {
            name: name.to_string(),
            start,
            end,
            label: (!label.is_empty()).then(|| label.to_string()),
        });
    }

    Ok(entries)
}

/// Where the files of a snapshot come from.
trait Source {
    fn file(&mut self, name: &str) -> Result<Option<Vec<u8>>>;
}

struct Directory<'p>(&'p Path);

impl Source for Directory<'_> {
    fn file(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.0.join(name)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// The members of a tar archive, keyed by normalized name.
struct Members(HashMap<String, Vec<u8>>);

impl Members {
    fn read(reader: impl Read) -> Result<Self> {
        let mut archive = Archive::new(reader);
        let mut members = HashMap::new();
        for entry in archive.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }

            let name = entry.path()?.to_string_lossy().into_owned();
            // The header's size isn't trusted until the content backs it.
            let mut content = Vec::new();
            let read = entry.read_to_end(&mut content)?;
            if read as u64 != entry.size() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{name} is truncated, {read:#x} out of {:#x} bytes", entry.size()),
                )
                .into());
            }

            members.insert(normalize(&name).to_string(), content);
        }

        Ok(Self(members))
    }
}

impl Source for Members {
    fn file(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.0.remove(normalize(name)))
    }
}

/// Archives made from a directory have their members prefixed by `./`.
fn normalize(name: &str) -> &str {
    let mut name = name;
    while let Some(rest) = name.strip_prefix("./") {
        name = rest;
    }

    name
}

fn build(source: &mut dyn Source, word_size: WordSize) -> Result<Mappings> {
    let index = source.file(INDEX_NAME)?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("the snapshot has no {INDEX_NAME} index"),
        )
    })?;
    let index = String::from_utf8_lossy(&index);

    let mut mappings = Mappings::new(word_size);
    for entry in parse_index(&index)? {
        let region = MemoryRegion::new(entry.start, entry.end, entry.label);
        let region = match source.file(&entry.name)? {
            Some(content) => {
                if content.len() as u64 != region.len() {
                    debug!(
                        "{} has {:#x} bytes of content for {:#x} bytes",
                        entry.name,
                        content.len(),
                        region.len()
                    );
                }

                region.captured(content)
            }
            None => {
                debug!("{} wasn't captured", entry.name);
                region
            }
        };

        mappings.insert(region)?;
    }

    debug!("loaded {} regions", mappings.len());

    Ok(mappings)
}

/// Load a snapshot from a directory, a `.tar` or a `.tar.gz`.
///
/// # Errors
///
/// Returns an error if the snapshot can't be read, if its index is malformed
/// or if two regions overlap. Regions without content aren't an error.
pub fn load(path: impl AsRef<Path>, word_size: WordSize) -> Result<Mappings> {
    let path = path.as_ref();
    if path.is_dir() {
        return build(&mut Directory(path), word_size);
    }

    // Sniff the compression..
    let mut file = BufReader::new(File::open(path)?);
    let mut magic = [0u8; 2];
    let compressed = match file.read_exact(&mut magic) {
        Ok(()) => magic == GZIP_MAGIC,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => false,
        Err(e) => return Err(e.into()),
    };
    file.seek(SeekFrom::Start(0))?;

    // ..and unpack the archive.
    let mut members = if compressed {
        Members::read(GzDecoder::new(file))?
    } else {
        Members::read(file)?
    };

    build(&mut members, word_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index() {
        let entries = parse_index(
            "0x08048000-0x08049000,/usr/bin/true\n\n0804a000-0806b000,[heap]\r\n7fff0000-7fff1000,\n",
        )
        .unwrap();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].name, "0x08048000-0x08049000");
        assert_eq!(entries[0].label.as_deref(), Some("/usr/bin/true"));
        assert_eq!(entries[1].start, Address::new(0x0804_a000));
        assert_eq!(entries[1].end, Address::new(0x0806_b000));
        assert_eq!(entries[1].label.as_deref(), Some("[heap]"));
        assert_eq!(entries[2].label, None);
    }

    #[test]
    fn malformed_index() {
        for (index, line) in [
            ("0x1000-0x2000", 1),
            ("0x1000-0x2000,a\n0x1000,b", 2),
            ("0x1000-zz,c", 1),
            ("0x2000-0x1000,d", 1),
        ] {
            assert!(
                matches!(parse_index(index), Err(HaystackError::InvalidIndex { line: l, .. }) if l == line),
                "{index}"
            );
        }
    }

    #[test]
    fn member_names() {
        assert_eq!(normalize("./mappings"), "mappings");
        assert_eq!(normalize("././0x1000-0x2000"), "0x1000-0x2000");
        assert_eq!(normalize("mappings"), "mappings");
    }
}

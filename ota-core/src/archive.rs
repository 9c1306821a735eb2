//! Streaming ZIP reader for release archives.
//!
//! Only the central directory is kept in memory. Members are decoded one at a
//! time straight from the archive file, so peak memory does not depend on the
//! archive size. Supports stored (0) and raw DEFLATE (8) members; no ZIP64.

use flate2::read::DeflateDecoder;
use flate2::CrcReader;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{IoContext, UpdateError};

pub const METHOD_STORED: u16 = 0;
pub const METHOD_DEFLATE: u16 = 8;

const LOCAL_HEADER_SIG: [u8; 4] = *b"PK\x03\x04";
const CENTRAL_DIR_SIG: [u8; 4] = *b"PK\x01\x02";
const END_CENTRAL_DIR_SIG: [u8; 4] = *b"PK\x05\x06";

const LOCAL_HEADER_LEN: usize = 30;
const CENTRAL_ENTRY_LEN: usize = 46;
const END_CENTRAL_DIR_LEN: usize = 22;
const EOCD_SEARCH_WINDOW: u64 = 64 * 1024;
const ZIP64_MARKER: u32 = 0xFFFF_FFFF;

/// One member as described by the central directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub method: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub local_header_offset: u64,
}

impl ArchiveEntry {
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }
}

pub struct ZipArchive {
    path: PathBuf,
    entries: Vec<ArchiveEntry>,
}

impl ZipArchive {
    /// Parse the end-of-central-directory record and the full central directory
    pub fn open(path: impl AsRef<Path>) -> Result<Self, UpdateError> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).at(&path)?;
        let file_len = file.metadata().at(&path)?.len();

        if file_len < END_CENTRAL_DIR_LEN as u64 {
            return Err(UpdateError::CorruptArchive(format!(
                "file too small for a ZIP archive ({} bytes)",
                file_len
            )));
        }

        // The EOCD sits at the end, followed by at most a 64KB comment
        let window = file_len.min(EOCD_SEARCH_WINDOW);
        let window_start = file_len - window;
        file.seek(SeekFrom::Start(window_start)).at(&path)?;
        let mut tail = vec![0u8; window as usize];
        file.read_exact(&mut tail).at(&path)?;

        let eocd_pos = find_last(&tail, &END_CENTRAL_DIR_SIG)
            .ok_or_else(|| UpdateError::CorruptArchive("end of central directory not found".into()))?;
        let eocd = &tail[eocd_pos..];
        if eocd.len() < END_CENTRAL_DIR_LEN {
            return Err(UpdateError::CorruptArchive("truncated end of central directory".into()));
        }

        let entry_count = le_u16(eocd, 10) as usize;
        let cd_size = le_u32(eocd, 12);
        let cd_offset = le_u32(eocd, 16);
        if cd_size == ZIP64_MARKER || cd_offset == ZIP64_MARKER {
            return Err(UpdateError::CorruptArchive("ZIP64 archives are not supported".into()));
        }

        let eocd_abs = window_start + eocd_pos as u64;
        if cd_offset as u64 + cd_size as u64 > eocd_abs {
            return Err(UpdateError::CorruptArchive(format!(
                "central directory ({} bytes at {}) runs past end of archive",
                cd_size, cd_offset
            )));
        }

        file.seek(SeekFrom::Start(cd_offset as u64)).at(&path)?;
        let mut directory = vec![0u8; cd_size as usize];
        file.read_exact(&mut directory).at(&path)?;

        let entries = parse_central_directory(&directory, entry_count)?;
        log::debug!("Opened {} ({} entries)", path.display(), entries.len());

        Ok(Self { path, entries })
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn by_name(&self, name: &str) -> Option<&ArchiveEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Decode `entry` into `dest_dir`, returning the written path.
    ///
    /// Directory entries are skipped and return `None`. A partially written file
    /// is removed when decoding fails.
    pub fn extract(&self, entry: &ArchiveEntry, dest_dir: &Path) -> Result<Option<PathBuf>, UpdateError> {
        if entry.is_dir() {
            return Ok(None);
        }

        let dest = dest_dir.join(&entry.name);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).at(parent)?;
        }

        let mut reader = CrcReader::new(self.open_member(entry)?);
        let mut out = File::create(&dest).at(&dest)?;
        let written = match io::copy(&mut reader, &mut out) {
            Ok(n) => n,
            Err(e) => {
                drop(out);
                discard_partial(&dest);
                return Err(decode_error(entry, e));
            }
        };
        drop(out);

        if let Err(e) = check_member(entry, written, reader.crc().sum()) {
            discard_partial(&dest);
            return Err(e);
        }

        log::debug!("Extracted: {} ({} bytes)", entry.name, written);
        Ok(Some(dest))
    }

    /// Decode a member into memory; meant for small metadata files
    pub fn read(&self, entry: &ArchiveEntry) -> Result<Vec<u8>, UpdateError> {
        let mut reader = CrcReader::new(self.open_member(entry)?);
        let mut data = Vec::with_capacity(entry.uncompressed_size.min(64 * 1024) as usize);
        reader.read_to_end(&mut data).map_err(|e| decode_error(entry, e))?;
        check_member(entry, data.len() as u64, reader.crc().sum())?;
        Ok(data)
    }

    /// Position a reader at the member's data and wrap it in the right decoder
    fn open_member(&self, entry: &ArchiveEntry) -> Result<Box<dyn Read>, UpdateError> {
        if entry.method != METHOD_STORED && entry.method != METHOD_DEFLATE {
            return Err(UpdateError::UnsupportedCompression {
                name: entry.name.clone(),
                method: entry.method,
            });
        }

        let mut file = File::open(&self.path).at(&self.path)?;
        file.seek(SeekFrom::Start(entry.local_header_offset)).at(&self.path)?;

        let mut header = [0u8; LOCAL_HEADER_LEN];
        file.read_exact(&mut header).map_err(|_| {
            UpdateError::CorruptArchive(format!("truncated local header for {}", entry.name))
        })?;
        if header[..4] != LOCAL_HEADER_SIG {
            return Err(UpdateError::CorruptArchive(format!(
                "invalid local header for {}",
                entry.name
            )));
        }

        // Local name/extra lengths can differ from the central directory copy
        let name_len = le_u16(&header, 26) as i64;
        let extra_len = le_u16(&header, 28) as i64;
        file.seek(SeekFrom::Current(name_len + extra_len)).at(&self.path)?;

        let data = BufReader::new(file).take(entry.compressed_size);
        let reader: Box<dyn Read> = match entry.method {
            METHOD_DEFLATE => Box::new(DeflateDecoder::new(data)),
            _ => Box::new(data),
        };
        Ok(reader)
    }
}

fn parse_central_directory(directory: &[u8], entry_count: usize) -> Result<Vec<ArchiveEntry>, UpdateError> {
    let mut entries = Vec::with_capacity(entry_count);
    let mut offset = 0usize;

    for index in 0..entry_count {
        let fixed = directory
            .get(offset..offset + CENTRAL_ENTRY_LEN)
            .ok_or_else(|| truncated(index, entry_count))?;
        if fixed[..4] != CENTRAL_DIR_SIG {
            return Err(UpdateError::CorruptArchive(format!(
                "bad central directory signature at entry {}",
                index
            )));
        }

        let method = le_u16(fixed, 10);
        let crc32 = le_u32(fixed, 16);
        let compressed_size = le_u32(fixed, 20);
        let uncompressed_size = le_u32(fixed, 24);
        let name_len = le_u16(fixed, 28) as usize;
        let extra_len = le_u16(fixed, 30) as usize;
        let comment_len = le_u16(fixed, 32) as usize;
        let local_header_offset = le_u32(fixed, 42);

        if compressed_size == ZIP64_MARKER
            || uncompressed_size == ZIP64_MARKER
            || local_header_offset == ZIP64_MARKER
        {
            return Err(UpdateError::CorruptArchive("ZIP64 members are not supported".into()));
        }

        let name_start = offset + CENTRAL_ENTRY_LEN;
        let name_bytes = directory
            .get(name_start..name_start + name_len)
            .ok_or_else(|| truncated(index, entry_count))?;
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| UpdateError::CorruptArchive(format!("entry {} has a non UTF-8 name", index)))?
            .to_string();
        validate_member_name(&name)?;

        entries.push(ArchiveEntry {
            name,
            method,
            crc32,
            compressed_size: compressed_size as u64,
            uncompressed_size: uncompressed_size as u64,
            local_header_offset: local_header_offset as u64,
        });

        offset = name_start + name_len + extra_len + comment_len;
        if offset > directory.len() {
            return Err(truncated(index, entry_count));
        }
    }

    Ok(entries)
}

/// Reject names that would land outside the extraction directory
fn validate_member_name(name: &str) -> Result<(), UpdateError> {
    let escapes = name.is_empty()
        || name.starts_with('/')
        || name.starts_with('\\')
        || name.contains(':')
        || name.split(['/', '\\']).any(|segment| segment == "..");
    if escapes {
        return Err(UpdateError::CorruptArchive(format!("unsafe member path '{}'", name)));
    }
    Ok(())
}

fn check_member(entry: &ArchiveEntry, written: u64, crc: u32) -> Result<(), UpdateError> {
    if written != entry.uncompressed_size {
        return Err(UpdateError::CorruptArchive(format!(
            "{}: expected {} bytes, decoded {}",
            entry.name, entry.uncompressed_size, written
        )));
    }
    if crc != entry.crc32 {
        return Err(UpdateError::CorruptArchive(format!(
            "{}: CRC-32 mismatch ({:08x} != {:08x})",
            entry.name, crc, entry.crc32
        )));
    }
    Ok(())
}

fn discard_partial(dest: &Path) {
    if let Err(e) = fs::remove_file(dest) {
        log::warn!("Could not remove partial {}: {}", dest.display(), e);
    }
}

fn decode_error(entry: &ArchiveEntry, e: io::Error) -> UpdateError {
    match e.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof => {
            UpdateError::CorruptArchive(format!("{}: {}", entry.name, e))
        }
        _ => UpdateError::io(&entry.name, e),
    }
}

fn truncated(index: usize, count: usize) -> UpdateError {
    UpdateError::CorruptArchive(format!(
        "central directory truncated at entry {} of {}",
        index, count
    ))
}

fn find_last(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .rev()
        .find(|&i| &haystack[i..i + needle.len()] == needle)
}

fn le_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{ZipBuilder, ZipMethod};

    fn build(members: &[(&str, &[u8], ZipMethod)]) -> Vec<u8> {
        let mut zip = ZipBuilder::new(Vec::new());
        for (name, data, method) in members {
            zip.add_file(name, data, *method).unwrap();
        }
        zip.finish().unwrap()
    }

    fn write_archive(dir: &Path, bytes: &[u8]) -> PathBuf {
        let path = dir.join("update.zip");
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_extract_and_read_mixed_methods() {
        let dir = tempfile::tempdir().unwrap();
        let text = b"hello world, hello world, hello world".repeat(40);
        let binary: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 256) as u8).collect();
        let path = write_archive(
            dir.path(),
            &build(&[
                ("manifest.json", &br#"{"version":"2.0.0"}"#[..], ZipMethod::Stored),
                ("lib/text.txt", text.as_slice(), ZipMethod::Deflate),
                ("app.bin", binary.as_slice(), ZipMethod::Deflate),
                ("empty.txt", &b""[..], ZipMethod::Stored),
            ]),
        );

        let archive = ZipArchive::open(&path).unwrap();
        assert_eq!(archive.names(), vec!["manifest.json", "lib/text.txt", "app.bin", "empty.txt"]);

        let out = dir.path().join("out");
        for entry in archive.entries() {
            archive.extract(entry, &out).unwrap();
        }
        assert_eq!(fs::read(out.join("lib/text.txt")).unwrap(), text);
        assert_eq!(fs::read(out.join("app.bin")).unwrap(), binary);
        assert_eq!(fs::read(out.join("empty.txt")).unwrap(), b"");

        let manifest = archive.by_name("manifest.json").unwrap();
        assert_eq!(archive.read(manifest).unwrap(), br#"{"version":"2.0.0"}"#);
    }

    #[test]
    fn test_directory_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut zip = ZipBuilder::new(Vec::new());
        zip.add_directory("lib/").unwrap();
        zip.add_file("lib/a.txt", b"a", ZipMethod::Stored).unwrap();
        let path = write_archive(dir.path(), &zip.finish().unwrap());

        let archive = ZipArchive::open(&path).unwrap();
        let out = dir.path().join("out");
        assert_eq!(archive.extract(&archive.entries()[0], &out).unwrap(), None);
        assert!(archive.extract(&archive.entries()[1], &out).unwrap().is_some());
    }

    #[test]
    fn test_missing_signature_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_archive(dir.path(), &[0u8; 512]);
        assert!(matches!(ZipArchive::open(&path), Err(UpdateError::CorruptArchive(_))));

        let tiny = write_archive(dir.path(), b"PK");
        assert!(matches!(ZipArchive::open(&tiny), Err(UpdateError::CorruptArchive(_))));
    }

    #[test]
    fn test_truncated_directory_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = build(&[
            ("a.txt", &b"aaaa"[..], ZipMethod::Stored),
            ("b.txt", &b"bbbb"[..], ZipMethod::Stored),
        ]);

        // Claim three entries while the directory holds two
        let mut patched = bytes.clone();
        let eocd = find_last(&patched, &END_CENTRAL_DIR_SIG).unwrap();
        patched[eocd + 8] = 3;
        patched[eocd + 10] = 3;
        let path = write_archive(dir.path(), &patched);
        assert!(matches!(ZipArchive::open(&path), Err(UpdateError::CorruptArchive(_))));

        // Directory offset pointing past the end of the file
        let mut patched = bytes;
        let eocd = find_last(&patched, &END_CENTRAL_DIR_SIG).unwrap();
        patched[eocd + 16..eocd + 20].copy_from_slice(&0x00FF_FFFFu32.to_le_bytes());
        let path = write_archive(dir.path(), &patched);
        assert!(matches!(ZipArchive::open(&path), Err(UpdateError::CorruptArchive(_))));
    }

    #[test]
    fn test_unsupported_method() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = build(&[("a.txt", &b"aaaa"[..], ZipMethod::Stored)]);
        // Rewrite the method in the central directory to bzip2 (12)
        let cd = find_last(&bytes, &CENTRAL_DIR_SIG).unwrap();
        bytes[cd + 10] = 12;
        let path = write_archive(dir.path(), &bytes);

        let archive = ZipArchive::open(&path).unwrap();
        let err = archive.extract(&archive.entries()[0], dir.path()).unwrap_err();
        assert!(matches!(err, UpdateError::UnsupportedCompression { method: 12, .. }));
    }

    #[test]
    fn test_crc_mismatch_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = build(&[("a.txt", &b"payload"[..], ZipMethod::Stored)]);
        let cd = find_last(&bytes, &CENTRAL_DIR_SIG).unwrap();
        bytes[cd + 16] ^= 0xFF;
        let path = write_archive(dir.path(), &bytes);

        let archive = ZipArchive::open(&path).unwrap();
        let out = dir.path().join("out");
        let err = archive.extract(&archive.entries()[0], &out).unwrap_err();
        assert!(matches!(err, UpdateError::CorruptArchive(_)));
        assert!(!out.join("a.txt").exists());
    }

    #[test]
    fn test_path_traversal_rejected() {
        assert!(validate_member_name("../boot.bin").is_err());
        assert!(validate_member_name("lib/../../x").is_err());
        assert!(validate_member_name("/abs.bin").is_err());
        assert!(validate_member_name("C:/win.bin").is_err());
        assert!(validate_member_name("lib/ok..name.bin").is_ok());
    }
}

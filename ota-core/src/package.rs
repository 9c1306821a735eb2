//! Release archive writer.
//!
//! Produces the minimal ZIP subset that [`crate::archive::ZipArchive`] reads:
//! stored or raw-deflate members, no ZIP64, no data descriptors. Used by the
//! release tool and by tests to build fixtures.

use flate2::write::DeflateEncoder;
use flate2::{Compression, Crc};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::archive::{METHOD_DEFLATE, METHOD_STORED};
use crate::error::{IoContext, UpdateError};
use crate::fs_util::{self, is_hidden_path};

const VERSION_NEEDED: u16 = 20;
// DOS date/time for 2024-01-01 00:00
const DOS_TIME: u16 = 0;
const DOS_DATE: u16 = ((2024 - 1980) << 9) | (1 << 5) | 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZipMethod {
    Stored,
    Deflate,
}

impl ZipMethod {
    fn code(self) -> u16 {
        match self {
            ZipMethod::Stored => METHOD_STORED,
            ZipMethod::Deflate => METHOD_DEFLATE,
        }
    }
}

struct CentralRecord {
    name: String,
    method: u16,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    offset: u32,
}

pub struct ZipBuilder<W: Write> {
    out: W,
    offset: u64,
    records: Vec<CentralRecord>,
}

impl<W: Write> ZipBuilder<W> {
    pub fn new(out: W) -> Self {
        Self { out, offset: 0, records: Vec::new() }
    }

    pub fn add_file(&mut self, name: &str, data: &[u8], method: ZipMethod) -> io::Result<()> {
        let mut crc = Crc::new();
        crc.update(data);

        let compressed = match method {
            ZipMethod::Stored => data.to_vec(),
            ZipMethod::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
                encoder.write_all(data)?;
                encoder.finish()?
            }
        };

        self.add_raw(name, method.code(), crc.sum(), &compressed, data.len())
    }

    pub fn add_directory(&mut self, name: &str) -> io::Result<()> {
        let name = if name.ends_with('/') { name.to_string() } else { format!("{}/", name) };
        self.add_raw(&name, METHOD_STORED, 0, &[], 0)
    }

    fn add_raw(
        &mut self,
        name: &str,
        method: u16,
        crc32: u32,
        compressed: &[u8],
        uncompressed_len: usize,
    ) -> io::Result<()> {
        let offset = to_u32(self.offset, "archive offset")?;
        let compressed_size = to_u32(compressed.len() as u64, name)?;
        let uncompressed_size = to_u32(uncompressed_len as u64, name)?;
        let name_len = u16::try_from(name.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "member name too long"))?;

        let mut header = Vec::with_capacity(30 + name.len());
        header.extend_from_slice(b"PK\x03\x04");
        put_u16(&mut header, VERSION_NEEDED);
        put_u16(&mut header, 0); // flags
        put_u16(&mut header, method);
        put_u16(&mut header, DOS_TIME);
        put_u16(&mut header, DOS_DATE);
        put_u32(&mut header, crc32);
        put_u32(&mut header, compressed_size);
        put_u32(&mut header, uncompressed_size);
        put_u16(&mut header, name_len);
        put_u16(&mut header, 0); // extra
        header.extend_from_slice(name.as_bytes());

        self.out.write_all(&header)?;
        self.out.write_all(compressed)?;
        self.offset += (header.len() + compressed.len()) as u64;

        self.records.push(CentralRecord {
            name: name.to_string(),
            method,
            crc32,
            compressed_size,
            uncompressed_size,
            offset,
        });
        Ok(())
    }

    /// Write the central directory and return the underlying writer
    pub fn finish(mut self) -> io::Result<W> {
        let cd_offset = to_u32(self.offset, "central directory offset")?;
        let mut directory = Vec::new();
        for record in &self.records {
            directory.extend_from_slice(b"PK\x01\x02");
            put_u16(&mut directory, VERSION_NEEDED); // made by
            put_u16(&mut directory, VERSION_NEEDED);
            put_u16(&mut directory, 0);
            put_u16(&mut directory, record.method);
            put_u16(&mut directory, DOS_TIME);
            put_u16(&mut directory, DOS_DATE);
            put_u32(&mut directory, record.crc32);
            put_u32(&mut directory, record.compressed_size);
            put_u32(&mut directory, record.uncompressed_size);
            put_u16(&mut directory, record.name.len() as u16);
            put_u16(&mut directory, 0); // extra
            put_u16(&mut directory, 0); // comment
            put_u16(&mut directory, 0); // disk
            put_u16(&mut directory, 0); // internal attrs
            put_u32(&mut directory, 0); // external attrs
            put_u32(&mut directory, record.offset);
            directory.extend_from_slice(record.name.as_bytes());
        }

        let entries = u16::try_from(self.records.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many members"))?;
        let cd_size = to_u32(directory.len() as u64, "central directory size")?;

        directory.extend_from_slice(b"PK\x05\x06");
        put_u16(&mut directory, 0);
        put_u16(&mut directory, 0);
        put_u16(&mut directory, entries);
        put_u16(&mut directory, entries);
        put_u32(&mut directory, cd_size);
        put_u32(&mut directory, cd_offset);
        put_u16(&mut directory, 0);

        self.out.write_all(&directory)?;
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Result of packaging a build directory
#[derive(Debug, Clone, Serialize)]
pub struct PackageSummary {
    pub path: PathBuf,
    pub files: usize,
    pub bytes: u64,
    pub sha256: String,
}

/// Zip every non-hidden file under `src` into `out`, sorted by path.
///
/// Text and firmware files are deflated unless `method` is `Stored`; members are
/// named relative to `src` with `/` separators.
pub fn package_directory(src: &Path, out: &Path, method: ZipMethod) -> Result<PackageSummary, UpdateError> {
    let mut files = Vec::new();
    collect_files(src, src, &mut files)?;
    files.sort();

    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    let writer = BufWriter::new(File::create(out).at(out)?);
    let mut zip = ZipBuilder::new(writer);

    for name in &files {
        let path = src.join(name);
        let data = fs::read(&path).at(&path)?;
        zip.add_file(name, &data, method).at(out)?;
        log::debug!("Packaged {} ({} bytes)", name, data.len());
    }
    zip.finish().at(out)?;

    let bytes = fs::metadata(out).at(out)?.len();
    Ok(PackageSummary {
        path: out.to_path_buf(),
        files: files.len(),
        bytes,
        sha256: sha256_file(out)?,
    })
}

fn collect_files(base: &Path, dir: &Path, out: &mut Vec<String>) -> Result<(), UpdateError> {
    for entry in fs::read_dir(dir).at(dir)? {
        let entry = entry.at(dir)?;
        let path = entry.path();
        let Ok(relative) = path.strip_prefix(base) else { continue };
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if is_hidden_path(&name) {
            continue;
        }
        if entry.file_type().at(&path)?.is_dir() {
            collect_files(base, &path, out)?;
        } else {
            out.push(name);
        }
    }
    Ok(())
}

/// Lowercase hex SHA-256 of a file
pub fn sha256_file(path: &Path) -> Result<String, UpdateError> {
    let digest = fs_util::file_digest(path, 8192).at(path)?;
    Ok(fs_util::to_hex(&digest))
}

fn to_u32(value: u64, what: &str) -> io::Result<u32> {
    u32::try_from(value)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("{} exceeds 4 GiB", what)))
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

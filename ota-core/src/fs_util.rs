//! Small filesystem helpers shared by the staging, install and recovery paths.
//!
//! Everything streams through fixed-size buffers; no helper reads a whole file
//! into memory.

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

const COPY_BUFFER_BYTES: usize = 2048;

pub type Sha256Digest = [u8; 32];

/// Remove a file or directory tree; a missing path is not an error
pub fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Copy `src` to `dst`, creating parent directories, and flush to storage
pub fn copy_file(src: &Path, dst: &Path) -> io::Result<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut input = File::open(src)?;
    let mut output = File::create(dst)?;
    let mut buf = [0u8; COPY_BUFFER_BYTES];
    let mut total = 0u64;
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        output.write_all(&buf[..n])?;
        total += n as u64;
    }
    output.sync_all()?;
    Ok(total)
}

/// SHA-256 of a file, read `chunk` bytes at a time
pub fn file_digest(path: &Path, chunk: usize) -> io::Result<Sha256Digest> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk.max(1)];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// True when any path segment is dot-prefixed (`.git/x`, `a/.DS_Store`)
pub fn is_hidden_path(path: &str) -> bool {
    path.split('/').any(|segment| segment.starts_with('.'))
}

/// FAT names compare case-insensitively
pub fn same_name(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Directory with at least one entry
pub fn dir_has_entries(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_path_detection() {
        assert!(is_hidden_path(".staging/app.bin"));
        assert!(is_hidden_path("lib/.cache/x"));
        assert!(is_hidden_path("__MACOSX/._app.bin"));
        assert!(!is_hidden_path("lib/certs/ca_bundle.pem"));
        assert!(!is_hidden_path("manifest.json"));
    }

    #[test]
    fn test_copy_creates_parents_and_digest_matches() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("a/b/dst.bin");
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&src, &data).unwrap();

        assert_eq!(copy_file(&src, &dst).unwrap(), data.len() as u64);
        assert_eq!(fs::read(&dst).unwrap(), data);
        assert_eq!(file_digest(&src, 64).unwrap(), file_digest(&dst, 4096).unwrap());
    }

    #[test]
    fn test_remove_missing_path_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        remove_path(&dir.path().join("nope")).unwrap();

        let nested = dir.path().join("x/y");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("f"), b"1").unwrap();
        remove_path(&dir.path().join("x")).unwrap();
        assert!(!dir.path().join("x").exists());
    }

    #[test]
    fn test_hex_encoding() {
        assert_eq!(to_hex(&[0x00, 0xab, 0x10]), "00ab10");
    }
}

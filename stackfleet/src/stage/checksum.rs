//! Object storage compatible content checksums.
//!
//! Single-part uploads carry the hex MD5 of the body as their ETag.
//! Multipart uploads carry the MD5 of the concatenated part digests with the
//! part count appended. Hashing local files the same way lets the stager
//! compare local and remote content without downloading anything.

use base64::{engine::general_purpose::STANDARD, Engine};
use md5::{Digest, Md5};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Part size used for multipart uploads.
pub const PART_SIZE: usize = 8 * 1024 * 1024;

/// Computes the quoted ETag of an in-memory body.
#[must_use]
pub fn etag_of_bytes(data: &[u8], part_size: usize) -> String {
    let part_size = part_size.max(1);
    if data.len() <= part_size {
        return format!("\"{}\"", hex::encode(Md5::digest(data)));
    }

    let mut digests = Vec::with_capacity(data.len() / part_size * 16 + 16);
    let mut parts = 0usize;
    for chunk in data.chunks(part_size) {
        digests.extend_from_slice(&Md5::digest(chunk));
        parts += 1;
    }
    format!("\"{}-{parts}\"", hex::encode(Md5::digest(&digests)))
}

/// Computes the quoted ETag of a file, streaming it in parts.
pub fn etag_of_file(path: &Path, part_size: usize) -> io::Result<String> {
    let part_size = part_size.max(1);
    let mut file = File::open(path)?;
    let mut buffer = vec![0u8; part_size];
    let mut digests: Vec<u8> = Vec::new();
    let mut parts = 0usize;

    loop {
        let filled = read_full(&mut file, &mut buffer)?;
        if filled == 0 {
            break;
        }
        digests.extend_from_slice(&Md5::digest(&buffer[..filled]));
        parts += 1;
        if filled < part_size {
            break;
        }
    }

    Ok(match parts {
        0 => format!("\"{}\"", hex::encode(Md5::digest(b""))),
        1 => format!("\"{}\"", hex::encode(&digests)),
        n => format!("\"{}-{n}\"", hex::encode(Md5::digest(&digests))),
    })
}

/// Base64 MD5 of a body, as sent in a `Content-MD5` header.
#[must_use]
pub fn content_md5(data: &[u8]) -> String {
    STANDARD.encode(Md5::digest(data))
}

fn read_full(reader: &mut impl Read, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_single_part_is_plain_md5() {
        assert_eq!(
            etag_of_bytes(b"hello world", PART_SIZE),
            "\"5eb63bbbe01eeed093cb22bb8f5acdc3\""
        );
    }

    #[test]
    fn test_empty_body() {
        assert_eq!(etag_of_bytes(b"", PART_SIZE), "\"d41d8cd98f00b204e9800998ecf8427e\"");
    }

    #[test]
    fn test_multipart_suffix() {
        let data = vec![7u8; 25];
        let etag = etag_of_bytes(&data, 10);
        assert!(etag.ends_with("-3\""));

        let mut concat = Vec::new();
        concat.extend_from_slice(&Md5::digest(&data[0..10]));
        concat.extend_from_slice(&Md5::digest(&data[10..20]));
        concat.extend_from_slice(&Md5::digest(&data[20..25]));
        assert_eq!(etag, format!("\"{}-3\"", hex::encode(Md5::digest(&concat))));
    }

    #[test]
    fn test_exact_part_boundary_is_single_part() {
        let data = vec![1u8; 10];
        assert!(!etag_of_bytes(&data, 10).contains('-'));
        assert!(etag_of_bytes(&[1u8; 20], 10).ends_with("-2\""));
    }

    #[test]
    fn test_file_matches_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        for part_size in [64, 1000, 4096] {
            assert_eq!(
                etag_of_file(file.path(), part_size).unwrap(),
                etag_of_bytes(&data, part_size)
            );
        }
    }

    #[test]
    fn test_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(
            etag_of_file(file.path(), PART_SIZE).unwrap(),
            etag_of_bytes(b"", PART_SIZE)
        );
    }

    #[test]
    fn test_content_md5() {
        assert_eq!(content_md5(b""), "1B2M2Y8AsgTpgAmY7PhCfg==");
    }
}

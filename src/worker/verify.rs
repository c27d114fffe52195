// src/worker/verify.rs

//! Structural checks on remuxed output, and content digests.
//!
//! These are not full demuxers. They catch what a failed or interrupted copy
//! remux actually produces: empty files, truncated box trees, and files that
//! are not the requested container at all.

use std::fmt;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, ensure, Context, Result};
use blake3::Hasher;
use serde::{Deserialize, Serialize};

use crate::fs::FileSystem;

/// Output container of the remux step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mp4,
    Mkv,
    Ts,
}

impl Container {
    pub fn extension(self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Mkv => "mkv",
            Container::Ts => "ts",
        }
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for Container {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mp4" => Ok(Container::Mp4),
            "mkv" | "matroska" => Ok(Container::Mkv),
            "ts" | "mpegts" => Ok(Container::Ts),
            other => Err(format!("unsupported container '{other}'; expected mp4, mkv or ts")),
        }
    }
}

const TS_PACKET: usize = 188;
const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

/// Fail unless `path` is non-empty and parses as `container`.
pub fn verify_container(fs: &dyn FileSystem, path: &Path, container: Container) -> Result<()> {
    let len = fs.file_len(path)?;
    ensure!(len > 0, "output {:?} is empty", path);

    let mut reader = fs.open_read(path)?;
    match container {
        Container::Mp4 => verify_mp4(&mut reader, len),
        Container::Mkv => {
            let mut magic = [0u8; 4];
            reader
                .read_exact(&mut magic)
                .context("reading EBML header")?;
            ensure!(magic == EBML_MAGIC, "missing EBML header");
            Ok(())
        }
        Container::Ts => {
            let mut head = vec![0u8; TS_PACKET + 1];
            let n = read_up_to(&mut reader, &mut head)?;
            ensure!(n >= 1 && head[0] == 0x47, "missing MPEG-TS sync byte");
            ensure!(
                n <= TS_PACKET || head[TS_PACKET] == 0x47,
                "MPEG-TS packets are not 188-byte aligned"
            );
            Ok(())
        }
    }
}

/// Walk the top-level ISO-BMFF boxes: `ftyp` first, a `moov` or `moof`
/// somewhere, and box sizes that add up to the file length.
fn verify_mp4(reader: &mut dyn Read, file_len: u64) -> Result<()> {
    let mut offset = 0u64;
    let mut first = true;
    let mut has_movie = false;

    while offset < file_len {
        let mut header = [0u8; 8];
        reader
            .read_exact(&mut header)
            .with_context(|| format!("truncated box header at offset {offset}"))?;
        let size32 = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let kind = [header[4], header[5], header[6], header[7]];

        let (size, header_len) = match size32 {
            0 => (file_len - offset, 8),
            1 => {
                let mut large = [0u8; 8];
                reader
                    .read_exact(&mut large)
                    .with_context(|| format!("truncated largesize at offset {offset}"))?;
                (u64::from_be_bytes(large), 16)
            }
            n => (u64::from(n), 8),
        };

        ensure!(
            size >= header_len,
            "box '{}' at offset {offset} has invalid size {size}",
            String::from_utf8_lossy(&kind)
        );
        ensure!(
            offset.checked_add(size).is_some_and(|end| end <= file_len),
            "box '{}' at offset {offset} runs past end of file",
            String::from_utf8_lossy(&kind)
        );

        if first {
            ensure!(&kind == b"ftyp", "first box is not 'ftyp'");
            first = false;
        }
        if &kind == b"moov" || &kind == b"moof" {
            has_movie = true;
        }

        let body = size - header_len;
        let skipped = io::copy(&mut Read::take(&mut *reader, body), &mut io::sink())?;
        if skipped != body {
            bail!("box body truncated at offset {offset}");
        }
        offset += size;
    }

    ensure!(has_movie, "no 'moov' or 'moof' box");
    Ok(())
}

fn read_up_to(reader: &mut dyn Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// blake3 digest of a file, hex encoded.
pub fn content_digest(fs: &dyn FileSystem, path: &Path) -> Result<String> {
    let mut hasher = Hasher::new();
    let mut reader = fs
        .open_read(path)
        .with_context(|| format!("opening file for hashing: {:?}", path))?;
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

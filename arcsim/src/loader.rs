//! Guest image loaders
//!
//! Three formats: raw binary images placed at a caller-chosen base, Intel
//! HEX, and ELF32 executables (little-endian, PT_LOAD segments only).
//! Loading goes through the ordinary guest-memory write path, so an image
//! landing on already-decoded pages invalidates like any other write.

use crate::mem::GuestMemory;
use itertools::Itertools;
use log::{debug, info};
use sim_types::GuestAddr;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed image: {0}")]
    BadImage(String),
}

/// Loads a raw binary image at `base`. The entry point is the base.
pub fn load_binary_image(
    mem: &mut GuestMemory,
    path: &Path,
    base: GuestAddr,
) -> Result<GuestAddr, LoadError> {
    let bytes = std::fs::read(path)?;
    mem.write_bytes(base, &bytes);
    info!(
        "loaded binary image {} ({} bytes at {base:#010x})",
        path.display(),
        bytes.len()
    );
    Ok(base)
}

/// Loads an Intel-HEX image. Returns the start address from a type-05
/// record when present.
pub fn load_hex_image(mem: &mut GuestMemory, path: &Path) -> Result<Option<GuestAddr>, LoadError> {
    let text = std::fs::read_to_string(path)?;
    let entry = load_hex_bytes(mem, &text)?;
    info!("loaded hex image {}", path.display());
    Ok(entry)
}

/// Parses Intel-HEX text into guest memory.
pub fn load_hex_bytes(mem: &mut GuestMemory, text: &str) -> Result<Option<GuestAddr>, LoadError> {
    let mut upper: u32 = 0;
    let mut entry = None;
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record = parse_hex_record(line)
            .map_err(|reason| LoadError::BadImage(format!("line {}: {reason}", number + 1)))?;
        match record.kind {
            0x00 => {
                let base = upper | record.address as u32;
                mem.write_bytes(base, &record.data);
            }
            0x01 => break,
            0x02 => {
                // extended segment address: bits 4..20
                let segment = be16(&record.data, 0)
                    .ok_or_else(|| LoadError::BadImage(format!("line {}: short record", number + 1)))?;
                upper = (segment as u32) << 4;
            }
            0x04 => {
                let high = be16(&record.data, 0)
                    .ok_or_else(|| LoadError::BadImage(format!("line {}: short record", number + 1)))?;
                upper = (high as u32) << 16;
            }
            0x05 => {
                if record.data.len() != 4 {
                    return Err(LoadError::BadImage(format!(
                        "line {}: bad start address record",
                        number + 1
                    )));
                }
                entry = Some(u32::from_be_bytes([
                    record.data[0],
                    record.data[1],
                    record.data[2],
                    record.data[3],
                ]));
            }
            kind => {
                debug!("ignoring hex record type {kind:#04x}");
            }
        }
    }
    Ok(entry)
}

struct HexRecord {
    address: u16,
    kind: u8,
    data: Vec<u8>,
}

fn be16(data: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*data.get(offset)?, *data.get(offset + 1)?]))
}

fn parse_hex_record(line: &str) -> Result<HexRecord, String> {
    let body = line.strip_prefix(':').ok_or("missing ':' prefix")?;
    if body.len() % 2 != 0 || body.len() < 10 {
        return Err("truncated record".into());
    }
    let bytes: Vec<u8> = body
        .chars()
        .tuples()
        .map(|(hi, lo)| {
            let hi = hi.to_digit(16)?;
            let lo = lo.to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        })
        .collect::<Option<_>>()
        .ok_or("invalid hex digit")?;

    let count = bytes[0] as usize;
    if bytes.len() != count + 5 {
        return Err(format!("length field {count} does not match record"));
    }
    let checksum: u8 = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if checksum != 0 {
        return Err("checksum mismatch".into());
    }
    Ok(HexRecord {
        address: u16::from_be_bytes([bytes[1], bytes[2]]),
        kind: bytes[3],
        data: bytes[4..4 + count].to_vec(),
    })
}

/// Loads an ELF32 executable, returning its entry point.
pub fn load_elf_image(mem: &mut GuestMemory, path: &Path) -> Result<GuestAddr, LoadError> {
    let bytes = std::fs::read(path)?;
    let entry = load_elf_bytes(mem, &bytes)?;
    info!("loaded ELF {} (entry {entry:#010x})", path.display());
    Ok(entry)
}

fn le16(bytes: &[u8], offset: usize) -> Result<u16, LoadError> {
    let slice = bytes
        .get(offset..offset + 2)
        .ok_or_else(|| LoadError::BadImage("truncated ELF header".into()))?;
    Ok(u16::from_le_bytes([slice[0], slice[1]]))
}

fn le32(bytes: &[u8], offset: usize) -> Result<u32, LoadError> {
    let slice = bytes
        .get(offset..offset + 4)
        .ok_or_else(|| LoadError::BadImage("truncated ELF header".into()))?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

/// Parses an ELF32 little-endian executable and maps its PT_LOAD segments.
pub fn load_elf_bytes(mem: &mut GuestMemory, bytes: &[u8]) -> Result<GuestAddr, LoadError> {
    if bytes.len() < 52 || &bytes[0..4] != b"\x7fELF" {
        return Err(LoadError::BadImage("not an ELF file".into()));
    }
    if bytes[4] != 1 {
        return Err(LoadError::BadImage("not a 32-bit ELF".into()));
    }
    if bytes[5] != 1 {
        return Err(LoadError::BadImage("not little-endian".into()));
    }

    let entry = le32(bytes, 0x18)?;
    let phoff = le32(bytes, 0x1c)? as usize;
    let phentsize = le16(bytes, 0x2a)? as usize;
    let phnum = le16(bytes, 0x2c)? as usize;
    if phentsize < 32 {
        return Err(LoadError::BadImage("bad program header size".into()));
    }

    const PT_LOAD: u32 = 1;
    for index in 0..phnum {
        let base = phoff + index * phentsize;
        let p_type = le32(bytes, base)?;
        if p_type != PT_LOAD {
            continue;
        }
        let offset = le32(bytes, base + 4)? as usize;
        let vaddr = le32(bytes, base + 8)?;
        let filesz = le32(bytes, base + 16)? as usize;
        let memsz = le32(bytes, base + 20)? as usize;
        if memsz < filesz {
            return Err(LoadError::BadImage("segment memsz < filesz".into()));
        }
        let data = bytes.get(offset..offset + filesz).ok_or_else(|| {
            LoadError::BadImage(format!("segment {index} extends past end of file"))
        })?;
        mem.write_bytes(vaddr, data);
        if memsz > filesz {
            // zero-fill (and thereby map) the bss tail
            mem.write_bytes(vaddr + filesz as u32, &vec![0u8; memsz - filesz]);
        }
        debug!("mapped segment {index}: {vaddr:#010x} + {memsz:#x}");
    }
    Ok(entry)
}

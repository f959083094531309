//! Shared archive builders for integration tests.
//!
//! `RawZip` writes LFH/CEN/EOCD records by hand so tests can produce archives
//! no well-behaved library would (mismatched names, traversal names, symlink
//! modes, lying sizes). `library_zip` goes through the `zip` crate for
//! realistic archives.

#![allow(dead_code)]

use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

const HOST_UNIX: u16 = 3;
const HOST_DOS: u16 = 0;
const S_IFLNK: u32 = 0o120000;

#[derive(Debug, Clone)]
pub struct RawEntry {
    pub local_name: Vec<u8>,
    pub central_name: Vec<u8>,
    pub data: Vec<u8>,
    pub deflate: bool,
    pub host: u16,
    pub external_attributes: u32,
    pub flags: u16,
    /// Override of the declared uncompressed size in both headers
    pub declared_size: Option<u32>,
    /// Sizes written after the data instead of in the local header
    pub data_descriptor: bool,
}

impl RawEntry {
    pub fn stored(name: &str, data: &[u8]) -> Self {
        Self {
            local_name: name.as_bytes().to_vec(),
            central_name: name.as_bytes().to_vec(),
            data: data.to_vec(),
            deflate: false,
            host: HOST_DOS,
            external_attributes: 0,
            flags: 0,
            declared_size: None,
            data_descriptor: false,
        }
    }

    pub fn deflated(name: &str, data: &[u8]) -> Self {
        Self {
            deflate: true,
            ..Self::stored(name, data)
        }
    }

    /// Unix symlink whose content is the link target
    pub fn symlink(name: &str, target: &str) -> Self {
        Self {
            host: HOST_UNIX,
            external_attributes: (S_IFLNK | 0o777) << 16,
            ..Self::stored(name, target.as_bytes())
        }
    }

    pub fn with_central_name(mut self, name: &str) -> Self {
        self.central_name = name.as_bytes().to_vec();
        self
    }

    pub fn with_host(mut self, host: u16) -> Self {
        self.host = host;
        self
    }

    pub fn with_external_attributes(mut self, attributes: u32) -> Self {
        self.external_attributes = attributes;
        self
    }

    pub fn with_declared_size(mut self, size: u32) -> Self {
        self.declared_size = Some(size);
        self
    }

    /// Zero sizes in the local header, flag bit 3, descriptor after the data
    pub fn with_data_descriptor(mut self) -> Self {
        self.data_descriptor = true;
        self.flags |= 0x0008;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RawZip {
    entries: Vec<RawEntry>,
    central_order: Option<Vec<usize>>,
    prefix: Vec<u8>,
    without_directory: bool,
}

impl RawZip {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(mut self, entry: RawEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Emit central records in this order (indices into the entries)
    pub fn central_order(mut self, order: &[usize]) -> Self {
        self.central_order = Some(order.to_vec());
        self
    }

    /// Bytes placed before the first local header (self-extracting stub)
    pub fn prefix(mut self, prefix: &[u8]) -> Self {
        self.prefix = prefix.to_vec();
        self
    }

    /// Local headers only, no central directory or EOCD
    pub fn without_directory(mut self) -> Self {
        self.without_directory = true;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = self.prefix.clone();
        let mut records: Vec<(usize, Vec<u8>, u16)> = Vec::new();

        for entry in &self.entries {
            let (method, body) = if entry.deflate {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
                encoder.write_all(&entry.data).unwrap();
                (8u16, encoder.finish().unwrap())
            } else {
                (0u16, entry.data.clone())
            };
            let size = entry.declared_size.unwrap_or(entry.data.len() as u32);
            // offsets are relative to the archive start, past any prefix
            let offset = out.len() - self.prefix.len();

            out.extend_from_slice(b"PK\x03\x04");
            out.extend_from_slice(&20u16.to_le_bytes());
            out.extend_from_slice(&entry.flags.to_le_bytes());
            out.extend_from_slice(&method.to_le_bytes());
            out.extend_from_slice(&[0u8; 8]);
            if entry.data_descriptor {
                out.extend_from_slice(&[0u8; 8]);
            } else {
                out.extend_from_slice(&(body.len() as u32).to_le_bytes());
                out.extend_from_slice(&size.to_le_bytes());
            }
            out.extend_from_slice(&(entry.local_name.len() as u16).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&entry.local_name);
            out.extend_from_slice(&body);
            if entry.data_descriptor {
                out.extend_from_slice(b"PK\x07\x08");
                out.extend_from_slice(&0u32.to_le_bytes());
                out.extend_from_slice(&(body.len() as u32).to_le_bytes());
                out.extend_from_slice(&size.to_le_bytes());
            }

            records.push((offset, body, method));
        }

        if self.without_directory {
            return out;
        }

        let order: Vec<usize> = self
            .central_order
            .clone()
            .unwrap_or_else(|| (0..self.entries.len()).collect());

        let cd_offset = out.len() - self.prefix.len();
        let mut central = Vec::new();
        for &idx in &order {
            let entry = &self.entries[idx];
            let (offset, body, method) = &records[idx];
            let size = entry.declared_size.unwrap_or(entry.data.len() as u32);

            central.extend_from_slice(b"PK\x01\x02");
            central.extend_from_slice(&(entry.host << 8 | 20).to_le_bytes());
            central.extend_from_slice(&20u16.to_le_bytes());
            central.extend_from_slice(&entry.flags.to_le_bytes());
            central.extend_from_slice(&method.to_le_bytes());
            central.extend_from_slice(&[0u8; 8]);
            central.extend_from_slice(&(body.len() as u32).to_le_bytes());
            central.extend_from_slice(&size.to_le_bytes());
            central.extend_from_slice(&(entry.central_name.len() as u16).to_le_bytes());
            central.extend_from_slice(&[0u8; 8]);
            central.extend_from_slice(&entry.external_attributes.to_le_bytes());
            central.extend_from_slice(&(*offset as u32).to_le_bytes());
            central.extend_from_slice(&entry.central_name);
        }
        out.extend_from_slice(&central);

        out.extend_from_slice(b"PK\x05\x06");
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&(order.len() as u16).to_le_bytes());
        out.extend_from_slice(&(order.len() as u16).to_le_bytes());
        out.extend_from_slice(&(central.len() as u32).to_le_bytes());
        out.extend_from_slice(&(cd_offset as u32).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out
    }
}

/// Stored single-level archive with matching headers
pub fn simple_zip(files: &[(&str, &[u8])]) -> Vec<u8> {
    files
        .iter()
        .fold(RawZip::new(), |zip, (name, data)| {
            zip.entry(RawEntry::stored(name, data))
        })
        .build()
}

/// Chain of archives nested `levels` deep; the innermost holds `leaf.txt`.
/// The outermost entry is `level{levels-1}.zip`.
pub fn nested_zip(levels: usize, leaf: &[u8]) -> Vec<u8> {
    let mut current = simple_zip(&[("leaf.txt", leaf)]);
    for level in 1..levels {
        let name = format!("level{}.zip", level);
        current = simple_zip(&[(name.as_str(), current.as_slice())]);
    }
    current
}

/// Archive written by the `zip` crate
pub fn library_zip(files: &[(&str, &[u8])], method: CompressionMethod) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(method);
    for (name, content) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

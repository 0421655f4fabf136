//! Firmware image parsing and flash write planning.
//!
//! A firmware file is a JSON document whose `sections` object maps section
//! names to `{lma, size, contents}`, with `contents` base64 encoded. Sections
//! are kept in name order. Everything is validated here, before the device is
//! asked to erase anything.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::protocol::constants::{
    FLASH_BASE_ADDRESS, FLASH_ERASABLE_PAGES, FLASH_PAGE_SIZE, FLASH_WRITE_CHUNK_SIZE,
};

#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("Invalid firmware description: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Firmware description has no sections")]
    NoSections,
    #[error("Section {name}: contents are not valid base64: {source}")]
    Base64 {
        name: String,
        #[source]
        source: base64::DecodeError,
    },
    #[error("Section {name}: declared size {declared}, contents are {actual} bytes")]
    LengthMismatch {
        name: String,
        declared: u64,
        actual: usize,
    },
    #[error("Section {name}: address range does not fit in 32 bits")]
    AddressOverflow { name: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Deserialize)]
struct RawImage {
    sections: BTreeMap<String, RawSection>,
}

#[derive(Deserialize)]
struct RawSection {
    lma: u64,
    size: u64,
    contents: String,
}

/// One named byte range of the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareSection {
    pub name: String,
    pub load_address: u32,
    pub contents: Vec<u8>,
}

impl FirmwareSection {
    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    /// One past the last byte.
    pub fn end_address(&self) -> u32 {
        self.load_address + self.contents.len() as u32
    }
}

/// Validated firmware image. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    sections: Vec<FirmwareSection>,
}

impl FirmwareImage {
    /// Parse a firmware description.
    pub fn from_json(data: &[u8]) -> Result<Self, FirmwareError> {
        let raw: RawImage = serde_json::from_slice(data)?;
        if raw.sections.is_empty() {
            return Err(FirmwareError::NoSections);
        }

        let mut sections = Vec::with_capacity(raw.sections.len());
        for (name, section) in raw.sections {
            let contents = STANDARD
                .decode(section.contents.trim())
                .map_err(|source| FirmwareError::Base64 {
                    name: name.clone(),
                    source,
                })?;
            if contents.len() as u64 != section.size {
                return Err(FirmwareError::LengthMismatch {
                    name,
                    declared: section.size,
                    actual: contents.len(),
                });
            }
            let end = section.lma.checked_add(section.size);
            let load_address = match (u32::try_from(section.lma), end) {
                (Ok(addr), Some(end)) if end <= u64::from(u32::MAX) => addr,
                _ => return Err(FirmwareError::AddressOverflow { name }),
            };
            debug!(
                section = %name,
                lma = format!("0x{:08X}", load_address),
                size = contents.len(),
                "Firmware section"
            );
            sections.push(FirmwareSection {
                name,
                load_address,
                contents,
            });
        }

        let image = Self { sections };
        info!(
            sections = image.sections.len(),
            bytes = image.total_bytes(),
            "Firmware image parsed"
        );
        Ok(image)
    }

    /// Load and parse a firmware file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, FirmwareError> {
        let data = std::fs::read(path)?;
        Self::from_json(&data)
    }

    pub fn sections(&self) -> &[FirmwareSection] {
        &self.sections
    }

    /// Sum of all section sizes.
    pub fn total_bytes(&self) -> u64 {
        self.sections.iter().map(|s| s.len() as u64).sum()
    }

    /// Sorted indices of every flash page touched by a section.
    ///
    /// Pages before the flash base or past the erasable range are skipped.
    pub fn erase_pages(&self) -> Vec<u16> {
        let page_size = i64::from(FLASH_PAGE_SIZE);
        let mut pages = BTreeSet::new();
        for section in self.sections.iter().filter(|s| !s.is_empty()) {
            let start = i64::from(section.load_address) - i64::from(FLASH_BASE_ADDRESS);
            let last = start + section.len() as i64 - 1;
            let first_page = start.div_euclid(page_size).max(0);
            let last_page = last.div_euclid(page_size).min(FLASH_ERASABLE_PAGES - 1);
            for page in first_page..=last_page {
                pages.insert(page as u16);
            }
        }
        pages.into_iter().collect()
    }

    /// Number of `write_flash` commands needed for the whole image.
    pub fn write_command_count(&self) -> usize {
        self.sections
            .iter()
            .map(|s| s.len().div_ceil(FLASH_WRITE_CHUNK_SIZE))
            .sum()
    }
}

/// Position of the flash write loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareWriteCursor {
    section_index: usize,
    write_address: u32,
    bytes_written_in_section: usize,
    total_bytes_written: u64,
    in_flight: usize,
}

impl FirmwareWriteCursor {
    pub fn new(image: &FirmwareImage) -> Self {
        let mut cursor = Self::default();
        cursor.settle(image);
        cursor
    }

    pub fn section_index(&self) -> usize {
        self.section_index
    }

    pub fn write_address(&self) -> u32 {
        self.write_address
    }

    pub fn bytes_written_in_section(&self) -> usize {
        self.bytes_written_in_section
    }

    /// Bytes acknowledged by the device so far.
    pub fn total_bytes_written(&self) -> u64 {
        self.total_bytes_written
    }

    pub fn is_exhausted(&self, image: &FirmwareImage) -> bool {
        self.section_index >= image.sections.len()
    }

    /// Next `(address, bytes)` to write, advancing past it.
    ///
    /// At most [`FLASH_WRITE_CHUNK_SIZE`] bytes; when the rest of the section
    /// fits, exactly the rest is returned and the cursor moves on to the next
    /// section.
    pub fn next_chunk(&mut self, image: &FirmwareImage) -> Option<(u32, Vec<u8>)> {
        let section = image.sections.get(self.section_index)?;
        let offset = self.bytes_written_in_section;
        let remaining = section.len() - offset;
        let size = remaining.min(FLASH_WRITE_CHUNK_SIZE);
        let address = self.write_address;
        let data = section.contents[offset..offset + size].to_vec();

        if remaining <= FLASH_WRITE_CHUNK_SIZE {
            self.section_index += 1;
            self.bytes_written_in_section = 0;
            self.settle(image);
        } else {
            self.bytes_written_in_section += size;
            self.write_address += size as u32;
        }
        self.in_flight = size;
        Some((address, data))
    }

    /// The last chunk was written.
    pub fn acknowledge(&mut self) {
        self.total_bytes_written += self.in_flight as u64;
        self.in_flight = 0;
    }

    fn settle(&mut self, image: &FirmwareImage) {
        while let Some(section) = image.sections.get(self.section_index) {
            if !section.is_empty() {
                self.write_address = section.load_address;
                return;
            }
            self.section_index += 1;
        }
    }
}

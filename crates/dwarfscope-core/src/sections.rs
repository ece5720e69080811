//! # Section Registry
//!
//! The byte ranges handed to the engine by the object-file reader.
//!
//! Each range is addressed by a `(section, offset, length)` triple over a
//! shared backing buffer; the engine never assumes that two sections are
//! contiguous or that a section starts at the beginning of its buffer.

use std::collections::HashMap;
use std::sync::Arc;

use gimli::{RunTimeEndian, SectionId};

use crate::error::{DwarfError, Result};

/// One registered section: a window into a shared buffer.
#[derive(Debug, Clone)]
pub struct SectionData
{
    backing: Arc<[u8]>,
    offset: usize,
    len: usize,
    address: u64,
}

impl SectionData
{
    /// The section's bytes.
    pub fn bytes(&self) -> &[u8]
    {
        &self.backing[self.offset..self.offset + self.len]
    }

    /// Load address of the section (used for pc-relative `.eh_frame` pointers).
    pub fn address(&self) -> u64
    {
        self.address
    }
}

/// The set of DWARF sections an image is decoded from.
#[derive(Debug, Clone)]
pub struct Sections
{
    endian: RunTimeEndian,
    sections: HashMap<SectionId, SectionData>,
}

impl Sections
{
    pub fn new(endian: RunTimeEndian) -> Self
    {
        Self {
            endian,
            sections: HashMap::new(),
        }
    }

    pub fn endian(&self) -> RunTimeEndian
    {
        self.endian
    }

    /// Register `len` bytes of `backing` starting at `offset` as section `id`.
    ///
    /// ## Errors
    ///
    /// Returns `UnexpectedEof` if the window lies outside the buffer.
    pub fn insert_range(&mut self, id: SectionId, backing: Arc<[u8]>, offset: usize, len: usize) -> Result<()>
    {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= backing.len())
            .ok_or(DwarfError::UnexpectedEof { offset })?;
        tracing::trace!(section = id.name(), offset, end, "registered section range");
        self.sections.insert(
            id,
            SectionData {
                backing,
                offset,
                len,
                address: 0,
            },
        );
        Ok(())
    }

    /// Register a whole owned buffer as section `id`.
    pub fn insert(&mut self, id: SectionId, bytes: impl Into<Arc<[u8]>>)
    {
        let backing: Arc<[u8]> = bytes.into();
        let len = backing.len();
        self.sections.insert(
            id,
            SectionData {
                backing,
                offset: 0,
                len,
                address: 0,
            },
        );
    }

    /// Builder form of [`Sections::insert`].
    #[must_use]
    pub fn with(mut self, id: SectionId, bytes: impl Into<Arc<[u8]>>) -> Self
    {
        self.insert(id, bytes);
        self
    }

    /// Record the load address of an already registered section.
    pub fn set_address(&mut self, id: SectionId, address: u64)
    {
        if let Some(section) = self.sections.get_mut(&id) {
            section.address = address;
        }
    }

    pub fn get(&self, id: SectionId) -> Option<&SectionData>
    {
        self.sections.get(&id)
    }

    /// Bytes of an optional section; absent sections read as empty.
    pub fn data(&self, id: SectionId) -> &[u8]
    {
        self.sections.get(&id).map_or(&[][..], SectionData::bytes)
    }

    /// Bytes of a section the caller cannot work without.
    ///
    /// ## Errors
    ///
    /// Returns `MissingSection` if the section was never registered.
    pub fn require(&self, id: SectionId) -> Result<&[u8]>
    {
        self.sections
            .get(&id)
            .map(SectionData::bytes)
            .ok_or(DwarfError::MissingSection(id))
    }

    pub fn contains(&self, id: SectionId) -> bool
    {
        self.sections.contains_key(&id)
    }

    /// Look up a NUL-terminated string in `.debug_str`.
    pub fn string_at(&self, offset: u64) -> Option<String>
    {
        let offset = usize::try_from(offset).ok()?;
        crate::reader::cstr_at(self.data(SectionId::DebugStr), offset)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }
}

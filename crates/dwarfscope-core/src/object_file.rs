//! Loading [`Sections`] out of an object file with the `object` crate.

use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;

use gimli::{RunTimeEndian, SectionId};
use object::{Object, ObjectSection};

use crate::error::{DwarfError, Result};
use crate::sections::Sections;

/// Sections the engine consumes, with their ELF and Mach-O spellings.
const DWARF_SECTIONS: &[(SectionId, &[&str])] = &[
    (SectionId::DebugAbbrev, &[".debug_abbrev", "__debug_abbrev"]),
    (SectionId::DebugInfo, &[".debug_info", "__debug_info"]),
    (SectionId::DebugLine, &[".debug_line", "__debug_line"]),
    (SectionId::DebugLoc, &[".debug_loc", "__debug_loc"]),
    (SectionId::DebugRanges, &[".debug_ranges", "__debug_ranges"]),
    (SectionId::DebugStr, &[".debug_str", "__debug_str"]),
    (SectionId::DebugFrame, &[".debug_frame", "__debug_frame"]),
    (SectionId::EhFrame, &[".eh_frame", "__eh_frame"]),
];

fn load_section<'data>(file: &object::File<'data>, names: &[&str]) -> Result<Option<(Arc<[u8]>, u64)>>
{
    for name in names {
        if let Some(section) = file.section_by_name(name) {
            let data = section
                .uncompressed_data()
                .map_err(|err| DwarfError::ObjectFile(format!("failed to read {name}: {err}")))?;
            let data: Arc<[u8]> = match data {
                Cow::Borrowed(bytes) => Arc::from(bytes),
                Cow::Owned(vec) => vec.into(),
            };
            return Ok(Some((data, section.address())));
        }
    }

    Ok(None)
}

impl Sections
{
    /// Collect the DWARF sections of a parsed object file.
    ///
    /// Compressed sections are decompressed. Sections the file lacks are
    /// simply not registered.
    ///
    /// ## Errors
    ///
    /// Returns `ObjectFile` if a present section cannot be read.
    pub fn from_object(file: &object::File<'_>) -> Result<Self>
    {
        let endian = if file.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };
        let mut sections = Sections::new(endian);
        for (id, aliases) in DWARF_SECTIONS {
            if let Some((data, address)) = load_section(file, aliases)? {
                tracing::debug!(section = id.name(), len = data.len(), "loaded section");
                sections.insert(*id, data);
                sections.set_address(*id, address);
            }
        }
        Ok(sections)
    }

    /// Parse an object file from raw bytes and collect its DWARF sections.
    ///
    /// ## Errors
    ///
    /// Returns `ObjectFile` if the bytes are not a recognised object format.
    pub fn from_object_bytes(bytes: &[u8]) -> Result<Self>
    {
        let file = object::File::parse(bytes).map_err(|err| DwarfError::ObjectFile(err.to_string()))?;
        Self::from_object(&file)
    }

    /// Read an object file from disk and collect its DWARF sections.
    ///
    /// ## Errors
    ///
    /// Returns `Io` if the file cannot be read, or `ObjectFile` if it cannot be parsed.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self>
    {
        let bytes = std::fs::read(path)?;
        Self::from_object_bytes(&bytes)
    }
}

//! # Compilation Units and the DIE Tree
//!
//! A `.debug_info` unit is a header followed by a flattened pre-order
//! stream of DIEs. Sibling and child links are never stored; they are
//! recovered from traversal order and each abbreviation's `has_children`
//! flag. A null entry (code 0) closes the current parent.
//!
//! DIEs live in a per-unit arena in decode order, so arena order, pre-order
//! and increasing offset are the same thing.

use std::collections::HashMap;
use std::sync::Arc;

use gimli::constants::{self, DwAt, DwTag};
use gimli::RunTimeEndian;

use crate::abbrev::AbbreviationTable;
use crate::attribute::{read_attribute, Attribute, AttributeValue};
use crate::error::{DwarfError, Result};
use crate::line::LineTable;
use crate::reader::{Encoding, Reader};
use crate::sections::Sections;

/// Decoded unit header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitHeader
{
    /// Offset of the header in `.debug_info`
    pub offset: usize,
    /// Value of the initial length field
    pub unit_length: u64,
    pub version: u16,
    pub abbrev_offset: usize,
    pub address_size: u8,
    /// 4 for 32-bit DWARF, 8 for 64-bit DWARF
    pub offset_size: u8,
    /// Offset of the first DIE
    pub entries_offset: usize,
}

impl UnitHeader
{
    /// Decode the header at `offset`.
    ///
    /// ## Errors
    ///
    /// Returns `TruncatedUnit` if the header or the declared unit extends past
    /// the section, and `UnsupportedVersion` for versions outside 2..=4.
    pub fn parse(info: &[u8], offset: usize, endian: RunTimeEndian) -> Result<Self>
    {
        let truncated = |_| DwarfError::TruncatedUnit {
            unit: offset,
            offset: info.len(),
        };
        let bytes = info.get(offset..).ok_or(DwarfError::TruncatedUnit {
            unit: offset,
            offset: info.len(),
        })?;
        let mut reader = Reader::new(bytes, offset, endian);
        let unit_length = reader.initial_length().map_err(truncated)?;
        let offset_size = reader.offset_size();
        let after_length = reader.offset();
        let version = reader.u16().map_err(truncated)?;
        if !(2..=4).contains(&version) {
            return Err(DwarfError::UnsupportedVersion { offset, version });
        }
        let abbrev_offset = reader.section_offset().map_err(truncated)? as usize;
        let address_size = reader.u8().map_err(truncated)?;

        let header = Self {
            offset,
            unit_length,
            version,
            abbrev_offset,
            address_size,
            offset_size,
            entries_offset: reader.offset(),
        };
        let end = usize::try_from(unit_length)
            .ok()
            .and_then(|len| after_length.checked_add(len));
        match end {
            Some(end) if end <= info.len() && end >= header.entries_offset => Ok(header),
            _ => Err(DwarfError::TruncatedUnit {
                unit: offset,
                offset: info.len(),
            }),
        }
    }

    /// Offset one past the last byte of the unit.
    pub fn end(&self) -> usize
    {
        let length_field = if self.offset_size == 8 { 12 } else { 4 };
        self.offset + length_field + self.unit_length as usize
    }

    pub fn encoding(&self, endian: RunTimeEndian) -> Encoding
    {
        Encoding {
            address_size: self.address_size,
            offset_size: self.offset_size,
            version: self.version,
            endian,
        }
    }
}

/// Walk `.debug_info` and return the offset of every unit header.
///
/// Stops at the first header whose length field cannot be read or whose
/// unit runs past the section; that unit is returned with its error so it
/// can be reported.
pub fn scan_unit_offsets(info: &[u8], endian: RunTimeEndian) -> Vec<(usize, Result<UnitHeader>)>
{
    let mut units = Vec::new();
    let mut offset = 0;
    while offset < info.len() {
        let header = UnitHeader::parse(info, offset, endian);
        let next = match &header {
            Ok(header) => Some(header.end()),
            // Versions we do not decode can still be skipped over by their length.
            Err(DwarfError::UnsupportedVersion { .. }) => {
                let mut reader = Reader::new(&info[offset..], offset, endian);
                reader
                    .initial_length()
                    .ok()
                    .and_then(|len| usize::try_from(len).ok())
                    .and_then(|len| reader.offset().checked_add(len))
            }
            Err(_) => None,
        };
        units.push((offset, header));
        match next {
            Some(next) if next > offset && next <= info.len() => offset = next,
            _ => break,
        }
    }
    units
}

/// Index of a DIE within its unit's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DieId(pub usize);

/// One debugging information entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Die
{
    /// Absolute `.debug_info` offset; unique across the image
    pub offset: usize,
    pub tag: DwTag,
    pub has_children: bool,
    pub attributes: Vec<Attribute>,
    pub parent: Option<DieId>,
    pub children: Vec<DieId>,
}

impl Die
{
    pub fn attr(&self, name: DwAt) -> Option<&AttributeValue>
    {
        self.attributes
            .iter()
            .find(|attr| attr.name == name)
            .map(|attr| &attr.value)
    }

    pub fn attribute(&self, name: DwAt) -> Option<&Attribute>
    {
        self.attributes.iter().find(|attr| attr.name == name)
    }

    pub fn has_attr(&self, name: DwAt) -> bool
    {
        self.attr(name).is_some()
    }

    pub fn flag(&self, name: DwAt) -> bool
    {
        self.attr(name).and_then(AttributeValue::flag).unwrap_or(false)
    }

    pub fn udata(&self, name: DwAt) -> Option<u64>
    {
        self.attr(name).and_then(AttributeValue::udata)
    }
}

/// A decoded compilation unit: header, shared abbreviations and DIE arena.
#[derive(Debug, Clone)]
pub struct CompilationUnit
{
    header: UnitHeader,
    encoding: Encoding,
    abbreviations: Arc<AbbreviationTable>,
    dies: Vec<Die>,
    by_offset: HashMap<usize, DieId>,
    lines: Option<Arc<LineTable>>,
}

impl CompilationUnit
{
    /// Rebuild the DIE tree of the unit described by `header`.
    ///
    /// ## Errors
    ///
    /// - `TruncatedUnit` if decoding runs past the unit's end or the unit ends with open parents
    /// - `UnbalancedTree` if a null entry precedes the root or a second DIE follows the closed root
    /// - `UnknownAbbrevCode` for a code missing from `abbreviations`
    /// - `IllegalForm` for an attribute encoded with a form it cannot take
    pub fn parse(info: &[u8], header: UnitHeader, abbreviations: Arc<AbbreviationTable>, endian: RunTimeEndian)
        -> Result<Self>
    {
        let unit = header.offset;
        let end = header.end().min(info.len());
        let entries = info.get(header.entries_offset..end).unwrap_or(&[]);
        let mut reader = Reader::new(entries, header.entries_offset, endian)
            .with_address_size(header.address_size)
            .with_offset_size(header.offset_size);
        let truncated = |err: DwarfError| match err {
            DwarfError::UnexpectedEof { offset } => DwarfError::TruncatedUnit { unit, offset },
            other => other,
        };

        let mut dies: Vec<Die> = Vec::new();
        let mut by_offset = HashMap::new();
        let mut parents: Vec<DieId> = Vec::new();

        while !reader.is_empty() {
            let offset = reader.offset();
            let code = reader.uleb128().map_err(truncated)?;
            if code == 0 {
                // Nulls after the root has closed are padding.
                if parents.pop().is_none() && dies.is_empty() {
                    return Err(DwarfError::UnbalancedTree { unit, offset });
                }
                continue;
            }
            // Only the root may sit outside every parent.
            if !dies.is_empty() && parents.is_empty() {
                return Err(DwarfError::UnbalancedTree { unit, offset });
            }

            let abbrev = abbreviations
                .get(code)
                .ok_or(DwarfError::UnknownAbbrevCode { unit, offset, code })?;
            let mut attributes = Vec::with_capacity(abbrev.attributes.len());
            for spec in &abbrev.attributes {
                let attr =
                    read_attribute(&mut reader, offset, spec.name, spec.form, header.version).map_err(truncated)?;
                attributes.push(attr);
            }

            let id = DieId(dies.len());
            let parent = parents.last().copied();
            if let Some(parent) = parent {
                dies[parent.0].children.push(id);
            }
            dies.push(Die {
                offset,
                tag: abbrev.tag,
                has_children: abbrev.has_children,
                attributes,
                parent,
                children: Vec::new(),
            });
            by_offset.insert(offset, id);
            if abbrev.has_children {
                parents.push(id);
            }
        }

        if !parents.is_empty() || dies.is_empty() {
            return Err(DwarfError::TruncatedUnit {
                unit,
                offset: reader.offset(),
            });
        }

        tracing::trace!(unit, dies = dies.len(), "rebuilt DIE tree");
        Ok(Self {
            header,
            encoding: header.encoding(endian),
            abbreviations,
            dies,
            by_offset,
            lines: None,
        })
    }

    pub(crate) fn set_lines(&mut self, lines: Arc<LineTable>)
    {
        self.lines = Some(lines);
    }

    pub fn header(&self) -> &UnitHeader
    {
        &self.header
    }

    pub fn offset(&self) -> usize
    {
        self.header.offset
    }

    pub fn encoding(&self) -> Encoding
    {
        self.encoding
    }

    pub fn abbreviations(&self) -> &Arc<AbbreviationTable>
    {
        &self.abbreviations
    }

    /// The decoded line table, if the unit has a `DW_AT_stmt_list`.
    pub fn lines(&self) -> Option<&Arc<LineTable>>
    {
        self.lines.as_ref()
    }

    pub fn root(&self) -> &Die
    {
        &self.dies[0]
    }

    pub fn die(&self, id: DieId) -> &Die
    {
        &self.dies[id.0]
    }

    pub fn die_id(&self, offset: usize) -> Option<DieId>
    {
        self.by_offset.get(&offset).copied()
    }

    pub fn die_at(&self, offset: usize) -> Option<&Die>
    {
        self.die_id(offset).map(|id| self.die(id))
    }

    /// All DIEs in decode order.
    pub fn dies(&self) -> &[Die]
    {
        &self.dies
    }

    pub fn contains_offset(&self, offset: usize) -> bool
    {
        (self.header.offset..self.header.end()).contains(&offset)
    }

    /// Base address for location and range lists: the root's `DW_AT_low_pc`.
    pub fn base_address(&self) -> u64
    {
        self.root()
            .attr(constants::DW_AT_low_pc)
            .and_then(AttributeValue::address)
            .unwrap_or(0)
    }

    /// Compilation directory named by the root DIE.
    pub fn comp_dir(&self, sections: &Sections) -> Option<String>
    {
        self.root()
            .attr(constants::DW_AT_comp_dir)
            .and_then(|value| value.string(sections))
    }

    /// Depth-first pre-order walk from the root, following child links.
    pub fn preorder(&self) -> Preorder<'_>
    {
        Preorder {
            unit: self,
            stack: vec![DieId(0)],
        }
    }
}

/// Iterator returned by [`CompilationUnit::preorder`].
pub struct Preorder<'a>
{
    unit: &'a CompilationUnit,
    stack: Vec<DieId>,
}

impl<'a> Iterator for Preorder<'a>
{
    type Item = &'a Die;

    fn next(&mut self) -> Option<Self::Item>
    {
        let id = self.stack.pop()?;
        let die = self.unit.die(id);
        self.stack.extend(die.children.iter().rev().copied());
        Some(die)
    }
}

/// Every successfully decoded unit plus an image-wide offset index.
#[derive(Debug, Clone, Default)]
pub struct UnitSet
{
    units: Vec<CompilationUnit>,
    index: HashMap<usize, (usize, DieId)>,
}

impl UnitSet
{
    pub fn new(units: Vec<CompilationUnit>) -> Self
    {
        let capacity = units.iter().map(|unit| unit.dies.len()).sum();
        let mut index = HashMap::with_capacity(capacity);
        for (position, unit) in units.iter().enumerate() {
            for (offset, id) in &unit.by_offset {
                index.insert(*offset, (position, *id));
            }
        }
        Self { units, index }
    }

    pub fn units(&self) -> &[CompilationUnit]
    {
        &self.units
    }

    pub fn len(&self) -> usize
    {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.units.is_empty()
    }

    pub fn die_count(&self) -> usize
    {
        self.index.len()
    }

    /// The DIE at an absolute `.debug_info` offset.
    pub fn die(&self, offset: usize) -> Option<DieRef<'_>>
    {
        let (position, id) = self.index.get(&offset)?;
        let unit = &self.units[*position];
        Some(DieRef {
            unit,
            id: *id,
            die: unit.die(*id),
        })
    }

    /// Unit containing the given `.debug_info` offset.
    pub fn unit_for_offset(&self, offset: usize) -> Option<&CompilationUnit>
    {
        self.units.iter().find(|unit| unit.contains_offset(offset))
    }
}

/// A DIE together with the unit that owns it.
#[derive(Debug, Clone, Copy)]
pub struct DieRef<'a>
{
    pub unit: &'a CompilationUnit,
    pub id: DieId,
    pub die: &'a Die,
}

impl<'a> DieRef<'a>
{
    pub fn offset(&self) -> usize
    {
        self.die.offset
    }

    pub fn tag(&self) -> DwTag
    {
        self.die.tag
    }

    pub fn attr(&self, name: DwAt) -> Option<&'a AttributeValue>
    {
        self.die.attr(name)
    }

    /// Absolute offset named by a reference attribute.
    pub fn reference(&self, name: DwAt) -> Option<usize>
    {
        self.attr(name)?.reference(self.unit.offset())
    }

    pub fn string(&self, name: DwAt, sections: &Sections) -> Option<String>
    {
        self.attr(name)?.string(sections)
    }

    pub fn parent(&self) -> Option<DieRef<'a>>
    {
        let id = self.die.parent?;
        Some(self.with_id(id))
    }

    pub fn children(&self) -> impl Iterator<Item = DieRef<'a>> + 'a
    {
        let unit = self.unit;
        self.die.children.iter().map(move |id| DieRef {
            unit,
            id: *id,
            die: unit.die(*id),
        })
    }

    fn with_id(&self, id: DieId) -> DieRef<'a>
    {
        DieRef {
            unit: self.unit,
            id,
            die: self.unit.die(id),
        }
    }
}

//! # Location Lists
//!
//! `.debug_loc` lists describe a variable whose location changes with the
//! PC. Each entry is a `[begin, end)` pair of address-sized values followed
//! by a 2-byte expression length and the expression; a pair whose begin is
//! the largest address selects a new base address, and `(0, 0)` ends the
//! list. Entry addresses are relative to the current base.

use crate::error::{DwarfError, Result};
use crate::expression::LocationExpression;
use crate::reader::Encoding;

/// One `[low, high)` range and the expression valid over it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationListEntry
{
    /// First PC covered (absolute)
    pub low: u64,
    /// One past the last PC covered (absolute)
    pub high: u64,
    pub expression: LocationExpression,
}

impl LocationListEntry
{
    pub fn contains(&self, pc: u64) -> bool
    {
        self.low <= pc && pc < self.high
    }
}

/// A decoded location list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationList
{
    offset: usize,
    entries: Vec<LocationListEntry>,
}

impl LocationList
{
    /// Decode the list at `offset` in `debug_loc`.
    ///
    /// `base` is the base address of the owning unit.
    ///
    /// ## Errors
    ///
    /// `MalformedLocationList` if the list is not terminated within the
    /// section, or propagates expression decode errors.
    pub fn parse(debug_loc: &[u8], offset: usize, encoding: Encoding, base: u64) -> Result<Self>
    {
        let malformed = |_| DwarfError::MalformedLocationList { offset };
        let data = debug_loc
            .get(offset..)
            .ok_or(DwarfError::MalformedLocationList { offset })?;
        let mut reader = encoding.reader(data, offset);
        let max = encoding.max_address();
        let mut base = base;
        let mut entries = Vec::new();

        loop {
            let begin = reader.address().map_err(malformed)?;
            let end = reader.address().map_err(malformed)?;
            if begin == 0 && end == 0 {
                break;
            }
            if begin == max {
                base = end;
                continue;
            }
            let len = usize::from(reader.u16().map_err(malformed)?);
            let bytes = reader.bytes(len).map_err(malformed)?;
            let expression = LocationExpression::parse(bytes, encoding)?;
            entries.push(LocationListEntry {
                low: base.wrapping_add(begin) & max,
                high: base.wrapping_add(end) & max,
                expression,
            });
        }

        tracing::trace!(offset, entries = entries.len(), "decoded location list");
        Ok(Self { offset, entries })
    }

    pub fn offset(&self) -> usize
    {
        self.offset
    }

    pub fn entries(&self) -> &[LocationListEntry]
    {
        &self.entries
    }

    /// The expression whose range contains `pc`.
    pub fn find(&self, pc: u64) -> Option<&LocationExpression>
    {
        self.entries
            .iter()
            .find(|entry| entry.contains(pc))
            .map(|entry| &entry.expression)
    }
}

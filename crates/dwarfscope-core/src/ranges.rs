//! Address ranges of units and subprograms.
//!
//! A DIE covers either a single `[low_pc, high_pc)` range (where `high_pc`
//! is an address, or a length when encoded as a constant) or a
//! `.debug_ranges` list named by `DW_AT_ranges`.

use gimli::constants;

use crate::attribute::AttributeValue;
use crate::error::{DwarfError, Result};
use crate::reader::Encoding;
use crate::unit::Die;

/// A half-open `[begin, end)` PC range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressRange
{
    pub begin: u64,
    pub end: u64,
}

impl AddressRange
{
    pub fn contains(&self, pc: u64) -> bool
    {
        self.begin <= pc && pc < self.end
    }
}

/// Decode the `.debug_ranges` list at `offset`.
///
/// ## Errors
///
/// `MalformedRangeList` if the list runs past the section before its `(0, 0)`
/// terminator.
pub fn parse_range_list(debug_ranges: &[u8], offset: usize, encoding: Encoding, base: u64)
    -> Result<Vec<AddressRange>>
{
    let malformed = |_| DwarfError::MalformedRangeList { offset };
    let data = debug_ranges
        .get(offset..)
        .ok_or(DwarfError::MalformedRangeList { offset })?;
    let mut reader = encoding.reader(data, offset);
    let max = encoding.max_address();
    let mut base = base;
    let mut ranges = Vec::new();
    loop {
        let begin = reader.address().map_err(malformed)?;
        let end = reader.address().map_err(malformed)?;
        match (begin, end) {
            (0, 0) => break,
            (begin, end) if begin == max => base = end,
            (begin, end) => {
                if end > begin {
                    ranges.push(AddressRange {
                        begin: base.wrapping_add(begin) & max,
                        end: base.wrapping_add(end) & max,
                    });
                }
            }
        }
    }
    Ok(ranges)
}

/// Ranges covered by `die`, from `low_pc`/`high_pc` or `DW_AT_ranges`.
///
/// `base` is the unit's base address, which `.debug_ranges` entries are
/// relative to. A DIE with neither form covers nothing.
///
/// ## Errors
///
/// Propagates `MalformedRangeList`.
pub fn die_ranges(die: &Die, debug_ranges: &[u8], encoding: Encoding, base: u64) -> Result<Vec<AddressRange>>
{
    if let Some(offset) = die.attr(constants::DW_AT_ranges).and_then(AttributeValue::section_offset) {
        return parse_range_list(debug_ranges, offset as usize, encoding, base);
    }
    let Some(low) = die.attr(constants::DW_AT_low_pc).and_then(AttributeValue::address) else {
        return Ok(Vec::new());
    };
    let end = match die.attr(constants::DW_AT_high_pc) {
        Some(AttributeValue::Address(high)) => *high,
        Some(value) => match value.udata() {
            Some(len) => low.wrapping_add(len),
            None => return Ok(Vec::new()),
        },
        // A lone low_pc marks a single address.
        None => low.wrapping_add(1),
    };
    if end <= low {
        return Ok(Vec::new());
    }
    Ok(vec![AddressRange { begin: low, end }])
}

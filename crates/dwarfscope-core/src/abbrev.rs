//! # Abbreviation Decoder
//!
//! Decodes `.debug_abbrev` tables. Each table maps a small code to a DIE
//! layout: tag, whether the DIE has children, and the ordered list of
//! `(attribute, form)` pairs its attribute values are encoded with.
//!
//! ## Layout
//!
//! ```text
//! code (ULEB) tag (ULEB) has_children (u8) [name (ULEB) form (ULEB)]* 0 0
//! ...
//! 0
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use gimli::constants::{self, DwAt, DwChildren, DwForm, DwTag};
use gimli::RunTimeEndian;

use crate::error::{DwarfError, Result};
use crate::reader::Reader;

/// One `(attribute, form)` pair of an abbreviation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeSpec
{
    pub name: DwAt,
    pub form: DwForm,
}

/// Layout declaration shared by every DIE that uses the same code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abbreviation
{
    pub code: u64,
    pub tag: DwTag,
    pub has_children: bool,
    pub attributes: Vec<AttributeSpec>,
}

/// Forms understood by the attribute decoder.
pub fn is_known_form(form: DwForm) -> bool
{
    matches!(
        form,
        constants::DW_FORM_addr
            | constants::DW_FORM_block2
            | constants::DW_FORM_block4
            | constants::DW_FORM_data2
            | constants::DW_FORM_data4
            | constants::DW_FORM_data8
            | constants::DW_FORM_string
            | constants::DW_FORM_block
            | constants::DW_FORM_block1
            | constants::DW_FORM_data1
            | constants::DW_FORM_flag
            | constants::DW_FORM_sdata
            | constants::DW_FORM_strp
            | constants::DW_FORM_udata
            | constants::DW_FORM_ref_addr
            | constants::DW_FORM_ref1
            | constants::DW_FORM_ref2
            | constants::DW_FORM_ref4
            | constants::DW_FORM_ref8
            | constants::DW_FORM_ref_udata
            | constants::DW_FORM_indirect
            | constants::DW_FORM_sec_offset
            | constants::DW_FORM_exprloc
            | constants::DW_FORM_flag_present
            | constants::DW_FORM_ref_sig8
    )
}

/// A decoded abbreviation table, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AbbreviationTable
{
    abbreviations: Vec<Abbreviation>,
    by_code: HashMap<u64, usize>,
}

impl AbbreviationTable
{
    /// Decode the table starting at `offset` in `data` (the whole `.debug_abbrev` section).
    ///
    /// Returns the table and the number of bytes consumed, terminator included.
    ///
    /// ## Errors
    ///
    /// Returns `MalformedAbbrev` for an unknown form, a `(0, form)` attribute
    /// entry, a duplicate code, or input that ends before a terminator.
    pub fn parse(data: &[u8], offset: usize) -> Result<(Self, usize)>
    {
        let bytes = data.get(offset..).ok_or_else(|| DwarfError::MalformedAbbrev {
            offset,
            reason: "table offset is outside .debug_abbrev".to_string(),
        })?;
        // The abbreviation encoding is endian-neutral; only LEB128 and u8 are read.
        let mut reader = Reader::new(bytes, offset, RunTimeEndian::Little);
        let truncated = |err: DwarfError| match err {
            DwarfError::UnexpectedEof { offset } => DwarfError::MalformedAbbrev {
                offset,
                reason: "table ends before its terminator".to_string(),
            },
            other => other,
        };

        let mut table = Self::default();
        loop {
            let record = reader.offset();
            let code = reader.uleb128().map_err(truncated)?;
            if code == 0 {
                break;
            }
            let tag = reader.uleb128().map_err(truncated)?;
            let tag = u16::try_from(tag).map_err(|_| DwarfError::MalformedAbbrev {
                offset: record,
                reason: format!("tag 0x{tag:x} does not fit in 16 bits"),
            })?;
            let has_children = match DwChildren(reader.u8().map_err(truncated)?) {
                constants::DW_CHILDREN_no => false,
                constants::DW_CHILDREN_yes => true,
                other => {
                    return Err(DwarfError::MalformedAbbrev {
                        offset: record,
                        reason: format!("invalid children flag {}", other.0),
                    })
                }
            };

            let mut attributes = Vec::new();
            loop {
                let spec_offset = reader.offset();
                let name = reader.uleb128().map_err(truncated)?;
                let form = reader.uleb128().map_err(truncated)?;
                if name == 0 && form == 0 {
                    break;
                }
                if name == 0 {
                    return Err(DwarfError::MalformedAbbrev {
                        offset: spec_offset,
                        reason: "attribute name 0 with a non-zero form".to_string(),
                    });
                }
                let form = u16::try_from(form).map(DwForm).ok().filter(|form| is_known_form(*form));
                let (Some(form), Ok(name)) = (form, u16::try_from(name)) else {
                    return Err(DwarfError::MalformedAbbrev {
                        offset: spec_offset,
                        reason: "unknown attribute form".to_string(),
                    });
                };
                attributes.push(AttributeSpec { name: DwAt(name), form });
            }

            if table.by_code.contains_key(&code) {
                return Err(DwarfError::MalformedAbbrev {
                    offset: record,
                    reason: format!("duplicate abbreviation code {code}"),
                });
            }
            table.by_code.insert(code, table.abbreviations.len());
            table.abbreviations.push(Abbreviation {
                code,
                tag: DwTag(tag),
                has_children,
                attributes,
            });
        }

        Ok((table, reader.position()))
    }

    pub fn get(&self, code: u64) -> Option<&Abbreviation>
    {
        self.by_code.get(&code).map(|index| &self.abbreviations[*index])
    }

    /// Abbreviations in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Abbreviation>
    {
        self.abbreviations.iter()
    }

    pub fn len(&self) -> usize
    {
        self.abbreviations.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.abbreviations.is_empty()
    }
}

/// Abbreviation tables keyed by their `.debug_abbrev` offset.
///
/// Units frequently share a table, so each offset is decoded once and the
/// result handed out as an `Arc`.
#[derive(Debug, Default)]
pub struct AbbreviationCache
{
    tables: HashMap<usize, Result<Arc<AbbreviationTable>>>,
}

impl AbbreviationCache
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Table at `offset`, decoding it on first use.
    ///
    /// ## Errors
    ///
    /// Returns the (memoised) decode error for a malformed table.
    pub fn get_or_parse(&mut self, data: &[u8], offset: usize) -> Result<Arc<AbbreviationTable>>
    {
        self.tables
            .entry(offset)
            .or_insert_with(|| {
                let parsed = AbbreviationTable::parse(data, offset).map(|(table, _)| Arc::new(table));
                if let Ok(table) = &parsed {
                    tracing::trace!(offset, abbreviations = table.len(), "decoded abbreviation table");
                }
                parsed
            })
            .clone()
    }

    /// Number of distinct offsets decoded so far.
    pub fn len(&self) -> usize
    {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.tables.is_empty()
    }
}

#[cfg(test)]
mod tests
{
    use gimli::constants::*;
    use proptest::prelude::*;

    use super::*;
    use crate::test_util::ByteWriter;

    fn encode(table: &AbbreviationTable) -> Vec<u8>
    {
        let mut w = ByteWriter::new();
        for abbrev in table.iter() {
            w.uleb(abbrev.code).uleb(u64::from(abbrev.tag.0)).u8(u8::from(abbrev.has_children));
            for spec in &abbrev.attributes {
                w.uleb(u64::from(spec.name.0)).uleb(u64::from(spec.form.0));
            }
            w.uleb(0).uleb(0);
        }
        w.uleb(0);
        w.into_bytes()
    }

    fn simple_table() -> Vec<u8>
    {
        let mut w = ByteWriter::new();
        w.uleb(1).uleb(DW_TAG_compile_unit.0.into()).u8(1);
        w.uleb(DW_AT_name.0.into()).uleb(DW_FORM_string.0.into());
        w.uleb(0).uleb(0);
        w.uleb(2).uleb(DW_TAG_base_type.0.into()).u8(0);
        w.uleb(DW_AT_byte_size.0.into()).uleb(DW_FORM_data1.0.into());
        w.uleb(0).uleb(0);
        w.uleb(0);
        w.into_bytes()
    }

    #[test]
    fn test_parse_simple_table()
    {
        let bytes = simple_table();
        let (table, consumed) = AbbreviationTable::parse(&bytes, 0).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(table.len(), 2);
        let cu = table.get(1).unwrap();
        assert_eq!(cu.tag, DW_TAG_compile_unit);
        assert!(cu.has_children);
        assert_eq!(
            cu.attributes,
            vec![AttributeSpec {
                name: DW_AT_name,
                form: DW_FORM_string
            }]
        );
        assert!(!table.get(2).unwrap().has_children);
        assert!(table.get(3).is_none());
    }

    #[test]
    fn test_table_at_nonzero_offset()
    {
        let mut bytes = vec![0xaa, 0xbb, 0xcc];
        bytes.extend(simple_table());
        let (table, consumed) = AbbreviationTable::parse(&bytes, 3).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(consumed, bytes.len() - 3);
    }

    #[test]
    fn test_unknown_form_is_malformed()
    {
        let mut w = ByteWriter::new();
        w.uleb(1).uleb(DW_TAG_variable.0.into()).u8(0);
        w.uleb(DW_AT_name.0.into()).uleb(0x7f);
        w.uleb(0).uleb(0).uleb(0);
        let err = AbbreviationTable::parse(w.as_slice(), 0).unwrap_err();
        assert!(matches!(err, DwarfError::MalformedAbbrev { offset: 3, .. }), "{err:?}");
    }

    #[test]
    fn test_dwarf5_only_form_is_malformed()
    {
        let mut w = ByteWriter::new();
        w.uleb(1).uleb(DW_TAG_variable.0.into()).u8(0);
        w.uleb(DW_AT_name.0.into()).uleb(DW_FORM_strx1.0.into());
        w.uleb(0).uleb(0).uleb(0);
        assert!(matches!(
            AbbreviationTable::parse(w.as_slice(), 0),
            Err(DwarfError::MalformedAbbrev { .. })
        ));
    }

    #[test]
    fn test_missing_terminator_is_malformed()
    {
        let mut bytes = simple_table();
        bytes.pop();
        assert!(matches!(
            AbbreviationTable::parse(&bytes, 0),
            Err(DwarfError::MalformedAbbrev { .. })
        ));
    }

    #[test]
    fn test_duplicate_code_is_malformed()
    {
        let mut w = ByteWriter::new();
        for _ in 0..2 {
            w.uleb(1).uleb(DW_TAG_variable.0.into()).u8(0).uleb(0).uleb(0);
        }
        w.uleb(0);
        assert!(matches!(
            AbbreviationTable::parse(w.as_slice(), 0),
            Err(DwarfError::MalformedAbbrev { .. })
        ));
    }

    #[test]
    fn test_cache_shares_tables_by_offset()
    {
        let bytes = simple_table();
        let mut cache = AbbreviationCache::new();
        let first = cache.get_or_parse(&bytes, 0).unwrap();
        let second = cache.get_or_parse(&bytes, 0).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    const FORMS: &[DwForm] = &[
        DW_FORM_addr,
        DW_FORM_data1,
        DW_FORM_data2,
        DW_FORM_data4,
        DW_FORM_data8,
        DW_FORM_sdata,
        DW_FORM_udata,
        DW_FORM_string,
        DW_FORM_strp,
        DW_FORM_ref4,
        DW_FORM_ref_addr,
        DW_FORM_exprloc,
        DW_FORM_flag_present,
        DW_FORM_sec_offset,
        DW_FORM_block1,
    ];

    fn arb_abbreviation() -> impl Strategy<Value = (u16, bool, Vec<(u16, usize)>)>
    {
        (
            1u16..0x4200,
            any::<bool>(),
            prop::collection::vec((1u16..0x3fff, 0..FORMS.len()), 0..8),
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn prop_decode_then_encode_round_trips(
            entries in prop::collection::vec(arb_abbreviation(), 0..12),
            first_code in 1u64..1000,
        ) {
            let mut w = ByteWriter::new();
            for (index, (tag, children, attrs)) in entries.iter().enumerate() {
                w.uleb(first_code + index as u64).uleb(u64::from(*tag)).u8(u8::from(*children));
                for (name, form) in attrs {
                    w.uleb(u64::from(*name)).uleb(u64::from(FORMS[*form].0));
                }
                w.uleb(0).uleb(0);
            }
            w.uleb(0);
            let bytes = w.into_bytes();

            let (table, consumed) = AbbreviationTable::parse(&bytes, 0).unwrap();
            prop_assert_eq!(consumed, bytes.len());
            prop_assert_eq!(table.len(), entries.len());
            prop_assert_eq!(encode(&table), bytes);
        }
    }
}

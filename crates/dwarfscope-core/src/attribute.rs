//! # Attribute Values
//!
//! Form-keyed decoding of DIE attribute values, and the form/attribute
//! contract that rejects values encoded with a form the attribute cannot take.
//!
//! Values are decoded by looking only at the form, never at the DIE's tag,
//! which keeps the decoder tolerant of producer-specific tags and attributes.

use gimli::constants::{self, DwAt, DwForm};

use crate::error::{DwarfError, Result};
use crate::reader::Reader;
use crate::sections::Sections;

/// A decoded attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue
{
    /// Target address (`DW_FORM_addr`)
    Address(u64),
    /// Opaque bytes (`DW_FORM_block*` and `DW_FORM_exprloc`)
    Block(Vec<u8>),
    /// Unsigned constant (`DW_FORM_data*`, `DW_FORM_udata`)
    Udata(u64),
    /// Signed constant (`DW_FORM_sdata`)
    Sdata(i64),
    Flag(bool),
    /// Inline string (`DW_FORM_string`)
    String(String),
    /// Offset into `.debug_str` (`DW_FORM_strp`)
    StrOffset(u64),
    /// Reference relative to the start of the containing unit
    UnitRef(usize),
    /// Reference to an absolute `.debug_info` offset (`DW_FORM_ref_addr`)
    DebugInfoRef(usize),
    /// Type-unit signature (`DW_FORM_ref_sig8`)
    TypeSignature(u64),
    /// Offset into `.debug_line`, `.debug_loc`, `.debug_ranges`, ...
    SecOffset(u64),
}

impl AttributeValue
{
    /// The value as an unsigned constant.
    pub fn udata(&self) -> Option<u64>
    {
        match self {
            Self::Udata(value) => Some(*value),
            Self::Sdata(value) => u64::try_from(*value).ok(),
            _ => None,
        }
    }

    /// The value as a signed constant.
    pub fn sdata(&self) -> Option<i64>
    {
        match self {
            Self::Udata(value) => Some(*value as i64),
            Self::Sdata(value) => Some(*value),
            _ => None,
        }
    }

    pub fn address(&self) -> Option<u64>
    {
        match self {
            Self::Address(address) => Some(*address),
            _ => None,
        }
    }

    pub fn flag(&self) -> Option<bool>
    {
        match self {
            Self::Flag(flag) => Some(*flag),
            _ => None,
        }
    }

    pub fn block(&self) -> Option<&[u8]>
    {
        match self {
            Self::Block(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn section_offset(&self) -> Option<u64>
    {
        match self {
            Self::SecOffset(offset) => Some(*offset),
            _ => None,
        }
    }

    /// Resolve a reference to an absolute `.debug_info` offset.
    pub fn reference(&self, unit_offset: usize) -> Option<usize>
    {
        match self {
            Self::UnitRef(relative) => unit_offset.checked_add(*relative),
            Self::DebugInfoRef(absolute) => Some(*absolute),
            _ => None,
        }
    }

    /// Resolve an inline or `.debug_str` string.
    pub fn string(&self, sections: &Sections) -> Option<String>
    {
        match self {
            Self::String(value) => Some(value.clone()),
            Self::StrOffset(offset) => sections.string_at(*offset),
            _ => None,
        }
    }
}

/// One attribute of a DIE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute
{
    pub name: DwAt,
    /// The form actually used, after resolving `DW_FORM_indirect`.
    pub form: DwForm,
    pub value: AttributeValue,
}

const ADDRESS: u8 = 1 << 0;
const BLOCK: u8 = 1 << 1;
const CONSTANT: u8 = 1 << 2;
const EXPRLOC: u8 = 1 << 3;
const FLAG: u8 = 1 << 4;
const REFERENCE: u8 = 1 << 5;
const SEC_OFFSET: u8 = 1 << 6;
const STRING: u8 = 1 << 7;

/// Classes a form belongs to in a unit of the given version.
fn form_classes(form: DwForm, version: u16) -> u8
{
    match form {
        constants::DW_FORM_addr => ADDRESS,
        constants::DW_FORM_block1
        | constants::DW_FORM_block2
        | constants::DW_FORM_block4
        | constants::DW_FORM_block => BLOCK,
        // Before version 4 there was no sec_offset form; data4/data8 doubled as section offsets.
        constants::DW_FORM_data4 | constants::DW_FORM_data8 if version < 4 => CONSTANT | SEC_OFFSET,
        constants::DW_FORM_data1
        | constants::DW_FORM_data2
        | constants::DW_FORM_data4
        | constants::DW_FORM_data8
        | constants::DW_FORM_sdata
        | constants::DW_FORM_udata => CONSTANT,
        constants::DW_FORM_exprloc => EXPRLOC,
        constants::DW_FORM_flag | constants::DW_FORM_flag_present => FLAG,
        constants::DW_FORM_ref1
        | constants::DW_FORM_ref2
        | constants::DW_FORM_ref4
        | constants::DW_FORM_ref8
        | constants::DW_FORM_ref_udata
        | constants::DW_FORM_ref_addr
        | constants::DW_FORM_ref_sig8 => REFERENCE,
        constants::DW_FORM_sec_offset => SEC_OFFSET,
        constants::DW_FORM_string | constants::DW_FORM_strp => STRING,
        _ => 0,
    }
}

/// Classes an attribute may be encoded with; `None` accepts any form.
fn attribute_classes(name: DwAt) -> Option<u8>
{
    let classes = match name {
        constants::DW_AT_name
        | constants::DW_AT_comp_dir
        | constants::DW_AT_producer
        | constants::DW_AT_linkage_name
        | constants::DW_AT_MIPS_linkage_name => STRING,
        constants::DW_AT_type
        | constants::DW_AT_sibling
        | constants::DW_AT_abstract_origin
        | constants::DW_AT_specification
        | constants::DW_AT_containing_type
        | constants::DW_AT_import => REFERENCE,
        constants::DW_AT_low_pc => ADDRESS,
        constants::DW_AT_high_pc => ADDRESS | CONSTANT,
        constants::DW_AT_location
        | constants::DW_AT_frame_base
        | constants::DW_AT_string_length
        | constants::DW_AT_return_addr => EXPRLOC | BLOCK | SEC_OFFSET,
        constants::DW_AT_data_member_location => CONSTANT | EXPRLOC | BLOCK | SEC_OFFSET,
        constants::DW_AT_stmt_list | constants::DW_AT_ranges | constants::DW_AT_macro_info => SEC_OFFSET,
        constants::DW_AT_byte_size
        | constants::DW_AT_bit_size
        | constants::DW_AT_bit_offset
        | constants::DW_AT_data_bit_offset
        | constants::DW_AT_count
        | constants::DW_AT_upper_bound
        | constants::DW_AT_lower_bound => CONSTANT | REFERENCE | EXPRLOC | BLOCK,
        constants::DW_AT_encoding
        | constants::DW_AT_decl_file
        | constants::DW_AT_decl_line
        | constants::DW_AT_decl_column
        | constants::DW_AT_language
        | constants::DW_AT_accessibility
        | constants::DW_AT_inline
        | constants::DW_AT_calling_convention => CONSTANT,
        constants::DW_AT_external
        | constants::DW_AT_declaration
        | constants::DW_AT_prototyped
        | constants::DW_AT_artificial
        | constants::DW_AT_main_subprogram => FLAG,
        constants::DW_AT_const_value => CONSTANT | BLOCK | STRING,
        _ => return None,
    };
    Some(classes)
}

/// Whether `form` is a legal encoding of `name` in a unit of `version`.
pub fn is_legal_form(name: DwAt, form: DwForm, version: u16) -> bool
{
    let form_classes = form_classes(form, version);
    match attribute_classes(name) {
        Some(allowed) => form_classes & allowed != 0,
        None => form_classes != 0,
    }
}

/// Decode one attribute value encoded with `form`.
///
/// `reader` must carry the unit's address and offset sizes.
pub(crate) fn read_value(reader: &mut Reader<'_>, form: DwForm, version: u16) -> Result<(DwForm, AttributeValue)>
{
    let mut form = form;
    // DW_FORM_indirect may in principle chain; bound it to the forms that exist.
    for _ in 0..4 {
        if form != constants::DW_FORM_indirect {
            break;
        }
        let raw = reader.uleb128()?;
        form = DwForm(u16::try_from(raw).unwrap_or(u16::MAX));
    }

    let value = match form {
        constants::DW_FORM_addr => AttributeValue::Address(reader.address()?),
        constants::DW_FORM_block1 => {
            let len = usize::from(reader.u8()?);
            AttributeValue::Block(reader.bytes(len)?.to_vec())
        }
        constants::DW_FORM_block2 => {
            let len = usize::from(reader.u16()?);
            AttributeValue::Block(reader.bytes(len)?.to_vec())
        }
        constants::DW_FORM_block4 => {
            let len = reader.u32()? as usize;
            AttributeValue::Block(reader.bytes(len)?.to_vec())
        }
        constants::DW_FORM_block | constants::DW_FORM_exprloc => {
            let len = reader.uleb128_usize()?;
            AttributeValue::Block(reader.bytes(len)?.to_vec())
        }
        constants::DW_FORM_data1 => AttributeValue::Udata(u64::from(reader.u8()?)),
        constants::DW_FORM_data2 => AttributeValue::Udata(u64::from(reader.u16()?)),
        constants::DW_FORM_data4 => AttributeValue::Udata(u64::from(reader.u32()?)),
        constants::DW_FORM_data8 => AttributeValue::Udata(reader.u64()?),
        constants::DW_FORM_sdata => AttributeValue::Sdata(reader.sleb128()?),
        constants::DW_FORM_udata => AttributeValue::Udata(reader.uleb128()?),
        constants::DW_FORM_flag => AttributeValue::Flag(reader.u8()? != 0),
        constants::DW_FORM_flag_present => AttributeValue::Flag(true),
        constants::DW_FORM_string => AttributeValue::String(String::from_utf8_lossy(reader.cstr()?).into_owned()),
        constants::DW_FORM_strp => AttributeValue::StrOffset(reader.section_offset()?),
        constants::DW_FORM_ref1 => AttributeValue::UnitRef(usize::from(reader.u8()?)),
        constants::DW_FORM_ref2 => AttributeValue::UnitRef(usize::from(reader.u16()?)),
        constants::DW_FORM_ref4 => AttributeValue::UnitRef(reader.u32()? as usize),
        constants::DW_FORM_ref8 => AttributeValue::UnitRef(reader.u64()? as usize),
        constants::DW_FORM_ref_udata => AttributeValue::UnitRef(reader.uleb128_usize()?),
        // Version 2 encodes ref_addr with the address size, later versions with the offset size.
        constants::DW_FORM_ref_addr if version == 2 => AttributeValue::DebugInfoRef(reader.address()? as usize),
        constants::DW_FORM_ref_addr => AttributeValue::DebugInfoRef(reader.section_offset()? as usize),
        constants::DW_FORM_ref_sig8 => AttributeValue::TypeSignature(reader.u64()?),
        constants::DW_FORM_sec_offset => AttributeValue::SecOffset(reader.section_offset()?),
        _ => {
            return Err(DwarfError::IllegalForm {
                offset: reader.offset(),
                attribute: DwAt(0),
                form,
            })
        }
    };
    Ok((form, value))
}

/// Decode and validate one attribute of the DIE at `die_offset`.
pub(crate) fn read_attribute(reader: &mut Reader<'_>, die_offset: usize, name: DwAt, form: DwForm, version: u16)
    -> Result<Attribute>
{
    let (form, value) = read_value(reader, form, version).map_err(|err| match err {
        DwarfError::IllegalForm { form, .. } => DwarfError::IllegalForm {
            offset: die_offset,
            attribute: name,
            form,
        },
        other => other,
    })?;
    if !is_legal_form(name, form, version) {
        return Err(DwarfError::IllegalForm {
            offset: die_offset,
            attribute: name,
            form,
        });
    }

    // A data4/data8 section pointer from a pre-version-4 unit is normalised to SecOffset.
    let value = match value {
        AttributeValue::Udata(offset)
            if version < 4
                && matches!(form, constants::DW_FORM_data4 | constants::DW_FORM_data8)
                && attribute_classes(name).is_some_and(|classes| classes & SEC_OFFSET != 0) =>
        {
            AttributeValue::SecOffset(offset)
        }
        other => other,
    };

    Ok(Attribute { name, form, value })
}

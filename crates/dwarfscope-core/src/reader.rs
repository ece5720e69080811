//! # Byte Reader
//!
//! A bounds-checked cursor over a borrowed section slice.
//!
//! Every decoder in the crate reads through [`Reader`]. Reads past the end
//! return [`DwarfError::UnexpectedEof`] carrying the absolute offset of the
//! failed read, so callers can map it onto their own structural error kind.

use gimli::{Endianity, RunTimeEndian};

use crate::error::{DwarfError, Result};

/// Sizes and byte order shared by everything decoded from one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encoding
{
    pub address_size: u8,
    /// 4 for 32-bit DWARF, 8 for 64-bit DWARF
    pub offset_size: u8,
    pub version: u16,
    pub endian: RunTimeEndian,
}

impl Encoding
{
    /// 64-bit little-endian, 32-bit DWARF format, version 4.
    pub fn host_default() -> Self
    {
        Self {
            address_size: 8,
            offset_size: 4,
            version: 4,
            endian: RunTimeEndian::Little,
        }
    }

    /// A reader over `data` configured with this encoding.
    pub fn reader<'a>(&self, data: &'a [u8], base: usize) -> Reader<'a>
    {
        Reader::new(data, base, self.endian)
            .with_address_size(self.address_size)
            .with_offset_size(self.offset_size)
    }

    /// Largest value an address of this size can hold.
    pub fn max_address(&self) -> u64
    {
        if self.address_size >= 8 {
            u64::MAX
        } else {
            (1u64 << (u32::from(self.address_size) * 8)) - 1
        }
    }
}

/// Cursor over a byte slice that knows its absolute section offset.
#[derive(Debug, Clone)]
pub struct Reader<'a>
{
    data: &'a [u8],
    pos: usize,
    base: usize,
    endian: RunTimeEndian,
    address_size: u8,
    offset_size: u8,
}

impl<'a> Reader<'a>
{
    /// Create a reader over `data`, whose first byte lives at section offset `base`.
    pub fn new(data: &'a [u8], base: usize, endian: RunTimeEndian) -> Self
    {
        Self {
            data,
            pos: 0,
            base,
            endian,
            address_size: 8,
            offset_size: 4,
        }
    }

    /// Set the size of target addresses (`DW_FORM_addr`, `DW_OP_addr`, ...).
    #[must_use]
    pub fn with_address_size(mut self, address_size: u8) -> Self
    {
        self.address_size = address_size;
        self
    }

    /// Set the size of section offsets: 4 for 32-bit DWARF, 8 for 64-bit.
    #[must_use]
    pub fn with_offset_size(mut self, offset_size: u8) -> Self
    {
        self.offset_size = offset_size;
        self
    }

    pub fn endian(&self) -> RunTimeEndian
    {
        self.endian
    }

    pub fn address_size(&self) -> u8
    {
        self.address_size
    }

    pub fn offset_size(&self) -> u8
    {
        self.offset_size
    }

    /// Absolute section offset of the next byte to be read.
    pub fn offset(&self) -> usize
    {
        self.base + self.pos
    }

    /// Position relative to the start of this reader's slice.
    pub fn position(&self) -> usize
    {
        self.pos
    }

    pub fn remaining(&self) -> usize
    {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool
    {
        self.pos >= self.data.len()
    }

    /// Move to a position relative to the start of the slice.
    pub fn seek(&mut self, pos: usize) -> Result<()>
    {
        if pos > self.data.len() {
            return Err(DwarfError::UnexpectedEof { offset: self.base + pos });
        }
        self.pos = pos;
        Ok(())
    }

    pub fn skip(&mut self, len: usize) -> Result<()>
    {
        self.bytes(len).map(|_| ())
    }

    /// Split off a sub-reader over the next `len` bytes and advance past them.
    pub fn split(&mut self, len: usize) -> Result<Reader<'a>>
    {
        let base = self.offset();
        let data = self.bytes(len)?;
        Ok(Reader {
            data,
            pos: 0,
            base,
            endian: self.endian,
            address_size: self.address_size,
            offset_size: self.offset_size,
        })
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]>
    {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(DwarfError::UnexpectedEof { offset: self.offset() })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8>
    {
        Ok(self.bytes(1)?[0])
    }

    pub fn i8(&mut self) -> Result<i8>
    {
        Ok(self.u8()? as i8)
    }

    pub fn u16(&mut self) -> Result<u16>
    {
        let bytes = self.bytes(2)?;
        Ok(self.endian.read_u16(bytes))
    }

    pub fn i16(&mut self) -> Result<i16>
    {
        Ok(self.u16()? as i16)
    }

    pub fn u32(&mut self) -> Result<u32>
    {
        let bytes = self.bytes(4)?;
        Ok(self.endian.read_u32(bytes))
    }

    pub fn i32(&mut self) -> Result<i32>
    {
        Ok(self.u32()? as i32)
    }

    pub fn u64(&mut self) -> Result<u64>
    {
        let bytes = self.bytes(8)?;
        Ok(self.endian.read_u64(bytes))
    }

    pub fn i64(&mut self) -> Result<i64>
    {
        Ok(self.u64()? as i64)
    }

    /// Read an unsigned integer of 1, 2, 4 or 8 bytes.
    pub fn sized(&mut self, size: u8) -> Result<u64>
    {
        match size {
            1 => self.u8().map(u64::from),
            2 => self.u16().map(u64::from),
            4 => self.u32().map(u64::from),
            8 => self.u64(),
            _ => Err(DwarfError::UnexpectedEof { offset: self.offset() }),
        }
    }

    /// Read a target address.
    pub fn address(&mut self) -> Result<u64>
    {
        self.sized(self.address_size)
    }

    /// Read a 4- or 8-byte section offset.
    pub fn section_offset(&mut self) -> Result<u64>
    {
        self.sized(self.offset_size)
    }

    pub fn uleb128(&mut self) -> Result<u64>
    {
        let start = self.offset();
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            if shift < 64 {
                result |= u64::from(byte & 0x7f) << shift;
            } else if byte & 0x7f != 0 {
                return Err(DwarfError::UnexpectedEof { offset: start });
            }
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    pub fn sleb128(&mut self) -> Result<i64>
    {
        let start = self.offset();
        let mut result: i64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            if shift < 64 {
                result |= i64::from(byte & 0x7f) << shift;
            } else if byte & 0x7f != 0 && byte & 0x7f != 0x7f {
                return Err(DwarfError::UnexpectedEof { offset: start });
            }
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
    }

    /// Read a ULEB128 value that must fit in `usize`.
    pub fn uleb128_usize(&mut self) -> Result<usize>
    {
        let offset = self.offset();
        let value = self.uleb128()?;
        usize::try_from(value).map_err(|_| DwarfError::UnexpectedEof { offset })
    }

    /// Read a NUL-terminated string, returning the bytes without the terminator.
    pub fn cstr(&mut self) -> Result<&'a [u8]>
    {
        let rest = &self.data[self.pos..];
        let len = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(DwarfError::UnexpectedEof { offset: self.base + self.data.len() })?;
        let slice = &rest[..len];
        self.pos += len + 1;
        Ok(slice)
    }

    /// Read an initial length field, switching to 64-bit offsets on the
    /// `0xffff_ffff` escape. Returns the unit length.
    pub fn initial_length(&mut self) -> Result<u64>
    {
        let length = self.u32()?;
        if length == 0xffff_ffff {
            self.offset_size = 8;
            self.u64()
        } else {
            self.offset_size = 4;
            Ok(u64::from(length))
        }
    }
}

/// Read a NUL-terminated string at `offset` within `data`.
pub(crate) fn cstr_at(data: &[u8], offset: usize) -> Option<&[u8]>
{
    let rest = data.get(offset..)?;
    let len = rest.iter().position(|b| *b == 0)?;
    Some(&rest[..len])
}

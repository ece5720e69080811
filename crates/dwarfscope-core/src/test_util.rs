//! Little-endian byte assembly for unit tests.

pub(crate) struct ByteWriter
{
    buf: Vec<u8>,
}

impl ByteWriter
{
    pub(crate) fn new() -> Self
    {
        Self { buf: Vec::new() }
    }

    pub(crate) fn u8(&mut self, value: u8) -> &mut Self
    {
        self.buf.push(value);
        self
    }

    pub(crate) fn u16(&mut self, value: u16) -> &mut Self
    {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub(crate) fn u32(&mut self, value: u32) -> &mut Self
    {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub(crate) fn u64(&mut self, value: u64) -> &mut Self
    {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub(crate) fn uleb(&mut self, mut value: u64) -> &mut Self
    {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                return self;
            }
            self.buf.push(byte | 0x80);
        }
    }

    pub(crate) fn sleb(&mut self, mut value: i64) -> &mut Self
    {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
            if done {
                self.buf.push(byte);
                return self;
            }
            self.buf.push(byte | 0x80);
        }
    }

    pub(crate) fn bytes(&mut self, bytes: &[u8]) -> &mut Self
    {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub(crate) fn cstr(&mut self, value: &str) -> &mut Self
    {
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
        self
    }

    pub(crate) fn len(&self) -> usize
    {
        self.buf.len()
    }

    /// Overwrite a previously written little-endian u32.
    pub(crate) fn patch_u32(&mut self, at: usize, value: u32) -> &mut Self
    {
        self.buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
        self
    }

    pub(crate) fn as_slice(&self) -> &[u8]
    {
        &self.buf
    }

    pub(crate) fn into_bytes(self) -> Vec<u8>
    {
        self.buf
    }
}

/// Attribute value for [`UnitBuilder`]; the variant picks the form.
#[derive(Debug, Clone)]
pub(crate) enum Attr
{
    Str(&'static str),
    Data1(u8),
    Data2(u16),
    Udata(u64),
    Sdata(i64),
    Flag(bool),
    Addr(u64),
    Exprloc(Vec<u8>),
    Block(Vec<u8>),
    SecOffset(u32),
    /// Reference to the DIE with this builder index
    Ref(usize),
    /// Reference to a raw unit-relative offset
    RawRef(u32),
}

impl Attr
{
    fn form(&self) -> gimli::DwForm
    {
        use gimli::constants::*;
        match self {
            Self::Str(_) => DW_FORM_string,
            Self::Data1(_) => DW_FORM_data1,
            Self::Data2(_) => DW_FORM_data2,
            Self::Udata(_) => DW_FORM_udata,
            Self::Sdata(_) => DW_FORM_sdata,
            Self::Flag(_) => DW_FORM_flag,
            Self::Addr(_) => DW_FORM_addr,
            Self::Exprloc(_) => DW_FORM_exprloc,
            Self::Block(_) => DW_FORM_block1,
            Self::SecOffset(_) => DW_FORM_sec_offset,
            Self::Ref(_) | Self::RawRef(_) => DW_FORM_ref4,
        }
    }
}

/// Assembles one version 4, 64-bit-address unit with one abbreviation per DIE.
pub(crate) struct UnitBuilder
{
    abbrev: ByteWriter,
    body: ByteWriter,
    offsets: Vec<usize>,
    patches: Vec<(usize, usize)>,
}

/// Size of a version 4, 32-bit-format unit header.
pub(crate) const HEADER_SIZE: usize = 11;

impl UnitBuilder
{
    pub(crate) fn new() -> Self
    {
        Self {
            abbrev: ByteWriter::new(),
            body: ByteWriter::new(),
            offsets: Vec::new(),
            patches: Vec::new(),
        }
    }

    /// Append a DIE and return its builder index.
    pub(crate) fn die(&mut self, tag: gimli::DwTag, children: bool, attrs: &[(gimli::DwAt, Attr)]) -> usize
    {
        let index = self.offsets.len();
        let code = index as u64 + 1;
        self.abbrev.uleb(code).uleb(tag.0.into()).u8(u8::from(children));
        for (name, value) in attrs {
            self.abbrev.uleb(name.0.into()).uleb(value.form().0.into());
        }
        self.abbrev.uleb(0).uleb(0);

        self.offsets.push(HEADER_SIZE + self.body.len());
        self.body.uleb(code);
        for (_, value) in attrs {
            match value {
                Attr::Str(text) => {
                    self.body.cstr(text);
                }
                Attr::Data1(v) => {
                    self.body.u8(*v);
                }
                Attr::Data2(v) => {
                    self.body.u16(*v);
                }
                Attr::Udata(v) => {
                    self.body.uleb(*v);
                }
                Attr::Sdata(v) => {
                    self.body.sleb(*v);
                }
                Attr::Flag(v) => {
                    self.body.u8(u8::from(*v));
                }
                Attr::Addr(v) => {
                    self.body.u64(*v);
                }
                Attr::Exprloc(bytes) => {
                    self.body.uleb(bytes.len() as u64).bytes(bytes);
                }
                Attr::Block(bytes) => {
                    self.body.u8(bytes.len() as u8).bytes(bytes);
                }
                Attr::SecOffset(v) | Attr::RawRef(v) => {
                    self.body.u32(*v);
                }
                Attr::Ref(target) => {
                    self.patches.push((self.body.len(), *target));
                    self.body.u32(0);
                }
            }
        }
        index
    }

    /// Close the innermost DIE with children.
    pub(crate) fn end(&mut self)
    {
        self.body.uleb(0);
    }

    /// Absolute `.debug_info` offset of a DIE.
    pub(crate) fn offset(&self, index: usize) -> usize
    {
        self.offsets[index]
    }

    /// `(.debug_abbrev, .debug_info)` bytes.
    pub(crate) fn finish(mut self) -> (Vec<u8>, Vec<u8>)
    {
        for (at, target) in std::mem::take(&mut self.patches) {
            let offset = self.offsets[target] as u32;
            self.body.patch_u32(at, offset);
        }
        self.abbrev.uleb(0);
        let mut info = ByteWriter::new();
        info.u32((HEADER_SIZE - 4 + self.body.len()) as u32).u16(4).u32(0).u8(8).bytes(self.body.as_slice());
        (self.abbrev.into_bytes(), info.into_bytes())
    }

    /// Decode the assembled unit.
    pub(crate) fn build(self) -> crate::unit::UnitSet
    {
        use std::sync::Arc;

        use gimli::RunTimeEndian;

        let (abbrev, info) = self.finish();
        let table = crate::abbrev::AbbreviationTable::parse(&abbrev, 0).unwrap().0;
        let header = crate::unit::UnitHeader::parse(&info, 0, RunTimeEndian::Little).unwrap();
        let unit = crate::unit::CompilationUnit::parse(&info, header, Arc::new(table), RunTimeEndian::Little).unwrap();
        crate::unit::UnitSet::new(vec![unit])
    }
}

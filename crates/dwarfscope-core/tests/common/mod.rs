//! Little-endian DWARF section assembly shared by the integration tests.

#![allow(dead_code)]

use gimli::constants::*;
use gimli::{DwAt, DwTag, RunTimeEndian, SectionId};

use dwarfscope_core::Sections;

#[derive(Debug, Default)]
pub struct Bytes
{
    buf: Vec<u8>,
}

impl Bytes
{
    pub fn new() -> Self
    {
        Self::default()
    }

    pub fn u8(&mut self, value: u8) -> &mut Self
    {
        self.buf.push(value);
        self
    }

    pub fn u16(&mut self, value: u16) -> &mut Self
    {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self
    {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u64(&mut self, value: u64) -> &mut Self
    {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn uleb(&mut self, mut value: u64) -> &mut Self
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

    pub fn sleb(&mut self, mut value: i64) -> &mut Self
    {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0) {
                self.buf.push(byte);
                return self;
            }
            self.buf.push(byte | 0x80);
        }
    }

    pub fn cstr(&mut self, value: &str) -> &mut Self
    {
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
        self
    }

    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self
    {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn len(&self) -> usize
    {
        self.buf.len()
    }

    pub fn patch_u32(&mut self, at: usize, value: u32)
    {
        self.buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn as_slice(&self) -> &[u8]
    {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8>
    {
        self.buf
    }
}

/// Attribute value; the variant picks the form.
#[derive(Debug, Clone)]
pub enum Value
{
    Str(&'static str),
    Data1(u8),
    Data2(u16),
    Data4(u32),
    Udata(u64),
    Sdata(i64),
    Flag(bool),
    Addr(u64),
    /// `exprloc` in version 4 units, `block1` before
    Expr(Vec<u8>),
    /// `sec_offset` in version 4 units, `data4` before
    SecOffset(u32),
    /// Reference to the DIE with this index within the same unit
    Ref(usize),
}

/// `.debug_abbrev` and `.debug_info` under construction.
#[derive(Debug, Default)]
pub struct DwarfWriter
{
    abbrev: Bytes,
    info: Bytes,
}

impl DwarfWriter
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Start a unit; it is appended when [`UnitWriter::finish`] is called.
    pub fn unit(&mut self, version: u16) -> UnitWriter<'_>
    {
        let start = self.info.len();
        let abbrev_offset = self.abbrev.len();
        UnitWriter {
            writer: self,
            version,
            start,
            abbrev_offset,
            body: Bytes::new(),
            offsets: Vec::new(),
            patches: Vec::new(),
        }
    }

    /// Append raw bytes to `.debug_info`.
    pub fn raw_info(&mut self, bytes: &[u8]) -> usize
    {
        let offset = self.info.len();
        self.info.bytes(bytes);
        offset
    }

    pub fn info_len(&self) -> usize
    {
        self.info.len()
    }

    /// `(.debug_abbrev, .debug_info)`
    pub fn finish(self) -> (Vec<u8>, Vec<u8>)
    {
        (self.abbrev.into_vec(), self.info.into_vec())
    }
}

/// Size of a 32-bit-format unit header.
pub const UNIT_HEADER_SIZE: usize = 11;

pub struct UnitWriter<'w>
{
    writer: &'w mut DwarfWriter,
    version: u16,
    start: usize,
    abbrev_offset: usize,
    body: Bytes,
    offsets: Vec<usize>,
    patches: Vec<(usize, usize)>,
}

impl UnitWriter<'_>
{
    /// Append a DIE with its own abbreviation; returns its index.
    pub fn die(&mut self, tag: DwTag, children: bool, attrs: &[(DwAt, Value)]) -> usize
    {
        let index = self.offsets.len();
        let code = index as u64 + 1;
        let v4 = self.version >= 4;

        let abbrev = &mut self.writer.abbrev;
        abbrev.uleb(code).uleb(tag.0.into()).u8(u8::from(children));
        for (name, value) in attrs {
            let form = match value {
                Value::Str(_) => DW_FORM_string,
                Value::Data1(_) => DW_FORM_data1,
                Value::Data2(_) => DW_FORM_data2,
                Value::Data4(_) => DW_FORM_data4,
                Value::Udata(_) => DW_FORM_udata,
                Value::Sdata(_) => DW_FORM_sdata,
                Value::Flag(_) => DW_FORM_flag,
                Value::Addr(_) => DW_FORM_addr,
                Value::Expr(_) if v4 => DW_FORM_exprloc,
                Value::Expr(_) => DW_FORM_block1,
                Value::SecOffset(_) if v4 => DW_FORM_sec_offset,
                Value::SecOffset(_) => DW_FORM_data4,
                Value::Ref(_) => DW_FORM_ref4,
            };
            abbrev.uleb(name.0.into()).uleb(form.0.into());
        }
        abbrev.uleb(0).uleb(0);

        self.offsets.push(self.start + UNIT_HEADER_SIZE + self.body.len());
        self.body.uleb(code);
        for (_, value) in attrs {
            match value {
                Value::Str(text) => {
                    self.body.cstr(text);
                }
                Value::Data1(v) => {
                    self.body.u8(*v);
                }
                Value::Data2(v) => {
                    self.body.u16(*v);
                }
                Value::Data4(v) | Value::SecOffset(v) => {
                    self.body.u32(*v);
                }
                Value::Udata(v) => {
                    self.body.uleb(*v);
                }
                Value::Sdata(v) => {
                    self.body.sleb(*v);
                }
                Value::Flag(v) => {
                    self.body.u8(u8::from(*v));
                }
                Value::Addr(v) => {
                    self.body.u64(*v);
                }
                Value::Expr(bytes) if v4 => {
                    self.body.uleb(bytes.len() as u64).bytes(bytes);
                }
                Value::Expr(bytes) => {
                    self.body.u8(bytes.len() as u8).bytes(bytes);
                }
                Value::Ref(target) => {
                    self.patches.push((self.body.len(), *target));
                    self.body.u32(0);
                }
            }
        }
        index
    }

    /// Close the innermost open DIE.
    pub fn end(&mut self)
    {
        self.body.uleb(0);
    }

    /// Write the unit and return the absolute offset of every DIE.
    pub fn finish(mut self) -> Vec<usize>
    {
        for (at, target) in std::mem::take(&mut self.patches) {
            let relative = (self.offsets[target] - self.start) as u32;
            self.body.patch_u32(at, relative);
        }
        self.writer.abbrev.uleb(0);
        let length = (UNIT_HEADER_SIZE - 4 + self.body.len()) as u32;
        self.writer
            .info
            .u32(length)
            .u16(self.version)
            .u32(self.abbrev_offset as u32)
            .u8(8)
            .bytes(self.body.as_slice());
        self.offsets
    }
}

pub const LINE_BASE: i8 = -5;
pub const LINE_RANGE: u8 = 14;
pub const OPCODE_BASE: u8 = 13;

/// A line-number program for `.debug_line`.
pub struct LineProgram
{
    version: u16,
    dirs: Vec<&'static str>,
    files: Vec<(&'static str, u64)>,
    body: Bytes,
}

impl LineProgram
{
    pub fn new(version: u16) -> Self
    {
        Self {
            version,
            dirs: Vec::new(),
            files: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn directory(&mut self, dir: &'static str) -> &mut Self
    {
        self.dirs.push(dir);
        self
    }

    pub fn file(&mut self, name: &'static str, dir: u64) -> &mut Self
    {
        self.files.push((name, dir));
        self
    }

    pub fn set_address(&mut self, address: u64) -> &mut Self
    {
        self.body.u8(0).uleb(9).u8(DW_LNE_set_address.0).u64(address);
        self
    }

    pub fn set_file(&mut self, file: u64) -> &mut Self
    {
        self.body.u8(DW_LNS_set_file.0).uleb(file);
        self
    }

    pub fn advance_line(&mut self, delta: i64) -> &mut Self
    {
        self.body.u8(DW_LNS_advance_line.0).sleb(delta);
        self
    }

    pub fn advance_pc(&mut self, delta: u64) -> &mut Self
    {
        self.body.u8(DW_LNS_advance_pc.0).uleb(delta);
        self
    }

    pub fn copy(&mut self) -> &mut Self
    {
        self.body.u8(DW_LNS_copy.0);
        self
    }

    pub fn end_sequence(&mut self) -> &mut Self
    {
        self.body.u8(0).uleb(1).u8(DW_LNE_end_sequence.0);
        self
    }

    pub fn finish(&self) -> Vec<u8>
    {
        let mut header = Bytes::new();
        header.u8(1);
        if self.version >= 4 {
            header.u8(1);
        }
        header.u8(1).u8(LINE_BASE as u8).u8(LINE_RANGE).u8(OPCODE_BASE);
        header.bytes(&[0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1]);
        for dir in &self.dirs {
            header.cstr(dir);
        }
        header.u8(0);
        for (name, dir) in &self.files {
            header.cstr(name).uleb(*dir).uleb(0).uleb(0);
        }
        header.u8(0);

        let mut w = Bytes::new();
        w.u32(0)
            .u16(self.version)
            .u32(header.len() as u32)
            .bytes(header.as_slice())
            .bytes(self.body.as_slice());
        let length = (w.len() - 4) as u32;
        w.patch_u32(0, length);
        w.into_vec()
    }
}

/// `.debug_frame` CIE: version 1, code align 1, data align -8, return
/// address in r16, initial rules `cfa = r7 + 8; r16 at cfa - 8`.
pub fn debug_frame_cie(w: &mut Bytes) -> usize
{
    let start = w.len();
    w.u32(0).u32(0xffff_ffff).u8(1).cstr("").uleb(1).sleb(-8).u8(16);
    w.u8(DW_CFA_def_cfa.0).uleb(7).uleb(8);
    w.u8(DW_CFA_offset.0 | 16).uleb(1);
    let length = (w.len() - start - 4) as u32;
    w.patch_u32(start, length);
    start
}

pub fn debug_frame_fde(w: &mut Bytes, cie: usize, low: u64, len: u64, instructions: &[u8])
{
    let start = w.len();
    w.u32(0).u32(cie as u32).u64(low).u64(len).bytes(instructions);
    let length = (w.len() - start - 4) as u32;
    w.patch_u32(start, length);
}

/// `push rbp; mov rbp, rsp`: after one byte `cfa = r7 + 16` with r6 saved at
/// `cfa - 16`, after four bytes `cfa = r6 + 16`.
pub fn frame_pointer_prologue() -> Vec<u8>
{
    let mut w = Bytes::new();
    w.u8(DW_CFA_advance_loc.0 | 1);
    w.u8(DW_CFA_def_cfa_offset.0).uleb(16);
    w.u8(DW_CFA_offset.0 | 6).uleb(2);
    w.u8(DW_CFA_advance_loc.0 | 3);
    w.u8(DW_CFA_def_cfa_register.0).uleb(6);
    w.into_vec()
}

pub fn loc_entry(w: &mut Bytes, low: u64, high: u64, expr: &[u8])
{
    w.u64(low).u64(high).u16(expr.len() as u16).bytes(expr);
}

pub fn loc_base(w: &mut Bytes, base: u64)
{
    w.u64(u64::MAX).u64(base);
}

pub fn loc_end(w: &mut Bytes)
{
    w.u64(0).u64(0);
}

/// Offsets of the interesting DIEs in [`sample_program`].
#[derive(Debug, Clone, Copy)]
pub struct SampleDies
{
    pub unit: usize,
    pub unsigned_char: usize,
    pub int: usize,
    pub flags: usize,
    pub node: usize,
    pub node_ptr: usize,
    pub main: usize,
    /// Location list variable
    pub x: usize,
    /// `DW_OP_fbreg -20` against a CFA-based frame base
    pub n: usize,
    /// `DW_OP_breg6 -8`
    pub argc: usize,
    /// `DW_OP_addr 0x1000; DW_OP_plus_uconst 16`
    pub total: usize,
}

pub const MAIN_LOW: u64 = 0x40_0000;
pub const MAIN_LEN: u64 = 0x20;

/// One version 4 unit `a.go` compiled in `/src`, with `main` covering
/// `[0x400000, 0x400020)`, line rows `0x400000 -> 10`, `0x400010 -> 11`,
/// a location list, and `.debug_frame` for `main`.
pub fn sample_program() -> (Sections, SampleDies)
{
    let mut dwarf = DwarfWriter::new();
    let mut unit = dwarf.unit(4);
    let cu = unit.die(
        DW_TAG_compile_unit,
        true,
        &[
            (DW_AT_producer, Value::Str("hand assembled")),
            (DW_AT_name, Value::Str("a.go")),
            (DW_AT_comp_dir, Value::Str("/src")),
            (DW_AT_low_pc, Value::Addr(MAIN_LOW)),
            (DW_AT_high_pc, Value::Data4(MAIN_LEN as u32)),
            (DW_AT_stmt_list, Value::SecOffset(0)),
        ],
    );
    let uchar = unit.die(
        DW_TAG_base_type,
        false,
        &[
            (DW_AT_name, Value::Str("unsigned char")),
            (DW_AT_byte_size, Value::Data1(1)),
            (DW_AT_encoding, Value::Data1(DW_ATE_unsigned_char.0)),
        ],
    );
    let int = unit.die(
        DW_TAG_base_type,
        false,
        &[
            (DW_AT_name, Value::Str("int")),
            (DW_AT_byte_size, Value::Data1(4)),
            (DW_AT_encoding, Value::Data1(DW_ATE_signed.0)),
        ],
    );
    let flags = unit.die(
        DW_TAG_structure_type,
        true,
        &[(DW_AT_name, Value::Str("flags")), (DW_AT_byte_size, Value::Data1(1))],
    );
    unit.die(
        DW_TAG_member,
        false,
        &[
            (DW_AT_name, Value::Str("mode")),
            (DW_AT_type, Value::Ref(uchar)),
            (DW_AT_bit_size, Value::Data1(3)),
            (DW_AT_data_bit_offset, Value::Data1(5)),
        ],
    );
    unit.end();
    let node = unit.die(
        DW_TAG_structure_type,
        true,
        &[(DW_AT_name, Value::Str("node")), (DW_AT_byte_size, Value::Data1(16))],
    );
    unit.die(
        DW_TAG_member,
        false,
        &[
            (DW_AT_name, Value::Str("value")),
            (DW_AT_type, Value::Ref(int)),
            (DW_AT_data_member_location, Value::Data1(0)),
        ],
    );
    let node_ptr = node + 3;
    unit.die(
        DW_TAG_member,
        false,
        &[
            (DW_AT_name, Value::Str("next")),
            (DW_AT_type, Value::Ref(node_ptr)),
            (DW_AT_data_member_location, Value::Data1(8)),
        ],
    );
    unit.end();
    assert_eq!(unit.die(DW_TAG_pointer_type, false, &[(DW_AT_type, Value::Ref(node))]), node_ptr);
    let main = unit.die(
        DW_TAG_subprogram,
        true,
        &[
            (DW_AT_name, Value::Str("main")),
            (DW_AT_low_pc, Value::Addr(MAIN_LOW)),
            (DW_AT_high_pc, Value::Data4(MAIN_LEN as u32)),
            (DW_AT_frame_base, Value::Expr(vec![DW_OP_call_frame_cfa.0])),
        ],
    );
    let x = unit.die(
        DW_TAG_variable,
        false,
        &[
            (DW_AT_name, Value::Str("x")),
            (DW_AT_type, Value::Ref(int)),
            (DW_AT_location, Value::SecOffset(0)),
        ],
    );
    let n = unit.die(
        DW_TAG_variable,
        false,
        &[
            (DW_AT_name, Value::Str("n")),
            (DW_AT_type, Value::Ref(int)),
            (DW_AT_location, Value::Expr(vec![DW_OP_fbreg.0, 0x6c])),
        ],
    );
    let argc = unit.die(
        DW_TAG_formal_parameter,
        false,
        &[
            (DW_AT_name, Value::Str("argc")),
            (DW_AT_type, Value::Ref(int)),
            (DW_AT_location, Value::Expr(vec![DW_OP_breg6.0, 0x78])),
        ],
    );
    let total = unit.die(
        DW_TAG_variable,
        false,
        &[
            (DW_AT_name, Value::Str("total")),
            (DW_AT_type, Value::Ref(int)),
            (
                DW_AT_location,
                Value::Expr(vec![
                    DW_OP_addr.0,
                    0x00,
                    0x10,
                    0,
                    0,
                    0,
                    0,
                    0,
                    0,
                    DW_OP_plus_uconst.0,
                    16,
                ]),
            ),
        ],
    );
    unit.end();
    unit.end();
    let offsets = unit.finish();
    let (abbrev, info) = dwarf.finish();

    let mut lines = LineProgram::new(4);
    lines
        .file("a.go", 0)
        .set_address(MAIN_LOW)
        .advance_line(9)
        .copy()
        .advance_pc(0x10)
        .advance_line(1)
        .copy()
        .advance_pc(0x10)
        .end_sequence();

    let mut loc = Bytes::new();
    loc_base(&mut loc, 0);
    loc_entry(&mut loc, 0x100, 0x120, &[DW_OP_reg3.0]);
    loc_entry(&mut loc, 0x120, 0x140, &[DW_OP_fbreg.0, 0x78]);
    loc_end(&mut loc);

    let mut frame = Bytes::new();
    let cie = debug_frame_cie(&mut frame);
    debug_frame_fde(&mut frame, cie, MAIN_LOW, MAIN_LEN, &frame_pointer_prologue());

    let sections = Sections::new(RunTimeEndian::Little)
        .with(SectionId::DebugAbbrev, abbrev)
        .with(SectionId::DebugInfo, info)
        .with(SectionId::DebugLine, lines.finish())
        .with(SectionId::DebugLoc, loc.into_vec())
        .with(SectionId::DebugFrame, frame.into_vec());

    let dies = SampleDies {
        unit: offsets[cu],
        unsigned_char: offsets[uchar],
        int: offsets[int],
        flags: offsets[flags],
        node: offsets[node],
        node_ptr: offsets[node_ptr],
        main: offsets[main],
        x: offsets[x],
        n: offsets[n],
        argc: offsets[argc],
        total: offsets[total],
    };
    (sections, dies)
}

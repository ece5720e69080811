//! # Call Frame Information
//!
//! Decoding of `.debug_frame` and `.eh_frame` into unwind rows.
//!
//! Both sections hold a sequence of CIEs (Common Information Entries) and
//! FDEs (Frame Description Entries). A CIE carries alignment factors, the
//! return-address register and initial instructions shared by its FDEs; an
//! FDE covers one PC range and carries the instructions that evolve the
//! rules across it. Replaying CIE then FDE instructions yields one
//! [`UnwindRow`] per PC sub-range.
//!
//! ## Section Differences
//!
//! - **`.debug_frame`**: CIE id is all ones, CIE pointers are section offsets,
//!   addresses are absolute and address-sized, CIE versions 1, 3 and 4.
//! - **`.eh_frame`**: CIE id is 0, CIE pointers are relative to the pointer
//!   field, and the `z` augmentation describes pointer encodings (`R`),
//!   personality routines (`P`), LSDA pointers (`L`) and signal frames (`S`).
//!
//! ## Rule Evaluation
//!
//! [`UnwindRow::cfa_value`] and [`UnwindRow::recover_register`] evaluate the
//! rules of a row against a paused target; [`UnwindRow::caller_frame`]
//! combines them into one stack-walking step.
//!
//! ## References
//!
//! - [DWARF 4, section 6.4 "Call Frame Information"](https://dwarfstd.org/doc/DWARF4.pdf)
//! - [LSB, "Exception Frames"](https://refspecs.linuxfoundation.org/LSB_5.0.0/LSB-Core-generic/LSB-Core-generic/ehframechpt.html)

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use gimli::constants::{self, DwCfa, DwEhPe};
use gimli::{Register, RunTimeEndian, SectionId};

use crate::error::{DwarfError, Result};
use crate::expression::{Location, LocationExpression, TargetAccess};
use crate::reader::{Encoding, Reader};

/// How to compute the canonical frame address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CfaRule
{
    /// `register + offset`
    RegisterOffset
    {
        register: Register,
        offset: i64,
    },
    /// Value of a location expression
    Expression(LocationExpression),
}

/// How to recover a register's value in the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterRule
{
    /// The value cannot be recovered
    Undefined,
    /// The register was not modified
    SameValue,
    /// Saved in memory at `CFA + n`
    Offset(i64),
    /// The value is `CFA + n`
    ValOffset(i64),
    /// Saved in another register
    Register(Register),
    /// Saved in memory at the address computed by the expression (CFA pushed first)
    Expression(LocationExpression),
    /// The value is computed by the expression (CFA pushed first)
    ValExpression(LocationExpression),
}

/// Unwind rules valid over `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindRow
{
    pub start: u64,
    pub end: u64,
    pub cfa: CfaRule,
    /// Rules for registers the instructions mention; others keep their value
    pub registers: BTreeMap<Register, RegisterRule>,
    pub return_address_register: Register,
    /// Offset of the FDE the row was produced from
    pub fde_offset: usize,
    encoding: Encoding,
}

/// The caller's PC and stack pointer, recovered from one unwind row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerFrame
{
    /// Return address in the caller
    pub pc: u64,
    /// CFA of the callee, which is the caller's stack pointer at the call site
    pub cfa: u64,
}

impl UnwindRow
{
    pub fn contains(&self, pc: u64) -> bool
    {
        self.start <= pc && pc < self.end
    }

    /// Rule for `register`; registers without an explicit rule keep their value.
    pub fn register(&self, register: Register) -> RegisterRule
    {
        self.registers
            .get(&register)
            .cloned()
            .unwrap_or(RegisterRule::SameValue)
    }

    /// Evaluate the CFA rule.
    ///
    /// ## Errors
    ///
    /// Propagates target and expression errors; `MalformedCallFrame` if a CFA
    /// expression does not produce an address.
    pub fn cfa_value<T: TargetAccess + ?Sized>(&self, target: &mut T) -> Result<u64>
    {
        match &self.cfa {
            CfaRule::RegisterOffset { register, offset } => {
                let base = target.read_register(*register)?;
                Ok(base.wrapping_add(*offset as u64) & self.encoding.max_address())
            }
            CfaRule::Expression(expr) => match expr.evaluator().evaluate(target)? {
                Location::Address(value) | Location::Value(value) => Ok(value),
                _ => Err(DwarfError::MalformedCallFrame {
                    offset: self.fde_offset,
                    reason: "CFA expression did not produce an address".to_string(),
                }),
            },
        }
    }

    /// Recover the caller's value of `register`, given the already computed CFA.
    ///
    /// Returns `Ok(None)` when the rule is `Undefined`.
    ///
    /// ## Errors
    ///
    /// Propagates target and expression errors.
    pub fn recover_register<T: TargetAccess + ?Sized>(&self, register: Register, target: &mut T, cfa: u64)
        -> Result<Option<u64>>
    {
        let mask = self.encoding.max_address();
        let value = match self.register(register) {
            RegisterRule::Undefined => return Ok(None),
            RegisterRule::SameValue => target.read_register(register)?,
            RegisterRule::Offset(offset) => self.read_address(target, cfa.wrapping_add(offset as u64) & mask)?,
            RegisterRule::ValOffset(offset) => cfa.wrapping_add(offset as u64) & mask,
            RegisterRule::Register(other) => target.read_register(other)?,
            RegisterRule::Expression(expr) => {
                let address = self.evaluate_with_cfa(&expr, target, cfa)?;
                self.read_address(target, address)?
            }
            RegisterRule::ValExpression(expr) => self.evaluate_with_cfa(&expr, target, cfa)?,
        };
        Ok(Some(value))
    }

    /// One stack-walking step: the caller's PC (from the return-address
    /// register) and the CFA.
    ///
    /// Returns `Ok(None)` when the return address is undefined, which marks
    /// the outermost frame.
    ///
    /// ## Errors
    ///
    /// Propagates target and expression errors.
    pub fn caller_frame<T: TargetAccess + ?Sized>(&self, target: &mut T) -> Result<Option<CallerFrame>>
    {
        let cfa = self.cfa_value(target)?;
        let pc = self.recover_register(self.return_address_register, target, cfa)?;
        Ok(pc.filter(|pc| *pc != 0).map(|pc| CallerFrame { pc, cfa }))
    }

    fn evaluate_with_cfa<T: TargetAccess + ?Sized>(&self, expr: &LocationExpression, target: &mut T, cfa: u64)
        -> Result<u64>
    {
        match expr.evaluator().with_initial_value(cfa).with_cfa(Some(cfa)).evaluate(target)? {
            Location::Address(value) | Location::Value(value) => Ok(value),
            _ => Err(DwarfError::MalformedCallFrame {
                offset: self.fde_offset,
                reason: "register expression did not produce a value".to_string(),
            }),
        }
    }

    fn read_address<T: TargetAccess + ?Sized>(&self, target: &mut T, address: u64) -> Result<u64>
    {
        let size = usize::from(self.encoding.address_size);
        let bytes = target.read_memory(address, size)?;
        let mut reader = Reader::new(&bytes, 0, self.encoding.endian);
        reader
            .sized(self.encoding.address_size)
            .map_err(|_| DwarfError::TargetAccess(format!("short read of saved register at 0x{address:x}")))
    }
}

/// A decoded CIE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonInformationEntry
{
    pub offset: usize,
    pub version: u8,
    pub augmentation: String,
    pub address_size: u8,
    pub code_alignment_factor: u64,
    pub data_alignment_factor: i64,
    pub return_address_register: Register,
    /// Encoding of FDE addresses (`R` augmentation)
    pub fde_encoding: DwEhPe,
    /// Encoding of LSDA pointers (`L` augmentation)
    pub lsda_encoding: Option<DwEhPe>,
    /// Personality routine (`P` augmentation)
    pub personality: Option<u64>,
    pub signal_frame: bool,
    has_augmentation_data: bool,
    instructions: Vec<u8>,
    instructions_offset: usize,
}

/// A decoded FDE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDescriptionEntry
{
    pub offset: usize,
    pub cie: Arc<CommonInformationEntry>,
    pub initial_location: u64,
    pub address_range: u64,
    pub lsda: Option<u64>,
    instructions: Vec<u8>,
    instructions_offset: usize,
}

impl FrameDescriptionEntry
{
    pub fn end(&self) -> u64
    {
        self.initial_location.wrapping_add(self.address_range)
    }

    pub fn contains(&self, pc: u64) -> bool
    {
        self.initial_location <= pc && pc < self.end()
    }
}

/// Parameters shared by every entry of one section.
#[derive(Debug, Clone, Copy)]
struct SectionContext
{
    section: SectionId,
    endian: RunTimeEndian,
    /// Load address of the section, for pc-relative pointers
    address: u64,
    address_size: u8,
}

/// All CIEs and FDEs of one call-frame section.
#[derive(Debug, Clone)]
pub struct CallFrameTable
{
    section: SectionId,
    endian: RunTimeEndian,
    /// Load address of the section, for pc-relative `DW_CFA_set_loc`
    section_address: u64,
    budget: usize,
    cies: HashMap<usize, Arc<CommonInformationEntry>>,
    /// Sorted by `initial_location`
    fdes: Vec<FrameDescriptionEntry>,
    errors: Vec<(usize, DwarfError)>,
}

impl CallFrameTable
{
    /// Decode every entry of a `.debug_frame` or `.eh_frame` section.
    ///
    /// `section_address` is the section's load address (pc-relative
    /// `.eh_frame` pointers are relative to it); `address_size` applies to
    /// CIEs that do not declare their own. Entries that fail to decode are
    /// skipped and reported by [`CallFrameTable::errors`].
    pub fn parse(
        data: &[u8],
        section: SectionId,
        section_address: u64,
        address_size: u8,
        endian: RunTimeEndian,
        budget: usize,
    ) -> Self
    {
        let ctx = SectionContext {
            section,
            endian,
            address: section_address,
            address_size,
        };
        let mut table = Self {
            section,
            endian,
            section_address,
            budget,
            cies: HashMap::new(),
            fdes: Vec::new(),
            errors: Vec::new(),
        };

        let mut offset = 0;
        while offset < data.len() {
            let entry = match read_entry(data, offset, &ctx) {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    table.errors.push((offset, err));
                    break;
                }
            };
            let next = entry.next;
            if !entry.is_cie {
                if let Err(err) = table.add_fde(data, &entry, &ctx) {
                    table.errors.push((offset, err));
                }
            }
            offset = next;
        }

        table.fdes.sort_by_key(|fde| fde.initial_location);
        tracing::debug!(
            section = section.name(),
            cies = table.cies.len(),
            fdes = table.fdes.len(),
            errors = table.errors.len(),
            "decoded call frame information"
        );
        table
    }

    fn add_fde(&mut self, data: &[u8], entry: &RawEntry<'_>, ctx: &SectionContext) -> Result<()>
    {
        let cie_offset = entry.cie_pointer;
        let cie = match self.cies.get(&cie_offset) {
            Some(cie) => cie.clone(),
            None => {
                let raw = read_entry(data, cie_offset, ctx)?
                    .filter(|raw| raw.is_cie)
                    .ok_or_else(|| malformed(entry.offset, format!("CIE pointer 0x{cie_offset:x} is not a CIE")))?;
                let cie = Arc::new(parse_cie(&raw, ctx)?);
                self.cies.insert(cie_offset, cie.clone());
                cie
            }
        };
        let fde = parse_fde(entry, cie, ctx)?;
        self.fdes.push(fde);
        Ok(())
    }

    pub fn section(&self) -> SectionId
    {
        self.section
    }

    pub fn fdes(&self) -> &[FrameDescriptionEntry]
    {
        &self.fdes
    }

    pub fn cies(&self) -> impl Iterator<Item = &Arc<CommonInformationEntry>>
    {
        self.cies.values()
    }

    /// Entries that could not be decoded, with their section offsets.
    pub fn errors(&self) -> &[(usize, DwarfError)]
    {
        &self.errors
    }

    /// FDE covering `pc`.
    pub fn fde_for(&self, pc: u64) -> Option<&FrameDescriptionEntry>
    {
        let upper = self.fdes.partition_point(|fde| fde.initial_location <= pc);
        self.fdes[..upper].iter().rev().find(|fde| fde.contains(pc))
    }

    /// Every row of an FDE.
    ///
    /// ## Errors
    ///
    /// `MalformedCallFrame` for undecodable instructions,
    /// `InstructionBudgetExceeded` when the CIE and FDE programs together
    /// exceed the budget.
    pub fn rows(&self, fde: &FrameDescriptionEntry) -> Result<Vec<UnwindRow>>
    {
        let ctx = SectionContext {
            section: self.section,
            endian: self.endian,
            address: self.section_address,
            address_size: fde.cie.address_size,
        };
        let mut machine = CfiMachine::new(fde, ctx, self.budget);
        machine.run(&fde.cie.instructions, fde.cie.instructions_offset, true)?;
        machine.initial = machine.registers.clone();
        machine.run(&fde.instructions, fde.instructions_offset, false)?;
        machine.finish();
        Ok(machine.rows)
    }

    /// The unwind row in effect at `pc`.
    ///
    /// ## Errors
    ///
    /// Propagates [`CallFrameTable::rows`] errors for the covering FDE.
    pub fn unwind_at(&self, pc: u64) -> Result<Option<UnwindRow>>
    {
        let Some(fde) = self.fde_for(pc) else {
            return Ok(None);
        };
        Ok(self.rows(fde)?.into_iter().find(|row| row.contains(pc)))
    }
}

/// Framing of one entry before its body is interpreted.
struct RawEntry<'a>
{
    offset: usize,
    is_cie: bool,
    /// Section offset of the CIE, for FDEs
    cie_pointer: usize,
    /// Reader over the body after the id field
    body: Reader<'a>,
    next: usize,
}

fn malformed(offset: usize, reason: impl Into<String>) -> DwarfError
{
    DwarfError::MalformedCallFrame {
        offset,
        reason: reason.into(),
    }
}

/// Read the length and id of the entry at `offset`; `None` at an `.eh_frame` terminator.
fn read_entry<'a>(data: &'a [u8], offset: usize, ctx: &SectionContext) -> Result<Option<RawEntry<'a>>>
{
    let truncated = |_| malformed(offset, "entry header runs past the section");
    let bytes = data
        .get(offset..)
        .ok_or_else(|| malformed(offset, "offset is past the end of the section"))?;
    let mut reader = Reader::new(bytes, offset, ctx.endian).with_address_size(ctx.address_size);
    let length = reader.initial_length().map_err(truncated)?;
    if length == 0 && ctx.section == SectionId::EhFrame {
        return Ok(None);
    }
    let length = usize::try_from(length)
        .ok()
        .filter(|len| *len <= reader.remaining())
        .ok_or_else(|| malformed(offset, "entry length runs past the section"))?;
    let mut body = reader.split(length).map_err(truncated)?;
    let next = reader.offset();
    if length == 0 {
        // A zero-length .debug_frame entry is padding.
        return Ok(Some(RawEntry {
            offset,
            is_cie: true,
            cie_pointer: 0,
            body,
            next,
        }));
    }

    let id_field = body.offset();
    let id = body.section_offset().map_err(truncated)?;
    let (is_cie, cie_pointer) = match ctx.section {
        SectionId::EhFrame => (id == 0, id_field.wrapping_sub(id as usize)),
        _ => {
            let all_ones = if body.offset_size() == 8 {
                u64::MAX
            } else {
                u64::from(u32::MAX)
            };
            (id == all_ones, id as usize)
        }
    };
    Ok(Some(RawEntry {
        offset,
        is_cie,
        cie_pointer,
        body,
        next,
    }))
}

fn parse_cie(raw: &RawEntry<'_>, ctx: &SectionContext) -> Result<CommonInformationEntry>
{
    let offset = raw.offset;
    let truncated = |_| malformed(offset, "truncated CIE");
    let mut body = raw.body.clone();

    let version = body.u8().map_err(truncated)?;
    let supported = match ctx.section {
        SectionId::EhFrame => matches!(version, 1 | 3),
        _ => matches!(version, 1 | 3 | 4),
    };
    if !supported {
        return Err(malformed(offset, format!("unsupported CIE version {version}")));
    }
    let augmentation = String::from_utf8_lossy(body.cstr().map_err(truncated)?).into_owned();
    let mut address_size = ctx.address_size;
    if version == 4 {
        address_size = body.u8().map_err(truncated)?;
        let segment_size = body.u8().map_err(truncated)?;
        if segment_size != 0 {
            return Err(malformed(offset, "segmented addressing is not supported"));
        }
    }
    body = body.with_address_size(address_size);
    let code_alignment_factor = body.uleb128().map_err(truncated)?;
    let data_alignment_factor = body.sleb128().map_err(truncated)?;
    let return_address_register = if version == 1 {
        u64::from(body.u8().map_err(truncated)?)
    } else {
        body.uleb128().map_err(truncated)?
    };
    let return_address_register = u16::try_from(return_address_register)
        .map(Register)
        .map_err(|_| malformed(offset, "return address register out of range"))?;

    let mut cie = CommonInformationEntry {
        offset,
        version,
        augmentation: augmentation.clone(),
        address_size,
        code_alignment_factor,
        data_alignment_factor,
        return_address_register,
        fde_encoding: constants::DW_EH_PE_absptr,
        lsda_encoding: None,
        personality: None,
        signal_frame: false,
        has_augmentation_data: false,
        instructions: Vec::new(),
        instructions_offset: 0,
    };

    if let Some(rest) = augmentation.strip_prefix('z') {
        cie.has_augmentation_data = true;
        let len = body.uleb128_usize().map_err(truncated)?;
        let mut data = body.split(len).map_err(truncated)?;
        for flag in rest.chars() {
            match flag {
                'R' => cie.fde_encoding = DwEhPe(data.u8().map_err(truncated)?),
                'L' => cie.lsda_encoding = Some(DwEhPe(data.u8().map_err(truncated)?)),
                'P' => {
                    let encoding = DwEhPe(data.u8().map_err(truncated)?);
                    cie.personality = Some(read_pointer(&mut data, encoding, ctx, offset)?);
                }
                'S' => cie.signal_frame = true,
                // Later flags cannot be interpreted; the length lets us skip them.
                _ => break,
            }
        }
    } else if !augmentation.is_empty() {
        return Err(malformed(offset, format!("unsupported augmentation {augmentation:?}")));
    }

    cie.instructions_offset = body.offset();
    cie.instructions = body.bytes(body.remaining()).map_err(truncated)?.to_vec();
    Ok(cie)
}

fn parse_fde(raw: &RawEntry<'_>, cie: Arc<CommonInformationEntry>, ctx: &SectionContext)
    -> Result<FrameDescriptionEntry>
{
    let offset = raw.offset;
    let truncated = |_| malformed(offset, "truncated FDE");
    let mut body = raw.body.clone().with_address_size(cie.address_size);

    let initial_location = read_pointer(&mut body, cie.fde_encoding, ctx, offset)?;
    let range_encoding = DwEhPe(cie.fde_encoding.0 & 0x0f);
    let address_range = read_pointer(&mut body, range_encoding, ctx, offset)?;

    let mut lsda = None;
    if cie.has_augmentation_data {
        let len = body.uleb128_usize().map_err(truncated)?;
        let mut data = body.split(len).map_err(truncated)?;
        if let Some(encoding) = cie.lsda_encoding.filter(|encoding| *encoding != constants::DW_EH_PE_omit) {
            lsda = Some(read_pointer(&mut data, encoding, ctx, offset)?);
        }
    }

    let instructions_offset = body.offset();
    let instructions = body.bytes(body.remaining()).map_err(truncated)?.to_vec();
    Ok(FrameDescriptionEntry {
        offset,
        cie,
        initial_location,
        address_range,
        lsda,
        instructions,
        instructions_offset,
    })
}

/// Read a pointer in an `.eh_frame` encoding.
///
/// Only absolute and pc-relative applications are supported; data- and
/// text-relative pointers need base addresses the engine is never given.
fn read_pointer(reader: &mut Reader<'_>, encoding: DwEhPe, ctx: &SectionContext, entry: usize) -> Result<u64>
{
    let truncated = |_| malformed(entry, "pointer runs past the entry");
    if encoding == constants::DW_EH_PE_omit {
        return Err(malformed(entry, "pointer encoding is DW_EH_PE_omit"));
    }
    if encoding.0 & 0x80 != 0 {
        return Err(malformed(entry, "indirect pointers are not supported"));
    }
    let field = ctx.address.wrapping_add(reader.offset() as u64);
    let value = match DwEhPe(encoding.0 & 0x0f) {
        constants::DW_EH_PE_absptr => reader.address(),
        constants::DW_EH_PE_uleb128 => reader.uleb128(),
        constants::DW_EH_PE_udata2 => reader.u16().map(u64::from),
        constants::DW_EH_PE_udata4 => reader.u32().map(u64::from),
        constants::DW_EH_PE_udata8 => reader.u64(),
        constants::DW_EH_PE_sleb128 => reader.sleb128().map(|v| v as u64),
        constants::DW_EH_PE_sdata2 => reader.i16().map(|v| i64::from(v) as u64),
        constants::DW_EH_PE_sdata4 => reader.i32().map(|v| i64::from(v) as u64),
        constants::DW_EH_PE_sdata8 => reader.i64().map(|v| v as u64),
        _ => return Err(malformed(entry, format!("unknown pointer format 0x{:02x}", encoding.0))),
    }
    .map_err(truncated)?;

    let mask = match reader.address_size() {
        size if size >= 8 => u64::MAX,
        size => (1u64 << (u32::from(size) * 8)) - 1,
    };
    match encoding.0 & 0x70 {
        0x00 => Ok(value & mask),
        0x10 => Ok(field.wrapping_add(value) & mask),
        application => Err(malformed(
            entry,
            format!("unsupported pointer application 0x{application:02x}"),
        )),
    }
}

type RuleSet = BTreeMap<Register, RegisterRule>;

/// State of a CIE + FDE instruction replay.
struct CfiMachine<'f>
{
    fde: &'f FrameDescriptionEntry,
    encoding: Encoding,
    endian: RunTimeEndian,
    ctx: SectionContext,
    budget: usize,
    executed: usize,
    location: u64,
    cfa: Option<CfaRule>,
    registers: RuleSet,
    /// Rules after the CIE's initial instructions, for `DW_CFA_restore*`
    initial: RuleSet,
    saved: Vec<(Option<CfaRule>, RuleSet)>,
    rows: Vec<UnwindRow>,
}

impl<'f> CfiMachine<'f>
{
    fn new(fde: &'f FrameDescriptionEntry, ctx: SectionContext, budget: usize) -> Self
    {
        let endian = ctx.endian;
        Self {
            fde,
            encoding: Encoding {
                address_size: fde.cie.address_size,
                offset_size: 4,
                version: 4,
                endian,
            },
            endian,
            ctx,
            budget,
            executed: 0,
            location: fde.initial_location,
            cfa: None,
            registers: RuleSet::new(),
            initial: RuleSet::new(),
            saved: Vec::new(),
            rows: Vec::new(),
        }
    }

    fn run(&mut self, instructions: &[u8], base: usize, in_cie: bool) -> Result<()>
    {
        let cie = self.fde.cie.clone();
        let offset = self.fde.offset;
        let truncated = |_| malformed(offset, "call frame instruction runs past the entry");
        let mut reader = Reader::new(instructions, base, self.endian).with_address_size(cie.address_size);
        let data_factor = cie.data_alignment_factor;

        while !reader.is_empty() {
            self.executed += 1;
            if self.executed > self.budget {
                return Err(DwarfError::InstructionBudgetExceeded { budget: self.budget });
            }
            let at = reader.offset();
            let byte = reader.u8().map_err(truncated)?;
            let low = byte & 0x3f;
            match DwCfa(byte & 0xc0) {
                constants::DW_CFA_advance_loc => {
                    self.advance(u64::from(low).wrapping_mul(cie.code_alignment_factor));
                    continue;
                }
                constants::DW_CFA_offset => {
                    let factored = reader.uleb128().map_err(truncated)?;
                    self.set_rule(u16::from(low), RegisterRule::Offset((factored as i64).wrapping_mul(data_factor)));
                    continue;
                }
                constants::DW_CFA_restore => {
                    self.restore(Register(u16::from(low)), in_cie);
                    continue;
                }
                _ => {}
            }

            match DwCfa(byte) {
                constants::DW_CFA_nop => {}
                constants::DW_CFA_set_loc => {
                    // Same encoding as the FDE's initial location, pc-relative included.
                    let target = read_pointer(&mut reader, cie.fde_encoding, &self.ctx, offset)?;
                    if target < self.location {
                        return Err(malformed(at, "DW_CFA_set_loc moves backwards"));
                    }
                    self.emit_until(target);
                }
                constants::DW_CFA_advance_loc1 => {
                    let delta = u64::from(reader.u8().map_err(truncated)?);
                    self.advance(delta.wrapping_mul(cie.code_alignment_factor));
                }
                constants::DW_CFA_advance_loc2 => {
                    let delta = u64::from(reader.u16().map_err(truncated)?);
                    self.advance(delta.wrapping_mul(cie.code_alignment_factor));
                }
                constants::DW_CFA_advance_loc4 => {
                    let delta = u64::from(reader.u32().map_err(truncated)?);
                    self.advance(delta.wrapping_mul(cie.code_alignment_factor));
                }
                constants::DW_CFA_offset_extended => {
                    let register = register_number(&mut reader, offset)?;
                    let factored = reader.uleb128().map_err(truncated)?;
                    self.set_rule(register, RegisterRule::Offset((factored as i64).wrapping_mul(data_factor)));
                }
                constants::DW_CFA_offset_extended_sf => {
                    let register = register_number(&mut reader, offset)?;
                    let factored = reader.sleb128().map_err(truncated)?;
                    self.set_rule(register, RegisterRule::Offset(factored.wrapping_mul(data_factor)));
                }
                constants::DW_CFA_GNU_negative_offset_extended => {
                    let register = register_number(&mut reader, offset)?;
                    let factored = reader.uleb128().map_err(truncated)?;
                    self.set_rule(
                        register,
                        RegisterRule::Offset((factored as i64).wrapping_neg().wrapping_mul(data_factor)),
                    );
                }
                constants::DW_CFA_val_offset => {
                    let register = register_number(&mut reader, offset)?;
                    let factored = reader.uleb128().map_err(truncated)?;
                    self.set_rule(register, RegisterRule::ValOffset((factored as i64).wrapping_mul(data_factor)));
                }
                constants::DW_CFA_val_offset_sf => {
                    let register = register_number(&mut reader, offset)?;
                    let factored = reader.sleb128().map_err(truncated)?;
                    self.set_rule(register, RegisterRule::ValOffset(factored.wrapping_mul(data_factor)));
                }
                constants::DW_CFA_restore_extended => {
                    let register = register_number(&mut reader, offset)?;
                    self.restore(Register(register), in_cie);
                }
                constants::DW_CFA_undefined => {
                    let register = register_number(&mut reader, offset)?;
                    self.set_rule(register, RegisterRule::Undefined);
                }
                constants::DW_CFA_same_value => {
                    let register = register_number(&mut reader, offset)?;
                    self.set_rule(register, RegisterRule::SameValue);
                }
                constants::DW_CFA_register => {
                    let target = register_number(&mut reader, offset)?;
                    let source = register_number(&mut reader, offset)?;
                    self.set_rule(target, RegisterRule::Register(Register(source)));
                }
                constants::DW_CFA_remember_state => {
                    self.saved.push((self.cfa.clone(), self.registers.clone()));
                }
                constants::DW_CFA_restore_state => {
                    let (cfa, registers) = self
                        .saved
                        .pop()
                        .ok_or_else(|| malformed(at, "DW_CFA_restore_state without a remembered state"))?;
                    self.cfa = cfa;
                    self.registers = registers;
                }
                constants::DW_CFA_def_cfa => {
                    let register = register_number(&mut reader, offset)?;
                    let cfa_offset = reader.uleb128().map_err(truncated)?;
                    self.cfa = Some(CfaRule::RegisterOffset {
                        register: Register(register),
                        offset: cfa_offset as i64,
                    });
                }
                constants::DW_CFA_def_cfa_sf => {
                    let register = register_number(&mut reader, offset)?;
                    let factored = reader.sleb128().map_err(truncated)?;
                    self.cfa = Some(CfaRule::RegisterOffset {
                        register: Register(register),
                        offset: factored.wrapping_mul(data_factor),
                    });
                }
                constants::DW_CFA_def_cfa_register => {
                    let new_register = Register(register_number(&mut reader, offset)?);
                    match &mut self.cfa {
                        Some(CfaRule::RegisterOffset { register, .. }) => *register = new_register,
                        _ => return Err(malformed(at, "DW_CFA_def_cfa_register without a register CFA")),
                    }
                }
                constants::DW_CFA_def_cfa_offset => {
                    let new_offset = reader.uleb128().map_err(truncated)? as i64;
                    self.set_cfa_offset(at, new_offset)?;
                }
                constants::DW_CFA_def_cfa_offset_sf => {
                    let new_offset = reader.sleb128().map_err(truncated)?.wrapping_mul(data_factor);
                    self.set_cfa_offset(at, new_offset)?;
                }
                constants::DW_CFA_def_cfa_expression => {
                    let expr = self.expression(&mut reader, offset)?;
                    self.cfa = Some(CfaRule::Expression(expr));
                }
                constants::DW_CFA_expression => {
                    let register = register_number(&mut reader, offset)?;
                    let expr = self.expression(&mut reader, offset)?;
                    self.set_rule(register, RegisterRule::Expression(expr));
                }
                constants::DW_CFA_val_expression => {
                    let register = register_number(&mut reader, offset)?;
                    let expr = self.expression(&mut reader, offset)?;
                    self.set_rule(register, RegisterRule::ValExpression(expr));
                }
                constants::DW_CFA_GNU_args_size => {
                    reader.uleb128().map_err(truncated)?;
                }
                other => {
                    return Err(malformed(at, format!("unknown call frame instruction 0x{:02x}", other.0)));
                }
            }
        }
        Ok(())
    }

    fn set_rule(&mut self, register: u16, rule: RegisterRule)
    {
        self.registers.insert(Register(register), rule);
    }

    fn set_cfa_offset(&mut self, at: usize, new_offset: i64) -> Result<()>
    {
        match &mut self.cfa {
            Some(CfaRule::RegisterOffset { offset, .. }) => {
                *offset = new_offset;
                Ok(())
            }
            _ => Err(malformed(at, "CFA offset changed without a register CFA")),
        }
    }

    fn restore(&mut self, register: Register, in_cie: bool)
    {
        match self.initial.get(&register).filter(|_| !in_cie) {
            Some(rule) => {
                self.registers.insert(register, rule.clone());
            }
            None => {
                self.registers.remove(&register);
            }
        }
    }

    fn expression(&self, reader: &mut Reader<'_>, offset: usize) -> Result<LocationExpression>
    {
        let len = reader
            .uleb128_usize()
            .map_err(|_| malformed(offset, "truncated expression length"))?;
        let bytes = reader
            .bytes(len)
            .map_err(|_| malformed(offset, "expression runs past the entry"))?;
        LocationExpression::parse(bytes, self.encoding)
    }

    fn advance(&mut self, delta: u64)
    {
        let target = self.location.wrapping_add(delta);
        self.emit_until(target);
    }

    /// Close the row that started at the current location and move to `target`.
    fn emit_until(&mut self, target: u64)
    {
        let target = target.min(self.fde.end());
        if target > self.location {
            self.push_row(target);
            self.location = target;
        }
    }

    fn finish(&mut self)
    {
        self.push_row(self.fde.end());
    }

    fn push_row(&mut self, end: u64)
    {
        if end <= self.location {
            return;
        }
        let Some(cfa) = self.cfa.clone() else {
            return;
        };
        self.rows.push(UnwindRow {
            start: self.location,
            end,
            cfa,
            registers: self.registers.clone(),
            return_address_register: self.fde.cie.return_address_register,
            fde_offset: self.fde.offset,
            encoding: self.encoding,
        });
    }
}

fn register_number(reader: &mut Reader<'_>, entry: usize) -> Result<u16>
{
    let value = reader
        .uleb128()
        .map_err(|_| malformed(entry, "truncated register number"))?;
    u16::try_from(value).map_err(|_| malformed(entry, format!("register number {value} out of range")))
}

#[cfg(test)]
mod tests
{
    use std::collections::HashMap;

    use super::*;
    use crate::expression::TargetFns;
    use crate::test_util::ByteWriter;

    const CFA_SP: u8 = 7;
    const RA: u8 = 16;

    /// CIE: version 1, code align 1, data align -8, RA r16,
    /// initial `def_cfa r7+8; offset r16 at cfa-8`.
    fn debug_frame_cie(w: &mut ByteWriter)
    {
        let start = w.len();
        w.u32(0).u32(0xffff_ffff).u8(1).cstr("").uleb(1).sleb(-8).u8(RA);
        w.u8(constants::DW_CFA_def_cfa.0).uleb(CFA_SP.into()).uleb(8);
        w.u8(constants::DW_CFA_offset.0 | RA).uleb(1);
        let len = (w.len() - start - 4) as u32;
        w.patch_u32(start, len);
    }

    fn debug_frame_fde(w: &mut ByteWriter, low: u64, len: u64, instructions: &[u8])
    {
        let start = w.len();
        w.u32(0).u32(0).u64(low).u64(len).bytes(instructions);
        let total = (w.len() - start - 4) as u32;
        w.patch_u32(start, total);
    }

    fn prologue() -> Vec<u8>
    {
        let mut w = ByteWriter::new();
        w.u8(constants::DW_CFA_advance_loc.0 | 1);
        w.u8(constants::DW_CFA_def_cfa_offset.0).uleb(16);
        w.u8(constants::DW_CFA_offset.0 | 6).uleb(2);
        w.u8(constants::DW_CFA_advance_loc.0 | 3);
        w.u8(constants::DW_CFA_def_cfa_register.0).uleb(6);
        w.into_bytes()
    }

    fn table(bytes: &[u8]) -> CallFrameTable
    {
        CallFrameTable::parse(bytes, SectionId::DebugFrame, 0, 8, RunTimeEndian::Little, 10_000)
    }

    #[test]
    fn test_rows_follow_prologue()
    {
        let mut w = ByteWriter::new();
        debug_frame_cie(&mut w);
        debug_frame_fde(&mut w, 0x1000, 0x40, &prologue());
        let table = table(w.as_slice());
        assert!(table.errors().is_empty());

        let rows = table.rows(&table.fdes()[0]).unwrap();
        let spans: Vec<(u64, u64)> = rows.iter().map(|row| (row.start, row.end)).collect();
        assert_eq!(spans, vec![(0x1000, 0x1001), (0x1001, 0x1004), (0x1004, 0x1040)]);
        assert_eq!(
            rows[1].cfa,
            CfaRule::RegisterOffset {
                register: Register(7),
                offset: 16
            }
        );
        assert_eq!(rows[1].register(Register(6)), RegisterRule::Offset(-16));
        assert_eq!(rows[0].register(Register(16)), RegisterRule::Offset(-8));
        assert_eq!(rows[0].register(Register(3)), RegisterRule::SameValue);
        assert_eq!(
            rows[2].cfa,
            CfaRule::RegisterOffset {
                register: Register(6),
                offset: 16
            }
        );

        let row = table.unwind_at(0x1002).unwrap().unwrap();
        assert_eq!((row.start, row.end), (0x1001, 0x1004));
        assert!(table.unwind_at(0x1040).unwrap().is_none());
        assert!(table.unwind_at(0xfff).unwrap().is_none());
    }

    #[test]
    fn test_caller_frame_reads_saved_return_address()
    {
        let mut w = ByteWriter::new();
        debug_frame_cie(&mut w);
        debug_frame_fde(&mut w, 0x1000, 0x40, &prologue());
        let table = table(w.as_slice());
        let row = table.unwind_at(0x1002).unwrap().unwrap();

        let registers: HashMap<u16, u64> = [(7, 0x7000), (6, 0x7100)].into_iter().collect();
        let memory: HashMap<u64, u64> = [(0x7008, 0x4444), (0x7000, 0x7200)].into_iter().collect();
        let mut target = TargetFns::new(
            |reg: Register| -> Result<u64> {
                registers
                    .get(&reg.0)
                    .copied()
                    .ok_or_else(|| DwarfError::TargetAccess(format!("r{}", reg.0)))
            },
            |address: u64, _len: usize| -> Result<Vec<u8>> {
                memory
                    .get(&address)
                    .map(|value| value.to_le_bytes().to_vec())
                    .ok_or_else(|| DwarfError::TargetAccess(format!("0x{address:x}")))
            },
        );

        assert_eq!(row.cfa_value(&mut target), Ok(0x7010));
        assert_eq!(row.recover_register(Register(6), &mut target, 0x7010), Ok(Some(0x7200)));
        assert!(row.recover_register(Register(3), &mut target, 0x7010).is_err());
        assert_eq!(
            row.caller_frame(&mut target),
            Ok(Some(CallerFrame {
                pc: 0x4444,
                cfa: 0x7010
            }))
        );
    }

    #[test]
    fn test_remember_and_restore_state()
    {
        let mut w = ByteWriter::new();
        w.u8(constants::DW_CFA_remember_state.0);
        w.u8(constants::DW_CFA_def_cfa_offset.0).uleb(32);
        w.u8(constants::DW_CFA_undefined.0).uleb(RA.into());
        w.u8(constants::DW_CFA_advance_loc.0 | 4);
        w.u8(constants::DW_CFA_restore_state.0);
        w.u8(constants::DW_CFA_advance_loc.0 | 4);
        w.u8(constants::DW_CFA_restore.0 | RA);
        let mut bytes = ByteWriter::new();
        debug_frame_cie(&mut bytes);
        debug_frame_fde(&mut bytes, 0x2000, 0x10, w.as_slice());
        let table = table(bytes.as_slice());
        let rows = table.rows(&table.fdes()[0]).unwrap();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].register(Register(16)), RegisterRule::Undefined);
        assert_eq!(
            rows[1].cfa,
            CfaRule::RegisterOffset {
                register: Register(7),
                offset: 8
            }
        );
        assert_eq!(rows[1].register(Register(16)), RegisterRule::Offset(-8));
        assert_eq!(rows[2].register(Register(16)), RegisterRule::Offset(-8));
    }

    #[test]
    fn test_undefined_return_address_ends_the_walk()
    {
        let mut w = ByteWriter::new();
        w.u8(constants::DW_CFA_undefined.0).uleb(RA.into());
        let mut bytes = ByteWriter::new();
        debug_frame_cie(&mut bytes);
        debug_frame_fde(&mut bytes, 0x3000, 0x10, w.as_slice());
        let row = table(bytes.as_slice()).unwind_at(0x3000).unwrap().unwrap();
        let mut target = TargetFns::new(
            |_: Register| -> Result<u64> { Ok(0x9000) },
            |_: u64, len: usize| -> Result<Vec<u8>> { Ok(vec![0; len]) },
        );
        assert_eq!(row.caller_frame(&mut target), Ok(None));
    }

    #[test]
    fn test_eh_frame_pcrel_augmentation()
    {
        let section_address = 0x10_0000u64;
        let mut w = ByteWriter::new();
        // CIE: version 1, "zR", code 1, data -8, RA 16, aug len 1, encoding pcrel|sdata4
        w.u32(0).u32(0).u8(1).cstr("zR").uleb(1).sleb(-8).u8(RA).uleb(1).u8(0x1b);
        w.u8(constants::DW_CFA_def_cfa.0).uleb(CFA_SP.into()).uleb(8);
        w.u8(constants::DW_CFA_offset.0 | RA).uleb(1);
        let cie_len = (w.len() - 4) as u32;
        w.patch_u32(0, cie_len);

        let fde_start = w.len();
        let pointer_field = fde_start + 4;
        let location_field = fde_start + 8;
        let target_pc = 0x40_1000u64;
        let relative = target_pc.wrapping_sub(section_address + location_field as u64) as u32;
        w.u32(0).u32(pointer_field as u32).u32(relative).u32(0x20).uleb(0);
        w.u8(constants::DW_CFA_nop.0);
        let fde_len = (w.len() - fde_start - 4) as u32;
        w.patch_u32(fde_start, fde_len);
        w.u32(0);

        let table = CallFrameTable::parse(
            w.as_slice(),
            SectionId::EhFrame,
            section_address,
            8,
            RunTimeEndian::Little,
            10_000,
        );
        assert!(table.errors().is_empty(), "{:?}", table.errors());
        let fde = table.fde_for(0x40_1010).unwrap();
        assert_eq!((fde.initial_location, fde.end()), (0x40_1000, 0x40_1020));
        assert_eq!(fde.cie.augmentation, "zR");
        let row = table.unwind_at(0x40_1000).unwrap().unwrap();
        assert_eq!(row.register(Register(16)), RegisterRule::Offset(-8));
    }

    #[test]
    fn test_eh_frame_set_loc_is_pc_relative()
    {
        let section_address = 0x10_0000u64;
        let mut w = ByteWriter::new();
        w.u32(0).u32(0).u8(1).cstr("zR").uleb(1).sleb(-8).u8(RA).uleb(1).u8(0x1b);
        w.u8(constants::DW_CFA_def_cfa.0).uleb(CFA_SP.into()).uleb(8);
        let cie_len = (w.len() - 4) as u32;
        w.patch_u32(0, cie_len);

        let fde_start = w.len();
        let pointer_field = fde_start + 4;
        let location_field = fde_start + 8;
        let relative = 0x40_1000u64.wrapping_sub(section_address + location_field as u64) as u32;
        w.u32(0).u32(pointer_field as u32).u32(relative).u32(0x20).uleb(0);
        w.u8(constants::DW_CFA_set_loc.0);
        let set_loc_field = w.len();
        let relative = 0x40_1008u64.wrapping_sub(section_address + set_loc_field as u64) as u32;
        w.u32(relative);
        w.u8(constants::DW_CFA_def_cfa_offset.0).uleb(16);
        let fde_len = (w.len() - fde_start - 4) as u32;
        w.patch_u32(fde_start, fde_len);
        w.u32(0);

        let table = CallFrameTable::parse(
            w.as_slice(),
            SectionId::EhFrame,
            section_address,
            8,
            RunTimeEndian::Little,
            10_000,
        );
        assert!(table.errors().is_empty(), "{:?}", table.errors());
        let rows = table.rows(&table.fdes()[0]).unwrap();
        let spans: Vec<(u64, u64)> = rows.iter().map(|row| (row.start, row.end)).collect();
        assert_eq!(spans, vec![(0x40_1000, 0x40_1008), (0x40_1008, 0x40_1020)]);
        assert_eq!(
            rows[1].cfa,
            CfaRule::RegisterOffset {
                register: Register(CFA_SP.into()),
                offset: 16
            }
        );
    }

    #[test]
    fn test_expression_rules()
    {
        let mut w = ByteWriter::new();
        // CFA = r7 + 24 via expression; r3 = CFA - 4 (value)
        w.u8(constants::DW_CFA_def_cfa_expression.0).uleb(2).u8(constants::DW_OP_breg7.0).sleb(24);
        w.u8(constants::DW_CFA_val_expression.0).uleb(3).uleb(3);
        w.u8(constants::DW_OP_const1s.0).u8((-4i8) as u8);
        w.u8(constants::DW_OP_plus.0);
        let mut bytes = ByteWriter::new();
        debug_frame_cie(&mut bytes);
        debug_frame_fde(&mut bytes, 0x5000, 0x10, w.as_slice());
        let row = table(bytes.as_slice()).unwind_at(0x5004).unwrap().unwrap();

        let mut target = TargetFns::new(
            |_: Register| -> Result<u64> { Ok(0x8000) },
            |_: u64, len: usize| -> Result<Vec<u8>> { Ok(vec![0; len]) },
        );
        let cfa = row.cfa_value(&mut target).unwrap();
        assert_eq!(cfa, 0x8018);
        assert_eq!(row.recover_register(Register(3), &mut target, cfa), Ok(Some(0x8014)));
    }

    #[test]
    fn test_malformed_entries_are_reported()
    {
        let mut w = ByteWriter::new();
        debug_frame_cie(&mut w);
        debug_frame_fde(&mut w, 0x1000, 0x10, &[0x3f]);
        let table = table(w.as_slice());
        assert!(matches!(
            table.unwind_at(0x1000),
            Err(DwarfError::MalformedCallFrame { reason, .. }) if reason.contains("unknown")
        ));

        let mut w = ByteWriter::new();
        debug_frame_cie(&mut w);
        w.u32(0x100).u32(0);
        let table = self::table(w.as_slice());
        assert!(table.fdes().is_empty());
        assert!(matches!(table.errors(), [(_, DwarfError::MalformedCallFrame { .. })]));
    }

    #[test]
    fn test_instruction_budget()
    {
        let nops = vec![constants::DW_CFA_nop.0; 64];
        let mut w = ByteWriter::new();
        debug_frame_cie(&mut w);
        debug_frame_fde(&mut w, 0x1000, 0x10, &nops);
        let table = CallFrameTable::parse(w.as_slice(), SectionId::DebugFrame, 0, 8, RunTimeEndian::Little, 16);
        assert_eq!(
            table.unwind_at(0x1000),
            Err(DwarfError::InstructionBudgetExceeded { budget: 16 })
        );
    }
}

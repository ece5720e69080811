//! # Location Expressions
//!
//! DWARF location expressions are programs for a small stack machine that
//! compute where a variable lives: a memory address, a register, a literal
//! value, or a list of pieces when one source-level value is split across
//! several storage locations.
//!
//! ## Evaluation
//!
//! Bytecode is decoded once into [`Operation`]s through an opcode table
//! (operand shape + minimum stack depth), then interpreted by
//! [`Evaluator`]. Every run is bounded by an instruction budget and a stack
//! depth limit so that malformed input cannot hang or exhaust memory.
//!
//! Live state comes from a [`TargetAccess`] implementation supplied by the
//! target-control layer. Evaluation takes it by `&mut`, so two evaluations can
//! never interleave their reads on the same paused target.
//!
//! ## References
//!
//! - [DWARF 4, section 2.5 "DWARF Expressions"](https://dwarfstd.org/doc/DWARF4.pdf)

mod eval;
mod ops;

use gimli::Register;

pub use self::eval::Evaluator;
pub use self::ops::{decode, op_info, OpInfo, Operand, OperandShape, Operation};
use crate::error::{DwarfError, Result};
use crate::reader::Encoding;

/// Read access to a paused target.
///
/// ## Implementation Notes
///
/// Implementations should return errors for unmapped memory or unknown
/// registers rather than inventing values; the evaluator propagates them.
pub trait TargetAccess
{
    /// Read a register by its DWARF register number.
    fn read_register(&mut self, register: Register) -> Result<u64>;

    /// Read `len` bytes of target memory starting at `address`.
    fn read_memory(&mut self, address: u64, len: usize) -> Result<Vec<u8>>;
}

impl<T: TargetAccess + ?Sized> TargetAccess for &mut T
{
    fn read_register(&mut self, register: Register) -> Result<u64>
    {
        (**self).read_register(register)
    }

    fn read_memory(&mut self, address: u64, len: usize) -> Result<Vec<u8>>
    {
        (**self).read_memory(address, len)
    }
}

/// A target with no live state, for evaluating expressions that must not
/// touch registers or memory (member offsets, constant locations).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTarget;

impl TargetAccess for NoTarget
{
    fn read_register(&mut self, register: Register) -> Result<u64>
    {
        Err(DwarfError::TargetAccess(format!(
            "register {} is not available without a target",
            register.0
        )))
    }

    fn read_memory(&mut self, address: u64, _len: usize) -> Result<Vec<u8>>
    {
        Err(DwarfError::TargetAccess(format!(
            "memory at 0x{address:x} is not available without a target"
        )))
    }
}

/// Adapts a pair of closures to [`TargetAccess`].
///
/// ```rust
/// use dwarfscope_core::error::Result;
/// use dwarfscope_core::expression::{TargetAccess, TargetFns};
/// use gimli::Register;
///
/// let registers = |reg: Register| -> Result<u64> { Ok(u64::from(reg.0) * 0x10) };
/// let memory = |_address: u64, len: usize| -> Result<Vec<u8>> { Ok(vec![0; len]) };
/// let mut target = TargetFns::new(registers, memory);
/// assert_eq!(target.read_register(Register(6)).unwrap(), 0x60);
/// ```
pub struct TargetFns<R, M>
{
    registers: R,
    memory: M,
}

impl<R, M> TargetFns<R, M>
where
    R: FnMut(Register) -> Result<u64>,
    M: FnMut(u64, usize) -> Result<Vec<u8>>,
{
    pub fn new(registers: R, memory: M) -> Self
    {
        Self { registers, memory }
    }
}

impl<R, M> TargetAccess for TargetFns<R, M>
where
    R: FnMut(Register) -> Result<u64>,
    M: FnMut(u64, usize) -> Result<Vec<u8>>,
{
    fn read_register(&mut self, register: Register) -> Result<u64>
    {
        (self.registers)(register)
    }

    fn read_memory(&mut self, address: u64, len: usize) -> Result<Vec<u8>>
    {
        (self.memory)(address, len)
    }
}

/// Result of evaluating a location expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location
{
    /// The value lives in memory at this address
    Address(u64),
    /// The value lives in this register
    Register(Register),
    /// The value itself was computed (`DW_OP_stack_value`)
    Value(u64),
    /// The value is given literally (`DW_OP_implicit_value`, `DW_AT_const_value` blocks)
    ImplicitBytes(Vec<u8>),
    /// The value is split across several locations
    Pieces(Vec<Piece>),
    /// The value was optimised out
    Unavailable,
}

impl Location
{
    /// The address, if the value lives in memory.
    pub fn address(&self) -> Option<u64>
    {
        match self {
            Self::Address(address) => Some(*address),
            _ => None,
        }
    }
}

/// One fragment of a split value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece
{
    /// Where this fragment lives; never itself `Pieces`
    pub location: Location,
    pub size_bits: u64,
    /// Offset of the fragment within its location (`DW_OP_bit_piece`)
    pub bit_offset: u64,
}

/// A decoded location expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationExpression
{
    bytes: Vec<u8>,
    ops: Vec<Operation>,
    encoding: Encoding,
}

impl LocationExpression
{
    /// Decode expression bytecode.
    ///
    /// ## Errors
    ///
    /// Returns `UnknownOpcode`/`UnsupportedOpcode` for bytes the decoder cannot
    /// step over, and `UnexpectedEof` for a truncated operand.
    pub fn parse(bytes: &[u8], encoding: Encoding) -> Result<Self>
    {
        let ops = ops::decode(bytes, &encoding)?;
        Ok(Self {
            bytes: bytes.to_vec(),
            ops,
            encoding,
        })
    }

    pub fn bytes(&self) -> &[u8]
    {
        &self.bytes
    }

    pub fn operations(&self) -> &[Operation]
    {
        &self.ops
    }

    pub fn encoding(&self) -> Encoding
    {
        self.encoding
    }

    pub fn is_empty(&self) -> bool
    {
        self.ops.is_empty()
    }

    /// Whether evaluation needs the enclosing function's frame base.
    pub fn uses_frame_base(&self) -> bool
    {
        self.ops
            .iter()
            .any(|op| op.opcode == gimli::constants::DW_OP_fbreg)
    }

    /// Whether evaluation needs the canonical frame address.
    pub fn uses_cfa(&self) -> bool
    {
        self.ops
            .iter()
            .any(|op| op.opcode == gimli::constants::DW_OP_call_frame_cfa)
    }

    /// Start configuring an evaluation of this expression.
    pub fn evaluator(&self) -> Evaluator<'_>
    {
        Evaluator::new(self)
    }
}

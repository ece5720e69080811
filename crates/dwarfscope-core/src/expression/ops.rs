//! Opcode table and decoding of expression bytecode into operations.

use gimli::constants::{self, DwOp};
use once_cell::sync::Lazy;

use crate::error::{DwarfError, Result};
use crate::reader::Encoding;

/// How an opcode's operands are laid out after the opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandShape
{
    None,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    Uleb,
    Sleb,
    UlebSleb,
    UlebUleb,
    Address,
    /// Section offset (4 or 8 bytes)
    Offset,
    /// ULEB length followed by that many bytes
    Block,
}

/// Static description of one opcode.
#[derive(Debug, Clone, Copy)]
pub struct OpInfo
{
    pub shape: OperandShape,
    /// Minimum stack depth the operation needs
    pub pops: usize,
    /// Whether the evaluator implements it
    pub supported: bool,
}

const fn op(shape: OperandShape, pops: usize) -> Option<OpInfo>
{
    Some(OpInfo {
        shape,
        pops,
        supported: true,
    })
}

const fn unsupported(shape: OperandShape, pops: usize) -> Option<OpInfo>
{
    Some(OpInfo {
        shape,
        pops,
        supported: false,
    })
}

/// Opcode byte → operand shape and stack effect.
static OPCODES: Lazy<[Option<OpInfo>; 256]> = Lazy::new(|| {
    use OperandShape as S;

    let mut table = [None; 256];
    let mut set = |opcode: DwOp, info: Option<OpInfo>| table[usize::from(opcode.0)] = info;

    set(constants::DW_OP_addr, op(S::Address, 0));
    set(constants::DW_OP_deref, op(S::None, 1));
    set(constants::DW_OP_const1u, op(S::U8, 0));
    set(constants::DW_OP_const1s, op(S::I8, 0));
    set(constants::DW_OP_const2u, op(S::U16, 0));
    set(constants::DW_OP_const2s, op(S::I16, 0));
    set(constants::DW_OP_const4u, op(S::U32, 0));
    set(constants::DW_OP_const4s, op(S::I32, 0));
    set(constants::DW_OP_const8u, op(S::U64, 0));
    set(constants::DW_OP_const8s, op(S::I64, 0));
    set(constants::DW_OP_constu, op(S::Uleb, 0));
    set(constants::DW_OP_consts, op(S::Sleb, 0));
    set(constants::DW_OP_dup, op(S::None, 1));
    set(constants::DW_OP_drop, op(S::None, 1));
    set(constants::DW_OP_over, op(S::None, 2));
    set(constants::DW_OP_pick, op(S::U8, 0));
    set(constants::DW_OP_swap, op(S::None, 2));
    set(constants::DW_OP_rot, op(S::None, 3));
    set(constants::DW_OP_xderef, unsupported(S::None, 2));
    set(constants::DW_OP_abs, op(S::None, 1));
    set(constants::DW_OP_and, op(S::None, 2));
    set(constants::DW_OP_div, op(S::None, 2));
    set(constants::DW_OP_minus, op(S::None, 2));
    set(constants::DW_OP_mod, op(S::None, 2));
    set(constants::DW_OP_mul, op(S::None, 2));
    set(constants::DW_OP_neg, op(S::None, 1));
    set(constants::DW_OP_not, op(S::None, 1));
    set(constants::DW_OP_or, op(S::None, 2));
    set(constants::DW_OP_plus, op(S::None, 2));
    set(constants::DW_OP_plus_uconst, op(S::Uleb, 1));
    set(constants::DW_OP_shl, op(S::None, 2));
    set(constants::DW_OP_shr, op(S::None, 2));
    set(constants::DW_OP_shra, op(S::None, 2));
    set(constants::DW_OP_xor, op(S::None, 2));
    set(constants::DW_OP_bra, op(S::I16, 1));
    set(constants::DW_OP_eq, op(S::None, 2));
    set(constants::DW_OP_ge, op(S::None, 2));
    set(constants::DW_OP_gt, op(S::None, 2));
    set(constants::DW_OP_le, op(S::None, 2));
    set(constants::DW_OP_lt, op(S::None, 2));
    set(constants::DW_OP_ne, op(S::None, 2));
    set(constants::DW_OP_skip, op(S::I16, 0));
    for n in 0..32u8 {
        set(DwOp(constants::DW_OP_lit0.0 + n), op(S::None, 0));
        set(DwOp(constants::DW_OP_reg0.0 + n), op(S::None, 0));
        set(DwOp(constants::DW_OP_breg0.0 + n), op(S::Sleb, 0));
    }
    set(constants::DW_OP_regx, op(S::Uleb, 0));
    set(constants::DW_OP_fbreg, op(S::Sleb, 0));
    set(constants::DW_OP_bregx, op(S::UlebSleb, 0));
    set(constants::DW_OP_piece, op(S::Uleb, 0));
    set(constants::DW_OP_deref_size, op(S::U8, 1));
    set(constants::DW_OP_xderef_size, unsupported(S::U8, 2));
    set(constants::DW_OP_nop, op(S::None, 0));
    set(constants::DW_OP_push_object_address, unsupported(S::None, 0));
    set(constants::DW_OP_call2, unsupported(S::U16, 0));
    set(constants::DW_OP_call4, unsupported(S::U32, 0));
    set(constants::DW_OP_call_ref, unsupported(S::Offset, 0));
    set(constants::DW_OP_form_tls_address, unsupported(S::None, 1));
    set(constants::DW_OP_call_frame_cfa, op(S::None, 0));
    set(constants::DW_OP_bit_piece, op(S::UlebUleb, 0));
    set(constants::DW_OP_implicit_value, op(S::Block, 0));
    set(constants::DW_OP_stack_value, op(S::None, 1));
    set(constants::DW_OP_entry_value, unsupported(S::Block, 0));
    set(constants::DW_OP_GNU_push_tls_address, unsupported(S::None, 1));
    set(constants::DW_OP_GNU_entry_value, unsupported(S::Block, 0));
    table
});

/// Table entry for a raw opcode byte.
pub fn op_info(opcode: u8) -> Option<OpInfo>
{
    OPCODES[usize::from(opcode)]
}

/// Decoded operands of one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand
{
    None,
    Unsigned(u64),
    Signed(i64),
    /// Register number (or size) followed by a signed offset
    UnsignedSigned(u64, i64),
    UnsignedPair(u64, u64),
    Block(Vec<u8>),
}

/// One decoded operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation
{
    /// Byte offset of the opcode within the expression
    pub offset: usize,
    pub opcode: DwOp,
    pub operand: Operand,
}

impl Operation
{
    pub fn unsigned(&self) -> u64
    {
        match self.operand {
            Operand::Unsigned(value) | Operand::UnsignedSigned(value, _) | Operand::UnsignedPair(value, _) => value,
            Operand::Signed(value) => value as u64,
            _ => 0,
        }
    }

    pub fn signed(&self) -> i64
    {
        match self.operand {
            Operand::Signed(value) | Operand::UnsignedSigned(_, value) => value,
            Operand::Unsigned(value) => value as i64,
            _ => 0,
        }
    }
}

/// Decode expression bytecode into an ordered operation list.
///
/// ## Errors
///
/// - `UnknownOpcode` for a byte that names no operation
/// - `UnsupportedOpcode` for typed-stack and implicit-pointer operations whose operands cannot be skipped
/// - `UnexpectedEof` (relative offset) if an operand runs past the end
pub fn decode(bytes: &[u8], encoding: &Encoding) -> Result<Vec<Operation>>
{
    let mut reader = encoding.reader(bytes, 0);
    let mut ops = Vec::new();
    while !reader.is_empty() {
        let offset = reader.offset();
        let byte = reader.u8()?;
        let opcode = DwOp(byte);
        let Some(info) = op_info(byte) else {
            return Err(if opcode.static_string().is_some() {
                DwarfError::UnsupportedOpcode { offset, opcode }
            } else {
                DwarfError::UnknownOpcode { offset, opcode: byte }
            });
        };
        let operand = match info.shape {
            OperandShape::None => Operand::None,
            OperandShape::U8 => Operand::Unsigned(u64::from(reader.u8()?)),
            OperandShape::I8 => Operand::Signed(i64::from(reader.i8()?)),
            OperandShape::U16 => Operand::Unsigned(u64::from(reader.u16()?)),
            OperandShape::I16 => Operand::Signed(i64::from(reader.i16()?)),
            OperandShape::U32 => Operand::Unsigned(u64::from(reader.u32()?)),
            OperandShape::I32 => Operand::Signed(i64::from(reader.i32()?)),
            OperandShape::U64 => Operand::Unsigned(reader.u64()?),
            OperandShape::I64 => Operand::Signed(reader.i64()?),
            OperandShape::Uleb => Operand::Unsigned(reader.uleb128()?),
            OperandShape::Sleb => Operand::Signed(reader.sleb128()?),
            OperandShape::UlebSleb => Operand::UnsignedSigned(reader.uleb128()?, reader.sleb128()?),
            OperandShape::UlebUleb => Operand::UnsignedPair(reader.uleb128()?, reader.uleb128()?),
            OperandShape::Address => Operand::Unsigned(reader.address()?),
            OperandShape::Offset => Operand::Unsigned(reader.section_offset()?),
            OperandShape::Block => {
                let len = reader.uleb128_usize()?;
                Operand::Block(reader.bytes(len)?.to_vec())
            }
        };
        ops.push(Operation { offset, opcode, operand });
    }
    Ok(ops)
}

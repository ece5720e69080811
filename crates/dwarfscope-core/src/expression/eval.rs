//! The expression interpreter loop.

use gimli::constants;
use gimli::{Endianity, Register};
use smallvec::SmallVec;
use tracing::trace;

use super::ops::{op_info, Operand, Operation};
use super::{Location, LocationExpression, Piece, TargetAccess};
use crate::config::EngineConfig;
use crate::error::{DwarfError, Result};

type Stack = SmallVec<[u64; 16]>;

/// A configured evaluation of one [`LocationExpression`].
#[derive(Debug, Clone)]
pub struct Evaluator<'a>
{
    expr: &'a LocationExpression,
    frame_base: Option<u64>,
    cfa: Option<u64>,
    initial: Stack,
    budget: usize,
    max_depth: usize,
    origin: usize,
    pc: u64,
}

impl<'a> Evaluator<'a>
{
    pub fn new(expr: &'a LocationExpression) -> Self
    {
        let config = EngineConfig::default();
        Self {
            expr,
            frame_base: None,
            cfa: None,
            initial: Stack::new(),
            budget: config.expression_budget,
            max_depth: config.max_stack_depth,
            origin: 0,
            pc: 0,
        }
    }

    /// Value `DW_OP_fbreg` offsets are applied to.
    #[must_use]
    pub fn with_frame_base(mut self, frame_base: Option<u64>) -> Self
    {
        self.frame_base = frame_base;
        self
    }

    /// Value pushed by `DW_OP_call_frame_cfa`.
    #[must_use]
    pub fn with_cfa(mut self, cfa: Option<u64>) -> Self
    {
        self.cfa = cfa;
        self
    }

    /// Push a value before the first operation runs (for example the base
    /// address of the containing object for `DW_AT_data_member_location`).
    #[must_use]
    pub fn with_initial_value(mut self, value: u64) -> Self
    {
        self.initial.push(value);
        self
    }

    /// Apply the interpreter limits from `config`.
    #[must_use]
    pub fn with_limits(mut self, config: &EngineConfig) -> Self
    {
        self.budget = config.expression_budget;
        self.max_depth = config.max_stack_depth;
        self
    }

    /// DIE offset and PC the evaluation is performed for; used in errors.
    #[must_use]
    pub fn with_context(mut self, die: usize, pc: u64) -> Self
    {
        self.origin = die;
        self.pc = pc;
        self
    }

    /// Run the expression.
    ///
    /// ## Errors
    ///
    /// - `StackUnderflow` if an operation needs more values than are on the stack
    /// - `DivisionByZero` for `DW_OP_div`/`DW_OP_mod` by zero
    /// - `InvalidBranch` for a skip/branch that does not land on an operation
    /// - `InstructionBudgetExceeded` / `StackOverflow` when limits are hit
    /// - `UnsupportedOpcode` for operations the evaluator does not implement
    /// - `MissingFrameBase` / `MissingCfa` when required context was not supplied
    /// - any error returned by `target`
    pub fn evaluate<T: TargetAccess + ?Sized>(&self, target: &mut T) -> Result<Location>
    {
        let mut machine = Machine {
            eval: self,
            stack: self.initial.clone(),
            pending: None,
            pieces: Vec::new(),
        };
        machine.run(target)
    }
}

struct Machine<'e, 'a>
{
    eval: &'e Evaluator<'a>,
    stack: Stack,
    /// Terminal location produced by a register, stack-value or implicit-value operation.
    pending: Option<(usize, Location)>,
    pieces: Vec<Piece>,
}

impl Machine<'_, '_>
{
    fn run<T: TargetAccess + ?Sized>(&mut self, target: &mut T) -> Result<Location>
    {
        let expr = self.eval.expr;
        let ops = expr.operations();
        let encoding = expr.encoding();
        let bits = u32::from(encoding.address_size.clamp(1, 8)) * 8;
        let mask = encoding.max_address();
        let sign_extend = |value: u64| -> i64 {
            if bits >= 64 {
                value as i64
            } else {
                ((value << (64 - bits)) as i64) >> (64 - bits)
            }
        };

        let mut index = 0;
        let mut executed = 0usize;
        while index < ops.len() {
            executed += 1;
            if executed > self.eval.budget {
                return Err(DwarfError::InstructionBudgetExceeded {
                    budget: self.eval.budget,
                });
            }

            let op = &ops[index];
            let is_piece = matches!(op.opcode, constants::DW_OP_piece | constants::DW_OP_bit_piece);
            if let Some((offset, _)) = &self.pending {
                if !is_piece {
                    return Err(DwarfError::InvalidTerminator { offset: *offset });
                }
            }
            let info = op_info(op.opcode.0).ok_or(DwarfError::UnknownOpcode {
                offset: op.offset,
                opcode: op.opcode.0,
            })?;
            if !info.supported {
                return Err(DwarfError::UnsupportedOpcode {
                    offset: op.offset,
                    opcode: op.opcode,
                });
            }
            if self.stack.len() < info.pops {
                return Err(underflow(op));
            }
            trace!(offset = op.offset, opcode = %op.opcode, depth = self.stack.len(), "expression step");

            let raw = op.opcode.0;
            let mut next = index + 1;
            match op.opcode {
                constants::DW_OP_addr
                | constants::DW_OP_const1u
                | constants::DW_OP_const2u
                | constants::DW_OP_const4u
                | constants::DW_OP_const8u
                | constants::DW_OP_constu => self.push(op, op.unsigned() & mask)?,
                constants::DW_OP_const1s
                | constants::DW_OP_const2s
                | constants::DW_OP_const4s
                | constants::DW_OP_const8s
                | constants::DW_OP_consts => self.push(op, (op.signed() as u64) & mask)?,
                _ if (constants::DW_OP_lit0.0..=constants::DW_OP_lit31.0).contains(&raw) => {
                    self.push(op, u64::from(raw - constants::DW_OP_lit0.0))?;
                }
                _ if (constants::DW_OP_breg0.0..=constants::DW_OP_breg31.0).contains(&raw) => {
                    let register = Register(u16::from(raw - constants::DW_OP_breg0.0));
                    let base = target.read_register(register)?;
                    self.push(op, base.wrapping_add(op.signed() as u64) & mask)?;
                }
                constants::DW_OP_bregx => {
                    let register = register_operand(op)?;
                    let base = target.read_register(register)?;
                    self.push(op, base.wrapping_add(op.signed() as u64) & mask)?;
                }
                constants::DW_OP_fbreg => {
                    let base = self.eval.frame_base.ok_or(DwarfError::MissingFrameBase {
                        offset: self.eval.origin,
                    })?;
                    self.push(op, base.wrapping_add(op.signed() as u64) & mask)?;
                }
                _ if (constants::DW_OP_reg0.0..=constants::DW_OP_reg31.0).contains(&raw) => {
                    let register = Register(u16::from(raw - constants::DW_OP_reg0.0));
                    self.pending = Some((op.offset, Location::Register(register)));
                }
                constants::DW_OP_regx => {
                    self.pending = Some((op.offset, Location::Register(register_operand(op)?)));
                }
                constants::DW_OP_call_frame_cfa => {
                    let cfa = self.eval.cfa.ok_or(DwarfError::MissingCfa { pc: self.eval.pc })?;
                    self.push(op, cfa)?;
                }

                constants::DW_OP_dup => {
                    let top = self.peek(0);
                    self.push(op, top)?;
                }
                constants::DW_OP_drop => {
                    self.stack.pop();
                }
                constants::DW_OP_over => {
                    let second = self.peek(1);
                    self.push(op, second)?;
                }
                constants::DW_OP_pick => {
                    let depth = op.unsigned() as usize;
                    if depth >= self.stack.len() {
                        return Err(underflow(op));
                    }
                    let value = self.peek(depth);
                    self.push(op, value)?;
                }
                constants::DW_OP_swap => {
                    let len = self.stack.len();
                    self.stack.swap(len - 1, len - 2);
                }
                constants::DW_OP_rot => {
                    // [.., a, b, c] -> [.., c, a, b]
                    let len = self.stack.len();
                    self.stack[len - 3..].rotate_right(1);
                }

                constants::DW_OP_deref => {
                    let address = self.pop(op)?;
                    let value = read_sized(target, address, encoding.address_size, encoding.endian)?;
                    self.push(op, value)?;
                }
                constants::DW_OP_deref_size => {
                    let size = op.unsigned();
                    if size == 0 || size > 8 {
                        return Err(DwarfError::UnsupportedOpcode {
                            offset: op.offset,
                            opcode: op.opcode,
                        });
                    }
                    let address = self.pop(op)?;
                    let value = read_sized(target, address, size as u8, encoding.endian)?;
                    self.push(op, value)?;
                }

                constants::DW_OP_abs => {
                    let value = sign_extend(self.pop(op)?);
                    self.push(op, (value.wrapping_abs() as u64) & mask)?;
                }
                constants::DW_OP_neg => {
                    let value = sign_extend(self.pop(op)?);
                    self.push(op, (value.wrapping_neg() as u64) & mask)?;
                }
                constants::DW_OP_not => {
                    let value = self.pop(op)?;
                    self.push(op, !value & mask)?;
                }
                constants::DW_OP_plus_uconst => {
                    let value = self.pop(op)?;
                    self.push(op, value.wrapping_add(op.unsigned()) & mask)?;
                }
                constants::DW_OP_div => {
                    let (lhs, rhs) = self.pop_pair(op)?;
                    let (lhs, rhs) = (sign_extend(lhs), sign_extend(rhs));
                    if rhs == 0 {
                        return Err(DwarfError::DivisionByZero { offset: op.offset });
                    }
                    self.push(op, (lhs.wrapping_div(rhs) as u64) & mask)?;
                }
                constants::DW_OP_mod => {
                    let (lhs, rhs) = self.pop_pair(op)?;
                    if rhs == 0 {
                        return Err(DwarfError::DivisionByZero { offset: op.offset });
                    }
                    self.push(op, (lhs % rhs) & mask)?;
                }
                constants::DW_OP_shl | constants::DW_OP_shr | constants::DW_OP_shra => {
                    let (value, amount) = self.pop_pair(op)?;
                    let result = match op.opcode {
                        constants::DW_OP_shl if amount < u64::from(bits) => value << amount,
                        constants::DW_OP_shr if amount < u64::from(bits) => value >> amount,
                        constants::DW_OP_shl | constants::DW_OP_shr => 0,
                        _ => {
                            let shift = amount.min(63) as u32;
                            (sign_extend(value) >> shift) as u64
                        }
                    };
                    self.push(op, result & mask)?;
                }
                constants::DW_OP_and
                | constants::DW_OP_or
                | constants::DW_OP_xor
                | constants::DW_OP_plus
                | constants::DW_OP_minus
                | constants::DW_OP_mul => {
                    let (lhs, rhs) = self.pop_pair(op)?;
                    let result = match op.opcode {
                        constants::DW_OP_and => lhs & rhs,
                        constants::DW_OP_or => lhs | rhs,
                        constants::DW_OP_xor => lhs ^ rhs,
                        constants::DW_OP_plus => lhs.wrapping_add(rhs),
                        constants::DW_OP_minus => lhs.wrapping_sub(rhs),
                        _ => lhs.wrapping_mul(rhs),
                    };
                    self.push(op, result & mask)?;
                }
                constants::DW_OP_eq
                | constants::DW_OP_ne
                | constants::DW_OP_lt
                | constants::DW_OP_le
                | constants::DW_OP_gt
                | constants::DW_OP_ge => {
                    let (lhs, rhs) = self.pop_pair(op)?;
                    let (lhs, rhs) = (sign_extend(lhs), sign_extend(rhs));
                    let result = match op.opcode {
                        constants::DW_OP_eq => lhs == rhs,
                        constants::DW_OP_ne => lhs != rhs,
                        constants::DW_OP_lt => lhs < rhs,
                        constants::DW_OP_le => lhs <= rhs,
                        constants::DW_OP_gt => lhs > rhs,
                        _ => lhs >= rhs,
                    };
                    self.push(op, u64::from(result))?;
                }

                constants::DW_OP_skip => next = self.branch_target(ops, op)?,
                constants::DW_OP_bra => {
                    if self.pop(op)? != 0 {
                        next = self.branch_target(ops, op)?;
                    }
                }
                constants::DW_OP_nop => {}

                constants::DW_OP_stack_value => {
                    let value = self.pop(op)?;
                    self.pending = Some((op.offset, Location::Value(value)));
                }
                constants::DW_OP_implicit_value => {
                    let Operand::Block(bytes) = &op.operand else {
                        return Err(underflow(op));
                    };
                    self.pending = Some((op.offset, Location::ImplicitBytes(bytes.clone())));
                }
                constants::DW_OP_piece => {
                    let location = self.take_piece_location();
                    self.pieces.push(Piece {
                        location,
                        size_bits: op.unsigned().saturating_mul(8),
                        bit_offset: 0,
                    });
                }
                constants::DW_OP_bit_piece => {
                    let Operand::UnsignedPair(size_bits, bit_offset) = op.operand else {
                        return Err(underflow(op));
                    };
                    let location = self.take_piece_location();
                    self.pieces.push(Piece {
                        location,
                        size_bits,
                        bit_offset,
                    });
                }
                opcode => {
                    return Err(DwarfError::UnsupportedOpcode {
                        offset: op.offset,
                        opcode,
                    })
                }
            }
            index = next;
        }

        if !self.pieces.is_empty() {
            if let Some((offset, _)) = self.pending {
                return Err(DwarfError::InvalidTerminator { offset });
            }
            return Ok(Location::Pieces(std::mem::take(&mut self.pieces)));
        }
        if let Some((_, location)) = self.pending.take() {
            return Ok(location);
        }
        Ok(self.stack.last().map_or(Location::Unavailable, |top| Location::Address(*top)))
    }

    fn push(&mut self, op: &Operation, value: u64) -> Result<()>
    {
        if self.stack.len() >= self.eval.max_depth {
            return Err(DwarfError::StackOverflow {
                offset: op.offset,
                limit: self.eval.max_depth,
            });
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self, op: &Operation) -> Result<u64>
    {
        self.stack.pop().ok_or_else(|| underflow(op))
    }

    /// Pop `rhs` (top) then `lhs`.
    fn pop_pair(&mut self, op: &Operation) -> Result<(u64, u64)>
    {
        let rhs = self.pop(op)?;
        let lhs = self.pop(op)?;
        Ok((lhs, rhs))
    }

    fn peek(&self, depth: usize) -> u64
    {
        self.stack[self.stack.len() - 1 - depth]
    }

    /// Location described by the operations since the previous piece.
    fn take_piece_location(&mut self) -> Location
    {
        if let Some((_, location)) = self.pending.take() {
            return location;
        }
        self.stack.pop().map_or(Location::Unavailable, Location::Address)
    }

    /// Index of the operation a skip/branch lands on.
    ///
    /// The offset is measured from the end of the 2-byte operand.
    fn branch_target(&self, ops: &[Operation], op: &Operation) -> Result<usize>
    {
        let target = op.offset as i64 + 3 + op.signed();
        let invalid = DwarfError::InvalidBranch {
            offset: op.offset,
            target,
        };
        let end = self.eval.expr.bytes().len() as i64;
        if target < 0 || target > end {
            return Err(invalid);
        }
        if target == end {
            return Ok(ops.len());
        }
        ops.binary_search_by_key(&(target as usize), |candidate| candidate.offset)
            .map_err(|_| invalid)
    }
}

fn underflow(op: &Operation) -> DwarfError
{
    DwarfError::StackUnderflow {
        offset: op.offset,
        opcode: op.opcode,
    }
}

fn register_operand(op: &Operation) -> Result<Register>
{
    u16::try_from(op.unsigned())
        .map(Register)
        .map_err(|_| DwarfError::UnsupportedOpcode {
            offset: op.offset,
            opcode: op.opcode,
        })
}

/// Read a `size`-byte value and zero-extend it.
fn read_sized<T>(target: &mut T, address: u64, size: u8, endian: gimli::RunTimeEndian) -> Result<u64>
where
    T: TargetAccess + ?Sized,
{
    let bytes = target.read_memory(address, usize::from(size))?;
    if bytes.len() < usize::from(size) {
        return Err(DwarfError::TargetAccess(format!(
            "short read at 0x{address:x}: wanted {size} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(match size {
        1 => u64::from(bytes[0]),
        2 => u64::from(endian.read_u16(&bytes)),
        4 => u64::from(endian.read_u32(&bytes)),
        8 => endian.read_u64(&bytes),
        _ => {
            let mut buf = [0u8; 8];
            if endian.is_big_endian() {
                buf[8 - usize::from(size)..].copy_from_slice(&bytes[..usize::from(size)]);
            } else {
                buf[..usize::from(size)].copy_from_slice(&bytes[..usize::from(size)]);
            }
            endian.read_u64(&buf)
        }
    })
}

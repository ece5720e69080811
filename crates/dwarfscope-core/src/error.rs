//! # Error Types
//!
//! Every failure the engine can report.
//!
//! We use `thiserror` to generate the `Error` implementations and messages.
//! Offsets carried by the variants are absolute offsets into the section
//! named by the variant (for example `.debug_info` for `TruncatedUnit`).

use gimli::constants::{DwAt, DwForm, DwOp, DwTag};
use gimli::SectionId;
use thiserror::Error;

/// Main error type for decoding and query operations
///
/// ## Error Categories
///
/// 1. **Structural decode errors**: MalformedAbbrev, TruncatedUnit, UnbalancedTree, IllegalForm,
///    UnknownAbbrevCode, UnsupportedVersion, UnexpectedEof. These abort the unit they occur in.
/// 2. **Type errors**: UnresolvedTypeReference, UnsupportedTag, TypeNestingTooDeep
/// 3. **Evaluator errors**: UnknownOpcode, UnsupportedOpcode, StackUnderflow, DivisionByZero,
///    InvalidBranch, InstructionBudgetExceeded, StackOverflow, InvalidTerminator
/// 4. **Query errors**: NoLocationAtPc, UnknownDie, MissingFrameBase, MissingCfa
/// 5. **Bytecode program errors**: MalformedLineProgram, MalformedCallFrame, MalformedLocationList,
///    MalformedRangeList
/// 6. **Collaborator errors**: TargetAccess, ObjectFile, MissingSection, Io
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DwarfError
{
    /// An abbreviation table could not be decoded
    ///
    /// Raised for an unknown form, a zero attribute name paired with a
    /// non-zero form, a duplicate code, or a table that ends before its
    /// terminating code 0.
    #[error("Malformed abbreviation at .debug_abbrev+0x{offset:x}: {reason}")]
    MalformedAbbrev
    {
        /// Offset of the offending record
        offset: usize,
        /// What was wrong with it
        reason: String,
    },

    /// A DIE used an abbreviation code that its unit's table does not define
    #[error("Unit at 0x{unit:x}: abbreviation code {code} at 0x{offset:x} is not defined")]
    UnknownAbbrevCode
    {
        /// Offset of the unit header
        unit: usize,
        /// Offset of the DIE
        offset: usize,
        /// The undefined code
        code: u64,
    },

    /// A unit header declared a version outside the supported 2..=4 range
    #[error("Unsupported DWARF version {version} at 0x{offset:x}")]
    UnsupportedVersion
    {
        /// Offset of the header
        offset: usize,
        /// Declared version
        version: u16,
    },

    /// Decoding ran past the unit's declared end, or the unit ended with
    /// parents still open
    #[error("Truncated unit at 0x{unit:x}: ran out of data at 0x{offset:x}")]
    TruncatedUnit
    {
        /// Offset of the unit header
        unit: usize,
        /// Where decoding stopped
        offset: usize,
    },

    /// A null entry came before the root, or a DIE followed the closed root
    #[error("Unbalanced DIE tree in unit at 0x{unit:x}: entry at 0x{offset:x} has no open parent")]
    UnbalancedTree
    {
        /// Offset of the unit header
        unit: usize,
        /// Offset of the offending entry
        offset: usize,
    },

    /// An attribute was encoded with a form outside its legal classes
    #[error("Attribute {attribute} at 0x{offset:x} cannot use form {form}")]
    IllegalForm
    {
        /// Offset of the DIE
        offset: usize,
        /// Attribute name
        attribute: DwAt,
        /// Offending form
        form: DwForm,
    },

    /// A `type` (or other) reference points at an offset with no DIE
    #[error("DIE at 0x{from:x} references 0x{target:x}, which is not a DIE")]
    UnresolvedTypeReference
    {
        /// DIE holding the reference
        from: usize,
        /// Referenced offset
        target: usize,
    },

    /// A DIE's tag has no mapping in the type graph
    #[error("DIE at 0x{offset:x} with tag {tag} does not describe a type")]
    UnsupportedTag
    {
        /// Offset of the DIE
        offset: usize,
        /// Its tag
        tag: DwTag,
    },

    /// A chain of type references nested deeper than the configured limit
    #[error("Type at 0x{offset:x} nests more than {limit} types deep")]
    TypeNestingTooDeep
    {
        /// Offset of the DIE where the limit was reached
        offset: usize,
        /// Configured maximum depth
        limit: usize,
    },

    /// A location expression contained a byte that is not an opcode
    #[error("Unknown opcode 0x{opcode:02x} at expression offset {offset}")]
    UnknownOpcode
    {
        /// Offset within the expression
        offset: usize,
        /// The raw byte
        opcode: u8,
    },

    /// A location expression used an opcode the evaluator does not implement
    #[error("Unsupported opcode {opcode} at expression offset {offset}")]
    UnsupportedOpcode
    {
        /// Offset within the expression
        offset: usize,
        /// The opcode
        opcode: DwOp,
    },

    /// An operation needed more stack entries than were present
    #[error("Stack underflow executing {opcode} at expression offset {offset}")]
    StackUnderflow
    {
        /// Offset within the expression
        offset: usize,
        /// The operation that underflowed
        opcode: DwOp,
    },

    /// The evaluation stack grew beyond the configured limit
    #[error("Stack overflow at expression offset {offset} (limit {limit})")]
    StackOverflow
    {
        /// Offset within the expression
        offset: usize,
        /// Configured depth limit
        limit: usize,
    },

    /// `DW_OP_div` or `DW_OP_mod` with a zero divisor
    #[error("Division by zero at expression offset {offset}")]
    DivisionByZero
    {
        /// Offset within the expression
        offset: usize,
    },

    /// A skip or branch landed outside the expression or between operations
    #[error("Branch at expression offset {offset} targets invalid offset {target}")]
    InvalidBranch
    {
        /// Offset of the branch operation
        offset: usize,
        /// Computed target
        target: i64,
    },

    /// A register location or implicit value was followed by something other
    /// than a piece operation
    #[error("Location terminator at expression offset {offset} is not followed by a piece")]
    InvalidTerminator
    {
        /// Offset of the terminating operation
        offset: usize,
    },

    /// A bytecode interpreter executed more operations than its budget allows
    ///
    /// Protects against skip/branch loops and oversized call-frame programs.
    #[error("Instruction budget of {budget} operations exceeded")]
    InstructionBudgetExceeded
    {
        /// Configured budget
        budget: usize,
    },

    /// The variable is out of scope at the requested PC
    #[error("DIE at 0x{die:x} has no location at pc 0x{pc:x}")]
    NoLocationAtPc
    {
        /// Offset of the variable DIE
        die: usize,
        /// Queried PC
        pc: u64,
    },

    /// No DIE starts at the given offset
    #[error("No DIE at .debug_info+0x{offset:x}")]
    UnknownDie
    {
        /// Requested offset
        offset: usize,
    },

    /// An expression used `DW_OP_fbreg` but no frame base could be determined
    #[error("No frame base available for DIE at 0x{offset:x}")]
    MissingFrameBase
    {
        /// Offset of the DIE being evaluated
        offset: usize,
    },

    /// An expression used `DW_OP_call_frame_cfa` but no CFA was available
    #[error("No canonical frame address available for pc 0x{pc:x}")]
    MissingCfa
    {
        /// PC the CFA was needed for
        pc: u64,
    },

    /// A line program could not be decoded
    #[error("Malformed line program at .debug_line+0x{offset:x}: {reason}")]
    MalformedLineProgram
    {
        /// Offset of the offending header field or opcode
        offset: usize,
        /// What was wrong with it
        reason: String,
    },

    /// A CIE, FDE or call-frame instruction could not be decoded
    #[error("Malformed call frame information at 0x{offset:x}: {reason}")]
    MalformedCallFrame
    {
        /// Offset within `.debug_frame` or `.eh_frame`
        offset: usize,
        /// What was wrong with it
        reason: String,
    },

    /// A location list was not terminated or ran past its section
    #[error("Malformed location list at .debug_loc+0x{offset:x}")]
    MalformedLocationList
    {
        /// Offset of the list
        offset: usize,
    },

    /// A range list was not terminated or ran past its section
    #[error("Malformed range list at .debug_ranges+0x{offset:x}")]
    MalformedRangeList
    {
        /// Offset of the list
        offset: usize,
    },

    /// A read ran past the end of the available bytes
    ///
    /// Decoders translate this into their own structural error where one
    /// exists; it surfaces directly only from the byte reader.
    #[error("Unexpected end of data at 0x{offset:x}")]
    UnexpectedEof
    {
        /// Offset of the failed read
        offset: usize,
    },

    /// A section required for the operation was not supplied
    #[error("Missing section {}", .0.name())]
    MissingSection(SectionId),

    /// The target-control layer failed to read a register or memory
    #[error("Target access failed: {0}")]
    TargetAccess(String),

    /// The object-file reader failed
    #[error("Object file error: {0}")]
    ObjectFile(String),

    /// I/O error while reading an object file from disk
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for DwarfError
{
    fn from(err: std::io::Error) -> Self
    {
        Self::Io(err.to_string())
    }
}

impl DwarfError
{
    /// Whether this error aborts the decoding of a whole unit rather than a
    /// single query.
    pub fn is_structural(&self) -> bool
    {
        matches!(
            self,
            Self::MalformedAbbrev { .. }
                | Self::UnknownAbbrevCode { .. }
                | Self::UnsupportedVersion { .. }
                | Self::TruncatedUnit { .. }
                | Self::UnbalancedTree { .. }
                | Self::IllegalForm { .. }
        )
    }
}

/// Convenience type alias for `Result<T, DwarfError>`
///
/// ```rust
/// use dwarfscope_core::error::Result;
/// fn foo() -> Result<()>
/// {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, DwarfError>;

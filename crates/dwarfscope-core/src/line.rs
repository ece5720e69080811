//! # Line Tables
//!
//! The `.debug_line` section stores, per compilation unit, a bytecode
//! program for a small state machine. Replaying it produces the matrix of
//! (address → file, line, column) rows that maps machine code back to
//! source.
//!
//! ## Program Layout
//!
//! ```text
//! header: unit_length, version, header_length, min_inst_length,
//!         [max_ops_per_inst], default_is_stmt, line_base, line_range,
//!         opcode_base, standard_opcode_lengths, include_directories, files
//! program: standard (1..opcode_base), extended (0, len, sub-op, args),
//!          special (opcode_base..=255) opcodes
//! ```
//!
//! Special opcodes advance the address and line together and append a row.
//! `DW_LNE_end_sequence` closes the current sequence; sequences are kept
//! sorted by start address so lookups can binary search.
//!
//! ## References
//!
//! - [DWARF 4, section 6.2 "Line Number Information"](https://dwarfstd.org/doc/DWARF4.pdf)

use gimli::constants::{self, DwLne, DwLns};
use gimli::RunTimeEndian;

use crate::error::{DwarfError, Result};
use crate::reader::Reader;

/// One entry of the file table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry
{
    /// Name as written in the table
    pub name: String,
    /// Index into the include directories; 0 is the compilation directory
    pub directory_index: u64,
    pub modification_time: u64,
    pub length: u64,
    /// Name joined with its directory and the compilation directory
    pub path: String,
}

/// Decoded line-program header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineProgramHeader
{
    pub offset: usize,
    pub version: u16,
    /// 4 for 32-bit DWARF, 8 for 64-bit DWARF
    pub offset_size: u8,
    pub minimum_instruction_length: u8,
    /// Greater than 1 only on VLIW targets
    pub maximum_operations_per_instruction: u8,
    pub default_is_stmt: bool,
    pub line_base: i8,
    pub line_range: u8,
    pub opcode_base: u8,
    /// Operand counts of standard opcodes `1..opcode_base`
    pub standard_opcode_lengths: Vec<u8>,
    pub include_directories: Vec<String>,
}

/// One row of the line matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRow
{
    pub address: u64,
    pub op_index: u64,
    /// 1-based index into the file table
    pub file: u64,
    pub line: u64,
    pub column: u64,
    pub is_stmt: bool,
    pub basic_block: bool,
    pub end_sequence: bool,
    pub prologue_end: bool,
    pub epilogue_begin: bool,
    pub isa: u64,
    pub discriminator: u64,
}

/// Rows for one contiguous run of machine code, ending with an
/// end-of-sequence row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineSequence
{
    pub start: u64,
    /// Address of the end-of-sequence row (exclusive)
    pub end: u64,
    pub rows: Vec<LineRow>,
}

impl LineSequence
{
    pub fn contains(&self, pc: u64) -> bool
    {
        self.start <= pc && pc < self.end
    }
}

/// Result of an address → source lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation
{
    pub path: String,
    pub line: u64,
    pub column: u64,
    /// Address of the row that matched
    pub address: u64,
}

/// A decoded line program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineTable
{
    header: LineProgramHeader,
    comp_dir: String,
    files: Vec<FileEntry>,
    sequences: Vec<LineSequence>,
}

/// Register file of the line-number state machine.
struct LineState
{
    row: LineRow,
}

impl LineState
{
    fn new(default_is_stmt: bool) -> Self
    {
        Self {
            row: LineRow {
                address: 0,
                op_index: 0,
                file: 1,
                line: 1,
                column: 0,
                is_stmt: default_is_stmt,
                basic_block: false,
                end_sequence: false,
                prologue_end: false,
                epilogue_begin: false,
                isa: 0,
                discriminator: 0,
            },
        }
    }

    /// Apply an operation advance.
    fn advance(&mut self, header: &LineProgramHeader, operation_advance: u64)
    {
        let min_len = u64::from(header.minimum_instruction_length);
        let max_ops = u64::from(header.maximum_operations_per_instruction);
        if max_ops <= 1 {
            self.row.address = self.row.address.wrapping_add(min_len.wrapping_mul(operation_advance));
        } else {
            let ops = self.row.op_index.wrapping_add(operation_advance);
            self.row.address = self.row.address.wrapping_add(min_len.wrapping_mul(ops / max_ops));
            self.row.op_index = ops % max_ops;
        }
    }

    /// Snapshot the registers as a row and clear the per-row flags.
    fn emit(&mut self, rows: &mut Vec<LineRow>)
    {
        rows.push(self.row);
        self.row.basic_block = false;
        self.row.prologue_end = false;
        self.row.epilogue_begin = false;
        self.row.discriminator = 0;
    }
}

impl LineTable
{
    /// Decode and replay the line program at `offset`.
    ///
    /// `address_size` comes from the owning unit; `comp_dir` is used to make
    /// file paths absolute.
    ///
    /// ## Errors
    ///
    /// `MalformedLineProgram` for a truncated or inconsistent header, or an
    /// opcode whose declared length runs past the program.
    pub fn parse(debug_line: &[u8], offset: usize, endian: RunTimeEndian, address_size: u8, comp_dir: Option<&str>)
        -> Result<Self>
    {
        let data = debug_line
            .get(offset..)
            .ok_or_else(|| malformed(offset, "offset is past the end of .debug_line"))?;
        let mut reader = Reader::new(data, offset, endian).with_address_size(address_size);
        let unit_length = reader
            .initial_length()
            .map_err(|_| malformed(offset, "truncated unit length"))?;
        let length = usize::try_from(unit_length)
            .ok()
            .filter(|len| *len <= reader.remaining())
            .ok_or_else(|| malformed(offset, "unit length runs past the section"))?;
        let mut program = reader.split(length)?;

        let (header, files) = parse_header(&mut program, offset, comp_dir)?;
        let mut table = Self {
            header,
            comp_dir: comp_dir.unwrap_or_default().to_string(),
            files,
            sequences: Vec::new(),
        };
        table.run(&mut program)?;
        table.sequences.sort_by_key(|sequence| sequence.start);

        tracing::debug!(
            offset,
            version = table.header.version,
            files = table.files.len(),
            sequences = table.sequences.len(),
            "decoded line program"
        );
        Ok(table)
    }

    fn run(&mut self, program: &mut Reader<'_>) -> Result<()>
    {
        let header = self.header.clone();
        let mut state = LineState::new(header.default_is_stmt);
        let mut rows = Vec::new();

        while !program.is_empty() {
            let at = program.offset();
            let eof = |_| malformed(at, "opcode operand runs past the program");
            let opcode = program.u8().map_err(eof)?;

            if opcode >= header.opcode_base {
                let adjusted = opcode - header.opcode_base;
                state.advance(&header, u64::from(adjusted / header.line_range));
                let delta = i64::from(header.line_base) + i64::from(adjusted % header.line_range);
                state.row.line = state.row.line.wrapping_add(delta as u64);
                state.emit(&mut rows);
                continue;
            }

            if opcode == 0 {
                let len = program.uleb128_usize().map_err(eof)?;
                let mut body = program
                    .split(len)
                    .map_err(|_| malformed(at, "extended opcode length runs past the program"))?;
                if len == 0 {
                    continue;
                }
                let sub = DwLne(body.u8().map_err(eof)?);
                match sub {
                    constants::DW_LNE_end_sequence => {
                        state.row.end_sequence = true;
                        rows.push(state.row);
                        self.finish_sequence(std::mem::take(&mut rows));
                        state = LineState::new(header.default_is_stmt);
                    }
                    constants::DW_LNE_set_address => {
                        let size = len - 1;
                        state.row.address = if (1..=8).contains(&size) && size.is_power_of_two() {
                            body.sized(size as u8).map_err(eof)?
                        } else {
                            body.address().map_err(eof)?
                        };
                        state.row.op_index = 0;
                    }
                    constants::DW_LNE_define_file => {
                        let entry = read_file_entry(&mut body, &header, &self.comp_dir)
                            .map_err(|_| malformed(at, "truncated DW_LNE_define_file"))?;
                        if let Some(entry) = entry {
                            self.files.push(entry);
                        }
                    }
                    constants::DW_LNE_set_discriminator => {
                        state.row.discriminator = body.uleb128().map_err(eof)?;
                    }
                    other => tracing::trace!(offset = at, opcode = other.0, "skipping unknown extended opcode"),
                }
                continue;
            }

            match DwLns(opcode) {
                constants::DW_LNS_copy => state.emit(&mut rows),
                constants::DW_LNS_advance_pc => {
                    let advance = program.uleb128().map_err(eof)?;
                    state.advance(&header, advance);
                }
                constants::DW_LNS_advance_line => {
                    let delta = program.sleb128().map_err(eof)?;
                    state.row.line = state.row.line.wrapping_add(delta as u64);
                }
                constants::DW_LNS_set_file => state.row.file = program.uleb128().map_err(eof)?,
                constants::DW_LNS_set_column => state.row.column = program.uleb128().map_err(eof)?,
                constants::DW_LNS_negate_stmt => state.row.is_stmt = !state.row.is_stmt,
                constants::DW_LNS_set_basic_block => state.row.basic_block = true,
                constants::DW_LNS_const_add_pc => {
                    let adjusted = 255 - header.opcode_base;
                    state.advance(&header, u64::from(adjusted / header.line_range));
                }
                constants::DW_LNS_fixed_advance_pc => {
                    let delta = program.u16().map_err(eof)?;
                    state.row.address = state.row.address.wrapping_add(u64::from(delta));
                    state.row.op_index = 0;
                }
                constants::DW_LNS_set_prologue_end => state.row.prologue_end = true,
                constants::DW_LNS_set_epilogue_begin => state.row.epilogue_begin = true,
                constants::DW_LNS_set_isa => state.row.isa = program.uleb128().map_err(eof)?,
                _ => {
                    let operands = header.standard_opcode_lengths[usize::from(opcode) - 1];
                    for _ in 0..operands {
                        program.uleb128().map_err(eof)?;
                    }
                }
            }
        }

        if !rows.is_empty() {
            tracing::trace!(rows = rows.len(), "dropping sequence without DW_LNE_end_sequence");
        }
        Ok(())
    }

    fn finish_sequence(&mut self, rows: Vec<LineRow>)
    {
        let (Some(first), Some(last)) = (rows.first(), rows.last()) else {
            return;
        };
        // Sequences that cover no address (e.g. discarded functions) cannot match a PC.
        if last.address <= first.address {
            return;
        }
        self.sequences.push(LineSequence {
            start: first.address,
            end: last.address,
            rows,
        });
    }

    pub fn header(&self) -> &LineProgramHeader
    {
        &self.header
    }

    /// File table, including files added by `DW_LNE_define_file`.
    pub fn files(&self) -> &[FileEntry]
    {
        &self.files
    }

    /// Entry for a 1-based file index.
    pub fn file(&self, index: u64) -> Option<&FileEntry>
    {
        let index = usize::try_from(index).ok()?.checked_sub(1)?;
        self.files.get(index)
    }

    /// Sequences sorted by start address.
    pub fn sequences(&self) -> &[LineSequence]
    {
        &self.sequences
    }

    /// Iterate every row of every sequence.
    pub fn rows(&self) -> impl Iterator<Item = &LineRow>
    {
        self.sequences.iter().flat_map(|sequence| sequence.rows.iter())
    }

    /// The row in effect at `pc`: the last row at or below `pc` in the
    /// sequence that covers it.
    pub fn row_for(&self, pc: u64) -> Option<&LineRow>
    {
        let upper = self.sequences.partition_point(|sequence| sequence.start <= pc);
        let sequence = self.sequences[..upper]
            .iter()
            .rev()
            .find(|sequence| sequence.contains(pc))?;
        let index = sequence.rows.partition_point(|row| row.address <= pc).checked_sub(1)?;
        let row = &sequence.rows[index];
        (!row.end_sequence).then_some(row)
    }

    /// Source position for `pc`.
    pub fn find(&self, pc: u64) -> Option<SourceLocation>
    {
        let row = self.row_for(pc)?;
        let path = self
            .file(row.file)
            .map_or_else(|| format!("<file {}>", row.file), |file| file.path.clone());
        Some(SourceLocation {
            path,
            line: row.line,
            column: row.column,
            address: row.address,
        })
    }

    /// Statement addresses where `line` of `file` begins.
    ///
    /// `file` matches a full path, a trailing path component sequence, or a
    /// bare file name. Consecutive rows for the same line yield one address.
    pub fn addresses_for(&self, file: &str, line: u64) -> Vec<u64>
    {
        let matching: Vec<u64> = self
            .files
            .iter()
            .enumerate()
            .filter(|(_, entry)| path_matches(entry, file))
            .map(|(index, _)| index as u64 + 1)
            .collect();
        if matching.is_empty() {
            return Vec::new();
        }

        let mut addresses = Vec::new();
        for sequence in &self.sequences {
            let mut previous_matched = false;
            for row in &sequence.rows {
                let matched = !row.end_sequence && row.line == line && matching.contains(&row.file);
                if matched && row.is_stmt && !previous_matched {
                    addresses.push(row.address);
                }
                previous_matched = matched && row.is_stmt;
            }
        }
        addresses.sort_unstable();
        addresses.dedup();
        addresses
    }
}

fn malformed(offset: usize, reason: &str) -> DwarfError
{
    DwarfError::MalformedLineProgram {
        offset,
        reason: reason.to_string(),
    }
}

fn parse_header(program: &mut Reader<'_>, offset: usize, comp_dir: Option<&str>)
    -> Result<(LineProgramHeader, Vec<FileEntry>)>
{
    let truncated = |_| malformed(offset, "truncated header");
    let version = program.u16().map_err(truncated)?;
    if !(2..=4).contains(&version) {
        return Err(malformed(offset, &format!("unsupported version {version}")));
    }
    let header_length = program.section_offset().map_err(truncated)?;
    let program_start = usize::try_from(header_length)
        .ok()
        .and_then(|len| program.position().checked_add(len))
        .filter(|start| *start <= program.position() + program.remaining())
        .ok_or_else(|| malformed(offset, "header length runs past the unit"))?;

    let minimum_instruction_length = program.u8().map_err(truncated)?;
    let maximum_operations_per_instruction = if version >= 4 {
        program.u8().map_err(truncated)?
    } else {
        1
    };
    if maximum_operations_per_instruction == 0 {
        return Err(malformed(offset, "maximum_operations_per_instruction is 0"));
    }
    let default_is_stmt = program.u8().map_err(truncated)? != 0;
    let line_base = program.i8().map_err(truncated)?;
    let line_range = program.u8().map_err(truncated)?;
    if line_range == 0 {
        return Err(malformed(offset, "line_range is 0"));
    }
    let opcode_base = program.u8().map_err(truncated)?;
    if opcode_base == 0 {
        return Err(malformed(offset, "opcode_base is 0"));
    }
    let standard_opcode_lengths = program
        .bytes(usize::from(opcode_base) - 1)
        .map_err(truncated)?
        .to_vec();

    let mut include_directories = Vec::new();
    loop {
        let dir = program.cstr().map_err(truncated)?;
        if dir.is_empty() {
            break;
        }
        include_directories.push(String::from_utf8_lossy(dir).into_owned());
    }

    let header = LineProgramHeader {
        offset,
        version,
        offset_size: program.offset_size(),
        minimum_instruction_length,
        maximum_operations_per_instruction,
        default_is_stmt,
        line_base,
        line_range,
        opcode_base,
        standard_opcode_lengths,
        include_directories,
    };

    let mut files = Vec::new();
    let comp_dir = comp_dir.unwrap_or("");
    while let Some(entry) = read_file_entry(program, &header, comp_dir).map_err(truncated)? {
        files.push(entry);
    }

    program.seek(program_start)?;
    Ok((header, files))
}

/// Read one file entry; `None` at the terminating empty name.
fn read_file_entry(reader: &mut Reader<'_>, header: &LineProgramHeader, comp_dir: &str) -> Result<Option<FileEntry>>
{
    let name = reader.cstr()?;
    if name.is_empty() {
        return Ok(None);
    }
    let name = String::from_utf8_lossy(name).into_owned();
    let directory_index = reader.uleb128()?;
    let modification_time = reader.uleb128()?;
    let length = reader.uleb128()?;

    let directory = match directory_index {
        0 => comp_dir.to_string(),
        index => {
            let dir = usize::try_from(index - 1)
                .ok()
                .and_then(|index| header.include_directories.get(index))
                .map_or("", String::as_str);
            join_path(comp_dir, dir)
        }
    };
    Ok(Some(FileEntry {
        path: join_path(&directory, &name),
        name,
        directory_index,
        modification_time,
        length,
    }))
}

fn join_path(dir: &str, name: &str) -> String
{
    if name.starts_with('/') || dir.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        dir.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

fn path_matches(entry: &FileEntry, file: &str) -> bool
{
    if entry.path == file || entry.name == file {
        return true;
    }
    let trimmed = file.trim_start_matches("./");
    entry.path.len() > trimmed.len()
        && entry.path.ends_with(trimmed)
        && entry.path.as_bytes()[entry.path.len() - trimmed.len() - 1] == b'/'
}

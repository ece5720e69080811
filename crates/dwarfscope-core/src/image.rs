//! # Debug Image
//!
//! [`DebugImage`] is the decoded, read-only view over one binary's DWARF
//! data and the entry point for every query.
//!
//! ## Loading
//!
//! 1. Unit headers are scanned out of `.debug_info`
//! 2. Each distinct abbreviation table is decoded once and shared
//! 3. Units are rebuilt (on the rayon pool when [`EngineConfig::parallel`]
//!    is set) together with their line tables and address ranges
//! 4. The type graph is built over every unit
//! 5. `.debug_frame` and `.eh_frame` are decoded
//!
//! A unit or section that fails to decode is recorded as a
//! [`DecodeFailure`] and logged; everything else stays queryable.
//!
//! ## Queries
//!
//! Queries take `&self`. Evaluations that need live state take the target by
//! `&mut`, so a paused target is never read by two evaluations at once.

use std::path::Path;
use std::sync::Arc;

use gimli::constants;
use gimli::SectionId;
use rayon::prelude::*;

use crate::abbrev::{AbbreviationCache, AbbreviationTable};
use crate::attribute::AttributeValue;
use crate::cfi::{CallFrameTable, CallerFrame, UnwindRow};
use crate::config::EngineConfig;
use crate::error::{DwarfError, Result};
use crate::expression::{Location, LocationExpression, TargetAccess};
use crate::line::{LineTable, SourceLocation};
use crate::loclist::LocationList;
use crate::ranges::{die_ranges, AddressRange};
use crate::sections::Sections;
use crate::type_graph::{TypeGraph, TypeRef};
use crate::unit::{scan_unit_offsets, CompilationUnit, DieRef, UnitHeader, UnitSet};

/// Hops allowed through `DW_AT_abstract_origin`/`DW_AT_specification`.
const MAX_ORIGIN_HOPS: usize = 8;

/// A unit, table or entry that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeFailure
{
    pub section: SectionId,
    /// Offset of the failed unit, table or entry within `section`
    pub offset: usize,
    pub error: DwarfError,
}

impl DecodeFailure
{
    fn new(section: SectionId, offset: usize, error: DwarfError) -> Self
    {
        tracing::warn!(section = section.name(), offset, error = %error, "decode failure");
        Self { section, offset, error }
    }
}

/// A fully decoded image.
#[derive(Debug)]
pub struct DebugImage
{
    sections: Sections,
    config: EngineConfig,
    units: UnitSet,
    /// PC ranges of each unit, parallel to `units.units()`
    unit_ranges: Vec<Vec<AddressRange>>,
    types: TypeGraph,
    debug_frame: Option<CallFrameTable>,
    eh_frame: Option<CallFrameTable>,
    failures: Vec<DecodeFailure>,
}

/// Output of decoding one unit.
struct DecodedUnit
{
    unit: CompilationUnit,
    ranges: Vec<AddressRange>,
    failures: Vec<DecodeFailure>,
}

impl DebugImage
{
    /// Decode everything in `sections`.
    ///
    /// ## Errors
    ///
    /// `MissingSection` if `.debug_info` or `.debug_abbrev` is absent. Every
    /// other problem is recorded in [`DebugImage::failures`].
    pub fn load(sections: &Sections, config: &EngineConfig) -> Result<Self>
    {
        let info = sections.require(SectionId::DebugInfo)?;
        let abbrev = sections.require(SectionId::DebugAbbrev)?;
        let endian = sections.endian();
        let mut failures = Vec::new();

        let mut cache = AbbreviationCache::new();
        let mut jobs = Vec::new();
        for (offset, header) in scan_unit_offsets(info, endian) {
            let header = match header {
                Ok(header) => header,
                Err(err) => {
                    failures.push(DecodeFailure::new(SectionId::DebugInfo, offset, err));
                    continue;
                }
            };
            match cache.get_or_parse(abbrev, header.abbrev_offset) {
                Ok(table) => jobs.push((header, table)),
                Err(err) => failures.push(DecodeFailure::new(SectionId::DebugAbbrev, header.abbrev_offset, err)),
            }
        }
        tracing::debug!(units = jobs.len(), abbreviation_tables = cache.len(), "scanned .debug_info");

        let decode = |(header, table): (UnitHeader, Arc<AbbreviationTable>)| {
            (header.offset, decode_unit(sections, info, header, table))
        };
        let decoded: Vec<(usize, Result<DecodedUnit>)> = if config.parallel {
            jobs.into_par_iter().map(decode).collect()
        } else {
            jobs.into_iter().map(decode).collect()
        };

        let mut units = Vec::with_capacity(decoded.len());
        let mut unit_ranges = Vec::with_capacity(decoded.len());
        for (offset, result) in decoded {
            match result {
                Ok(decoded) => {
                    failures.extend(decoded.failures);
                    unit_ranges.push(decoded.ranges);
                    units.push(decoded.unit);
                }
                Err(err) => failures.push(DecodeFailure::new(SectionId::DebugInfo, offset, err)),
            }
        }
        let units = UnitSet::new(units);
        let types = TypeGraph::build(&units, sections, config);

        let address_size = units
            .units()
            .first()
            .map_or(8, |unit| unit.encoding().address_size);
        let frames = [SectionId::DebugFrame, SectionId::EhFrame].map(|id| {
            sections.get(id).map(|section| {
                CallFrameTable::parse(
                    section.bytes(),
                    id,
                    section.address(),
                    address_size,
                    endian,
                    config.cfi_budget,
                )
            })
        });
        for table in frames.iter().flatten() {
            for (offset, err) in table.errors() {
                failures.push(DecodeFailure::new(table.section(), *offset, err.clone()));
            }
        }
        let [debug_frame, eh_frame] = frames;

        tracing::debug!(
            units = units.len(),
            dies = units.die_count(),
            types = types.len(),
            failures = failures.len(),
            "loaded debug image"
        );
        Ok(Self {
            sections: sections.clone(),
            config: *config,
            units,
            unit_ranges,
            types,
            debug_frame,
            eh_frame,
            failures,
        })
    }

    /// Read an object file from disk and decode its DWARF sections.
    ///
    /// ## Errors
    ///
    /// `Io` or `ObjectFile` if the file cannot be read, plus the errors of
    /// [`DebugImage::load`].
    pub fn open(path: impl AsRef<Path>, config: &EngineConfig) -> Result<Self>
    {
        let sections = Sections::from_path(path)?;
        Self::load(&sections, config)
    }

    pub fn sections(&self) -> &Sections
    {
        &self.sections
    }

    pub fn config(&self) -> &EngineConfig
    {
        &self.config
    }

    pub fn units(&self) -> &UnitSet
    {
        &self.units
    }

    pub fn type_graph(&self) -> &TypeGraph
    {
        &self.types
    }

    /// Everything that failed to decode while loading.
    pub fn failures(&self) -> &[DecodeFailure]
    {
        &self.failures
    }

    pub fn die(&self, offset: usize) -> Option<DieRef<'_>>
    {
        self.units.die(offset)
    }

    /// Name of a DIE, looking through abstract origins and specifications.
    pub fn die_name(&self, offset: usize) -> Option<String>
    {
        let die = self.units.die(offset)?;
        [constants::DW_AT_name, constants::DW_AT_linkage_name, constants::DW_AT_MIPS_linkage_name]
            .into_iter()
            .find_map(|name| {
                let (_, value) = self.find_attr(die, name)?;
                value.string(&self.sections)
            })
    }

    /// Type of the DIE at `offset`.
    ///
    /// ## Errors
    ///
    /// `UnknownDie`, `UnresolvedTypeReference`, `UnsupportedTag` or `TypeNestingTooDeep`; see
    /// [`TypeGraph::resolve_type`].
    pub fn resolve_type(&self, offset: usize) -> Result<TypeRef<'_>>
    {
        let id = self.types.resolve_type(&self.units, offset)?;
        Ok(self.types.get(id))
    }

    /// Where the variable or parameter at `offset` lives at `pc`.
    ///
    /// `frame_base` overrides the enclosing subprogram's `DW_AT_frame_base`.
    /// A DIE without a location yields its `DW_AT_const_value`, or
    /// [`Location::Unavailable`] when it has neither.
    ///
    /// ## Errors
    ///
    /// - `UnknownDie` if no DIE starts at `offset`
    /// - `NoLocationAtPc` if the location list has no entry covering `pc`
    /// - `MalformedLocationList` and evaluator errors
    pub fn variable_location<T: TargetAccess + ?Sized>(
        &self,
        offset: usize,
        pc: u64,
        target: &mut T,
        frame_base: Option<u64>,
    ) -> Result<Location>
    {
        let die = self.units.die(offset).ok_or(DwarfError::UnknownDie { offset })?;
        let Some((holder, value)) = self.find_attr(die, constants::DW_AT_location) else {
            return Ok(self.const_value(die));
        };
        let Some(expr) = self.expression_at(holder, value, pc)? else {
            return Err(DwarfError::NoLocationAtPc { die: offset, pc });
        };

        let frame_base = match frame_base {
            Some(base) => Some(base),
            None if expr.uses_frame_base() => self.frame_base(die, pc, target)?,
            None => None,
        };
        let cfa = if expr.uses_cfa() { self.cfa_at(pc, target)? } else { None };

        expr.evaluator()
            .with_frame_base(frame_base)
            .with_cfa(cfa)
            .with_limits(&self.config)
            .with_context(offset, pc)
            .evaluate(target)
    }

    /// Source position of the line-table row covering `pc`.
    pub fn line_for_address(&self, pc: u64) -> Option<SourceLocation>
    {
        let covering = self
            .units
            .units()
            .iter()
            .zip(&self.unit_ranges)
            .filter(|(_, ranges)| ranges.iter().any(|range| range.contains(pc)))
            .filter_map(|(unit, _)| unit.lines());
        let mut tables = covering.chain(self.units.units().iter().filter_map(CompilationUnit::lines));
        tables.find_map(|lines| lines.find(pc))
    }

    /// Statement addresses where `line` of `file` begins, across all units.
    pub fn address_for_line(&self, file: &str, line: u64) -> Vec<u64>
    {
        let mut addresses: Vec<u64> = self
            .units
            .units()
            .iter()
            .filter_map(CompilationUnit::lines)
            .flat_map(|lines| lines.addresses_for(file, line))
            .collect();
        addresses.sort_unstable();
        addresses.dedup();
        addresses
    }

    /// Unwind row in effect at `pc`, from `.debug_frame` then `.eh_frame`.
    ///
    /// ## Errors
    ///
    /// `MalformedCallFrame` or `InstructionBudgetExceeded` from replaying the
    /// covering FDE.
    pub fn try_unwind_at(&self, pc: u64) -> Result<Option<UnwindRow>>
    {
        for table in [&self.debug_frame, &self.eh_frame].into_iter().flatten() {
            if let Some(row) = table.unwind_at(pc)? {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    /// Unwind row in effect at `pc`; replay errors are logged and yield `None`.
    pub fn unwind_at(&self, pc: u64) -> Option<UnwindRow>
    {
        match self.try_unwind_at(pc) {
            Ok(row) => row,
            Err(err) => {
                tracing::warn!(pc, error = %err, "failed to replay call frame program");
                None
            }
        }
    }

    /// The caller's PC and CFA for a frame stopped at `pc`.
    ///
    /// `Ok(None)` when no unwind information covers `pc` or the return
    /// address is undefined (the outermost frame).
    ///
    /// ## Errors
    ///
    /// Replay, target and expression errors.
    pub fn caller_frame<T: TargetAccess + ?Sized>(&self, pc: u64, target: &mut T) -> Result<Option<CallerFrame>>
    {
        match self.try_unwind_at(pc)? {
            Some(row) => row.caller_frame(target),
            None => Ok(None),
        }
    }

    /// Innermost subprogram DIE whose ranges cover `pc`.
    pub fn subprogram_at(&self, pc: u64) -> Option<DieRef<'_>>
    {
        let mut best: Option<(u64, DieRef<'_>)> = None;
        for (unit, ranges) in self.units.units().iter().zip(&self.unit_ranges) {
            if !ranges.is_empty() && !ranges.iter().any(|range| range.contains(pc)) {
                continue;
            }
            let debug_ranges = self.sections.data(SectionId::DebugRanges);
            for die in unit.dies() {
                if die.tag != constants::DW_TAG_subprogram {
                    continue;
                }
                let covering = match die_ranges(die, debug_ranges, unit.encoding(), unit.base_address()) {
                    Ok(ranges) => ranges.into_iter().find(|range| range.contains(pc)),
                    Err(err) => {
                        tracing::debug!(offset = die.offset, error = %err, "skipping subprogram ranges");
                        None
                    }
                };
                let Some(range) = covering else {
                    continue;
                };
                let width = range.end - range.begin;
                if best.as_ref().map_or(true, |(best_width, _)| width <= *best_width) {
                    best = self.units.die(die.offset).map(|die| (width, die));
                }
            }
        }
        best.map(|(_, die)| die)
    }

    /// `name` on `die` or on the DIEs it completes.
    fn find_attr<'a>(&'a self, die: DieRef<'a>, name: gimli::DwAt) -> Option<(DieRef<'a>, &'a AttributeValue)>
    {
        let mut current = die;
        for _ in 0..MAX_ORIGIN_HOPS {
            if let Some(value) = current.attr(name) {
                return Some((current, value));
            }
            let next = current
                .reference(constants::DW_AT_abstract_origin)
                .or_else(|| current.reference(constants::DW_AT_specification))?;
            current = self.units.die(next)?;
        }
        None
    }

    /// Expression in effect at `pc` for a location-class attribute of `holder`.
    ///
    /// `Ok(None)` when a location list has no entry for `pc`.
    fn expression_at(&self, holder: DieRef<'_>, value: &AttributeValue, pc: u64) -> Result<Option<LocationExpression>>
    {
        let encoding = holder.unit.encoding();
        match value {
            AttributeValue::Block(bytes) => LocationExpression::parse(bytes, encoding).map(Some),
            AttributeValue::SecOffset(offset) => {
                let list = LocationList::parse(
                    self.sections.data(SectionId::DebugLoc),
                    *offset as usize,
                    encoding,
                    holder.unit.base_address(),
                )?;
                Ok(list.find(pc).cloned())
            }
            _ => Ok(None),
        }
    }

    /// Value of a DIE that has no location.
    fn const_value(&self, die: DieRef<'_>) -> Location
    {
        let Some((_, value)) = self.find_attr(die, constants::DW_AT_const_value) else {
            return Location::Unavailable;
        };
        match value {
            AttributeValue::Udata(value) => Location::Value(*value),
            AttributeValue::Sdata(value) => Location::Value(*value as u64),
            AttributeValue::Block(bytes) => Location::ImplicitBytes(bytes.clone()),
            other => other
                .string(&self.sections)
                .map_or(Location::Unavailable, |text| Location::ImplicitBytes(text.into_bytes())),
        }
    }

    /// Frame base of the subprogram enclosing `die` at `pc`.
    fn frame_base<T: TargetAccess + ?Sized>(&self, die: DieRef<'_>, pc: u64, target: &mut T) -> Result<Option<u64>>
    {
        let mut scope = die.parent();
        while let Some(current) = scope {
            if current.tag() == constants::DW_TAG_subprogram {
                break;
            }
            scope = current.parent();
        }
        let Some(subprogram) = scope else {
            return Ok(None);
        };
        let Some((holder, value)) = self.find_attr(subprogram, constants::DW_AT_frame_base) else {
            return Ok(None);
        };
        let Some(expr) = self.expression_at(holder, value, pc)? else {
            return Ok(None);
        };

        let cfa = if expr.uses_cfa() { self.cfa_at(pc, target)? } else { None };
        let location = expr
            .evaluator()
            .with_cfa(cfa)
            .with_limits(&self.config)
            .with_context(subprogram.offset(), pc)
            .evaluate(target)?;
        let base = match location {
            Location::Address(address) | Location::Value(address) => Some(address),
            Location::Register(register) => Some(target.read_register(register)?),
            _ => None,
        };
        tracing::trace!(subprogram = subprogram.offset(), pc, ?base, "computed frame base");
        Ok(base)
    }

    fn cfa_at<T: TargetAccess + ?Sized>(&self, pc: u64, target: &mut T) -> Result<Option<u64>>
    {
        match self.try_unwind_at(pc)? {
            Some(row) => row.cfa_value(target).map(Some),
            None => Ok(None),
        }
    }
}

/// Rebuild one unit and attach its line table and ranges.
fn decode_unit(
    sections: &Sections,
    info: &[u8],
    header: UnitHeader,
    table: Arc<AbbreviationTable>,
) -> Result<DecodedUnit>
{
    let endian = sections.endian();
    let mut unit = CompilationUnit::parse(info, header, table, endian)?;
    let mut failures = Vec::new();

    if let Some(offset) = unit
        .root()
        .attr(constants::DW_AT_stmt_list)
        .and_then(AttributeValue::section_offset)
    {
        let offset = offset as usize;
        let comp_dir = unit.comp_dir(sections);
        match LineTable::parse(
            sections.data(SectionId::DebugLine),
            offset,
            endian,
            unit.encoding().address_size,
            comp_dir.as_deref(),
        ) {
            Ok(lines) => unit.set_lines(Arc::new(lines)),
            Err(err) => failures.push(DecodeFailure::new(SectionId::DebugLine, offset, err)),
        }
    }

    let ranges = match die_ranges(
        unit.root(),
        sections.data(SectionId::DebugRanges),
        unit.encoding(),
        unit.base_address(),
    ) {
        Ok(ranges) => ranges,
        Err(err) => {
            failures.push(DecodeFailure::new(SectionId::DebugRanges, unit.offset(), err));
            Vec::new()
        }
    };

    tracing::debug!(unit = unit.offset(), dies = unit.dies().len(), "decoded unit");
    Ok(DecodedUnit { unit, ranges, failures })
}

//! # dwarfscope-core
//!
//! A DWARF debug-information engine.
//!
//! Given the raw debug sections of a compiled binary, this crate builds the
//! program knowledge a source-level debugger needs:
//! - The DIE tree of every compilation unit, decoded through its abbreviation table
//! - A type graph with cycle-safe resolution and structural equality
//! - Variable locations from location expressions and location lists
//! - Address ↔ source line mapping from line-number programs
//! - Call-frame unwind rows from `.debug_frame` and `.eh_frame`
//!
//! ## Scope
//!
//! Object-file parsing stops at handing named byte ranges to [`Sections`]
//! (see [`Sections::from_object`]). Live registers and memory come from a
//! [`TargetAccess`] implementation supplied by the process-control layer.
//! Units of DWARF versions 2 to 4 are decoded; version 5 units are reported
//! as unsupported.
//!
//! ## Example
//!
//! ```rust,no_run
//! use dwarfscope_core::{DebugImage, EngineConfig};
//!
//! let image = DebugImage::open("./target/debug/app", &EngineConfig::from_env())?;
//! if let Some(location) = image.line_for_address(0x401136) {
//!     println!("{}:{}", location.path, location.line);
//! }
//! for address in image.address_for_line("main.rs", 12) {
//!     println!("line 12 starts at 0x{address:x}");
//! }
//! # Ok::<(), dwarfscope_core::DwarfError>(())
//! ```

pub mod abbrev;
pub mod attribute;
pub mod cfi;
pub mod config;
pub mod error;
pub mod expression;
pub mod image;
pub mod line;
pub mod loclist;
pub mod object_file;
pub mod prelude;
pub mod ranges;
pub mod reader;
pub mod sections;
pub mod type_graph;
pub mod unit;

#[cfg(test)]
mod test_util;

pub use cfi::{CallFrameTable, CallerFrame, CfaRule, RegisterRule, UnwindRow};
pub use config::EngineConfig;
pub use error::{DwarfError, Result};
pub use expression::{Location, LocationExpression, NoTarget, Piece, TargetAccess, TargetFns};
pub use image::{DebugImage, DecodeFailure};
pub use line::{LineTable, SourceLocation};
pub use sections::Sections;
pub use type_graph::{TypeGraph, TypeId, TypeKind, TypeNode, TypeRef};
pub use unit::{CompilationUnit, Die, DieRef, UnitSet};

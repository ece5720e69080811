//! Common module for library exports

pub use gimli::{Register, RunTimeEndian, SectionId};

pub use crate::cfi::{CallerFrame, CfaRule, RegisterRule, UnwindRow};
pub use crate::config::EngineConfig;
pub use crate::error::{DwarfError, Result};
pub use crate::expression::{Location, Piece, TargetAccess, TargetFns};
pub use crate::image::{DebugImage, DecodeFailure};
pub use crate::line::SourceLocation;
pub use crate::sections::Sections;
pub use crate::type_graph::{CompositeKind, Member, Qualifier, TypeId, TypeKind, TypeRef};
pub use crate::unit::DieRef;

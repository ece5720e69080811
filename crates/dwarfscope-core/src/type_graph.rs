//! # Type Graph
//!
//! Resolves type DIEs into an arena of [`TypeNode`]s connected by
//! [`TypeId`] edges.
//!
//! ## Cycles
//!
//! Types are routinely self-referential (`struct list { struct list *next; }`).
//! Before a DIE's children are visited its offset is mapped to a reserved
//! arena slot, so a reference back to a type under construction resolves to
//! that slot instead of recursing. A failed top-level resolution truncates
//! the arena back to where it started and forgets every offset it mapped.
//! Acyclic chains more than 128 types deep fail with `TypeNestingTooDeep`.
//!
//! ## Equality
//!
//! Nodes never store their DIE offset. Two types are equal when their graphs
//! are bisimilar: same names, sizes and kinds, with edges leading to equal
//! types. [`TypeRef`]'s `PartialEq` performs that comparison, and terminates
//! on cyclic graphs.
//!
//! ## Bit Fields
//!
//! Member bit positions use the `DW_AT_data_bit_offset` meaning (counted
//! from the least significant bit of the containing object). A legacy
//! `DW_AT_bit_offset`, counted from the most significant bit of a storage
//! unit, is converted once assuming a little-endian target.

use std::collections::{HashMap, HashSet};
use std::fmt;

use gimli::constants::{self, DwAte, DwTag};

use crate::attribute::AttributeValue;
use crate::config::EngineConfig;
use crate::error::{DwarfError, Result};
use crate::expression::{Location, LocationExpression, NoTarget};
use crate::sections::Sections;
use crate::unit::{DieRef, UnitSet};

/// Index of a node in a [`TypeGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeKind
{
    Struct,
    Class,
    Union,
    Interface,
}

impl CompositeKind
{
    fn keyword(self) -> &'static str
    {
        match self {
            Self::Struct => "struct",
            Self::Class => "class",
            Self::Union => "union",
            Self::Interface => "interface",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qualifier
{
    Const,
    Volatile,
    Restrict,
    Atomic,
}

impl Qualifier
{
    fn keyword(self) -> &'static str
    {
        match self {
            Self::Const => "const",
            Self::Volatile => "volatile",
            Self::Restrict => "restrict",
            Self::Atomic => "_Atomic",
        }
    }
}

/// One array dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimension
{
    pub lower_bound: i64,
    /// Element count; `None` for unknown or runtime-sized dimensions
    pub count: Option<u64>,
}

/// A data member or base class of a composite type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member
{
    pub name: Option<String>,
    pub ty: TypeId,
    pub byte_offset: u64,
    /// Bit position within the byte at `byte_offset`, for bit fields
    pub bit_offset: Option<u64>,
    pub bit_size: Option<u64>,
    /// `DW_TAG_inheritance` rather than `DW_TAG_member`
    pub is_base: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enumerator
{
    pub name: String,
    pub value: i64,
}

/// The shape of a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind
{
    Void,
    Base
    {
        encoding: DwAte,
    },
    Pointer
    {
        target: TypeId,
    },
    Reference
    {
        target: TypeId,
        rvalue: bool,
    },
    Array
    {
        element: TypeId,
        dimensions: Vec<Dimension>,
    },
    Composite
    {
        kind: CompositeKind,
        members: Vec<Member>,
        /// Only declared here; the definition lives elsewhere
        declaration: bool,
    },
    Enumeration
    {
        underlying: Option<TypeId>,
        enumerators: Vec<Enumerator>,
    },
    Typedef
    {
        target: TypeId,
    },
    Qualified
    {
        qualifier: Qualifier,
        target: TypeId,
    },
    Subroutine
    {
        return_type: TypeId,
        parameters: Vec<TypeId>,
        variadic: bool,
    },
    Unspecified,
    /// Slot reserved while the node is being built
    Pending,
}

/// A resolved type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeNode
{
    pub name: Option<String>,
    pub byte_size: Option<u64>,
    pub kind: TypeKind,
}

/// Whether a tag describes a type (mapped or not).
pub fn is_type_tag(tag: DwTag) -> bool
{
    matches!(
        tag,
        constants::DW_TAG_base_type
            | constants::DW_TAG_pointer_type
            | constants::DW_TAG_reference_type
            | constants::DW_TAG_rvalue_reference_type
            | constants::DW_TAG_array_type
            | constants::DW_TAG_structure_type
            | constants::DW_TAG_class_type
            | constants::DW_TAG_union_type
            | constants::DW_TAG_interface_type
            | constants::DW_TAG_enumeration_type
            | constants::DW_TAG_typedef
            | constants::DW_TAG_const_type
            | constants::DW_TAG_volatile_type
            | constants::DW_TAG_restrict_type
            | constants::DW_TAG_atomic_type
            | constants::DW_TAG_subroutine_type
            | constants::DW_TAG_unspecified_type
            | constants::DW_TAG_ptr_to_member_type
            | constants::DW_TAG_string_type
            | constants::DW_TAG_set_type
            | constants::DW_TAG_file_type
            | constants::DW_TAG_packed_type
            | constants::DW_TAG_shared_type
    )
}

/// Arena of every type in an image.
#[derive(Debug, Clone)]
pub struct TypeGraph
{
    nodes: Vec<TypeNode>,
    by_offset: HashMap<usize, TypeId>,
    failures: HashMap<usize, DwarfError>,
}

const VOID: TypeId = TypeId(0);
const DISPLAY_DEPTH: usize = 32;
/// Type references followed from one root before resolution gives up.
const MAX_TYPE_DEPTH: usize = 128;

impl Default for TypeGraph
{
    fn default() -> Self
    {
        Self {
            nodes: vec![TypeNode {
                name: None,
                byte_size: None,
                kind: TypeKind::Void,
            }],
            by_offset: HashMap::new(),
            failures: HashMap::new(),
        }
    }
}

impl TypeGraph
{
    /// Resolve every type DIE of every unit.
    ///
    /// Per-DIE failures are kept and returned by later lookups of that DIE.
    pub fn build(units: &UnitSet, sections: &Sections, config: &EngineConfig) -> Self
    {
        let mut builder = Builder {
            units,
            sections,
            config,
            graph: Self::default(),
            reserved: Vec::new(),
            depth: 0,
        };
        for unit in units.units() {
            for die in unit.dies() {
                if is_type_tag(die.tag) {
                    builder.resolve_root(die.offset);
                }
            }
        }
        let graph = builder.graph;
        tracing::debug!(
            types = graph.nodes.len(),
            failures = graph.failures.len(),
            "built type graph"
        );
        graph
    }

    pub fn len(&self) -> usize
    {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.nodes.is_empty()
    }

    pub fn void(&self) -> TypeId
    {
        VOID
    }

    pub fn node(&self, id: TypeId) -> &TypeNode
    {
        &self.nodes[id.0]
    }

    pub fn get(&self, id: TypeId) -> TypeRef<'_>
    {
        TypeRef { graph: self, id }
    }

    /// Type DIEs that failed to resolve, by offset.
    pub fn failures(&self) -> &HashMap<usize, DwarfError>
    {
        &self.failures
    }

    /// Node built for the type DIE at `offset`.
    ///
    /// ## Errors
    ///
    /// The error recorded when that DIE failed to resolve, or `UnknownDie`
    /// if the offset was never a type DIE.
    pub fn lookup(&self, offset: usize) -> Result<TypeId>
    {
        if let Some(id) = self.by_offset.get(&offset) {
            return Ok(*id);
        }
        Err(self
            .failures
            .get(&offset)
            .cloned()
            .unwrap_or(DwarfError::UnknownDie { offset }))
    }

    /// Type of the DIE at `offset`.
    ///
    /// A type DIE resolves to itself; any other DIE to its `DW_AT_type`, or
    /// to `void` when it has none.
    ///
    /// ## Errors
    ///
    /// - `UnknownDie` if no DIE starts at `offset`
    /// - `UnresolvedTypeReference` if `DW_AT_type` names no DIE
    /// - `UnsupportedTag` if it names a DIE that is not a mapped type
    /// - `TypeNestingTooDeep` if its type chain is too deep to resolve
    pub fn resolve_type(&self, units: &UnitSet, offset: usize) -> Result<TypeId>
    {
        let die = units.die(offset).ok_or(DwarfError::UnknownDie { offset })?;
        if is_type_tag(die.tag()) {
            return self.lookup(offset);
        }
        let Some(value) = die.attr(constants::DW_AT_type) else {
            return Ok(VOID);
        };
        let target = value
            .reference(die.unit.offset())
            .ok_or(DwarfError::UnresolvedTypeReference { from: offset, target: 0 })?;
        if let Some(id) = self.by_offset.get(&target) {
            return Ok(*id);
        }
        if let Some(err) = self.failures.get(&target) {
            return Err(err.clone());
        }
        match units.die(target) {
            None => Err(DwarfError::UnresolvedTypeReference { from: offset, target }),
            Some(die) => Err(DwarfError::UnsupportedTag {
                offset: target,
                tag: die.tag(),
            }),
        }
    }

    /// Size in bytes, looking through typedefs and qualifiers.
    pub fn size_of(&self, id: TypeId) -> Option<u64>
    {
        let mut id = id;
        for _ in 0..DISPLAY_DEPTH {
            let node = self.node(id);
            if node.byte_size.is_some() {
                return node.byte_size;
            }
            match node.kind {
                TypeKind::Typedef { target } | TypeKind::Qualified { target, .. } => id = target,
                _ => return None,
            }
        }
        None
    }

    /// Structural equality of two nodes, by bisimulation.
    pub fn structurally_equal(&self, a: TypeId, b: TypeId) -> bool
    {
        let mut assumed = HashSet::new();
        let mut work = vec![(a, b)];
        while let Some((x, y)) = work.pop() {
            if x == y || !assumed.insert((x, y)) {
                continue;
            }
            let (nx, ny) = (self.node(x), self.node(y));
            if nx.name != ny.name || nx.byte_size != ny.byte_size {
                return false;
            }
            let same_shape = match (&nx.kind, &ny.kind) {
                (TypeKind::Void, TypeKind::Void)
                | (TypeKind::Unspecified, TypeKind::Unspecified)
                | (TypeKind::Pending, TypeKind::Pending) => true,
                (TypeKind::Base { encoding: a }, TypeKind::Base { encoding: b }) => a == b,
                (TypeKind::Pointer { target: a }, TypeKind::Pointer { target: b })
                | (TypeKind::Typedef { target: a }, TypeKind::Typedef { target: b }) => {
                    work.push((*a, *b));
                    true
                }
                (
                    TypeKind::Reference { target: a, rvalue: ra },
                    TypeKind::Reference { target: b, rvalue: rb },
                ) => {
                    work.push((*a, *b));
                    ra == rb
                }
                (
                    TypeKind::Qualified { qualifier: qa, target: a },
                    TypeKind::Qualified { qualifier: qb, target: b },
                ) => {
                    work.push((*a, *b));
                    qa == qb
                }
                (
                    TypeKind::Array { element: a, dimensions: da },
                    TypeKind::Array { element: b, dimensions: db },
                ) => {
                    work.push((*a, *b));
                    da == db
                }
                (
                    TypeKind::Composite { kind: ka, members: ma, declaration: xa },
                    TypeKind::Composite { kind: kb, members: mb, declaration: xb },
                ) => {
                    let same = ka == kb && xa == xb && ma.len() == mb.len();
                    if same {
                        for (a, b) in ma.iter().zip(mb) {
                            if a.name != b.name
                                || a.byte_offset != b.byte_offset
                                || a.bit_offset != b.bit_offset
                                || a.bit_size != b.bit_size
                                || a.is_base != b.is_base
                            {
                                return false;
                            }
                            work.push((a.ty, b.ty));
                        }
                    }
                    same
                }
                (
                    TypeKind::Enumeration { underlying: ua, enumerators: ea },
                    TypeKind::Enumeration { underlying: ub, enumerators: eb },
                ) => {
                    match (ua, ub) {
                        (Some(a), Some(b)) => work.push((*a, *b)),
                        (None, None) => {}
                        _ => return false,
                    }
                    ea == eb
                }
                (
                    TypeKind::Subroutine { return_type: ra, parameters: pa, variadic: va },
                    TypeKind::Subroutine { return_type: rb, parameters: pb, variadic: vb },
                ) => {
                    work.push((*ra, *rb));
                    work.extend(pa.iter().copied().zip(pb.iter().copied()));
                    va == vb && pa.len() == pb.len()
                }
                _ => false,
            };
            if !same_shape {
                return false;
            }
        }
        true
    }
}

/// A node together with the graph it lives in.
#[derive(Debug, Clone, Copy)]
pub struct TypeRef<'a>
{
    graph: &'a TypeGraph,
    id: TypeId,
}

impl<'a> TypeRef<'a>
{
    pub fn id(&self) -> TypeId
    {
        self.id
    }

    pub fn node(&self) -> &'a TypeNode
    {
        self.graph.node(self.id)
    }

    pub fn kind(&self) -> &'a TypeKind
    {
        &self.node().kind
    }

    pub fn name(&self) -> Option<&'a str>
    {
        self.node().name.as_deref()
    }

    /// Size in bytes, looking through typedefs and qualifiers.
    pub fn size(&self) -> Option<u64>
    {
        self.graph.size_of(self.id)
    }

    /// Pointee, referent, typedef or qualifier target, or array element.
    pub fn target(&self) -> Option<TypeRef<'a>>
    {
        let target = match self.kind() {
            TypeKind::Pointer { target }
            | TypeKind::Reference { target, .. }
            | TypeKind::Typedef { target }
            | TypeKind::Qualified { target, .. } => *target,
            TypeKind::Array { element, .. } => *element,
            _ => return None,
        };
        Some(self.graph.get(target))
    }

    /// Follow typedefs and qualifiers to the underlying type.
    pub fn strip(&self) -> TypeRef<'a>
    {
        let mut current = *self;
        for _ in 0..DISPLAY_DEPTH {
            match current.kind() {
                TypeKind::Typedef { target } | TypeKind::Qualified { target, .. } => {
                    current = self.graph.get(*target);
                }
                _ => break,
            }
        }
        current
    }

    /// Members of a composite type with their resolved types.
    pub fn members(&self) -> impl Iterator<Item = (&'a Member, TypeRef<'a>)> + 'a
    {
        let graph = self.graph;
        let members: &'a [Member] = match self.kind() {
            TypeKind::Composite { members, .. } => members,
            _ => &[],
        };
        members.iter().map(move |member| (member, graph.get(member.ty)))
    }

    /// Member by name.
    pub fn member(&self, name: &str) -> Option<(&'a Member, TypeRef<'a>)>
    {
        self.members()
            .find(|(member, _)| member.name.as_deref() == Some(name))
    }

    fn write_name(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result
    {
        if depth > DISPLAY_DEPTH {
            return f.write_str("...");
        }
        let node = self.node();
        let name = node.name.as_deref();
        match &node.kind {
            TypeKind::Void => f.write_str("void"),
            TypeKind::Pending => f.write_str("<pending>"),
            TypeKind::Base { .. } | TypeKind::Typedef { .. } | TypeKind::Unspecified => {
                f.write_str(name.unwrap_or("<anonymous>"))
            }
            TypeKind::Composite { kind, .. } => write!(f, "{} {}", kind.keyword(), name.unwrap_or("<anonymous>")),
            TypeKind::Enumeration { .. } => write!(f, "enum {}", name.unwrap_or("<anonymous>")),
            TypeKind::Pointer { target } => {
                self.graph.get(*target).write_name(f, depth + 1)?;
                f.write_str("*")
            }
            TypeKind::Reference { target, rvalue } => {
                self.graph.get(*target).write_name(f, depth + 1)?;
                f.write_str(if *rvalue { "&&" } else { "&" })
            }
            TypeKind::Qualified { qualifier, target } => {
                let target = self.graph.get(*target);
                if matches!(target.kind(), TypeKind::Pointer { .. }) {
                    target.write_name(f, depth + 1)?;
                    write!(f, " {}", qualifier.keyword())
                } else {
                    write!(f, "{} ", qualifier.keyword())?;
                    target.write_name(f, depth + 1)
                }
            }
            TypeKind::Array { element, dimensions } => {
                self.graph.get(*element).write_name(f, depth + 1)?;
                for dimension in dimensions {
                    match dimension.count {
                        Some(count) => write!(f, "[{count}]")?,
                        None => f.write_str("[]")?,
                    }
                }
                Ok(())
            }
            TypeKind::Subroutine { return_type, parameters, variadic } => {
                self.graph.get(*return_type).write_name(f, depth + 1)?;
                f.write_str(" (")?;
                for (index, parameter) in parameters.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    self.graph.get(*parameter).write_name(f, depth + 1)?;
                }
                if *variadic {
                    f.write_str(if parameters.is_empty() { "..." } else { ", ..." })?;
                }
                f.write_str(")")
            }
        }
    }
}

impl fmt::Display for TypeRef<'_>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        self.write_name(f, 0)
    }
}

impl PartialEq for TypeRef<'_>
{
    fn eq(&self, other: &Self) -> bool
    {
        std::ptr::eq(self.graph, other.graph) && self.graph.structurally_equal(self.id, other.id)
    }
}

struct Builder<'a>
{
    units: &'a UnitSet,
    sections: &'a Sections,
    config: &'a EngineConfig,
    graph: TypeGraph,
    /// Offsets mapped since the current top-level resolution started
    reserved: Vec<usize>,
    /// Nested `resolve` calls below the current root
    depth: usize,
}

impl<'a> Builder<'a>
{
    fn resolve_root(&mut self, offset: usize)
    {
        if self.graph.by_offset.contains_key(&offset) || self.graph.failures.contains_key(&offset) {
            return;
        }
        let mark = self.graph.nodes.len();
        self.reserved.clear();
        self.depth = 0;
        if let Err(err) = self.resolve(offset, offset) {
            self.graph.nodes.truncate(mark);
            for reserved in self.reserved.drain(..) {
                self.graph.by_offset.remove(&reserved);
            }
            tracing::debug!(offset, error = %err, "type did not resolve");
            self.graph.failures.insert(offset, err);
        }
    }

    /// Node for the type DIE at `offset`, referenced from `from`.
    fn resolve(&mut self, from: usize, offset: usize) -> Result<TypeId>
    {
        if let Some(id) = self.graph.by_offset.get(&offset) {
            return Ok(*id);
        }
        if let Some(err) = self.graph.failures.get(&offset) {
            return Err(err.clone());
        }
        let units: &'a UnitSet = self.units;
        let die = units
            .die(offset)
            .ok_or(DwarfError::UnresolvedTypeReference { from, target: offset })?;
        if self.depth >= MAX_TYPE_DEPTH {
            return Err(DwarfError::TypeNestingTooDeep {
                offset,
                limit: MAX_TYPE_DEPTH,
            });
        }

        let id = TypeId(self.graph.nodes.len());
        self.graph.nodes.push(TypeNode {
            name: None,
            byte_size: None,
            kind: TypeKind::Pending,
        });
        self.graph.by_offset.insert(offset, id);
        self.reserved.push(offset);

        self.depth += 1;
        let node = self.build_node(die);
        self.depth -= 1;
        self.graph.nodes[id.0] = node?;
        Ok(id)
    }

    /// Target of `DW_AT_type`, or `void` when absent.
    fn type_attr(&mut self, die: DieRef<'a>) -> Result<TypeId>
    {
        match die.attr(constants::DW_AT_type) {
            None => Ok(VOID),
            Some(value) => {
                let target = value
                    .reference(die.unit.offset())
                    .ok_or(DwarfError::UnresolvedTypeReference {
                        from: die.offset(),
                        target: 0,
                    })?;
                self.resolve(die.offset(), target)
            }
        }
    }

    fn build_node(&mut self, die: DieRef<'a>) -> Result<TypeNode>
    {
        let name = die.string(constants::DW_AT_name, self.sections);
        let mut byte_size = die.attr(constants::DW_AT_byte_size).and_then(AttributeValue::udata);
        let address_size = u64::from(die.unit.encoding().address_size);

        let kind = match die.tag() {
            constants::DW_TAG_base_type => TypeKind::Base {
                encoding: DwAte(
                    die.attr(constants::DW_AT_encoding)
                        .and_then(AttributeValue::udata)
                        .unwrap_or(0) as u8,
                ),
            },
            constants::DW_TAG_pointer_type => {
                byte_size = byte_size.or(Some(address_size));
                TypeKind::Pointer {
                    target: self.type_attr(die)?,
                }
            }
            constants::DW_TAG_reference_type | constants::DW_TAG_rvalue_reference_type => {
                byte_size = byte_size.or(Some(address_size));
                TypeKind::Reference {
                    target: self.type_attr(die)?,
                    rvalue: die.tag() == constants::DW_TAG_rvalue_reference_type,
                }
            }
            constants::DW_TAG_array_type => {
                let element = self.type_attr(die)?;
                let dimensions: Vec<Dimension> = die
                    .children()
                    .filter(|child| child.tag() == constants::DW_TAG_subrange_type)
                    .map(dimension)
                    .collect();
                if byte_size.is_none() {
                    byte_size = self.array_size(element, &dimensions);
                }
                TypeKind::Array { element, dimensions }
            }
            constants::DW_TAG_structure_type
            | constants::DW_TAG_class_type
            | constants::DW_TAG_union_type
            | constants::DW_TAG_interface_type => {
                let kind = match die.tag() {
                    constants::DW_TAG_structure_type => CompositeKind::Struct,
                    constants::DW_TAG_class_type => CompositeKind::Class,
                    constants::DW_TAG_union_type => CompositeKind::Union,
                    _ => CompositeKind::Interface,
                };
                let mut members = Vec::new();
                for child in die.children() {
                    if let Some(member) = self.member(child)? {
                        members.push(member);
                    }
                }
                TypeKind::Composite {
                    kind,
                    members,
                    declaration: die.die.flag(constants::DW_AT_declaration),
                }
            }
            constants::DW_TAG_enumeration_type => {
                let underlying = match die.attr(constants::DW_AT_type) {
                    Some(_) => Some(self.type_attr(die)?),
                    None => None,
                };
                let enumerators = die
                    .children()
                    .filter(|child| child.tag() == constants::DW_TAG_enumerator)
                    .map(|child| Enumerator {
                        name: child.string(constants::DW_AT_name, self.sections).unwrap_or_default(),
                        value: child
                            .attr(constants::DW_AT_const_value)
                            .and_then(AttributeValue::sdata)
                            .unwrap_or(0),
                    })
                    .collect();
                TypeKind::Enumeration { underlying, enumerators }
            }
            constants::DW_TAG_typedef => TypeKind::Typedef {
                target: self.type_attr(die)?,
            },
            constants::DW_TAG_const_type
            | constants::DW_TAG_volatile_type
            | constants::DW_TAG_restrict_type
            | constants::DW_TAG_atomic_type => {
                let qualifier = match die.tag() {
                    constants::DW_TAG_const_type => Qualifier::Const,
                    constants::DW_TAG_volatile_type => Qualifier::Volatile,
                    constants::DW_TAG_restrict_type => Qualifier::Restrict,
                    _ => Qualifier::Atomic,
                };
                TypeKind::Qualified {
                    qualifier,
                    target: self.type_attr(die)?,
                }
            }
            constants::DW_TAG_subroutine_type => {
                let return_type = self.type_attr(die)?;
                let mut parameters = Vec::new();
                let mut variadic = false;
                for child in die.children() {
                    match child.tag() {
                        constants::DW_TAG_formal_parameter => parameters.push(self.type_attr(child)?),
                        constants::DW_TAG_unspecified_parameters => variadic = true,
                        _ => {}
                    }
                }
                TypeKind::Subroutine {
                    return_type,
                    parameters,
                    variadic,
                }
            }
            constants::DW_TAG_unspecified_type => TypeKind::Unspecified,
            tag => {
                return Err(DwarfError::UnsupportedTag {
                    offset: die.offset(),
                    tag,
                })
            }
        };

        Ok(TypeNode { name, byte_size, kind })
    }

    fn array_size(&self, element: TypeId, dimensions: &[Dimension]) -> Option<u64>
    {
        let mut size = self.graph.size_of(element)?;
        for dimension in dimensions {
            size = size.checked_mul(dimension.count?)?;
        }
        Some(size)
    }

    /// A member or base class; `None` for children that are neither, and for
    /// static members.
    fn member(&mut self, child: DieRef<'a>) -> Result<Option<Member>>
    {
        let is_base = match child.tag() {
            constants::DW_TAG_member => false,
            constants::DW_TAG_inheritance => true,
            _ => return Ok(None),
        };
        if child.die.flag(constants::DW_AT_declaration) {
            return Ok(None);
        }

        let location = match child.attr(constants::DW_AT_data_member_location) {
            None => None,
            Some(value) => match self.member_location(child, value) {
                Ok(offset) => Some(offset),
                // Virtual bases are located through the vtable at runtime.
                Err(_) if is_base && child.die.has_attr(constants::DW_AT_virtuality) => {
                    tracing::trace!(offset = child.offset(), "skipping virtual base");
                    return Ok(None);
                }
                Err(err) => return Err(err),
            },
        };

        let ty = self.type_attr(child)?;
        let bit_size = child.attr(constants::DW_AT_bit_size).and_then(AttributeValue::udata);
        let data_bit_offset = child.attr(constants::DW_AT_data_bit_offset).and_then(AttributeValue::udata);
        let legacy_bit_offset = child.attr(constants::DW_AT_bit_offset).and_then(AttributeValue::udata);

        let (byte_offset, bit_offset) = match (data_bit_offset, legacy_bit_offset) {
            (Some(bits), _) => match location {
                Some(byte_offset) => (
                    byte_offset,
                    byte_offset.checked_mul(8).map(|base| bits.saturating_sub(base)),
                ),
                None => (bits / 8, Some(bits % 8)),
            },
            (None, Some(msb_offset)) => {
                let storage = child
                    .attr(constants::DW_AT_byte_size)
                    .and_then(AttributeValue::udata)
                    .or_else(|| self.graph.size_of(ty));
                let lsb_offset = storage
                    .zip(bit_size)
                    .and_then(|(storage, size)| storage.checked_mul(8)?.checked_sub(msb_offset)?.checked_sub(size));
                (location.unwrap_or(0), lsb_offset)
            }
            (None, None) => (location.unwrap_or(0), None),
        };

        Ok(Some(Member {
            name: child.string(constants::DW_AT_name, self.sections),
            ty,
            byte_offset,
            bit_offset,
            bit_size,
            is_base,
        }))
    }

    fn member_location(&self, child: DieRef<'a>, value: &AttributeValue) -> Result<u64>
    {
        match value {
            AttributeValue::Udata(_) | AttributeValue::Sdata(_) => Ok(value.udata().unwrap_or(0)),
            // data4/data8 in version 2/3 units.
            AttributeValue::SecOffset(offset) => Ok(*offset),
            AttributeValue::Block(bytes) => {
                let expr = LocationExpression::parse(bytes, child.unit.encoding())?;
                let location = expr
                    .evaluator()
                    .with_initial_value(0)
                    .with_limits(self.config)
                    .with_context(child.offset(), 0)
                    .evaluate(&mut NoTarget)?;
                match location {
                    Location::Address(offset) | Location::Value(offset) => Ok(offset),
                    _ => Err(DwarfError::UnsupportedTag {
                        offset: child.offset(),
                        tag: child.tag(),
                    }),
                }
            }
            _ => Err(DwarfError::UnsupportedTag {
                offset: child.offset(),
                tag: child.tag(),
            }),
        }
    }
}

/// Dimension described by a `DW_TAG_subrange_type`.
fn dimension(subrange: DieRef<'_>) -> Dimension
{
    let lower_bound = subrange
        .attr(constants::DW_AT_lower_bound)
        .and_then(AttributeValue::sdata)
        .unwrap_or(0);
    let count = match subrange.attr(constants::DW_AT_count).and_then(AttributeValue::udata) {
        Some(count) => Some(count),
        None => subrange
            .attr(constants::DW_AT_upper_bound)
            .and_then(AttributeValue::sdata)
            .and_then(|upper| upper.checked_sub(lower_bound)?.checked_add(1))
            .and_then(|count| u64::try_from(count).ok()),
    };
    Dimension { lower_bound, count }
}

#[cfg(test)]
mod tests
{
    use gimli::constants::*;
    use gimli::RunTimeEndian;

    use super::*;
    use crate::test_util::{Attr, UnitBuilder};

    fn graph(units: &UnitSet) -> TypeGraph
    {
        TypeGraph::build(units, &Sections::new(RunTimeEndian::Little), &EngineConfig::default())
    }

    #[test]
    fn test_bit_field_in_one_byte_struct()
    {
        let mut b = UnitBuilder::new();
        b.die(DW_TAG_compile_unit, true, &[]);
        let uchar = b.die(
            DW_TAG_base_type,
            false,
            &[
                (DW_AT_name, Attr::Str("unsigned char")),
                (DW_AT_byte_size, Attr::Data1(1)),
                (DW_AT_encoding, Attr::Data1(DW_ATE_unsigned_char.0)),
            ],
        );
        let flags = b.die(
            DW_TAG_structure_type,
            true,
            &[(DW_AT_name, Attr::Str("flags")), (DW_AT_byte_size, Attr::Data1(1))],
        );
        b.die(
            DW_TAG_member,
            false,
            &[
                (DW_AT_name, Attr::Str("mode")),
                (DW_AT_type, Attr::Ref(uchar)),
                (DW_AT_bit_size, Attr::Data1(3)),
                (DW_AT_data_bit_offset, Attr::Data1(5)),
            ],
        );
        b.end();
        b.end();
        let offset = b.offset(flags);
        let units = b.build();
        let graph = graph(&units);

        let ty = graph.get(graph.lookup(offset).unwrap());
        assert_eq!(ty.size(), Some(1));
        let (member, member_ty) = ty.member("mode").unwrap();
        assert_eq!((member.byte_offset, member.bit_offset, member.bit_size), (0, Some(5), Some(3)));
        assert_eq!(member_ty.to_string(), "unsigned char");
    }

    #[test]
    fn test_legacy_bit_offset_is_converted()
    {
        let mut b = UnitBuilder::new();
        b.die(DW_TAG_compile_unit, true, &[]);
        let int = b.die(
            DW_TAG_base_type,
            false,
            &[
                (DW_AT_name, Attr::Str("int")),
                (DW_AT_byte_size, Attr::Data1(4)),
                (DW_AT_encoding, Attr::Data1(DW_ATE_signed.0)),
            ],
        );
        let s = b.die(DW_TAG_structure_type, true, &[(DW_AT_byte_size, Attr::Data1(4))]);
        b.die(
            DW_TAG_member,
            false,
            &[
                (DW_AT_name, Attr::Str("f")),
                (DW_AT_type, Attr::Ref(int)),
                (DW_AT_byte_size, Attr::Data1(4)),
                (DW_AT_bit_size, Attr::Data1(3)),
                (DW_AT_bit_offset, Attr::Data1(24)),
                (DW_AT_data_member_location, Attr::Data1(0)),
            ],
        );
        b.end();
        b.end();
        let offset = b.offset(s);
        let units = b.build();
        let graph = graph(&units);

        let ty = graph.get(graph.lookup(offset).unwrap());
        let (member, _) = ty.member("f").unwrap();
        assert_eq!((member.byte_offset, member.bit_offset, member.bit_size), (0, Some(5), Some(3)));
        assert_eq!(ty.to_string(), "struct <anonymous>");
    }

    #[test]
    fn test_bit_offsets_that_overflow_are_unknown()
    {
        let mut b = UnitBuilder::new();
        b.die(DW_TAG_compile_unit, true, &[]);
        let int = b.die(
            DW_TAG_base_type,
            false,
            &[(DW_AT_name, Attr::Str("int")), (DW_AT_byte_size, Attr::Data1(4))],
        );
        let s = b.die(DW_TAG_structure_type, true, &[(DW_AT_byte_size, Attr::Data1(8))]);
        b.die(
            DW_TAG_member,
            false,
            &[
                (DW_AT_name, Attr::Str("far")),
                (DW_AT_type, Attr::Ref(int)),
                (DW_AT_bit_size, Attr::Data1(3)),
                (DW_AT_data_bit_offset, Attr::Udata(3)),
                (DW_AT_data_member_location, Attr::Udata(u64::MAX / 4)),
            ],
        );
        b.die(
            DW_TAG_member,
            false,
            &[
                (DW_AT_name, Attr::Str("wide")),
                (DW_AT_type, Attr::Ref(int)),
                (DW_AT_byte_size, Attr::Udata(u64::MAX)),
                (DW_AT_bit_size, Attr::Data1(3)),
                (DW_AT_bit_offset, Attr::Data1(1)),
                (DW_AT_data_member_location, Attr::Data1(4)),
            ],
        );
        b.end();
        b.end();
        let offset = b.offset(s);
        let units = b.build();
        let graph = graph(&units);

        let ty = graph.get(graph.lookup(offset).unwrap());
        let (far, _) = ty.member("far").unwrap();
        assert_eq!((far.byte_offset, far.bit_offset), (u64::MAX / 4, None));
        let (wide, _) = ty.member("wide").unwrap();
        assert_eq!((wide.byte_offset, wide.bit_offset, wide.bit_size), (4, None, Some(3)));
    }

    #[test]
    fn test_subrange_count_that_overflows_is_unknown()
    {
        let mut b = UnitBuilder::new();
        b.die(DW_TAG_compile_unit, true, &[]);
        let char_ty = b.die(
            DW_TAG_base_type,
            false,
            &[(DW_AT_name, Attr::Str("char")), (DW_AT_byte_size, Attr::Data1(1))],
        );
        let array = b.die(DW_TAG_array_type, true, &[(DW_AT_type, Attr::Ref(char_ty))]);
        b.die(
            DW_TAG_subrange_type,
            false,
            &[(DW_AT_lower_bound, Attr::Sdata(-1)), (DW_AT_upper_bound, Attr::Sdata(i64::MAX))],
        );
        b.end();
        let reversed = b.die(DW_TAG_array_type, true, &[(DW_AT_type, Attr::Ref(char_ty))]);
        b.die(
            DW_TAG_subrange_type,
            false,
            &[(DW_AT_lower_bound, Attr::Sdata(i64::MAX)), (DW_AT_upper_bound, Attr::Sdata(i64::MIN))],
        );
        b.end();
        b.end();
        let offsets = [b.offset(array), b.offset(reversed)];
        let units = b.build();
        let graph = graph(&units);

        for offset in offsets {
            let ty = graph.get(graph.lookup(offset).unwrap());
            let TypeKind::Array { dimensions, .. } = ty.kind() else {
                panic!("expected an array, got {:?}", ty.kind());
            };
            assert_eq!(dimensions.len(), 1);
            assert_eq!(dimensions[0].count, None);
            assert_eq!(ty.size(), None);
        }
    }

    #[test]
    fn test_deep_typedef_chain_fails_without_overflow()
    {
        let chain = MAX_TYPE_DEPTH + 44;
        let mut b = UnitBuilder::new();
        b.die(DW_TAG_compile_unit, true, &[]);
        // typedef i names typedef i + 1; the last one names int.
        let first = 1;
        let int = first + chain;
        let mut typedefs = Vec::new();
        for i in 0..chain {
            typedefs.push(b.die(DW_TAG_typedef, false, &[(DW_AT_type, Attr::Ref(first + i + 1))]));
        }
        let int_index = b.die(
            DW_TAG_base_type,
            false,
            &[(DW_AT_name, Attr::Str("int")), (DW_AT_byte_size, Attr::Data1(4))],
        );
        assert_eq!(int_index, int);
        b.end();
        let offsets: Vec<usize> = typedefs.iter().map(|index| b.offset(*index)).collect();
        let units = b.build();
        let graph = graph(&units);

        assert!(matches!(
            graph.lookup(offsets[0]),
            Err(DwarfError::TypeNestingTooDeep { limit: MAX_TYPE_DEPTH, .. })
        ));
        assert!(graph.lookup(offsets[chain - MAX_TYPE_DEPTH]).is_err());
        // Close enough to the base type to resolve.
        let within = graph.lookup(offsets[chain - MAX_TYPE_DEPTH + 1]).unwrap();
        assert!(matches!(graph.get(within).kind(), TypeKind::Typedef { .. }));
        let tail = graph.get(graph.lookup(offsets[chain - 1]).unwrap());
        assert_eq!(tail.strip().size(), Some(4));
    }

    #[test]
    fn test_self_referential_struct_terminates()
    {
        let mut b = UnitBuilder::new();
        b.die(DW_TAG_compile_unit, true, &[]);
        let node = b.die(
            DW_TAG_structure_type,
            true,
            &[(DW_AT_name, Attr::Str("node")), (DW_AT_byte_size, Attr::Data1(8))],
        );
        // The pointer type follows the struct, so the member is a forward reference.
        b.die(
            DW_TAG_member,
            false,
            &[
                (DW_AT_name, Attr::Str("next")),
                (DW_AT_type, Attr::Ref(3)),
                (DW_AT_data_member_location, Attr::Data1(0)),
            ],
        );
        b.end();
        let ptr = b.die(DW_TAG_pointer_type, false, &[(DW_AT_type, Attr::Ref(node))]);
        assert_eq!(ptr, 3);
        b.end();
        let (node_offset, ptr_offset) = (b.offset(node), b.offset(ptr));
        let units = b.build();
        let graph = graph(&units);

        let node_id = graph.lookup(node_offset).unwrap();
        let ptr_id = graph.lookup(ptr_offset).unwrap();
        let ty = graph.get(node_id);
        let (_, next) = ty.member("next").unwrap();
        assert_eq!(next.id(), ptr_id);
        assert_eq!(next.target().map(|t| t.id()), Some(node_id));
        assert_eq!(next.to_string(), "struct node*");
        assert_eq!(next.size(), Some(8));
        assert!(graph.structurally_equal(node_id, node_id));
    }

    #[test]
    fn test_identical_structs_compare_equal()
    {
        let mut b = UnitBuilder::new();
        b.die(DW_TAG_compile_unit, true, &[]);
        let mut structs = Vec::new();
        for _ in 0..2 {
            let int = b.die(
                DW_TAG_base_type,
                false,
                &[
                    (DW_AT_name, Attr::Str("int")),
                    (DW_AT_byte_size, Attr::Data1(4)),
                    (DW_AT_encoding, Attr::Data1(DW_ATE_signed.0)),
                ],
            );
            let s = b.die(
                DW_TAG_structure_type,
                true,
                &[(DW_AT_name, Attr::Str("list")), (DW_AT_byte_size, Attr::Data1(16))],
            );
            b.die(
                DW_TAG_member,
                false,
                &[
                    (DW_AT_name, Attr::Str("value")),
                    (DW_AT_type, Attr::Ref(int)),
                    (DW_AT_data_member_location, Attr::Data1(0)),
                ],
            );
            b.die(
                DW_TAG_member,
                false,
                &[
                    (DW_AT_name, Attr::Str("next")),
                    (DW_AT_type, Attr::Ref(s + 3)),
                    (DW_AT_data_member_location, Attr::Data1(8)),
                ],
            );
            b.end();
            b.die(DW_TAG_pointer_type, false, &[(DW_AT_type, Attr::Ref(s))]);
            structs.push(s);
        }
        let different = b.die(
            DW_TAG_structure_type,
            true,
            &[(DW_AT_name, Attr::Str("list")), (DW_AT_byte_size, Attr::Data1(16))],
        );
        b.end();
        b.end();
        let offsets: Vec<usize> = structs.iter().map(|s| b.offset(*s)).collect();
        let different = b.offset(different);
        let units = b.build();
        let graph = graph(&units);

        let a = graph.get(graph.lookup(offsets[0]).unwrap());
        let c = graph.get(graph.lookup(offsets[1]).unwrap());
        assert_ne!(a.id(), c.id());
        assert!(a == c);
        assert!(a != graph.get(graph.lookup(different).unwrap()));
    }

    #[test]
    fn test_arrays_qualifiers_and_subroutines()
    {
        let mut b = UnitBuilder::new();
        b.die(DW_TAG_compile_unit, true, &[]);
        let char_ty = b.die(
            DW_TAG_base_type,
            false,
            &[
                (DW_AT_name, Attr::Str("char")),
                (DW_AT_byte_size, Attr::Data1(1)),
                (DW_AT_encoding, Attr::Data1(DW_ATE_signed_char.0)),
            ],
        );
        let array = b.die(DW_TAG_array_type, true, &[(DW_AT_type, Attr::Ref(char_ty))]);
        b.die(DW_TAG_subrange_type, false, &[(DW_AT_upper_bound, Attr::Data1(3))]);
        b.die(DW_TAG_subrange_type, false, &[(DW_AT_count, Attr::Udata(2))]);
        b.end();
        let const_char = b.die(DW_TAG_const_type, false, &[(DW_AT_type, Attr::Ref(char_ty))]);
        let ptr = b.die(DW_TAG_pointer_type, false, &[(DW_AT_type, Attr::Ref(const_char))]);
        let func = b.die(DW_TAG_subroutine_type, true, &[(DW_AT_type, Attr::Ref(ptr))]);
        b.die(DW_TAG_formal_parameter, false, &[(DW_AT_type, Attr::Ref(array))]);
        b.die(DW_TAG_unspecified_parameters, false, &[]);
        b.end();
        let typedef = b.die(
            DW_TAG_typedef,
            false,
            &[(DW_AT_name, Attr::Str("grid_t")), (DW_AT_type, Attr::Ref(array))],
        );
        b.end();
        let offsets = [b.offset(array), b.offset(ptr), b.offset(func), b.offset(typedef)];
        let units = b.build();
        let graph = graph(&units);
        let get = |offset: usize| graph.get(graph.lookup(offset).unwrap());

        let array = get(offsets[0]);
        assert_eq!(array.to_string(), "char[4][2]");
        assert_eq!(array.size(), Some(8));
        assert_eq!(get(offsets[1]).to_string(), "const char*");
        assert_eq!(get(offsets[2]).to_string(), "const char* (char[4][2], ...)");
        let typedef = get(offsets[3]);
        assert_eq!(typedef.size(), Some(8));
        assert_eq!(typedef.strip().id(), array.id());
    }

    #[test]
    fn test_enumeration()
    {
        let mut b = UnitBuilder::new();
        b.die(DW_TAG_compile_unit, true, &[]);
        let e = b.die(
            DW_TAG_enumeration_type,
            true,
            &[(DW_AT_name, Attr::Str("color")), (DW_AT_byte_size, Attr::Data1(4))],
        );
        b.die(
            DW_TAG_enumerator,
            false,
            &[(DW_AT_name, Attr::Str("RED")), (DW_AT_const_value, Attr::Sdata(-1))],
        );
        b.die(
            DW_TAG_enumerator,
            false,
            &[(DW_AT_name, Attr::Str("BLUE")), (DW_AT_const_value, Attr::Data1(2))],
        );
        b.end();
        b.end();
        let offset = b.offset(e);
        let units = b.build();
        let graph = graph(&units);

        let ty = graph.get(graph.lookup(offset).unwrap());
        assert_eq!(ty.to_string(), "enum color");
        let TypeKind::Enumeration { underlying, enumerators } = ty.kind() else {
            panic!("expected an enumeration, got {:?}", ty.kind());
        };
        assert_eq!(*underlying, None);
        assert_eq!(
            enumerators,
            &vec![
                Enumerator {
                    name: "RED".into(),
                    value: -1
                },
                Enumerator {
                    name: "BLUE".into(),
                    value: 2
                },
            ]
        );
    }

    #[test]
    fn test_resolve_type_policy_and_errors()
    {
        let mut b = UnitBuilder::new();
        b.die(DW_TAG_compile_unit, true, &[]);
        let int = b.die(
            DW_TAG_base_type,
            false,
            &[
                (DW_AT_name, Attr::Str("int")),
                (DW_AT_byte_size, Attr::Data1(4)),
                (DW_AT_encoding, Attr::Data1(DW_ATE_signed.0)),
            ],
        );
        let var = b.die(
            DW_TAG_variable,
            false,
            &[(DW_AT_name, Attr::Str("x")), (DW_AT_type, Attr::Ref(int))],
        );
        let no_type = b.die(DW_TAG_subprogram, false, &[(DW_AT_name, Attr::Str("f"))]);
        let dangling = b.die(DW_TAG_variable, false, &[(DW_AT_type, Attr::RawRef(0x7fff))]);
        let to_function = b.die(DW_TAG_variable, false, &[(DW_AT_type, Attr::Ref(no_type))]);
        let bad_ptr = b.die(DW_TAG_pointer_type, false, &[(DW_AT_type, Attr::RawRef(0x7ff0))]);
        let bad_struct = b.die(DW_TAG_structure_type, true, &[(DW_AT_name, Attr::Str("s"))]);
        b.die(
            DW_TAG_member,
            false,
            &[(DW_AT_name, Attr::Str("p")), (DW_AT_type, Attr::Ref(bad_ptr))],
        );
        b.end();
        b.end();
        let offsets: Vec<usize> = [int, var, no_type, dangling, to_function, bad_ptr, bad_struct]
            .iter()
            .map(|index| b.offset(*index))
            .collect();
        let units = b.build();
        let graph = graph(&units);

        let int_id = graph.resolve_type(&units, offsets[0]).unwrap();
        assert_eq!(graph.resolve_type(&units, offsets[1]), Ok(int_id));
        assert_eq!(graph.resolve_type(&units, offsets[2]), Ok(graph.void()));
        assert_eq!(
            graph.resolve_type(&units, offsets[3]),
            Err(DwarfError::UnresolvedTypeReference {
                from: offsets[3],
                target: 0x7fff
            })
        );
        assert_eq!(
            graph.resolve_type(&units, offsets[4]),
            Err(DwarfError::UnsupportedTag {
                offset: offsets[2],
                tag: DW_TAG_subprogram
            })
        );
        let expected = Err(DwarfError::UnresolvedTypeReference {
            from: offsets[5],
            target: 0x7ff0,
        });
        assert_eq!(graph.resolve_type(&units, offsets[5]), expected);
        assert_eq!(graph.resolve_type(&units, offsets[6]), expected);
        assert_eq!(graph.resolve_type(&units, 0x1), Err(DwarfError::UnknownDie { offset: 1 }));
        // The failed struct left no partially built nodes behind: void, int.
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_member_location_expression()
    {
        let mut b = UnitBuilder::new();
        b.die(DW_TAG_compile_unit, true, &[]);
        let int = b.die(
            DW_TAG_base_type,
            false,
            &[(DW_AT_name, Attr::Str("int")), (DW_AT_byte_size, Attr::Data1(4))],
        );
        let s = b.die(DW_TAG_structure_type, true, &[(DW_AT_byte_size, Attr::Data1(16))]);
        b.die(
            DW_TAG_member,
            false,
            &[
                (DW_AT_name, Attr::Str("y")),
                (DW_AT_type, Attr::Ref(int)),
                (
                    DW_AT_data_member_location,
                    Attr::Exprloc(vec![DW_OP_plus_uconst.0, 12]),
                ),
            ],
        );
        b.end();
        b.end();
        let offset = b.offset(s);
        let units = b.build();
        let graph = graph(&units);
        let ty = graph.get(graph.lookup(offset).unwrap());
        assert_eq!(ty.member("y").map(|(m, _)| m.byte_offset), Some(12));
    }
}

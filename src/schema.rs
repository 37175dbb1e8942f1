// Axel '0vercl0k' Souchet - October 18 2026
//! This has the declarative description of C structures: [`SchemaDescriptor`]
//! is what users write, [`Schema`] is what the [`Registry`] validates and lays
//! out once, before any memory gets read.
//!
//! # Examples
//!
//! ```
//! # use haystack::{Constraint, FieldKind, Registry, SchemaDescriptor, WordSize};
//! let mut registry = Registry::new(WordSize::Eight);
//! let id = registry
//!     .register(
//!         SchemaDescriptor::new("node")
//!             .field("value", FieldKind::u32())
//!             .field("next", FieldKind::pointer("node"))
//!             .constrain("value", Constraint::in_range(0, 0xfff)),
//!     )
//!     .unwrap();
//! let node = registry.get(id);
//! assert_eq!(node.size(), 0x10);
//! assert_eq!(node.field("next").unwrap().offset(), 8);
//! ```
use std::collections::HashMap;

use tracing::{debug, warn};

use crate::addr::WordSize;
use crate::constraint::{Constraint, Domain};
use crate::error::{HaystackError, Result};
use crate::instance::Loadable;

/// The semantic type of a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// A 1, 2, 4 or 8 bytes integer.
    Int { width: usize, signed: bool },
    /// A word-sized pointer to an instance of the named schema.
    Pointer(String),
    /// An instance of the named schema, embedded by value.
    Struct(String),
    /// An opaque buffer of that many bytes.
    Bytes(usize),
    /// A word-sized pointer that may point to a NUL-terminated string.
    CString,
}

impl FieldKind {
    #[must_use]
    pub const fn u8() -> Self {
        Self::Int {
            width: 1,
            signed: false,
        }
    }

    #[must_use]
    pub const fn u16() -> Self {
        Self::Int {
            width: 2,
            signed: false,
        }
    }

    #[must_use]
    pub const fn u32() -> Self {
        Self::Int {
            width: 4,
            signed: false,
        }
    }

    #[must_use]
    pub const fn u64() -> Self {
        Self::Int {
            width: 8,
            signed: false,
        }
    }

    #[must_use]
    pub const fn i8() -> Self {
        Self::Int {
            width: 1,
            signed: true,
        }
    }

    #[must_use]
    pub const fn i16() -> Self {
        Self::Int {
            width: 2,
            signed: true,
        }
    }

    #[must_use]
    pub const fn i32() -> Self {
        Self::Int {
            width: 4,
            signed: true,
        }
    }

    #[must_use]
    pub const fn i64() -> Self {
        Self::Int {
            width: 8,
            signed: true,
        }
    }

    /// An unsigned integer as wide as a machine word (`size_t`).
    #[must_use]
    pub const fn word(word_size: WordSize) -> Self {
        Self::Int {
            width: word_size.as_usize(),
            signed: false,
        }
    }

    #[must_use]
    pub fn pointer(target: impl Into<String>) -> Self {
        Self::Pointer(target.into())
    }

    #[must_use]
    pub fn nested(name: impl Into<String>) -> Self {
        Self::Struct(name.into())
    }

    #[must_use]
    pub const fn bytes(len: usize) -> Self {
        Self::Bytes(len)
    }

    #[must_use]
    pub const fn cstring() -> Self {
        Self::CString
    }

    /// Does the field decode to a [`crate::Scalar`] that constraints can look at?
    #[must_use]
    pub fn is_scalar(&self) -> bool {
        matches!(self, Self::Int { .. } | Self::Pointer(_) | Self::CString)
    }
}

/// A field as declared by the user.
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    /// Explicit offset; when absent the field is laid out after the previous
    /// one, with its natural alignment.
    pub offset: Option<usize>,
}

/// A structure as declared by the user: ordered fields plus per-field
/// constraints.
#[derive(Debug, Clone)]
pub struct SchemaDescriptor {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
    pub constraints: Vec<(String, Constraint)>,
}

impl SchemaDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            constraints: Vec::new(),
        }
    }

    /// Append a field, laid out C-style after the previous one.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldDescriptor {
            name: name.into(),
            kind,
            offset: None,
        });

        self
    }

    /// Append a field at an explicit offset.
    #[must_use]
    pub fn field_at(mut self, name: impl Into<String>, kind: FieldKind, offset: usize) -> Self {
        self.fields.push(FieldDescriptor {
            name: name.into(),
            kind,
            offset: Some(offset),
        });

        self
    }

    /// Attach a constraint to a field. Constraints of a field are evaluated in
    /// the order they were attached.
    #[must_use]
    pub fn constrain(mut self, field: impl Into<String>, constraint: Constraint) -> Self {
        self.constraints.push((field.into(), constraint));

        self
    }
}

/// Identifies a registered [`Schema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaId(usize);

/// A laid out field.
#[derive(Debug, Clone)]
pub struct Field {
    name: String,
    kind: FieldKind,
    offset: usize,
    size: usize,
    constraints: Vec<Constraint>,
}

impl Field {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }
}

/// A validated, laid out structure. Immutable once registered.
#[derive(Debug, Clone)]
pub struct Schema {
    id: SchemaId,
    name: String,
    fields: Vec<Field>,
    size: usize,
    align: usize,
}

impl Schema {
    #[must_use]
    pub fn id(&self) -> SchemaId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total size of the structure in bytes, trailing padding included.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn align(&self) -> usize {
        self.align
    }

    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub(crate) fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

fn align_up(value: usize, align: usize) -> Option<usize> {
    value.checked_add(align - 1).map(|v| v / align * align)
}

/// Maps names to [`Schema`]s. Registration happens once, before any analysis;
/// the registry is only read afterwards.
#[derive(Debug)]
pub struct Registry {
    word_size: WordSize,
    schemas: Vec<Schema>,
    by_name: HashMap<String, SchemaId>,
}

impl Registry {
    #[must_use]
    pub fn new(word_size: WordSize) -> Self {
        Self {
            word_size,
            schemas: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    #[must_use]
    pub fn word_size(&self) -> WordSize {
        self.word_size
    }

    /// Validate, lay out and register a schema.
    ///
    /// Registering a name twice is a no-op: the first schema stays and its id
    /// is returned.
    ///
    /// # Errors
    ///
    /// Returns [`HaystackError::MalformedSchema`] if the descriptor doesn't
    /// describe a structure that can be laid out.
    pub fn register(&mut self, desc: SchemaDescriptor) -> Result<SchemaId> {
        if let Some(&id) = self.by_name.get(&desc.name) {
            warn!("schema {} is already registered, skipping", desc.name);
            return Ok(id);
        }

        let schema = self.layout(desc)?;
        debug!(
            "registered {} ({:#x} bytes, {} fields)",
            schema.name,
            schema.size,
            schema.fields.len()
        );
        let id = schema.id;
        self.by_name.insert(schema.name.clone(), id);
        self.schemas.push(schema);

        Ok(id)
    }

    /// Register the schema backing a [`Loadable`] type.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema is malformed.
    pub fn register_type<T: Loadable>(&mut self) -> Result<SchemaId> {
        self.register(T::descriptor(self.word_size))
    }

    /// Make sure every pointer field targets a registered schema.
    ///
    /// # Errors
    ///
    /// Returns [`HaystackError::MalformedSchema`] for the first dangling
    /// pointer.
    pub fn check(&self) -> Result<()> {
        for schema in &self.schemas {
            for field in &schema.fields {
                if let FieldKind::Pointer(target) = &field.kind {
                    if !self.by_name.contains_key(target) {
                        return Err(HaystackError::malformed(
                            &schema.name,
                            format!("{} points to unknown schema {target}", field.name),
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<SchemaId> {
        self.by_name.get(name).copied()
    }

    /// Get a schema by id. Ids are only handed out by this registry.
    #[must_use]
    pub fn get(&self, id: SchemaId) -> &Schema {
        &self.schemas[id.0]
    }

    /// Get a schema by name.
    ///
    /// # Errors
    ///
    /// Returns [`HaystackError::UnknownSchema`] if nothing is registered
    /// under that name.
    pub fn by_name(&self, name: &str) -> Result<&Schema> {
        self.lookup(name)
            .map(|id| self.get(id))
            .ok_or_else(|| HaystackError::UnknownSchema(name.to_string()))
    }

    pub fn schemas(&self) -> impl ExactSizeIterator<Item = &Schema> + '_ {
        self.schemas.iter()
    }

    /// Size and alignment of a field kind.
    fn size_align(&self, schema: &str, kind: &FieldKind) -> Result<(usize, usize)> {
        let word = self.word_size.as_usize();
        match kind {
            FieldKind::Int { width, .. } if matches!(width, 1 | 2 | 4 | 8) => Ok((*width, *width)),
            FieldKind::Int { width, .. } => Err(HaystackError::malformed(
                schema,
                format!("{width} bytes integers aren't supported"),
            )),
            FieldKind::Pointer(_) | FieldKind::CString => Ok((word, word)),
            FieldKind::Bytes(0) => Err(HaystackError::malformed(schema, "zero-length buffer")),
            FieldKind::Bytes(len) => Ok((*len, 1)),
            FieldKind::Struct(name) if name == schema => Err(HaystackError::malformed(
                schema,
                "a structure can't embed itself by value",
            )),
            FieldKind::Struct(name) => {
                let nested = self.by_name(name).map_err(|_| {
                    HaystackError::malformed(schema, format!("embeds unknown schema {name}"))
                })?;

                Ok((nested.size, nested.align))
            }
        }
    }

    fn layout(&self, desc: SchemaDescriptor) -> Result<Schema> {
        let name = desc.name;
        if desc.fields.is_empty() {
            return Err(HaystackError::malformed(&name, "no fields"));
        }

        let mut fields = Vec::with_capacity(desc.fields.len());
        let mut cursor = 0usize;
        let mut align = 1usize;
        let mut end = 0usize;
        for field in desc.fields {
            if fields.iter().any(|f: &Field| f.name == field.name) {
                return Err(HaystackError::malformed(
                    &name,
                    format!("duplicate field {}", field.name),
                ));
            }

            let (size, field_align) = self.size_align(&name, &field.kind)?;
            let offset = match field.offset {
                Some(offset) => offset,
                None => align_up(cursor, field_align)
                    .ok_or_else(|| HaystackError::malformed(&name, "layout overflow"))?,
            };

            cursor = offset
                .checked_add(size)
                .ok_or_else(|| HaystackError::malformed(&name, "layout overflow"))?;
            end = end.max(cursor);
            align = align.max(field_align);
            fields.push(Field {
                name: field.name,
                kind: field.kind,
                offset,
                size,
                constraints: Vec::new(),
            });
        }

        for (field_name, constraint) in desc.constraints {
            let Some(field) = fields.iter_mut().find(|f| f.name == field_name) else {
                return Err(HaystackError::malformed(
                    &name,
                    format!("constraint on unknown field {field_name}"),
                ));
            };

            let domain = match field.kind {
                FieldKind::Int { width, signed } => Domain::new(width, signed),
                FieldKind::Pointer(_) | FieldKind::CString => {
                    Domain::new(self.word_size.as_usize(), false)
                }
                FieldKind::Struct(_) | FieldKind::Bytes(_) => {
                    return Err(HaystackError::malformed(
                        &name,
                        format!("{field_name} isn't a scalar and can't be constrained"),
                    ));
                }
            };

            constraint.fits(domain).map_err(|reason| {
                HaystackError::malformed(&name, format!("{field_name}: {reason}"))
            })?;
            field.constraints.push(constraint);
        }

        let size = align_up(end, align)
            .ok_or_else(|| HaystackError::malformed(&name, "layout overflow"))?;

        Ok(Schema {
            id: SchemaId(self.schemas.len()),
            name,
            fields,
            size,
            align,
        })
    }
}

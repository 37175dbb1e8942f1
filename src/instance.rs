// Axel '0vercl0k' Souchet - October 18 2026
//! This defines what the loader materializes: [`Instance`]s living in a
//! session's arena and referencing each other by [`InstanceId`], which is how
//! cyclic structure graphs are represented.
use std::borrow::Cow;

use crate::addr::{Address, WordSize};
use crate::constraint::Scalar;
use crate::error::{HaystackError, Result};
use crate::schema::{Field, Schema, SchemaDescriptor, SchemaId};
use crate::space::AddressSpace;

/// Identifies an [`Instance`] inside a [`crate::Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub(crate) usize);

/// A string-or-pointer field. The pointee is only read once the pointer has
/// been validated, and only as a best-effort diagnostic value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StringField {
    Null,
    /// The pointer is valid but no string could be read from it.
    Unresolved(Address),
    /// The bytes read from the pointer, NUL excluded.
    Resolved { addr: Address, bytes: Vec<u8> },
}

impl StringField {
    /// The pointer itself.
    #[must_use]
    pub fn addr(&self) -> Address {
        match self {
            Self::Null => Address::NULL,
            Self::Unresolved(addr) | Self::Resolved { addr, .. } => *addr,
        }
    }

    /// The string, lossily decoded as UTF-8.
    #[must_use]
    pub fn to_string_lossy(&self) -> Option<Cow<'_, str>> {
        match self {
            Self::Resolved { bytes, .. } => Some(String::from_utf8_lossy(bytes)),
            _ => None,
        }
    }
}

/// The decoded value of a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Int(Scalar),
    /// `target` is `None` for null pointers.
    Pointer {
        addr: Address,
        target: Option<InstanceId>,
    },
    Struct(InstanceId),
    Bytes(Vec<u8>),
    String(StringField),
}

/// How much of an instance was loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// The depth budget ran out before this instance: nothing was read and
    /// nothing was validated.
    Partial,
    /// Every field was decoded, constrained and followed.
    Complete,
}

/// A schema interpreted at a given address of a snapshot.
#[derive(Debug, Clone)]
pub struct Instance {
    addr: Address,
    schema: SchemaId,
    state: LoadState,
    valid: bool,
    /// Pointer hops the instance was loaded with.
    depth: usize,
    values: Vec<FieldValue>,
}

impl Instance {
    /// An instance the loader stopped short of.
    pub(crate) fn partial(schema: SchemaId, addr: Address) -> Self {
        Self {
            addr,
            schema,
            state: LoadState::Partial,
            valid: true,
            depth: 0,
            values: Vec::new(),
        }
    }

    /// An instance being loaded with `depth` hops to go; it isn't valid until
    /// [`Instance::complete`].
    pub(crate) fn provisional(schema: SchemaId, addr: Address, depth: usize) -> Self {
        Self {
            addr,
            schema,
            state: LoadState::Partial,
            valid: false,
            depth,
            values: Vec::new(),
        }
    }

    pub(crate) fn complete(&mut self, values: Vec<FieldValue>) {
        self.values = values;
        self.state = LoadState::Complete;
        self.valid = true;
    }

    pub(crate) fn deepen(&mut self, depth: usize) {
        self.depth = depth;
    }

    #[must_use]
    pub fn addr(&self) -> Address {
        self.addr
    }

    #[must_use]
    pub fn schema(&self) -> SchemaId {
        self.schema
    }

    #[must_use]
    pub fn state(&self) -> LoadState {
        self.state
    }

    /// The number of pointer hops the loader was allowed to follow from this
    /// instance. Zero for partial instances.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state == LoadState::Complete
    }

    /// Did the instance pass validation? Partial instances are valid but
    /// incomplete; an instance only reads as invalid while it is being loaded.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Field values, in schema order. Empty for partial instances.
    #[must_use]
    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }
}

/// An [`Instance`] along with its [`Schema`], to access fields by name.
#[derive(Debug, Clone, Copy)]
pub struct InstanceView<'s> {
    pub(crate) id: InstanceId,
    pub(crate) schema: &'s Schema,
    pub(crate) instance: &'s Instance,
}

impl<'s> InstanceView<'s> {
    #[must_use]
    pub fn id(&self) -> InstanceId {
        self.id
    }

    #[must_use]
    pub fn schema(&self) -> &'s Schema {
        self.schema
    }

    #[must_use]
    pub fn instance(&self) -> &'s Instance {
        self.instance
    }

    #[must_use]
    pub fn addr(&self) -> Address {
        self.instance.addr
    }

    /// The value of the field `name`, if the instance was loaded.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&'s FieldValue> {
        let idx = self.schema.field_index(name)?;

        self.instance.values.get(idx)
    }

    /// The value of an integer field.
    #[must_use]
    pub fn scalar(&self, name: &str) -> Option<Scalar> {
        match self.get(name)? {
            FieldValue::Int(s) => Some(*s),
            _ => None,
        }
    }

    /// The target of a pointer field; `Some(None)` for a null pointer.
    #[must_use]
    pub fn pointer(&self, name: &str) -> Option<Option<InstanceId>> {
        match self.get(name)? {
            FieldValue::Pointer { target, .. } => Some(*target),
            _ => None,
        }
    }

    /// Like [`InstanceView::scalar`] but errors out when the field is absent,
    /// handy in [`Loadable::from_view`].
    ///
    /// # Errors
    ///
    /// Returns [`HaystackError::MissingField`] if the field isn't an integer
    /// or the instance wasn't loaded.
    pub fn require_scalar(&self, name: &str) -> Result<Scalar> {
        self.scalar(name).ok_or_else(|| HaystackError::MissingField {
            schema: self.schema.name().to_string(),
            field: name.to_string(),
        })
    }

    /// Iterate over the fields and their values.
    pub fn fields(&self) -> impl Iterator<Item = (&'s Field, &'s FieldValue)> + 's {
        self.schema.fields().iter().zip(self.instance.values.iter())
    }
}

/// A Rust type backed by a schema. The loader decodes and validates the
/// schema generically; the type then builds itself out of the loaded instance
/// and can veto it with checks constraints can't express.
pub trait Loadable: Sized {
    /// The name the schema is registered under.
    const NAME: &'static str;

    /// Describe the structure for a given word size.
    fn descriptor(word_size: WordSize) -> SchemaDescriptor;

    /// Build the value out of a loaded instance.
    ///
    /// # Errors
    ///
    /// Returns an error if a field is missing.
    fn from_view(view: &InstanceView<'_>) -> Result<Self>;

    /// Extra validation that needs to look at the address space.
    ///
    /// # Errors
    ///
    /// Returns a recoverable error if the value isn't a valid instance.
    fn is_valid(&self, _space: &dyn AddressSpace) -> Result<()> {
        Ok(())
    }
}

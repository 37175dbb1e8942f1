// Axel '0vercl0k' Souchet - October 18 2026
//! This has the structure loader: a [`Session`] interprets byte ranges of an
//! [`AddressSpace`] as instances of registered schemas, follows their pointers
//! up to a depth budget, and keeps the identity of everything it loaded in its
//! [`ReferenceCache`].
//!
//! A session is owned by one traversal at a time; analyzing independent
//! snapshots concurrently means one session per snapshot.
use tracing::{debug, trace};

use crate::addr::{Address, WordSize};
use crate::cache::{Mark, ReferenceCache, DEFAULT_SOFT_LIMIT};
use crate::constraint::{first_failure, Scalar};
use crate::error::{ignore_recoverable, HaystackError, ReadError, Result};
use crate::instance::{FieldValue, Instance, InstanceId, InstanceView, Loadable, StringField};
use crate::schema::{FieldKind, Registry, Schema, SchemaId};
use crate::space::{AddressSpace, MemoryRegion};

/// Knobs of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Maximum number of bytes read behind a string pointer.
    pub max_string_len: usize,
    /// Number of cached instances past which the session warns.
    pub cache_soft_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_string_len: 256,
            cache_soft_limit: DEFAULT_SOFT_LIMIT,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn max_string_len(mut self, len: usize) -> Self {
        self.max_string_len = len;

        self
    }

    #[must_use]
    pub fn cache_soft_limit(mut self, limit: usize) -> Self {
        self.cache_soft_limit = limit;

        self
    }
}

/// One analysis of one snapshot.
pub struct Session<'a> {
    registry: &'a Registry,
    space: &'a dyn AddressSpace,
    config: SessionConfig,
    cache: ReferenceCache,
    /// Every instance loaded so far; [`InstanceId`]s index into it.
    instances: Vec<Instance>,
    /// Instances updated in place by the current load, as they were before.
    restores: Vec<(InstanceId, Instance)>,
}

/// Where to roll a session back to when a load fails.
struct Checkpoint {
    cache: Mark,
    restores: usize,
}

impl std::fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("instances", &self.instances.len())
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl<'a> Session<'a> {
    /// Start a session with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a schema points to an unregistered schema, or if
    /// the registry and the address space disagree on the word size.
    pub fn new(registry: &'a Registry, space: &'a dyn AddressSpace) -> Result<Self> {
        Self::with_config(registry, space, SessionConfig::default())
    }

    /// Start a session with a specific configuration.
    ///
    /// # Errors
    ///
    /// Same as [`Session::new`].
    pub fn with_config(
        registry: &'a Registry,
        space: &'a dyn AddressSpace,
        config: SessionConfig,
    ) -> Result<Self> {
        if registry.word_size() != space.word_size() {
            return Err(HaystackError::WordSizeMismatch {
                registry: registry.word_size(),
                space: space.word_size(),
            });
        }

        registry.check()?;

        Ok(Self {
            registry,
            space,
            config,
            cache: ReferenceCache::new(config.cache_soft_limit),
            instances: Vec::new(),
            restores: Vec::new(),
        })
    }

    #[must_use]
    pub fn registry(&self) -> &'a Registry {
        self.registry
    }

    #[must_use]
    pub fn space(&self) -> &'a dyn AddressSpace {
        self.space
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &ReferenceCache {
        &self.cache
    }

    /// Number of instances in the session.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Drop every instance and every cached identity. Ids handed out before
    /// are meaningless afterwards.
    pub fn reset(&mut self) {
        self.instances.clear();
        self.restores.clear();
        self.cache.reset();
    }

    /// Get an instance. Ids are only handed out by this session.
    #[must_use]
    pub fn instance(&self, id: InstanceId) -> &Instance {
        &self.instances[id.0]
    }

    /// Get an instance along with its schema.
    #[must_use]
    pub fn view(&self, id: InstanceId) -> InstanceView<'_> {
        let instance = &self.instances[id.0];

        InstanceView {
            id,
            schema: self.registry.get(instance.schema()),
            instance,
        }
    }

    /// Interpret the bytes at `addr` as an instance of the schema `name`.
    ///
    /// `max_depth` is the number of pointer hops the loader is allowed to
    /// follow; instances past that are returned partially loaded. Loading an
    /// address again with a larger budget completes the instances loaded
    /// before, it never creates new ones.
    ///
    /// # Errors
    ///
    /// Returns [`HaystackError::OutOfBounds`] if the instance, or anything it
    /// points to, isn't backed by the address space, and
    /// [`HaystackError::ConstraintViolation`] if a field doesn't satisfy its
    /// constraints. Nothing about a failed load is remembered.
    pub fn load(&mut self, name: &str, addr: Address, max_depth: usize) -> Result<InstanceId> {
        let schema = self.registry.by_name(name)?.id();

        self.load_schema(schema, addr, max_depth)
    }

    /// Like [`Session::load`], with a schema id.
    ///
    /// # Errors
    ///
    /// Same as [`Session::load`].
    pub fn load_schema(
        &mut self,
        schema: SchemaId,
        addr: Address,
        max_depth: usize,
    ) -> Result<InstanceId> {
        let checkpoint = self.checkpoint();
        let r = self.load_inner(schema, addr, max_depth);
        self.settle(checkpoint, r.is_ok());

        r
    }

    /// Load a [`Loadable`] type at `addr` and run its own validation on top.
    ///
    /// # Errors
    ///
    /// Same as [`Session::load`], plus whatever [`Loadable::is_valid`]
    /// reports; [`HaystackError::UnknownSchema`] if the type wasn't
    /// registered.
    pub fn load_as<T: Loadable>(
        &mut self,
        addr: Address,
        max_depth: usize,
    ) -> Result<(InstanceId, T)> {
        let schema = self.registry.by_name(T::NAME)?.id();
        let checkpoint = self.checkpoint();
        let r = self.load_inner(schema, addr, max_depth).and_then(|id| {
            let value = T::from_view(&self.view(id))?;
            value.is_valid(self.space)?;

            Ok((id, value))
        });

        self.settle(checkpoint, r.is_ok());

        r
    }

    /// Is the instance valid?
    #[must_use]
    pub fn is_valid(&self, id: InstanceId) -> bool {
        self.instances.get(id.0).is_some_and(Instance::is_valid)
    }

    /// Try to load the schema `name` at every `step`-aligned address of
    /// `region` and return the instances that validated. Candidates failing
    /// with a recoverable error are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema isn't registered, or if `step` or
    /// `max_depth` is zero: a candidate has to be read to be validated.
    pub fn search(
        &mut self,
        name: &str,
        region: &MemoryRegion,
        step: u64,
        max_depth: usize,
    ) -> Result<Vec<InstanceId>> {
        let schema = self.registry.by_name(name)?;
        if step == 0 {
            return Err(HaystackError::Overflow("search step can't be zero"));
        }

        if max_depth == 0 {
            return Err(HaystackError::Overflow("search depth can't be zero"));
        }

        let (id, size) = (schema.id(), schema.size() as u64);
        let mut found = Vec::new();
        let mut offset = 0u64;
        while offset.checked_add(size).is_some_and(|end| end <= region.len()) {
            let Some(addr) = region.start().checked_add(offset) else {
                break;
            };

            if let Some(instance) = ignore_recoverable(self.load_schema(id, addr, max_depth))? {
                if self.instance(instance).is_complete() {
                    found.push(instance);
                }
            }

            let Some(next) = offset.checked_add(step) else {
                break;
            };
            offset = next;
        }

        debug!(
            "found {} {name} in {} bytes at {}",
            found.len(),
            region.len(),
            region.start()
        );

        Ok(found)
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            cache: self.cache.mark(InstanceId(self.instances.len())),
            restores: self.restores.len(),
        }
    }

    /// Keep what a load did if it succeeded, otherwise retract every instance
    /// allocated since `checkpoint` and put back the ones it updated.
    fn settle(&mut self, checkpoint: Checkpoint, success: bool) {
        if success {
            self.restores.truncate(checkpoint.restores);
            return;
        }

        let first = checkpoint.cache.first_instance();
        if first.0 < self.instances.len() {
            debug!(
                "rolling back {} instance(s)",
                self.instances.len() - first.0
            );
        }

        for (id, before) in self.restores.drain(checkpoint.restores..).rev() {
            if id < first {
                self.instances[id.0] = before;
            }
        }

        self.cache.rollback(checkpoint.cache);
        self.instances.truncate(first.0);
    }

    /// Update an instance in place, remembering how it was in case the load
    /// fails.
    fn update(&mut self, id: InstanceId, instance: Instance) {
        let before = std::mem::replace(&mut self.instances[id.0], instance);
        self.restores.push((id, before));
    }

    fn alloc(&mut self, instance: Instance) -> InstanceId {
        let id = InstanceId(self.instances.len());
        self.instances.push(instance);

        id
    }

    fn load_inner(&mut self, schema_id: SchemaId, addr: Address, depth: usize) -> Result<InstanceId> {
        // If we already know what lives there with enough depth, hand it back;
        // this is what breaks cycles, as instances being loaded are cached too.
        let cached = self.cache.lookup(schema_id, addr);
        if let Some(id) = cached {
            if self.instances[id.0].depth() >= depth {
                trace!("{schema_id:?}@{addr} is cached as {id:?}");
                return Ok(id);
            }

            if self.instances[id.0].is_complete() {
                return self.deepen(id, depth);
            }
        }

        let registry = self.registry;
        let schema = registry.get(schema_id);
        if depth == 0 {
            debug!(
                "maximum depth reached, {}@{addr} is partially loaded",
                schema.name()
            );
            let id = self.alloc(Instance::partial(schema_id, addr));
            self.cache.remember(schema_id, addr, id);

            return Ok(id);
        }

        // Read the whole structure in one go, and decode every scalar field to
        // check its constraints before following anything.
        let bytes = self.space.read_bytes(addr, schema.size())?;
        let raw = decode_scalars(schema, &bytes, self.space.word_size())?;

        // Remember the instance before recursing, so that pointers coming back
        // to it resolve to it. An instance the depth budget stopped short of
        // earlier is completed in place.
        let provisional = Instance::provisional(schema_id, addr, depth);
        let id = match cached {
            Some(id) => {
                debug!("completing {}@{addr} ({id:?})", schema.name());
                self.update(id, provisional);

                id
            }
            None => {
                let id = self.alloc(provisional);
                self.cache.remember(schema_id, addr, id);

                id
            }
        };

        let mut values = Vec::with_capacity(schema.fields().len());
        for (field, raw) in schema.fields().iter().zip(raw) {
            let value = match (field.kind(), raw) {
                (FieldKind::Int { .. }, Some(scalar)) => FieldValue::Int(scalar),
                (FieldKind::Pointer(target), Some(scalar)) => {
                    let ptr = Address::new(scalar.as_u64());
                    let target = if ptr.is_null() {
                        None
                    } else {
                        let target = registry.by_name(target)?;
                        self.check_pointer(ptr, target.size() as u64)?;

                        Some(self.load_inner(target.id(), ptr, depth - 1)?)
                    };

                    FieldValue::Pointer { addr: ptr, target }
                }
                (FieldKind::CString, Some(scalar)) => {
                    FieldValue::String(self.load_string(Address::new(scalar.as_u64()))?)
                }
                (FieldKind::Struct(nested), _) => {
                    let nested = registry.by_name(nested)?;
                    let nested_addr = addr
                        .checked_add(field.offset() as u64)
                        .ok_or(HaystackError::Overflow("w/ nested structure address"))?;

                    // Embedded by value: same hop, same depth.
                    FieldValue::Struct(self.load_inner(nested.id(), nested_addr, depth)?)
                }
                (FieldKind::Bytes(_), _) => FieldValue::Bytes(
                    bytes[field.offset()..field.offset() + field.size()].to_vec(),
                ),
                (_, None) => {
                    return Err(HaystackError::Overflow("w/ scalar decoding"));
                }
            };

            values.push(value);
        }

        self.instances[id.0].complete(values);

        Ok(id)
    }

    /// Give a loaded instance a larger depth budget, and pass it on to what it
    /// points to so that instances past the old budget get completed.
    fn deepen(&mut self, id: InstanceId, depth: usize) -> Result<InstanceId> {
        let mut deeper = self.instances[id.0].clone();
        let targets = deeper
            .values()
            .iter()
            .filter_map(|value| match value {
                FieldValue::Pointer {
                    target: Some(target),
                    ..
                } => Some((*target, depth - 1)),
                FieldValue::Struct(nested) => Some((*nested, depth)),
                _ => None,
            })
            .collect::<Vec<_>>();

        deeper.deepen(depth);
        self.update(id, deeper);
        for (target, depth) in targets {
            let (schema, addr) = {
                let target = &self.instances[target.0];
                (target.schema(), target.addr())
            };

            self.load_inner(schema, addr, depth)?;
        }

        Ok(id)
    }

    /// A pointer is followed only if the address it holds is mapped.
    fn check_pointer(&self, ptr: Address, len: u64) -> Result<()> {
        if self.space.is_mapped(ptr) {
            return Ok(());
        }

        Err(HaystackError::OutOfBounds {
            addr: ptr,
            len,
            reason: ReadError::Unmapped(ptr),
        })
    }

    /// Validate a string pointer and, if it holds, read a bounded string
    /// behind it. What's behind the pointer never fails the structure.
    fn load_string(&self, ptr: Address) -> Result<StringField> {
        if ptr.is_null() {
            return Ok(StringField::Null);
        }

        self.check_pointer(ptr, 1)?;
        let mut buf = vec![0; self.config.max_string_len];
        let amount = match self.space.read(ptr, &mut buf) {
            Ok(0) | Err(_) => {
                debug!("couldn't read the string at {ptr}");
                return Ok(StringField::Unresolved(ptr));
            }
            Ok(amount) => amount,
        };

        buf.truncate(amount);
        if let Some(nul) = buf.iter().position(|&b| b == 0) {
            buf.truncate(nul);
        }

        Ok(StringField::Resolved {
            addr: ptr,
            bytes: buf,
        })
    }
}

/// Decode every scalar field of `schema` out of `bytes` and evaluate its
/// constraints, in declaration order. Non-scalar fields decode to `None`.
fn decode_scalars(
    schema: &Schema,
    bytes: &[u8],
    word_size: WordSize,
) -> Result<Vec<Option<Scalar>>> {
    let mut scalars = Vec::with_capacity(schema.fields().len());
    for field in schema.fields() {
        let data = bytes
            .get(field.offset()..field.offset() + field.size())
            .ok_or(HaystackError::Overflow("w/ field bounds"))?;
        let scalar = match field.kind() {
            FieldKind::Int { signed, .. } => Scalar::decode(data, *signed),
            FieldKind::Pointer(_) | FieldKind::CString => word_size.decode(data).map(Scalar::Unsigned),
            FieldKind::Struct(_) | FieldKind::Bytes(_) => {
                scalars.push(None);
                continue;
            }
        };

        let Some(scalar) = scalar else {
            return Err(HaystackError::Overflow("w/ scalar decoding"));
        };

        if first_failure(field.constraints(), scalar).is_some() {
            return Err(HaystackError::ConstraintViolation {
                schema: schema.name().to_string(),
                field: field.name().to_string(),
                value: scalar,
            });
        }

        scalars.push(Some(scalar));
    }

    Ok(scalars)
}

// Axel '0vercl0k' Souchet - October 18 2026
//! This implements the [`ReferenceCache`]: the identity map from
//! `(schema, address)` to the single instance loaded there. It is what breaks
//! cycles in self-referential structures, so it never evicts on its own.
use std::collections::HashMap;

use tracing::{debug, warn};

use crate::addr::Address;
use crate::instance::InstanceId;
use crate::schema::SchemaId;

/// Default number of entries past which the cache starts complaining.
pub const DEFAULT_SOFT_LIMIT: usize = 35_000;

type Key = (SchemaId, Address);

/// A position in the cache's history, to undo everything remembered after it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Mark {
    journal_len: usize,
    first_instance: InstanceId,
}

impl Mark {
    /// The first instance allocated after the mark.
    pub(crate) fn first_instance(&self) -> InstanceId {
        self.first_instance
    }
}

#[derive(Debug)]
pub struct ReferenceCache {
    refs: HashMap<Key, InstanceId>,
    /// Keys in insertion order.
    journal: Vec<Key>,
    soft_limit: usize,
    warned: bool,
}

impl Default for ReferenceCache {
    fn default() -> Self {
        Self::new(DEFAULT_SOFT_LIMIT)
    }
}

impl ReferenceCache {
    #[must_use]
    pub fn new(soft_limit: usize) -> Self {
        Self {
            refs: HashMap::new(),
            journal: Vec::new(),
            soft_limit,
            warned: false,
        }
    }

    /// The instance already loaded for `schema` at `addr`, if any.
    #[must_use]
    pub fn lookup(&self, schema: SchemaId, addr: Address) -> Option<InstanceId> {
        self.refs.get(&(schema, addr)).copied()
    }

    /// Remember `instance` as the one for `schema` at `addr`. The first
    /// writer wins; returns `false` if the key was already taken.
    pub fn remember(&mut self, schema: SchemaId, addr: Address, instance: InstanceId) -> bool {
        let key = (schema, addr);
        if let Some(existing) = self.refs.get(&key) {
            debug!("{schema:?}@{addr} already in cache as {existing:?}");
            return false;
        }

        self.refs.insert(key, instance);
        self.journal.push(key);
        if self.refs.len() > self.soft_limit && !self.warned {
            warn!(
                "the reference cache holds more than {} entries, you should reset the session",
                self.soft_limit
            );
            self.warned = true;
        }

        true
    }

    /// Retract the instance remembered for `schema` at `addr`.
    pub fn forget(&mut self, schema: SchemaId, addr: Address) -> Option<InstanceId> {
        self.refs.remove(&(schema, addr))
    }

    /// Forget about everything.
    pub fn reset(&mut self) {
        self.refs.clear();
        self.journal.clear();
        self.warned = false;
    }

    /// Every `(schema, instance)` remembered at `addr`.
    #[must_use]
    pub fn at(&self, addr: Address) -> Vec<(SchemaId, InstanceId)> {
        let mut found: Vec<_> = self
            .refs
            .iter()
            .filter(|((_, a), _)| *a == addr)
            .map(|((schema, _), id)| (*schema, *id))
            .collect();
        found.sort_unstable();

        found
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    #[must_use]
    pub fn soft_limit(&self) -> usize {
        self.soft_limit
    }

    pub(crate) fn mark(&self, first_instance: InstanceId) -> Mark {
        Mark {
            journal_len: self.journal.len(),
            first_instance,
        }
    }

    /// Forget every entry remembered since `mark` that points to an instance
    /// allocated since `mark`.
    pub(crate) fn rollback(&mut self, mark: Mark) {
        if mark.journal_len > self.journal.len() {
            return;
        }

        for key in self.journal.drain(mark.journal_len..) {
            if self
                .refs
                .get(&key)
                .is_some_and(|id| *id >= mark.first_instance)
            {
                self.refs.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tracing_subscriber::fmt::MakeWriter;

    use super::*;
    use crate::schema::{FieldKind, Registry, SchemaDescriptor};
    use crate::WordSize;

    fn two_schemas() -> (SchemaId, SchemaId) {
        let mut registry = Registry::new(WordSize::Eight);
        let a = registry
            .register(SchemaDescriptor::new("a").field("x", FieldKind::u8()))
            .unwrap();
        let b = registry
            .register(SchemaDescriptor::new("b").field("x", FieldKind::u8()))
            .unwrap();

        (a, b)
    }

    #[test]
    fn first_writer_wins() {
        let (a, _) = two_schemas();
        let mut cache = ReferenceCache::default();
        let addr = Address::new(0x1000);
        assert!(cache.remember(a, addr, InstanceId(0)));
        assert!(!cache.remember(a, addr, InstanceId(1)));
        assert_eq!(cache.lookup(a, addr), Some(InstanceId(0)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn keys_are_schema_and_address() {
        let (a, b) = two_schemas();
        let mut cache = ReferenceCache::default();
        let addr = Address::new(0x1000);
        cache.remember(a, addr, InstanceId(0));
        cache.remember(b, addr, InstanceId(1));
        assert_eq!(cache.lookup(b, addr), Some(InstanceId(1)));
        assert_eq!(cache.at(addr), [(a, InstanceId(0)), (b, InstanceId(1))]);

        assert_eq!(cache.forget(a, addr), Some(InstanceId(0)));
        assert_eq!(cache.lookup(a, addr), None);
        assert_eq!(cache.forget(a, addr), None);

        cache.reset();
        assert!(cache.is_empty());
    }

    #[test]
    fn soft_limit_never_evicts() {
        let (a, _) = two_schemas();
        let mut cache = ReferenceCache::new(2);
        for i in 0..10 {
            cache.remember(a, Address::new(i), InstanceId(i as usize));
        }
        assert_eq!(cache.len(), 10);
        assert_eq!(cache.lookup(a, Address::new(0)), Some(InstanceId(0)));
    }

    /// Collects what gets logged.
    #[derive(Clone, Default)]
    struct Logs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Logs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);

            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Logs {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn soft_limit_warns_once_until_reset() {
        let (a, _) = two_schemas();
        let logs = Logs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let mut cache = ReferenceCache::new(2);
            for _ in 0..2 {
                for i in 0..5 {
                    cache.remember(a, Address::new(i), InstanceId(i as usize));
                }

                assert!(cache.warned);
                cache.reset();
                assert!(!cache.warned);
            }
        });

        let logs = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert_eq!(logs.matches("holds more than 2 entries").count(), 2);
    }

    #[test]
    fn rollback_only_drops_newer_instances() {
        let (a, b) = two_schemas();
        let mut cache = ReferenceCache::default();
        cache.remember(a, Address::new(0x1000), InstanceId(0));
        let mark = cache.mark(InstanceId(1));
        cache.remember(a, Address::new(0x2000), InstanceId(1));
        cache.remember(b, Address::new(0x2000), InstanceId(2));
        cache.rollback(mark);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(a, Address::new(0x1000)), Some(InstanceId(0)));
        assert_eq!(cache.lookup(a, Address::new(0x2000)), None);
    }
}

// Axel '0vercl0k' Souchet - October 18 2026
//! This turns loaded instances into a [`Snapshot`]: plain values detached from
//! the session, the registry and the address space, that can be persisted or
//! compared. Instances are exported once each and referenced by index, so
//! cycles in the instance graph stay cycles in the snapshot.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::constraint::Scalar;
use crate::instance::{FieldValue, InstanceId, StringField};
use crate::loader::Session;

/// A detached field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Unsigned(u64),
    Signed(i64),
    Bytes(Vec<u8>),
    /// `target` is the index of the pointee in [`Snapshot::nodes`], `None`
    /// for null pointers.
    Pointer { address: u64, target: Option<usize> },
    /// Index of the embedded structure in [`Snapshot::nodes`].
    Struct(usize),
    /// `value` is `bytes` decoded lossily, both are `None` if nothing could be
    /// read.
    String {
        address: u64,
        value: Option<String>,
        bytes: Option<Vec<u8>>,
    },
}

/// A detached instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub schema: String,
    pub address: u64,
    /// `false` if the depth budget ran out before this instance; its fields
    /// are empty then.
    pub complete: bool,
    pub fields: Vec<(String, Value)>,
}

impl Node {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find_map(|(field, value)| (field == name).then_some(value))
    }
}

/// A graph of detached instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Index of the exported instance in `nodes`.
    pub root: usize,
    pub nodes: Vec<Node>,
}

impl Snapshot {
    #[must_use]
    pub fn root(&self) -> &Node {
        &self.nodes[self.root]
    }

    #[must_use]
    pub fn node(&self, idx: usize) -> Option<&Node> {
        self.nodes.get(idx)
    }

    /// Follow the pointer field `name` of the node `idx`.
    #[must_use]
    pub fn follow(&self, idx: usize, name: &str) -> Option<usize> {
        match self.node(idx)?.get(name)? {
            Value::Pointer { target, .. } => *target,
            Value::Struct(target) => Some(*target),
            _ => None,
        }
    }
}

impl From<Scalar> for Value {
    fn from(value: Scalar) -> Self {
        match value {
            Scalar::Unsigned(v) => Self::Unsigned(v),
            Scalar::Signed(v) => Self::Signed(v),
        }
    }
}

/// Hands out snapshot indices, one per instance.
#[derive(Default)]
struct Interner {
    index: HashMap<InstanceId, usize>,
    order: Vec<InstanceId>,
}

impl Interner {
    fn intern(&mut self, id: InstanceId) -> usize {
        *self.index.entry(id).or_insert_with(|| {
            self.order.push(id);

            self.order.len() - 1
        })
    }
}

impl Session<'_> {
    /// Export the instance `id` and everything reachable from it.
    #[must_use]
    pub fn export(&self, id: InstanceId) -> Snapshot {
        let mut interner = Interner::default();
        let root = interner.intern(id);
        let mut nodes = Vec::new();
        // Every instance discovered while exporting a node is queued behind it,
        // so this walks the graph breadth first without recursing.
        while let Some(&current) = interner.order.get(nodes.len()) {
            let view = self.view(current);
            let fields = view
                .fields()
                .map(|(field, value)| {
                    let value = match value {
                        FieldValue::Int(scalar) => Value::from(*scalar),
                        FieldValue::Bytes(bytes) => Value::Bytes(bytes.clone()),
                        FieldValue::Pointer { addr, target } => Value::Pointer {
                            address: addr.u64(),
                            target: target.map(|target| interner.intern(target)),
                        },
                        FieldValue::Struct(nested) => Value::Struct(interner.intern(*nested)),
                        FieldValue::String(s) => Value::String {
                            address: s.addr().u64(),
                            value: s.to_string_lossy().map(|s| s.into_owned()),
                            bytes: match s {
                                StringField::Resolved { bytes, .. } => Some(bytes.clone()),
                                StringField::Null | StringField::Unresolved(_) => None,
                            },
                        },
                    };

                    (field.name().to_string(), value)
                })
                .collect();

            nodes.push(Node {
                schema: view.schema().name().to_string(),
                address: view.addr().u64(),
                complete: view.instance().is_complete(),
                fields,
            });
        }

        Snapshot { root, nodes }
    }
}

//! Navigable tree over a parsed binary.
//!
//! Nodes are built once during a mapping pass and are immutable for
//! detection, scripting, and display afterwards. Children always carry
//! absolute file offsets; the relative layout of a field lives only in
//! the parser that produced it.

use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// Leaf value of a structure node.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U64(u64),
    I64(i64),
    F64(f64),
    Bytes(Vec<u8>),
    Str(String),
}

impl Value {
    /// Integer view of the value, when it has one.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(v) => Some(*v),
            Value::I64(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::U64(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Bytes(b) => {
                for (i, byte) in b.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{byte:02X}")?;
                }
                Ok(())
            }
        }
    }
}

/// One node of the binary structure tree.
pub struct BinaryStructure {
    /// Display name, unique among siblings for the nodes the mapper emits.
    pub name: String,
    /// Free-form type tag, e.g. `"IMAGE_DOS_HEADER"`.
    pub tag: String,
    /// Absolute file offset of the described bytes.
    pub offset: Option<u64>,
    /// Size of the described bytes.
    pub size: Option<u64>,
    /// Decoded value for leaf fields.
    pub value: Option<Value>,
    /// Human-readable rendering of `value`.
    pub display_value: Option<String>,
    children: RwLock<Vec<Arc<BinaryStructure>>>,
    parent: OnceCell<Weak<BinaryStructure>>,
    metadata: RwLock<BTreeMap<String, String>>,
}

impl BinaryStructure {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            tag: tag.into(),
            offset: None,
            size: None,
            value: None,
            display_value: None,
            children: RwLock::new(Vec::new()),
            parent: OnceCell::new(),
            metadata: RwLock::new(BTreeMap::new()),
        })
    }

    /// Container node covering `[offset, offset + size)`.
    pub fn span(
        name: impl Into<String>,
        tag: impl Into<String>,
        offset: u64,
        size: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            tag: tag.into(),
            offset: Some(offset),
            size: Some(size),
            value: None,
            display_value: None,
            children: RwLock::new(Vec::new()),
            parent: OnceCell::new(),
            metadata: RwLock::new(BTreeMap::new()),
        })
    }

    /// Leaf field node with a decoded value and display form.
    pub fn field(
        name: impl Into<String>,
        tag: impl Into<String>,
        offset: u64,
        size: u64,
        value: Value,
        display: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            tag: tag.into(),
            offset: Some(offset),
            size: Some(size),
            value: Some(value),
            display_value: Some(display.into()),
            children: RwLock::new(Vec::new()),
            parent: OnceCell::new(),
            metadata: RwLock::new(BTreeMap::new()),
        })
    }

    /// Valueless annotation node with only a display string, e.g. a
    /// parse failure attached to the root.
    pub fn note(
        name: impl Into<String>,
        tag: impl Into<String>,
        display: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            tag: tag.into(),
            offset: None,
            size: None,
            value: None,
            display_value: Some(display.into()),
            children: RwLock::new(Vec::new()),
            parent: OnceCell::new(),
            metadata: RwLock::new(BTreeMap::new()),
        })
    }

    /// Append `child` and set its parent back-reference.
    pub fn attach_child(self: &Arc<Self>, child: Arc<BinaryStructure>) {
        let _ = child.parent.set(Arc::downgrade(self));
        self.children.write().push(child);
    }

    /// Snapshot of the ordered children.
    pub fn children(&self) -> Vec<Arc<BinaryStructure>> {
        self.children.read().clone()
    }

    pub fn parent(&self) -> Option<Arc<BinaryStructure>> {
        self.parent.get().and_then(Weak::upgrade)
    }

    /// Direct child with exactly this name (case-sensitive).
    pub fn child(&self, name: &str) -> Option<Arc<BinaryStructure>> {
        self.children.read().iter().find(|c| c.name == name).cloned()
    }

    /// Case-sensitive, name-matched descent through `segments`.
    pub fn find_by_path(self: &Arc<Self>, segments: &[&str]) -> Option<Arc<BinaryStructure>> {
        let mut node = self.clone();
        for segment in segments {
            node = node.child(segment)?;
        }
        Some(node)
    }

    /// Probe an ordered list of dotted candidate paths and return the
    /// first node that exists. Decouples callers from any one parser's
    /// field naming.
    pub fn resolve_field(self: &Arc<Self>, candidates: &[&str]) -> Option<Arc<BinaryStructure>> {
        for candidate in candidates {
            let segments: Vec<&str> = candidate.split('.').collect();
            if let Some(node) = self.find_by_path(&segments) {
                return Some(node);
            }
        }
        None
    }

    /// Integer value of the first resolvable candidate field.
    pub fn resolve_u64(self: &Arc<Self>, candidates: &[&str]) -> Option<u64> {
        self.resolve_field(candidates)
            .and_then(|n| n.value.as_ref().and_then(Value::as_u64))
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.write().insert(key.into(), value.into());
    }

    pub fn metadata(&self) -> BTreeMap<String, String> {
        self.metadata.read().clone()
    }

    /// JSON dump of the subtree, for host tooling and test assertions.
    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert("name".into(), self.name.clone().into());
        obj.insert("tag".into(), self.tag.clone().into());
        if let Some(offset) = self.offset {
            obj.insert("offset".into(), offset.into());
        }
        if let Some(size) = self.size {
            obj.insert("size".into(), size.into());
        }
        if let Some(display) = &self.display_value {
            obj.insert("display".into(), display.clone().into());
        }
        let metadata = self.metadata.read();
        if !metadata.is_empty() {
            obj.insert(
                "metadata".into(),
                serde_json::to_value(&*metadata).unwrap_or_default(),
            );
        }
        let children = self.children.read();
        if !children.is_empty() {
            obj.insert(
                "children".into(),
                children.iter().map(|c| c.to_json()).collect(),
            );
        }
        serde_json::Value::Object(obj)
    }
}

impl fmt::Debug for BinaryStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryStructure")
            .field("name", &self.name)
            .field("tag", &self.tag)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("display_value", &self.display_value)
            .field("children", &self.children.read().len())
            .finish()
    }
}

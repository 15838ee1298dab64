use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::runtime::Value;

/// Ordered name → offset mapping.
///
/// The same structure serves two roles: at compile time it is a function's
/// local scope (name → stack slot, `this` first), at run time it is the shape
/// of a heap object (name → field offset). Offsets are handed out in
/// insertion order and never change; `len` is the next free offset.
///
/// A shape may have a parent. `slot` only consults the local mapping;
/// `resolve` also walks the parent chain, which the compiler uses to tell a
/// true global apart from a local of an enclosing function.
#[derive(Debug, Default)]
pub struct Shape {
    names: Vec<String>,
    offsets: HashMap<String, u32>,
    parent: Option<Rc<Shape>>,
}

impl Shape {
    pub fn new() -> Self {
        Shape::default()
    }

    pub fn with_parent(parent: Rc<Shape>) -> Self {
        Shape { parent: Some(parent), ..Shape::default() }
    }

    /// Build a shape whose offsets follow `names` in order.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut shape = Shape::new();
        for name in names {
            shape.register(name);
        }
        shape
    }

    /// Assign `name` the next free offset. A name that is already present
    /// keeps its offset.
    pub fn register(&mut self, name: &str) -> u32 {
        if let Some(&offset) = self.offsets.get(name) {
            return offset;
        }
        let offset = self.names.len() as u32;
        self.names.push(name.to_string());
        self.offsets.insert(name.to_string(), offset);
        offset
    }

    /// Append a fresh offset for `name`, shadowing an earlier one. Used for
    /// repeated parameter names, where the last parameter wins.
    pub fn push(&mut self, name: &str) -> u32 {
        let offset = self.names.len() as u32;
        self.names.push(name.to_string());
        self.offsets.insert(name.to_string(), offset);
        offset
    }

    /// Local lookup only.
    pub fn slot(&self, name: &str) -> Option<u32> {
        self.offsets.get(name).copied()
    }

    /// Lookup through the parent chain. Returns the number of parent hops
    /// taken together with the offset.
    pub fn resolve(&self, name: &str) -> Option<(usize, u32)> {
        let mut depth = 0;
        let mut current = Some(self);
        while let Some(shape) = current {
            if let Some(offset) = shape.slot(name) {
                return Some((depth, offset));
            }
            depth += 1;
            current = shape.parent.as_deref();
        }
        None
    }

    pub fn len(&self) -> u32 {
        self.names.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shape{{")?;
        for (i, name) in self.names.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}: {i}")?;
        }
        write!(f, "}}")
    }
}

/// Layout of an object literal. A key given twice keeps its last value, so
/// the shape lists the last occurrence of each key in source order and
/// `keep[i]` is false for initializers overridden later on.
pub fn literal_layout<'a>(keys: impl IntoIterator<Item = &'a str>) -> (Shape, Vec<bool>) {
    let keys: Vec<&str> = keys.into_iter().collect();
    let keep: Vec<bool> = keys
        .iter()
        .enumerate()
        .map(|(i, key)| !keys[i + 1..].contains(key))
        .collect();
    let shape = Shape::from_names(keys.iter().zip(&keep).filter(|(_, k)| **k).map(|(key, _)| *key));
    (shape, keep)
}

/// Where a materialized record lives in a VM heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapOrigin {
    pub heap: u32,
    pub index: u32,
}

/// Caller-visible object: a shape plus one value per field.
///
/// The interpreter creates records directly. The VM materializes them from
/// heap cells when a reference crosses into native code, remembering the
/// origin so the same reference comes back when the value is re-encoded.
pub struct Record {
    shape: Rc<Shape>,
    fields: RefCell<Vec<Value>>,
    origin: Option<HeapOrigin>,
}

const DISPLAY_DEPTH: usize = 4;

impl Record {
    pub fn new(shape: Rc<Shape>, fields: Vec<Value>) -> Self {
        debug_assert_eq!(shape.len() as usize, fields.len());
        Record { shape, fields: RefCell::new(fields), origin: None }
    }

    pub(crate) fn materialized(shape: Rc<Shape>, origin: HeapOrigin) -> Self {
        let fields = vec![Value::Undefined; shape.len() as usize];
        Record { shape, fields: RefCell::new(fields), origin: Some(origin) }
    }

    pub fn shape(&self) -> &Rc<Shape> {
        &self.shape
    }

    pub fn origin(&self) -> Option<HeapOrigin> {
        self.origin
    }

    /// Field value, or `None` when the shape has no such field.
    pub fn get(&self, name: &str) -> Option<Value> {
        let offset = self.shape.slot(name)?;
        self.fields.borrow().get(offset as usize).cloned()
    }

    /// Overwrite an existing field. Returns false when the shape has no
    /// such field; records never grow.
    pub fn set(&self, name: &str, value: Value) -> bool {
        match self.shape.slot(name) {
            Some(offset) => {
                self.set_at(offset, value);
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_at(&self, offset: u32, value: Value) {
        if let Some(cell) = self.fields.borrow_mut().get_mut(offset as usize) {
            *cell = value;
        }
    }

    pub fn fields(&self) -> Vec<(String, Value)> {
        let values = self.fields.borrow();
        self.shape
            .names()
            .zip(values.iter())
            .map(|(n, v)| (n.to_string(), v.clone()))
            .collect()
    }

    /// Identity: the same allocation, or two views of the same heap cell.
    pub fn same(&self, other: &Record) -> bool {
        std::ptr::eq(self, other)
            || matches!((self.origin, other.origin), (Some(a), Some(b)) if a == b)
    }

    pub(crate) fn fmt_depth(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        if depth >= DISPLAY_DEPTH {
            return write!(f, "{{...}}");
        }
        write!(f, "{{")?;
        let values = self.fields.borrow();
        for (i, (name, value)) in self.shape.names().zip(values.iter()).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}: ")?;
            match value {
                Value::Record(inner) => inner.fmt_depth(f, depth + 1)?,
                other => write!(f, "{other}")?,
            }
        }
        write!(f, "}}")
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_depth(f, 0)
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.shape.names().collect();
        f.debug_struct("Record")
            .field("fields", &names)
            .field("origin", &self.origin)
            .finish()
    }
}

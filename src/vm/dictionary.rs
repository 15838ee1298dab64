use std::collections::HashMap;
use std::rc::Rc;

use super::tagged::{INDEX_LIMIT, Tagged};
use crate::object::Shape;
use crate::runtime::{Failure, Function, Value};

/// Deduplication key: strings and integers by content, everything else by
/// allocation address. Entries are never removed, so an address stays
/// unique for as long as the dictionary holds the `Rc`.
#[derive(PartialEq, Eq, Hash)]
enum Key {
    Undefined,
    Global,
    Int(i32),
    Str(Rc<str>),
    Ptr(usize),
}

fn key_of(value: &Value) -> Key {
    match value {
        Value::Undefined => Key::Undefined,
        Value::Global => Key::Global,
        Value::Int(n) => Key::Int(*n),
        Value::Str(s) => Key::Str(s.clone()),
        Value::Function(f) => Key::Ptr(Rc::as_ptr(f) as *const () as usize),
        Value::Shape(s) => Key::Ptr(Rc::as_ptr(s) as *const () as usize),
        Value::Record(r) => Key::Ptr(Rc::as_ptr(r) as *const () as usize),
    }
}

/// Append-only constant pool shared by the compiler and the VM.
///
/// Holds every value the tagged encoding cannot carry inline: strings,
/// negative integers, functions, shapes and foreign records. Index 0 is
/// always `undefined`.
pub struct Dictionary {
    entries: Vec<Value>,
    index: HashMap<Key, u32>,
}

impl Default for Dictionary {
    fn default() -> Self {
        Dictionary::new()
    }
}

impl Dictionary {
    pub fn new() -> Self {
        let mut index = HashMap::new();
        index.insert(Key::Undefined, 0);
        Dictionary { entries: vec![Value::Undefined], index }
    }

    /// Intern `value` and return its dictionary tag. Registering the same
    /// value twice returns the same tag.
    pub fn register(&mut self, value: Value) -> Result<Tagged, Failure> {
        let key = key_of(&value);
        if let Some(&i) = self.index.get(&key) {
            return Tagged::dict(i).ok_or_else(|| Failure::internal("dictionary index overflow"));
        }
        let i = self.entries.len() as u32;
        if i >= INDEX_LIMIT {
            return Err(Failure::internal("dictionary full"));
        }
        self.entries.push(value);
        self.index.insert(key, i);
        Tagged::dict(i).ok_or_else(|| Failure::internal("dictionary index overflow"))
    }

    pub fn lookup(&self, index: u32) -> Option<&Value> {
        self.entries.get(index as usize)
    }

    /// Entry behind a dictionary tag.
    pub fn value(&self, tagged: Tagged) -> Result<&Value, Failure> {
        let index = tagged
            .as_dict()
            .ok_or_else(|| Failure::internal(format!("{tagged:?} is not a dictionary tag")))?;
        self.lookup(index)
            .ok_or_else(|| Failure::internal(format!("dictionary index {index} out of range")))
    }

    pub fn string(&self, tagged: Tagged) -> Result<Rc<str>, Failure> {
        match self.value(tagged)? {
            Value::Str(s) => Ok(s.clone()),
            other => Err(Failure::internal(format!("expected name, found {}", other.type_name()))),
        }
    }

    pub fn shape(&self, tagged: Tagged) -> Result<Rc<Shape>, Failure> {
        match self.value(tagged)? {
            Value::Shape(s) => Ok(s.clone()),
            other => Err(Failure::internal(format!("expected shape, found {}", other.type_name()))),
        }
    }

    pub fn function(&self, tagged: Tagged) -> Result<Rc<Function>, Failure> {
        match self.value(tagged)? {
            Value::Function(f) => Ok(f.clone()),
            other => Err(Failure::internal(format!("expected function, found {}", other.type_name()))),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Value)> {
        self.entries.iter().enumerate().map(|(i, v)| (i as u32, v))
    }
}

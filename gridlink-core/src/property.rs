//! Interface to the host object model.
//!
//! The connector never owns simulation objects. Local names are resolved
//! into [`Property`] handles through a [`Resolver`], and values cross the
//! boundary in textual form, serialized under the owning object's lock.
//!
//! [`ObjectStore`] is a simple in-memory object model implementing these
//! traits.
//!
//! [`Property`]: trait.Property.html
//! [`Resolver`]: trait.Resolver.html
//! [`ObjectStore`]: struct.ObjectStore.html

use std::sync::{Arc, RwLock};

use fnv::FnvHashMap;
use strsim::normalized_damerau_levenshtein;

use crate::error::{Error, Result};
use crate::var::{Value, ValueKind};

const SUGGEST_THRESHOLD: f64 = 0.4;

/// Handle to a single property of a host object.
pub trait Property: Send + Sync {
    /// Numeric identity of the owning object.
    fn object_id(&self) -> u64;
    fn object_name(&self) -> &str;
    fn name(&self) -> &str;
    /// Byte offset of the property within the owning object.
    fn offset(&self) -> usize;
    /// Declared size of the property in bytes.
    fn size(&self) -> usize;
    fn kind(&self) -> ValueKind;
    /// Serializes the current value, holding the object's read lock.
    fn read_string(&self) -> Result<String>;
    /// Parses and stores a new value, holding the object's write lock.
    fn write_string(&self, value: &str) -> Result<()>;
}

/// Resolves local names of the form `object.property`.
pub trait Resolver {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Property>>;
}

/// Converts single values between their local and wire forms.
pub trait Translator: Send + Sync {
    fn encode(&self, local: &str) -> Result<String>;
    fn decode(&self, remote: &str) -> Result<String>;
}

/// Declaration of a single property of a stored object.
#[derive(Debug, Clone)]
pub struct PropertySpec {
    pub name: String,
    pub kind: ValueKind,
    /// Declared size, defaults to the size of the kind
    pub size: Option<usize>,
    /// Initial value, defaults to the kind's default
    pub value: Option<String>,
}

impl PropertySpec {
    pub fn new(name: &str, kind: ValueKind) -> Self {
        PropertySpec {
            name: name.to_string(),
            kind,
            size: None,
            value: None,
        }
    }

    pub fn with_value(mut self, value: &str) -> Self {
        self.value = Some(value.to_string());
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }
}

struct Object {
    id: u64,
    name: String,
    values: RwLock<Vec<Value>>,
}

struct StoredProperty {
    object: Arc<Object>,
    index: usize,
    name: String,
    kind: ValueKind,
    offset: usize,
    size: usize,
}

impl Property for StoredProperty {
    fn object_id(&self) -> u64 {
        self.object.id
    }

    fn object_name(&self) -> &str {
        &self.object.name
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn offset(&self) -> usize {
        self.offset
    }

    fn size(&self) -> usize {
        self.size
    }

    fn kind(&self) -> ValueKind {
        self.kind
    }

    fn read_string(&self) -> Result<String> {
        let values = self
            .object
            .values
            .read()
            .map_err(|_| Error::Other(format!("object lock poisoned: {}", self.object.name)))?;
        Ok(values[self.index].to_string())
    }

    fn write_string(&self, value: &str) -> Result<()> {
        let parsed = Value::parse(self.kind, value)?;
        if let Value::String(s) = &parsed {
            if s.len() > self.size {
                return Err(Error::ValueTooLarge {
                    len: s.len(),
                    capacity: self.size,
                });
            }
        }
        let mut values = self
            .object
            .values
            .write()
            .map_err(|_| Error::Other(format!("object lock poisoned: {}", self.object.name)))?;
        values[self.index] = parsed;
        Ok(())
    }
}

/// In-memory object model.
///
/// Object ids are assigned sequentially starting from 1. Property offsets
/// are laid out back to back using each property's declared size.
#[derive(Default)]
pub struct ObjectStore {
    next_id: u64,
    objects: Vec<Arc<Object>>,
    properties: FnvHashMap<String, Arc<StoredProperty>>,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a new object with the given properties, returning its id.
    pub fn add_object(&mut self, name: &str, specs: Vec<PropertySpec>) -> Result<u64> {
        if name.is_empty() || name.contains('.') {
            return Err(Error::ParsingError(format!("invalid object name: {}", name)));
        }
        if self.objects.iter().any(|o| o.name == name) {
            return Err(Error::Other(format!("object already exists: {}", name)));
        }

        let keys = specs
            .iter()
            .map(|spec| format!("{}.{}", name, spec.name))
            .collect::<Vec<String>>();
        for (n, key) in keys.iter().enumerate() {
            if self.properties.contains_key(key) || keys[..n].contains(key) {
                return Err(Error::Other(format!("property declared twice: {}", key)));
            }
        }

        let mut values = Vec::with_capacity(specs.len());
        for spec in &specs {
            values.push(match &spec.value {
                Some(v) => Value::parse(spec.kind, v)?,
                None => spec.kind.default_value(),
            });
        }
        self.next_id += 1;
        let object = Arc::new(Object {
            id: self.next_id,
            name: name.to_string(),
            values: RwLock::new(values),
        });

        let mut offset = 0;
        for (index, (spec, key)) in specs.into_iter().zip(keys).enumerate() {
            let size = spec.size.unwrap_or_else(|| spec.kind.size());
            self.properties.insert(
                key,
                Arc::new(StoredProperty {
                    object: object.clone(),
                    index,
                    name: spec.name,
                    kind: spec.kind,
                    offset,
                    size,
                }),
            );
            offset += size;
        }
        trace!("added object {} (id {}) to store", name, object.id);
        self.objects.push(object);
        Ok(self.next_id)
    }

    /// Reads the textual value of `object.property`.
    pub fn get(&self, name: &str) -> Result<String> {
        self.properties
            .get(name)
            .ok_or_else(|| Error::ResolutionError(name.to_string()))?
            .read_string()
    }

    /// Stores a textual value into `object.property`.
    pub fn set(&self, name: &str, value: &str) -> Result<()> {
        self.properties
            .get(name)
            .ok_or_else(|| Error::ResolutionError(name.to_string()))?
            .write_string(value)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Finds the stored property name most similar to `name`.
    pub fn suggest(&self, name: &str) -> Option<String> {
        let mut best = None;
        let mut highest = 0f64;
        for candidate in self.properties.keys() {
            let sim = normalized_damerau_levenshtein(candidate, name);
            if sim > highest {
                highest = sim;
                best = Some(candidate);
            }
        }
        if highest > SUGGEST_THRESHOLD {
            best.cloned()
        } else {
            None
        }
    }
}

impl Resolver for ObjectStore {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Property>> {
        self.properties
            .get(name)
            .map(|p| p.clone() as Arc<dyn Property>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ObjectStore {
        let mut store = ObjectStore::new();
        store
            .add_object(
                "meter",
                vec![
                    PropertySpec::new("voltage", ValueKind::Float).with_value("120.5"),
                    PropertySpec::new("count", ValueKind::Int),
                    PropertySpec::new("label", ValueKind::String).with_size(32),
                    PropertySpec::new("power", ValueKind::Complex).with_value("1+2j"),
                ],
            )
            .unwrap();
        store
    }

    #[test]
    fn offsets_follow_declared_sizes() {
        let store = store();
        let voltage = store.resolve("meter.voltage").unwrap();
        let count = store.resolve("meter.count").unwrap();
        let label = store.resolve("meter.label").unwrap();
        let power = store.resolve("meter.power").unwrap();
        assert_eq!(voltage.offset(), 0);
        assert_eq!(count.offset(), 8);
        assert_eq!(label.offset(), 16);
        assert_eq!(label.size(), 32);
        assert_eq!(power.offset(), 48);
        assert_eq!(voltage.object_id(), power.object_id());
        assert_eq!(power.object_name(), "meter");
    }

    #[test]
    fn read_write_through_handles() {
        let store = store();
        let voltage = store.resolve("meter.voltage").unwrap();
        assert_eq!(voltage.read_string().unwrap(), "120.5");
        voltage.write_string("118").unwrap();
        assert_eq!(store.get("meter.voltage").unwrap(), "118");
        assert!(voltage.write_string("high").is_err());
        assert!(store.set("meter.label", &"x".repeat(33)).is_err());
        assert!(store.resolve("meter.missing").is_none());
    }

    #[test]
    fn duplicate_objects_rejected() {
        let mut store = store();
        assert!(store.add_object("meter", vec![]).is_err());
        assert_eq!(store.add_object("other", vec![]).unwrap(), 2);
    }

    #[test]
    fn duplicate_property_leaves_store_untouched() {
        let mut store = store();
        let specs = vec![
            PropertySpec::new("a", ValueKind::Float),
            PropertySpec::new("b", ValueKind::Int),
            PropertySpec::new("a", ValueKind::Float),
        ];
        assert!(store.add_object("pump", specs).is_err());
        assert!(store.resolve("pump.a").is_none());
        assert!(store.resolve("pump.b").is_none());
        assert_eq!(store.object_count(), 1);
        assert_eq!(
            store
                .add_object("pump", vec![PropertySpec::new("a", ValueKind::Float)])
                .unwrap(),
            2
        );
    }

    #[test]
    fn suggest_similar_names() {
        let store = store();
        assert_eq!(store.suggest("meter.voltgae"), Some("meter.voltage".to_string()));
        assert_eq!(store.suggest("zzzzzzzzzzzzzzzzzzzz"), None);
    }
}

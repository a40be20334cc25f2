//! Hashed value cache.
//!
//! Every bound (object, property, remote tag) triple owns exactly one
//! [`CacheItem`], stored in a [`CacheIndex`] owned by the connection that
//! uses it. Items are addressed by a [`CacheId`] hashed from the triple and
//! reduced modulo the current index size. When two distinct triples land on
//! the same id the index grows by a factor of 256 and every id is
//! recomputed.
//!
//! A [`Cache`] is an ordered list of items. Its order follows declaration
//! order and determines the field order of schema and data exchanges.
//!
//! [`CacheItem`]: struct.CacheItem.html
//! [`CacheIndex`]: struct.CacheIndex.html
//! [`CacheId`]: type.CacheId.html
//! [`Cache`]: struct.Cache.html

use std::hash::Hasher;
use std::sync::{Arc, Weak};

use fnv::{FnvHashMap, FnvHasher};

use crate::error::{Error, Result};
use crate::property::{Property, Translator};
use crate::varmap::VarMapEntry;

/// Capacity of a single item's value buffer, in bytes.
pub const ITEM_CAPACITY: usize = 1024;
/// Starting modulo of a fresh index.
pub const INITIAL_MODULO: u64 = 0x100;
/// Factor the index modulo is multiplied by on each growth.
pub const GROWTH_FACTOR: u64 = 0x100;
/// Default number of items a single cache list can hold.
pub const DEFAULT_CACHE_SIZE: usize = 0x100;

/// Integer handle of a cached slot.
pub type CacheId = u64;

/// Identity of a cached value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Numeric identity of the owning object
    pub object: u64,
    /// Byte offset of the property within the object
    pub offset: usize,
    /// Declared size of the property
    pub size: usize,
    pub remote: String,
}

impl CacheKey {
    pub fn for_entry(entry: &VarMapEntry) -> Result<Self> {
        let property = entry
            .property()
            .ok_or_else(|| Error::PropertyExpired(entry.local_name.clone()))?;
        Ok(CacheKey {
            object: property.object_id(),
            offset: property.offset(),
            size: property.size(),
            remote: entry.remote_name.clone(),
        })
    }
}

/// Hashes the key and reduces it modulo `modulo`.
///
/// The result depends only on the arguments.
pub fn cache_id(key: &CacheKey, modulo: u64) -> CacheId {
    let mut hasher = FnvHasher::default();
    hasher.write_u64(key.object);
    hasher.write_u64(key.offset as u64);
    hasher.write_u64(key.size as u64);
    hasher.write(key.remote.as_bytes());
    hasher.finish() % modulo
}

/// Stable reference to an item inside a `CacheIndex`.
///
/// Unlike `CacheId`s, handles don't change when the index grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemHandle(usize);

/// Outcome of reading an item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemRead {
    /// Stored value, now consumed
    Value(String),
    /// Nothing was written since the last read
    Empty,
    /// Value doesn't fit the caller's limit and was left in place
    TooSmall { needed: usize },
}

/// Single cached value.
pub struct CacheItem {
    id: CacheId,
    key: CacheKey,
    local_name: String,
    property: Option<Weak<dyn Property>>,
    value: String,
    marked: bool,
    translator: Option<Arc<dyn Translator>>,
}

impl CacheItem {
    fn new(id: CacheId, key: CacheKey, entry: &VarMapEntry) -> Self {
        CacheItem {
            id,
            key,
            local_name: entry.local_name.clone(),
            property: entry.weak_property(),
            value: String::with_capacity(ITEM_CAPACITY),
            marked: false,
            translator: None,
        }
    }

    pub fn id(&self) -> CacheId {
        self.id
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn remote_name(&self) -> &str {
        &self.key.remote
    }

    /// Current stored value, without consuming it.
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_marked(&self) -> bool {
        self.marked
    }

    pub fn unmark(&mut self) {
        self.marked = false;
    }

    pub fn set_translator(&mut self, translator: Option<Arc<dyn Translator>>) {
        self.translator = translator;
    }

    fn property(&self) -> Result<Arc<dyn Property>> {
        self.property
            .as_ref()
            .and_then(|w| w.upgrade())
            .ok_or_else(|| Error::PropertyExpired(self.local_name.clone()))
    }

    /// Stores a new value and marks the item.
    ///
    /// The value goes through `xltr`, or the item's own translator if
    /// there is one.
    pub fn write(&mut self, value: &str, xltr: Option<&dyn Translator>) -> Result<()> {
        let encoded = match xltr.or_else(|| self.translator.as_deref()) {
            Some(t) => t.encode(value)?,
            None => value.to_string(),
        };
        self.store(&encoded)
    }

    /// Stores a value that is already in wire form and marks the item.
    pub fn store(&mut self, encoded: &str) -> Result<()> {
        if encoded.len() > ITEM_CAPACITY {
            return Err(Error::ValueTooLarge {
                len: encoded.len(),
                capacity: ITEM_CAPACITY,
            });
        }
        if self.marked && !self.value.is_empty() && self.value != encoded {
            warn!(
                "cache item {}: overwriting unconsumed value '{}' with '{}'",
                self.key.remote, self.value, encoded
            );
        }
        self.value.clear();
        self.value.push_str(encoded);
        self.marked = true;
        Ok(())
    }

    /// Takes the stored value out of the item.
    ///
    /// A value is returned once; the next read without an intervening
    /// write reports `ItemRead::Empty`.
    pub fn read(&mut self, limit: usize, xltr: Option<&dyn Translator>) -> Result<ItemRead> {
        if self.value.is_empty() {
            return Ok(ItemRead::Empty);
        }
        let decoded = match xltr.or_else(|| self.translator.as_deref()) {
            Some(t) => t.decode(&self.value)?,
            None => self.value.clone(),
        };
        if decoded.len() > limit {
            return Ok(ItemRead::TooSmall {
                needed: decoded.len(),
            });
        }
        self.value.clear();
        self.marked = false;
        Ok(ItemRead::Value(decoded))
    }

    /// Seeds the slot from the bound property without marking it.
    pub fn copy_from_object(&mut self) -> Result<()> {
        let raw = self.property()?.read_string()?;
        let encoded = match &self.translator {
            Some(t) => t.encode(&raw)?,
            None => raw,
        };
        if encoded.len() > ITEM_CAPACITY {
            return Err(Error::ValueTooLarge {
                len: encoded.len(),
                capacity: ITEM_CAPACITY,
            });
        }
        self.value = encoded;
        Ok(())
    }

    /// Stores the slot's value into the bound property, leaving the slot
    /// untouched.
    pub fn copy_to_object(&self) -> Result<()> {
        if self.value.is_empty() {
            return Ok(());
        }
        let decoded = match &self.translator {
            Some(t) => t.decode(&self.value)?,
            None => self.value.clone(),
        };
        self.property()?.write_string(&decoded)
    }

    /// Describes the bound property as `<type> <object>:<property>`.
    pub fn schema_info(&self) -> Result<String> {
        let property = self.property()?;
        Ok(format!(
            "{} {}:{}",
            property.kind(),
            property.object_name(),
            property.name()
        ))
    }
}

/// Hash index of cache items, owned by a single connection.
pub struct CacheIndex {
    modulo: u64,
    slots: FnvHashMap<CacheId, ItemHandle>,
    items: Vec<CacheItem>,
    grow_count: usize,
}

impl Default for CacheIndex {
    fn default() -> Self {
        CacheIndex {
            modulo: INITIAL_MODULO,
            slots: FnvHashMap::default(),
            items: Vec::new(),
            grow_count: 0,
        }
    }
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn modulo(&self) -> u64 {
        self.modulo
    }

    /// Number of times the index was grown.
    pub fn grow_count(&self) -> usize {
        self.grow_count
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, handle: ItemHandle) -> Option<&CacheItem> {
        self.items.get(handle.0)
    }

    pub fn get_mut(&mut self, handle: ItemHandle) -> Option<&mut CacheItem> {
        self.items.get_mut(handle.0)
    }

    /// Looks up the item for the exact key.
    pub fn find(&self, key: &CacheKey) -> Option<ItemHandle> {
        let id = cache_id(key, self.modulo);
        self.slots
            .get(&id)
            .filter(|h| &self.items[h.0].key == key)
            .copied()
    }

    /// Creates a new item for the entry.
    ///
    /// Fails if an item for the same triple already exists. Collisions with
    /// other triples grow the index until the new item fits.
    pub fn create(&mut self, entry: &VarMapEntry) -> Result<ItemHandle> {
        let key = CacheKey::for_entry(entry)?;
        loop {
            let id = cache_id(&key, self.modulo);
            match self.slots.get(&id) {
                Some(h) if self.items[h.0].key == key => {
                    return Err(Error::DuplicateCacheItem {
                        local: entry.local_name.clone(),
                        remote: entry.remote_name.clone(),
                    })
                }
                Some(h) => {
                    debug!(
                        "cache index collision at id {} between {} and {}",
                        id, self.items[h.0].key.remote, key.remote
                    );
                    self.grow()?;
                }
                None => {
                    let handle = ItemHandle(self.items.len());
                    self.items.push(CacheItem::new(id, key, entry));
                    self.slots.insert(id, handle);
                    return Ok(handle);
                }
            }
        }
    }

    pub fn get_or_create(&mut self, entry: &VarMapEntry) -> Result<ItemHandle> {
        match self.find(&CacheKey::for_entry(entry)?) {
            Some(handle) => Ok(handle),
            None => self.create(entry),
        }
    }

    /// Multiplies the modulo and rehashes every item.
    ///
    /// A collision during the rehash moves on to the next size, so the
    /// index is never left with two items sharing a slot.
    fn grow(&mut self) -> Result<()> {
        let mut modulo = self.modulo;
        'sizes: loop {
            modulo = modulo
                .checked_mul(GROWTH_FACTOR)
                .ok_or(Error::CacheIndexExhausted(modulo))?;
            let mut slots = FnvHashMap::default();
            for (n, item) in self.items.iter().enumerate() {
                if slots
                    .insert(cache_id(&item.key, modulo), ItemHandle(n))
                    .is_some()
                {
                    debug!("cache index collision during regrowth to {}", modulo);
                    continue 'sizes;
                }
            }
            for item in &mut self.items {
                item.id = cache_id(&item.key, modulo);
            }
            debug!(
                "cache index grown from {} to {} ({} items)",
                self.modulo,
                modulo,
                self.items.len()
            );
            self.modulo = modulo;
            self.slots = slots;
            self.grow_count += 1;
            return Ok(());
        }
    }
}

/// Single row of a cache dump.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DumpRow {
    pub id: CacheId,
    pub local: String,
    pub remote: String,
    pub value: String,
    pub marked: bool,
}

/// Ordered list of cache items.
pub struct Cache {
    name: String,
    items: Vec<ItemHandle>,
    size: usize,
}

impl Cache {
    pub fn new(name: &str) -> Self {
        Cache {
            name: name.to_string(),
            items: Vec::new(),
            size: DEFAULT_CACHE_SIZE,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Maximum number of items in the list.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn handles(&self) -> &[ItemHandle] {
        &self.items
    }

    /// Gets or creates the item for the entry, appends it to the list and
    /// seeds it from the bound object.
    pub fn add_item(
        &mut self,
        index: &mut CacheIndex,
        entry: &VarMapEntry,
        translator: Option<Arc<dyn Translator>>,
    ) -> Result<ItemHandle> {
        let handle = index.get_or_create(entry)?;
        if self.items.contains(&handle) {
            return Ok(handle);
        }
        if self.items.len() >= self.size {
            return Err(Error::CacheFull {
                name: self.name.clone(),
                size: self.size,
            });
        }
        self.items.push(handle);
        if let Some(item) = index.get_mut(handle) {
            if translator.is_some() {
                item.set_translator(translator);
            }
            item.copy_from_object()?;
        }
        Ok(handle)
    }

    /// Finds a listed item by local and remote name.
    pub fn find_item(&self, index: &CacheIndex, local: &str, remote: &str) -> Option<ItemHandle> {
        self.items.iter().copied().find(|h| {
            index
                .get(*h)
                .map(|item| item.local_name == local && item.key.remote == remote)
                .unwrap_or(false)
        })
    }

    fn item_for(&mut self, index: &mut CacheIndex, entry: &VarMapEntry) -> Result<ItemHandle> {
        match self.find_item(index, &entry.local_name, &entry.remote_name) {
            Some(handle) => Ok(handle),
            None => self.add_item(index, entry, None),
        }
    }

    /// Copies the entry's current local value into its item.
    ///
    /// Returns true if the value counted as changed and was stored.
    pub fn write(
        &mut self,
        index: &mut CacheIndex,
        entry: &mut VarMapEntry,
        xltr: Option<&dyn Translator>,
    ) -> Result<bool> {
        if entry.is_inert() {
            return Ok(false);
        }
        let handle = self.item_for(index, entry)?;
        let value = entry.read_value()?;
        if !entry.has_changed(&value) {
            return Ok(false);
        }
        match index.get_mut(handle) {
            Some(item) => item.write(&value, xltr)?,
            None => return Ok(false),
        }
        Ok(true)
    }

    /// Moves the entry's received value into the bound object.
    ///
    /// Returns false if there was no new value.
    pub fn read(
        &mut self,
        index: &mut CacheIndex,
        entry: &VarMapEntry,
        xltr: Option<&dyn Translator>,
    ) -> Result<bool> {
        let property = match entry.property() {
            Some(p) => p,
            None => return Ok(false),
        };
        let handle = self.item_for(index, entry)?;
        let item = match index.get_mut(handle) {
            Some(item) => item,
            None => return Ok(false),
        };
        match item.read(ITEM_CAPACITY, xltr)? {
            ItemRead::Value(value) => {
                property.write_string(&value)?;
                Ok(true)
            }
            ItemRead::Empty => Ok(false),
            ItemRead::TooSmall { needed } => {
                warn!(
                    "cache {}: value for {} needs {} bytes, skipping",
                    self.name, entry.remote_name, needed
                );
                Ok(false)
            }
        }
    }

    /// Lists the cache contents, logging them as a table at debug level.
    pub fn dump(&self, index: &CacheIndex) -> Vec<DumpRow> {
        debug!("{} dump:", self.name);
        debug!("ID       LOCAL/REMOTE                     VALUE");
        debug!("-------- -------------------------------- --------------------------------");
        let mut rows = Vec::new();
        for item in self.items.iter().filter_map(|h| index.get(*h)) {
            let row = DumpRow {
                id: item.id,
                local: item.local_name.clone(),
                remote: item.key.remote.clone(),
                value: item.value.clone(),
                marked: item.marked,
            };
            debug!(
                "{:8} {:32} {}{}",
                row.id,
                format!("{}/{}", row.local, row.remote),
                row.value,
                if row.marked { " *" } else { "" }
            );
            rows.push(row);
        }
        rows
    }

    /// Applies a cache command, currently only `size N`.
    pub fn option(&mut self, command: &str) -> Result<()> {
        let command = command.replace('=', " ");
        let mut split = command.split_whitespace();
        match (split.next(), split.next(), split.next()) {
            (Some("size"), Some(n), None) => {
                self.set_size(n.parse()?);
                Ok(())
            }
            _ => Err(Error::ParsingError(format!(
                "invalid {} command: {}",
                self.name, command
            ))),
        }
    }

    /// Grows the list capacity. Shrinking is ignored.
    pub fn set_size(&mut self, size: usize) {
        if size > self.size {
            self.items.reserve(size - self.items.len());
            self.size = size;
        } else {
            warn!("{}: invalid size {} is ignored", self.name, size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{ObjectStore, PropertySpec, Resolver};
    use crate::var::ValueKind;
    use crate::varmap::{CommunicationType, VarMap};

    fn store() -> ObjectStore {
        let mut store = ObjectStore::new();
        store
            .add_object(
                "node",
                vec![
                    PropertySpec::new("v", ValueKind::Float).with_value("3.14"),
                    PropertySpec::new("name", ValueKind::String).with_value("feeder"),
                ],
            )
            .unwrap();
        store
    }

    fn entry(store: &ObjectStore, spec: &str) -> VarMapEntry {
        let mut e = VarMapEntry::parse(spec, CommunicationType::Unknown).unwrap();
        e.bind(&store.resolve(&e.local_name).unwrap());
        e
    }

    struct Brackets;

    impl Translator for Brackets {
        fn encode(&self, local: &str) -> Result<String> {
            Ok(format!("[{}]", local))
        }
        fn decode(&self, remote: &str) -> Result<String> {
            Ok(remote.trim_start_matches('[').trim_end_matches(']').to_string())
        }
    }

    #[test]
    fn cache_id_is_deterministic() {
        let key = CacheKey {
            object: 7,
            offset: 16,
            size: 8,
            remote: "bus.v".to_string(),
        };
        assert_eq!(cache_id(&key, 256), cache_id(&key.clone(), 256));
        assert!(cache_id(&key, 256) < 256);
        assert_eq!(cache_id(&key, 65536) % 256, cache_id(&key, 256));
        let other = CacheKey {
            remote: "bus.w".to_string(),
            ..key.clone()
        };
        assert_ne!(cache_id(&key, u64::MAX), cache_id(&other, u64::MAX));
    }

    #[test]
    fn read_consumes_value_once() {
        let store = store();
        let mut index = CacheIndex::new();
        let handle = index.create(&entry(&store, "node.name -> r.name")).unwrap();
        let item = index.get_mut(handle).unwrap();

        let value = "  spaced \"quoted\" value\t";
        item.write(value, None).unwrap();
        assert!(item.is_marked());
        assert_eq!(item.read(ITEM_CAPACITY, None).unwrap(), ItemRead::Value(value.to_string()));
        assert!(!item.is_marked());
        assert_eq!(item.read(ITEM_CAPACITY, None).unwrap(), ItemRead::Empty);
    }

    #[test]
    fn read_with_small_limit_keeps_value() {
        let store = store();
        let mut index = CacheIndex::new();
        let handle = index.create(&entry(&store, "node.v -> r.v")).unwrap();
        let item = index.get_mut(handle).unwrap();
        item.write("123.456", None).unwrap();
        assert_eq!(item.read(3, None).unwrap(), ItemRead::TooSmall { needed: 7 });
        assert_eq!(item.read(7, None).unwrap(), ItemRead::Value("123.456".to_string()));
    }

    #[test]
    fn oversized_writes_fail() {
        let store = store();
        let mut index = CacheIndex::new();
        let handle = index.create(&entry(&store, "node.v -> r.v")).unwrap();
        let item = index.get_mut(handle).unwrap();
        assert!(item.write(&"9".repeat(ITEM_CAPACITY + 1), None).is_err());
        assert!(item.write(&"9".repeat(ITEM_CAPACITY), None).is_ok());
    }

    #[test]
    fn duplicate_creation_fails() {
        let store = store();
        let mut index = CacheIndex::new();
        let e = entry(&store, "node.v -> r.v");
        let first = index.create(&e).unwrap();
        match index.create(&e) {
            Err(Error::DuplicateCacheItem { .. }) => (),
            _ => panic!("expected duplicate creation error"),
        }
        assert_eq!(index.get_or_create(&e).unwrap(), first);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn collisions_grow_the_index() {
        let store = store();
        let property = store.resolve("node.v").unwrap();
        let key = |remote: &str| CacheKey {
            object: property.object_id(),
            offset: property.offset(),
            size: property.size(),
            remote: remote.to_string(),
        };

        // find two remote names colliding at the second index size
        let mut seen: FnvHashMap<CacheId, String> = FnvHashMap::default();
        let mut pair = None;
        for n in 0..100_000 {
            let remote = format!("r{}", n);
            let id = cache_id(&key(&remote), INITIAL_MODULO * GROWTH_FACTOR);
            if let Some(first) = seen.insert(id, remote.clone()) {
                pair = Some((first, remote));
                break;
            }
        }
        let (a, b) = pair.expect("no colliding remote names found");

        let mut map = VarMap::new();
        for name in &["f0", "f1", "f2", "f3", a.as_str(), b.as_str()] {
            map.add(&format!("node.v -> {}", name), CommunicationType::Unknown)
                .unwrap();
        }
        map.resolve(&store);

        let mut index = CacheIndex::new();
        let mut cache = Cache::new("write_cache");
        let mut inserted: Vec<&VarMapEntry> = Vec::new();
        for e in map.iter() {
            cache.add_item(&mut index, e, None).unwrap();
            inserted.push(e);
            for prev in &inserted {
                let h = cache
                    .find_item(&index, &prev.local_name, &prev.remote_name)
                    .unwrap();
                assert_eq!(index.get(h).unwrap().remote_name(), prev.remote_name);
            }
        }

        assert!(index.grow_count() >= 2);
        assert!(index.modulo() >= INITIAL_MODULO * GROWTH_FACTOR * GROWTH_FACTOR);
        let id_a = index.find(&key(&a)).map(|h| index.get(h).unwrap().id());
        let id_b = index.find(&key(&b)).map(|h| index.get(h).unwrap().id());
        assert!(id_a.is_some() && id_b.is_some());
        assert_ne!(id_a, id_b);
        assert_eq!(index.len(), 6);
    }

    #[test]
    fn cache_write_and_read_through_objects() {
        let store = store();
        let mut map = VarMap::new();
        map.add("node.v -> r.v", CommunicationType::Unknown).unwrap();
        map.add("node.name <- r.name", CommunicationType::Unknown).unwrap();
        map.resolve(&store);

        let mut index = CacheIndex::new();
        let mut write_cache = Cache::new("write_cache");
        let mut read_cache = Cache::new("read_cache");

        let mut entries = map.iter_mut();
        let out = entries.next().unwrap();
        assert!(write_cache.write(&mut index, out, Some(&Brackets)).unwrap());
        let h = write_cache.find_item(&index, "node.v", "r.v").unwrap();
        assert_eq!(index.get(h).unwrap().value(), "[3.14]");

        let input = entries.next().unwrap();
        let h = read_cache.add_item(&mut index, input, None).unwrap();
        index.get_mut(h).unwrap().write("[substation]", None).unwrap();
        assert!(read_cache.read(&mut index, input, Some(&Brackets)).unwrap());
        assert_eq!(store.get("node.name").unwrap(), "substation");
        assert!(!read_cache.read(&mut index, input, Some(&Brackets)).unwrap());
    }

    #[test]
    fn size_option_only_grows() {
        let store = store();
        let mut index = CacheIndex::new();
        let mut cache = Cache::new("read_cache");
        cache.option("size 1").unwrap();
        assert_eq!(cache.size(), DEFAULT_CACHE_SIZE);
        cache.option("size 512").unwrap();
        assert_eq!(cache.size(), 512);
        assert!(cache.option("length 3").is_err());
        assert!(cache.option("size").is_err());

        let mut small = Cache {
            name: "tiny".to_string(),
            items: Vec::new(),
            size: 1,
        };
        small.add_item(&mut index, &entry(&store, "node.v <- a"), None).unwrap();
        assert!(small.add_item(&mut index, &entry(&store, "node.v <- b"), None).is_err());
    }

    #[test]
    fn dump_lists_items_in_order() {
        let store = store();
        let mut index = CacheIndex::new();
        let mut cache = Cache::new("write_cache");
        cache.add_item(&mut index, &entry(&store, "node.v -> r.v"), None).unwrap();
        cache.add_item(&mut index, &entry(&store, "node.name -> r.name"), None).unwrap();
        let rows = cache.dump(&index);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].remote, "r.v");
        assert_eq!(rows[0].value, "3.14");
        assert!(!rows[0].marked);
        assert_eq!(rows[1].local, "node.name");
        assert_eq!(rows[1].value, "feeder");
    }
}

//! Variable mapping between local properties and remote tags.
//!
//! A binding is declared with a short specification string:
//!
//! ```text
//! LOCAL -> REMOTE            local value is written to the remote tag
//! LOCAL <- REMOTE            remote tag is read into the local value
//! LOCAL -> REMOTE; 0.5       written only when it moved by more than 0.5
//! ```
//!
//! Whitespace around the arrow and the threshold separator is optional.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};

use crate::error::{Error, Result};
use crate::property::{Property, Resolver};
use crate::var::Value;
use crate::Float;

pub const WRITE_ARROW: &str = "->";
pub const READ_ARROW: &str = "<-";
pub const THRESHOLD_SEPARATOR: char = ';';

/// Direction of data exchange for a single binding.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Direction {
    /// Remote value is read into the local property
    Read,
    /// Local property is written out to the remote tag
    Write,
    /// Name is explicitly allowed to be exchanged
    Allow,
    /// Name is never exchanged
    Forbid,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => write!(f, "read"),
            Direction::Write => write!(f, "write"),
            Direction::Allow => write!(f, "allow"),
            Direction::Forbid => write!(f, "forbid"),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum CommunicationType {
    Unknown,
    PubSub,
    Route,
}

impl Default for CommunicationType {
    fn default() -> Self {
        CommunicationType::Unknown
    }
}

impl FromStr for CommunicationType {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "" | "unknown" => Ok(CommunicationType::Unknown),
            "pubsub" | "publish" | "subscribe" => Ok(CommunicationType::PubSub),
            "route" => Ok(CommunicationType::Route),
            _ => Err(Error::ParsingError(format!(
                "failed parsing communication type from string: {}",
                s
            ))),
        }
    }
}

/// Exchange phases of a simulation step, in the order they run.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Phase {
    Allow,
    Forbid,
    Init,
    Precommit,
    Presync,
    Sync,
    Postsync,
    Commit,
    Prenotify,
    Postnotify,
    Finalize,
    Plc,
    Term,
}

impl Phase {
    pub const ALL: [Phase; 13] = [
        Phase::Allow,
        Phase::Forbid,
        Phase::Init,
        Phase::Precommit,
        Phase::Presync,
        Phase::Sync,
        Phase::Postsync,
        Phase::Commit,
        Phase::Prenotify,
        Phase::Postnotify,
        Phase::Finalize,
        Phase::Plc,
        Phase::Term,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Allow => "allow",
            Phase::Forbid => "forbid",
            Phase::Init => "init",
            Phase::Precommit => "precommit",
            Phase::Presync => "presync",
            Phase::Sync => "sync",
            Phase::Postsync => "postsync",
            Phase::Commit => "commit",
            Phase::Prenotify => "prenotify",
            Phase::Postnotify => "postnotify",
            Phase::Finalize => "finalize",
            Phase::Plc => "plc",
            Phase::Term => "term",
        }
    }

    /// Allow and forbid lists filter bindings but are never exchanged.
    pub fn is_exchanged(&self) -> bool {
        !matches!(self, Phase::Allow | Phase::Forbid)
    }

    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Phase {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Phase::ALL
            .iter()
            .find(|p| p.as_str() == s.trim().to_lowercase())
            .copied()
            .ok_or_else(|| Error::ParsingError(format!("unknown phase: {}", s)))
    }
}

/// Single configured binding between a local property and a remote tag.
#[derive(Debug, Clone)]
pub struct VarMapEntry {
    pub local_name: String,
    pub remote_name: String,
    pub direction: Direction,
    pub communication_type: CommunicationType,
    /// Minimum change required before a written value counts as changed
    pub threshold: Option<Float>,
    last_value: Option<Value>,
    property: Option<Weak<dyn Property>>,
}

impl VarMapEntry {
    /// Parses a binding specification.
    pub fn parse(spec: &str, communication_type: CommunicationType) -> Result<Self> {
        let invalid = |what: &str| Error::ParsingError(format!("{}: '{}'", what, spec));

        let (binding, threshold) = match spec.find(THRESHOLD_SEPARATOR) {
            Some(i) => {
                let t = spec[i + 1..].trim();
                let t = t
                    .parse::<Float>()
                    .map_err(|_| invalid("invalid threshold"))?;
                if !t.is_finite() || t < 0. {
                    return Err(invalid("threshold must be a non-negative number"));
                }
                (&spec[..i], Some(t))
            }
            None => (spec, None),
        };

        let (local, direction, remote) = if let Some(i) = binding.find(WRITE_ARROW) {
            (&binding[..i], Direction::Write, &binding[i + WRITE_ARROW.len()..])
        } else if let Some(i) = binding.find(READ_ARROW) {
            (&binding[..i], Direction::Read, &binding[i + READ_ARROW.len()..])
        } else {
            return Err(invalid("missing direction arrow"));
        };

        let local = local.trim();
        let remote = remote.trim();
        for name in &[local, remote] {
            if name.is_empty()
                || name.contains(char::is_whitespace)
                || name.contains(WRITE_ARROW)
                || name.contains(READ_ARROW)
            {
                return Err(invalid("invalid variable name"));
            }
        }

        Ok(VarMapEntry {
            local_name: local.to_string(),
            remote_name: remote.to_string(),
            direction,
            communication_type,
            threshold,
            last_value: None,
            property: None,
        })
    }

    /// Creates an allow or forbid rule for the given name.
    pub fn rule(name: &str, direction: Direction) -> Self {
        let name = name.trim();
        VarMapEntry {
            local_name: name.to_string(),
            remote_name: name.to_string(),
            direction,
            communication_type: CommunicationType::Unknown,
            threshold: None,
            last_value: None,
            property: None,
        }
    }

    /// Returns the bound property, if resolved and still alive.
    pub fn property(&self) -> Option<Arc<dyn Property>> {
        self.property.as_ref().and_then(|w| w.upgrade())
    }

    pub fn bind(&mut self, property: &Arc<dyn Property>) {
        self.property = Some(Arc::downgrade(property));
    }

    pub(crate) fn weak_property(&self) -> Option<Weak<dyn Property>> {
        self.property.clone()
    }

    /// Inert entries have no live property and are skipped on exchange.
    pub fn is_inert(&self) -> bool {
        self.property().is_none()
    }

    /// Reads the current value of the bound property.
    pub fn read_value(&self) -> Result<String> {
        self.property()
            .ok_or_else(|| Error::PropertyExpired(self.local_name.clone()))?
            .read_string()
    }

    /// Decides whether `value` should be published.
    ///
    /// Without a threshold any non-empty value counts as changed. With a
    /// threshold the value has to move by strictly more than the threshold
    /// since the last published value. The last value is only updated when
    /// a change is reported.
    pub fn has_changed(&mut self, value: &str) -> bool {
        let threshold = match self.threshold {
            Some(t) => t,
            None => return !value.is_empty(),
        };
        let kind = match self.property() {
            Some(p) => p.kind(),
            None => return false,
        };
        let new = match Value::parse(kind, value) {
            Ok(v) => v,
            Err(e) => {
                warn!("{}: can't compare against threshold: {}", self.local_name, e);
                return true;
            }
        };
        let changed = match &self.last_value {
            None => true,
            Some(last) => match new.distance(last) {
                Some(d) => d > threshold,
                None => &new != last,
            },
        };
        if changed {
            self.last_value = Some(new);
        }
        changed
    }
}

impl PartialEq for VarMapEntry {
    /// Entries are structurally equal when their declarations are.
    fn eq(&self, other: &Self) -> bool {
        self.local_name == other.local_name
            && self.remote_name == other.remote_name
            && self.direction == other.direction
            && self.communication_type == other.communication_type
            && self.threshold == other.threshold
    }
}

/// Something able to materialize cache items for map entries.
pub trait LinkTarget {
    /// Creates or reuses a cache item for the entry. Returns false if the
    /// entry's direction isn't cached.
    fn link_entry(&mut self, entry: &VarMapEntry) -> Result<bool>;
}

/// Collection of bindings for a single exchange category.
#[derive(Debug, Clone, Default)]
pub struct VarMap {
    entries: Vec<VarMapEntry>,
}

impl VarMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and adds a new binding.
    pub fn add(&mut self, spec: &str, communication_type: CommunicationType) -> Result<()> {
        let entry = VarMapEntry::parse(spec, communication_type)?;
        debug!(
            "varmap: {} {} {}{}",
            entry.local_name,
            entry.direction,
            entry.remote_name,
            entry
                .threshold
                .map(|t| format!(" (threshold {})", t))
                .unwrap_or_default()
        );
        self.entries.push(entry);
        Ok(())
    }

    pub fn add_rule(&mut self, name: &str, direction: Direction) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::ParsingError("empty rule name".to_string()));
        }
        self.entries.push(VarMapEntry::rule(name, direction));
        Ok(())
    }

    /// Binds every read and write entry to the host object model.
    ///
    /// Unresolvable names are logged and the entry becomes inert. Returns
    /// the number of entries resolved.
    pub fn resolve(&mut self, resolver: &dyn Resolver) -> usize {
        let mut resolved = 0;
        for entry in &mut self.entries {
            if !matches!(entry.direction, Direction::Read | Direction::Write) {
                continue;
            }
            match resolver.resolve(&entry.local_name) {
                Some(property) => {
                    entry.bind(&property);
                    resolved += 1;
                }
                None => {
                    let e = Error::ResolutionError(entry.local_name.clone());
                    warn!("varmap: {}, entry will be ignored", e);
                }
            }
        }
        resolved
    }

    /// Asks the target to materialize cache items for all live entries.
    pub fn link_cache(&self, target: &mut dyn LinkTarget) -> Result<usize> {
        let mut linked = 0;
        for entry in self.entries.iter().filter(|e| !e.is_inert()) {
            if target.link_entry(entry)? {
                linked += 1;
            }
        }
        Ok(linked)
    }

    /// Checks whether the name appears in this map, on either side.
    pub fn mentions(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.local_name == name || e.remote_name == name)
    }

    pub fn iter(&self) -> std::slice::Iter<VarMapEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<VarMapEntry> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{ObjectStore, PropertySpec};
    use crate::var::ValueKind;

    #[test]
    fn grammar_forms_are_equivalent() {
        let ctype = CommunicationType::Unknown;
        let spaced = VarMapEntry::parse("A -> B", ctype).unwrap();
        let tight = VarMapEntry::parse("A->B", ctype).unwrap();
        assert_eq!(spaced, tight);
        assert_eq!(spaced.direction, Direction::Write);
        assert_eq!(spaced.threshold, None);

        let spaced = VarMapEntry::parse("A <- B; 0.5", ctype).unwrap();
        let tight = VarMapEntry::parse("A<-B;0.5", ctype).unwrap();
        assert_eq!(spaced, tight);
        assert_eq!(tight.local_name, "A");
        assert_eq!(tight.remote_name, "B");
        assert_eq!(tight.direction, Direction::Read);
        assert_eq!(tight.threshold, Some(0.5));
    }

    #[test]
    fn malformed_specs_are_rejected() {
        let mut map = VarMap::new();
        for spec in &["A B", "-> B", "A ->", "A -> B; fast", "A -> B C", "A <- B -> C", ""] {
            assert!(map.add(spec, CommunicationType::Unknown).is_err(), "{}", spec);
        }
        assert!(map.is_empty());
    }

    #[test]
    fn unresolved_entries_are_inert() {
        let mut store = ObjectStore::new();
        store
            .add_object("a", vec![PropertySpec::new("x", ValueKind::Float)])
            .unwrap();
        let mut map = VarMap::new();
        map.add("a.x -> r.x", CommunicationType::Unknown).unwrap();
        map.add("a.missing <- r.y", CommunicationType::Unknown).unwrap();
        assert_eq!(map.resolve(&store), 1);
        let inert = map.iter().filter(|e| e.is_inert()).count();
        assert_eq!(inert, 1);
        assert!(map.iter().nth(1).unwrap().read_value().is_err());
    }

    #[test]
    fn threshold_controls_change_reports() {
        let mut store = ObjectStore::new();
        store
            .add_object("a", vec![PropertySpec::new("x", ValueKind::Float)])
            .unwrap();
        let mut map = VarMap::new();
        map.add("a.x -> r.x; 0.5", CommunicationType::PubSub).unwrap();
        map.add("a.x -> r.z", CommunicationType::PubSub).unwrap();
        map.resolve(&store);

        let mut entries = map.iter_mut();
        let with = entries.next().unwrap();
        assert!(with.has_changed("1.0"));
        assert!(!with.has_changed("1.4"));
        assert!(!with.has_changed("1.5"));
        assert!(with.has_changed("1.6"));
        assert!(!with.has_changed("1.2"));

        let without = entries.next().unwrap();
        assert!(without.has_changed("1.0"));
        assert!(without.has_changed("1.0"));
        assert!(!without.has_changed(""));
    }

    #[test]
    fn phase_names() {
        assert_eq!("Sync".parse::<Phase>().unwrap(), Phase::Sync);
        assert!("lunch".parse::<Phase>().is_err());
        assert!(!Phase::Forbid.is_exchanged());
        assert_eq!(Phase::Term.index(), 12);
    }
}

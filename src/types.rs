//! Core types for the instance store.
//!
//! Instance identity arrives from the CIM object-path model as a class name
//! plus key-property bindings. [`KeyCodec`] folds that identity into an
//! [`InstanceKey`], a canonical string that compares equal exactly when the
//! two paths name the same instance.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical, comparable identity of one stored instance.
///
/// The index and data files treat the key as an opaque value; only equality
/// and the raw bytes matter to them.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceKey(String);

impl InstanceKey {
    /// Wrap an already-canonical key string.
    pub fn new(key: impl Into<String>) -> Self {
        InstanceKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Rebuild a key from bytes read off disk.
    pub(crate) fn from_utf8(bytes: Vec<u8>) -> Result<Self> {
        String::from_utf8(bytes)
            .map(InstanceKey)
            .map_err(|e| StoreError::Corruption(format!("Index key is not UTF-8: {}", e)))
    }
}

impl fmt::Debug for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceKey({:?})", self.0)
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceKey {
    fn from(s: &str) -> Self {
        InstanceKey(s.to_string())
    }
}

impl From<String> for InstanceKey {
    fn from(s: String) -> Self {
        InstanceKey(s)
    }
}

/// One key-property binding of an object path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBinding {
    pub name: String,
    pub value: String,
}

impl KeyBinding {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Instance name: class plus key bindings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectPath {
    pub class_name: String,
    pub bindings: Vec<KeyBinding>,
}

impl ObjectPath {
    /// Path with no key bindings (singleton class).
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            bindings: Vec::new(),
        }
    }

    /// Add a key binding.
    pub fn with_binding(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.bindings.push(KeyBinding::new(name, value));
        self
    }

    /// Canonical key for this path.
    pub fn key(&self) -> Result<InstanceKey> {
        KeyCodec::encode(self)
    }
}

/// Converts object paths to and from canonical instance keys.
///
/// Canonical form: `class.name1="v1",name2="v2"`. Class and property names
/// are case-insensitive in CIM, so both are lowercased; bindings are sorted
/// by name; `\`, `"`, newline and carriage return inside values are escaped.
pub struct KeyCodec;

impl KeyCodec {
    /// Canonicalize an object path.
    pub fn encode(path: &ObjectPath) -> Result<InstanceKey> {
        let class = path.class_name.trim();
        if !is_cim_name(class) {
            return Err(StoreError::InvalidKey(format!(
                "Invalid class name: {:?}",
                path.class_name
            )));
        }

        let mut bindings = Vec::with_capacity(path.bindings.len());
        for binding in &path.bindings {
            let name = binding.name.trim();
            if !is_cim_name(name) {
                return Err(StoreError::InvalidKey(format!(
                    "Invalid key property name: {:?}",
                    binding.name
                )));
            }
            bindings.push((name.to_ascii_lowercase(), binding.value.as_str()));
        }
        bindings.sort_by(|a, b| a.0.cmp(&b.0));

        if let Some(pair) = bindings.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(StoreError::InvalidKey(format!(
                "Duplicate key property: {}",
                pair[0].0
            )));
        }

        let mut out = class.to_ascii_lowercase();
        for (i, (name, value)) in bindings.iter().enumerate() {
            out.push(if i == 0 { '.' } else { ',' });
            out.push_str(name);
            out.push_str("=\"");
            escape_into(&mut out, value);
            out.push('"');
        }

        Ok(InstanceKey(out))
    }

    /// Parse a canonical key back into an object path.
    pub fn decode(key: &InstanceKey) -> Result<ObjectPath> {
        let s = key.as_str();
        let (class, rest) = match s.find('.') {
            Some(i) => (&s[..i], Some(&s[i + 1..])),
            None => (s, None),
        };

        if !is_cim_name(class) {
            return Err(StoreError::InvalidKey(format!("Invalid class name in key: {}", s)));
        }

        let bindings = match rest {
            Some(rest) => parse_bindings(rest).map_err(|reason| {
                StoreError::InvalidKey(format!("{} in key {}", reason, s))
            })?,
            None => Vec::new(),
        };

        Ok(ObjectPath {
            class_name: class.to_string(),
            bindings,
        })
    }
}

fn is_cim_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_')
}

fn escape_into(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
}

fn parse_bindings(input: &str) -> std::result::Result<Vec<KeyBinding>, String> {
    let mut bindings = Vec::new();
    let mut chars = input.chars();

    loop {
        let mut name = String::new();
        loop {
            match chars.next() {
                Some('=') => break,
                Some(c) => name.push(c),
                None => return Err("missing '=' after property name".into()),
            }
        }
        if !is_cim_name(&name) {
            return Err(format!("invalid property name {:?}", name));
        }

        if chars.next() != Some('"') {
            return Err("expected opening quote".into());
        }

        let mut value = String::new();
        loop {
            match chars.next() {
                Some('\\') => match chars.next() {
                    Some('n') => value.push('\n'),
                    Some('r') => value.push('\r'),
                    Some('"') => value.push('"'),
                    Some('\\') => value.push('\\'),
                    other => return Err(format!("bad escape sequence {:?}", other)),
                },
                Some('"') => break,
                Some(c) => value.push(c),
                None => return Err("unterminated value".into()),
            }
        }

        bindings.push(KeyBinding { name, value });

        match chars.next() {
            Some(',') => continue,
            None => break,
            Some(c) => return Err(format!("unexpected character {:?}", c)),
        }
    }

    Ok(bindings)
}

/// One index-file record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: InstanceKey,
    pub offset: u64,
    pub size: u64,
    pub live: bool,
}

impl IndexEntry {
    /// Exclusive end of the data range, saturating at `u64::MAX` so a
    /// corrupt range still fails bounds checks.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }
}

/// Result of enumerating an index file: parallel sequences in file order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryList {
    pub live_flags: Vec<bool>,
    pub offsets: Vec<u64>,
    pub sizes: Vec<u64>,
    pub keys: Vec<InstanceKey>,
}

impl EntryList {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            live_flags: Vec::with_capacity(capacity),
            offsets: Vec::with_capacity(capacity),
            sizes: Vec::with_capacity(capacity),
            keys: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, entry: &IndexEntry) {
        self.live_flags.push(entry.live);
        self.offsets.push(entry.offset);
        self.sizes.push(entry.size);
        self.keys.push(entry.key.clone());
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Entry at position `i` in file order.
    pub fn get(&self, i: usize) -> Option<IndexEntry> {
        Some(IndexEntry {
            key: self.keys.get(i)?.clone(),
            offset: self.offsets[i],
            size: self.sizes[i],
            live: self.live_flags[i],
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = IndexEntry> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    /// Number of entries marked free.
    pub fn free_count(&self) -> usize {
        self.live_flags.iter().filter(|live| !**live).count()
    }
}

impl<'a> FromIterator<&'a IndexEntry> for EntryList {
    fn from_iter<I: IntoIterator<Item = &'a IndexEntry>>(iter: I) -> Self {
        let mut list = EntryList::default();
        for entry in iter {
            list.push(entry);
        }
        list
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub live_entries: u64,
    pub free_entries: u64,
    pub data_bytes: u64,
    pub live_bytes: u64,
    pub orphaned_bytes: u64,
}

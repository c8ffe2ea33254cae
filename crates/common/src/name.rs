//! Bidirectional mapping between secret names and directory entry names
//!
//! Most secret names are usable as-is. Names that cannot appear as a single
//! directory entry, or that would shadow one of the filesystem's own
//! entries, are rewritten and suffixed with a short hash of the raw
//! name so that distinct secrets never share an entry.

use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};

use sha2::{Digest, Sha256};

/// Entries the filesystem itself places at the root
pub const RESERVED_NAMES: &[&str] = &[
    ".",
    "..",
    ".version",
    ".running",
    ".clear_cache",
    ".json",
    ".pprof",
];

/// Longest entry name most filesystems accept
pub const NAME_MAX: usize = 255;

/// Separator between the rewritten name and its hash suffix
const HASH_SEPARATOR: &str = "..";

/// Hash lengths tried in order when disambiguating
const HASH_LENGTHS: [usize; 3] = [8, 16, 64];

/// Whether a raw secret name must be rewritten to be used as an entry name
pub fn needs_sanitizing(raw: &str) -> bool {
    raw.is_empty()
        || raw.len() > NAME_MAX
        || RESERVED_NAMES.contains(&raw)
        || raw.contains(|c| c == '/' || c == '\0')
}

/// Raw name ↔ entry name table, rebuilt from every secret listing
#[derive(Debug, Clone, Default)]
pub struct NameTable {
    to_entry: HashMap<String, String>,
    to_raw: HashMap<String, String>,
}

impl NameTable {
    /// Build the table for a set of raw names.
    ///
    /// The result only depends on the set of names, not on their order.
    pub fn build<'a, I>(names: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let names: BTreeSet<&str> = names.into_iter().collect();
        let mut table = Self::default();

        // names that are valid as-is claim their entry first
        for raw in names.iter().filter(|raw| !needs_sanitizing(raw)) {
            table.insert(raw, raw.to_string());
        }

        for raw in names.iter().filter(|raw| needs_sanitizing(raw)) {
            let entry = HASH_LENGTHS
                .iter()
                .map(|len| disambiguated(raw, *len))
                .find(|candidate| !table.to_raw.contains_key(candidate))
                .unwrap_or_else(|| disambiguated(raw, 64));
            tracing::debug!(raw = %raw.escape_debug(), %entry, "secret name rewritten");
            table.insert(raw, entry);
        }

        table
    }

    fn insert(&mut self, raw: &str, entry: String) {
        self.to_raw.insert(entry.clone(), raw.to_string());
        self.to_entry.insert(raw.to_string(), entry);
    }

    /// Directory entry name for a raw secret name
    pub fn entry_name<'a>(&'a self, raw: &'a str) -> Cow<'a, str> {
        match self.to_entry.get(raw) {
            Some(entry) => Cow::Borrowed(entry.as_str()),
            None if needs_sanitizing(raw) => Cow::Owned(disambiguated(raw, HASH_LENGTHS[0])),
            None => Cow::Borrowed(raw),
        }
    }

    /// Raw secret name for a directory entry name.
    ///
    /// Entries unknown to the table map to themselves so that secrets
    /// missing from the last listing can still be looked up by name.
    pub fn raw_name<'a>(&'a self, entry: &'a str) -> &'a str {
        self.to_raw.get(entry).map(String::as_str).unwrap_or(entry)
    }

    /// Iterate over `(raw, entry)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.to_entry.iter().map(|(r, e)| (r.as_str(), e.as_str()))
    }

    pub fn len(&self) -> usize {
        self.to_entry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_entry.is_empty()
    }
}

fn disambiguated(raw: &str, hash_len: usize) -> String {
    let digest = hex::encode(Sha256::digest(raw.as_bytes()));
    let hash = &digest[..hash_len.min(digest.len())];

    let mut base: String = raw
        .chars()
        .map(|c| if c == '/' || c == '\0' { '_' } else { c })
        .collect();
    let budget = NAME_MAX - HASH_SEPARATOR.len() - hash.len();
    if base.len() > budget {
        let mut cut = budget;
        while !base.is_char_boundary(cut) {
            cut -= 1;
        }
        base.truncate(cut);
    }

    format!("{base}{HASH_SEPARATOR}{hash}")
}

//! A case-insensitive name/value map preserving insertion order.
//!
//! HTTP header names, and by convention the query parameters this library
//! collects next to them, compare case-insensitively but must be emitted in
//! the order the peer (or the application) supplied them. The map keeps one
//! ordered vector of entries plus a small bucket index of chains so lookups
//! stay O(1) amortized without disturbing that order.

use tracing::warn;

/// Number of index buckets. Prime, so signatures spread evenly.
const BUCKETS: usize = 127;

/// Soft cap on entries; an HTTP message with more fields than this is
/// either broken or hostile.
const MAX_ENTRIES: usize = 256;

/// Computes the hash of a name, folded byte-by-byte over its ASCII
/// lowercase form (djb2). The full 32-bit value is kept so chain walks can
/// compare signatures before comparing strings.
pub(crate) fn signature(name: &str) -> u32 {
    let mut hash: u32 = 5381;
    for b in name.bytes() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_add(hash)
            .wrapping_add(b.to_ascii_lowercase() as u32);
    }
    hash
}

#[derive(Debug)]
struct Entry {
    name: String,
    value: String,
    signature: u32,
    /// Next entry index in the same bucket chain.
    next: Option<usize>,
}

/// An insertion-ordered map with case-insensitive keys.
///
/// Setting an existing name replaces its value in place, keeping the
/// original position and the original spelling of the name. Iteration
/// yields entries in insertion order.
#[derive(Debug)]
pub struct HeaderMap {
    entries: Vec<Entry>,
    buckets: [Option<usize>; BUCKETS],
}

impl HeaderMap {
    /// Creates an empty map.
    pub fn new() -> HeaderMap {
        HeaderMap {
            entries: Vec::new(),
            buckets: [None; BUCKETS],
        }
    }

    /// Removes every entry.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.buckets = [None; BUCKETS];
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the map holds no entry.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn search(&self, signature: u32, name: &str) -> Option<usize> {
        let mut cursor = self.buckets[(signature as usize) % BUCKETS];
        while let Some(i) = cursor {
            let entry = &self.entries[i];
            if entry.signature == signature && entry.name.eq_ignore_ascii_case(name) {
                return Some(i);
            }
            cursor = entry.next;
        }
        None
    }

    /// Returns the position of `name`, if present.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.search(signature(name), name)
    }

    /// Returns the value stored under `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.find(name).map(|i| self.entries[i].value.as_str())
    }

    /// Inserts `name` = `value`, replacing the value in place when the name
    /// already exists. Returns false (and leaves the map unchanged) when
    /// the entry cap is reached.
    pub fn set(&mut self, name: &str, value: &str) -> bool {
        let signature = signature(name);
        if let Some(i) = self.search(signature, name) {
            self.entries[i].value = value.to_owned();
            return true;
        }
        if self.entries.len() >= MAX_ENTRIES {
            warn!("header map full, dropping {}", name);
            return false;
        }
        let bucket = (signature as usize) % BUCKETS;
        self.entries.push(Entry {
            name: name.to_owned(),
            value: value.to_owned(),
            signature,
            next: self.buckets[bucket],
        });
        self.buckets[bucket] = Some(self.entries.len() - 1);
        true
    }

    /// Iterates entries as `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|e| (e.name.as_str(), e.value.as_str()))
    }

    /// Renders the map as `name=value` pairs separated by `sep`, with both
    /// sides percent-encoded. Useful to rebuild a query string from
    /// collected parameters.
    pub fn join(&self, sep: &str) -> String {
        let mut out = String::new();
        for (name, value) in self.iter() {
            if !out.is_empty() {
                out.push_str(sep);
            }
            out.push_str(&crate::encoding::escape(name));
            out.push('=');
            out.push_str(&crate::encoding::escape(value));
        }
        out
    }
}

impl Default for HeaderMap {
    fn default() -> HeaderMap {
        HeaderMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_last_value_set() {
        let mut map = HeaderMap::new();
        assert!(map.set("Content-Type", "text/plain"));
        assert!(map.set("content-type", "application/json"));
        assert_eq!(map.get("CONTENT-TYPE"), Some("application/json"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn keeps_insertion_order() {
        let mut map = HeaderMap::new();
        map.set("b", "2");
        map.set("a", "1");
        map.set("c", "3");
        map.set("A", "one");
        let order: Vec<&str> = map.iter().map(|(n, _)| n).collect();
        assert_eq!(order, ["b", "a", "c"]);
        assert_eq!(map.get("a"), Some("one"));
    }

    #[test]
    fn reset_empties() {
        let mut map = HeaderMap::new();
        map.set("x", "y");
        map.reset();
        assert!(map.is_empty());
        assert_eq!(map.get("x"), None);
    }

    #[test]
    fn overflow_is_refused_not_fatal() {
        let mut map = HeaderMap::new();
        for i in 0..300 {
            map.set(&format!("h{}", i), "v");
        }
        assert_eq!(map.len(), 256);
        assert!(!map.set("one-more", "v"));
        // Existing names still update past the cap.
        assert!(map.set("h0", "updated"));
        assert_eq!(map.get("h0"), Some("updated"));
    }

    #[test]
    fn join_encodes_both_sides() {
        let mut map = HeaderMap::new();
        map.set("what", "hello world");
        map.set("path", "/a/b");
        assert_eq!(map.join("&"), "what=hello%20world&path=%2Fa%2Fb");
    }

    #[test]
    fn signatures_ignore_case() {
        assert_eq!(signature("Location"), signature("LOCATION"));
        assert_ne!(signature("Location"), signature("Locatio"));
    }
}

//! Key-Value Store
//!
//! In-memory string store with lazy expiry. Owned by the command loop,
//! so none of this is synchronised.

pub mod rdb;

use bytes::Bytes;
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Current wall clock in unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A stored value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub value: Bytes,
    /// Absolute expiry in unix milliseconds
    pub expires_at: Option<i64>,
}

impl Entry {
    pub fn new(value: Bytes) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

/// The key space
#[derive(Debug, Default)]
pub struct Store {
    entries: HashMap<Bytes, Entry>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from snapshot entries, dropping anything already expired
    pub fn from_entries(entries: impl IntoIterator<Item = (Bytes, Entry)>) -> Self {
        let now = now_millis();
        Self {
            entries: entries
                .into_iter()
                .filter(|(_, entry)| !entry.is_expired(now))
                .collect(),
        }
    }

    /// Replace the whole key space
    pub fn replace(&mut self, other: Store) {
        self.entries = other.entries;
    }

    pub fn get(&mut self, key: &[u8]) -> Option<Bytes> {
        self.live_entry(key).map(|entry| entry.value.clone())
    }

    pub fn set(&mut self, key: Bytes, value: Bytes, expires_at: Option<i64>) {
        self.entries.insert(key, Entry { value, expires_at });
    }

    /// Remove a key, reporting whether a live one existed
    pub fn delete(&mut self, key: &[u8]) -> bool {
        let now = now_millis();
        match self.entries.remove(key) {
            Some(entry) => !entry.is_expired(now),
            None => false,
        }
    }

    /// Increment an integer value, creating it at 0 when absent
    pub fn incr(&mut self, key: &[u8]) -> Result<i64> {
        let (current, expires_at) = match self.live_entry(key) {
            Some(entry) => {
                let parsed = std::str::from_utf8(&entry.value)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(|| {
                        Error::InvalidCommand(
                            "value is not an integer or out of range".into(),
                        )
                    })?;
                (parsed, entry.expires_at)
            }
            None => (0, None),
        };

        let next = current
            .checked_add(1)
            .ok_or_else(|| Error::InvalidCommand("increment or decrement would overflow".into()))?;
        self.entries.insert(
            Bytes::copy_from_slice(key),
            Entry {
                value: Bytes::from(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    /// `string` for live keys, `none` otherwise
    pub fn value_type(&mut self, key: &[u8]) -> &'static str {
        if self.live_entry(key).is_some() {
            "string"
        } else {
            "none"
        }
    }

    /// Live keys matching a glob pattern
    pub fn keys(&mut self, pattern: &[u8]) -> Vec<Bytes> {
        self.purge_expired();
        let mut keys: Vec<Bytes> = self
            .entries
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Snapshot of live entries, sorted by key
    pub fn entries(&self) -> Vec<(Bytes, Entry)> {
        let now = now_millis();
        let mut entries: Vec<(Bytes, Entry)> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn live_entry(&mut self, key: &[u8]) -> Option<&Entry> {
        let now = now_millis();
        if self.entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key)
    }

    fn purge_expired(&mut self) {
        let now = now_millis();
        self.entries.retain(|_, entry| !entry.is_expired(now));
    }
}

/// Redis-style glob matching: `*`, `?`, `[abc]`, `[^a-z]` and `\` escapes
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                b'*' => {
                    star = Some((p, t));
                    p += 1;
                    continue;
                }
                b'?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                b'[' => {
                    if let Some((matched, next)) = match_class(pattern, p, text[t]) {
                        if matched {
                            p = next;
                            t += 1;
                            continue;
                        }
                    }
                }
                b'\\' if p + 1 < pattern.len() => {
                    if pattern[p + 1] == text[t] {
                        p += 2;
                        t += 1;
                        continue;
                    }
                }
                c => {
                    if c == text[t] {
                        p += 1;
                        t += 1;
                        continue;
                    }
                }
            }
        }

        match star {
            Some((sp, st)) => {
                p = sp + 1;
                t = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}

/// Match one byte against the class starting at `pattern[start] == b'['`.
/// Returns whether it matched and the index after the closing `]`.
fn match_class(pattern: &[u8], start: usize, c: u8) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = pattern.get(i) == Some(&b'^');
    if negate {
        i += 1;
    }

    let mut matched = false;
    while i < pattern.len() && pattern[i] != b']' {
        let lo = if pattern[i] == b'\\' && i + 1 < pattern.len() {
            i += 1;
            pattern[i]
        } else {
            pattern[i]
        };

        if i + 2 < pattern.len() && pattern[i + 1] == b'-' && pattern[i + 2] != b']' {
            let hi = pattern[i + 2];
            let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
            if (lo..=hi).contains(&c) {
                matched = true;
            }
            i += 3;
        } else {
            if lo == c {
                matched = true;
            }
            i += 1;
        }
    }

    if i >= pattern.len() {
        return None;
    }
    Some((matched != negate, i + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let mut store = Store::new();
        store.set(Bytes::from("k"), Bytes::from("v"), None);
        assert_eq!(store.get(b"k"), Some(Bytes::from("v")));
        assert_eq!(store.value_type(b"k"), "string");
        assert!(store.delete(b"k"));
        assert!(!store.delete(b"k"));
        assert_eq!(store.value_type(b"k"), "none");
    }

    #[test]
    fn test_lazy_expiry() {
        let mut store = Store::new();
        store.set(Bytes::from("gone"), Bytes::from("v"), Some(now_millis() - 1));
        store.set(Bytes::from("kept"), Bytes::from("v"), Some(now_millis() + 60_000));
        assert_eq!(store.get(b"gone"), None);
        assert_eq!(store.get(b"kept"), Some(Bytes::from("v")));
        assert_eq!(store.keys(b"*"), vec![Bytes::from("kept")]);
    }

    #[test]
    fn test_incr() {
        let mut store = Store::new();
        assert_eq!(store.incr(b"n").unwrap(), 1);
        assert_eq!(store.incr(b"n").unwrap(), 2);
        store.set(Bytes::from("s"), Bytes::from("abc"), None);
        assert!(matches!(store.incr(b"s"), Err(Error::InvalidCommand(_))));
    }

    #[test]
    fn test_glob() {
        assert!(glob_match(b"*", b"anything"));
        assert!(glob_match(b"h?llo", b"hello"));
        assert!(glob_match(b"h*o", b"hello"));
        assert!(glob_match(b"h[ae]llo", b"hallo"));
        assert!(!glob_match(b"h[^e]llo", b"hello"));
        assert!(glob_match(b"h[a-f]llo", b"hello"));
        assert!(glob_match(b"k\\*", b"k*"));
        assert!(!glob_match(b"k\\*", b"kx"));
        assert!(!glob_match(b"a*b", b"acd"));
    }
}

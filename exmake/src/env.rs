//! Script-authored environment table.
//!
//! A process-wide mapping from string keys to either a single string or an
//! ordered list of strings, separate from the OS environment. Recipes read
//! and write it through the free functions at the bottom of this module; the
//! table deliberately lives for the whole process.

use std::collections::BTreeMap;
use std::sync::{LazyLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Key stamped into the table by `save_env` so the serialized file differs
/// across saves.
pub const STAMP_KEY: &str = "EXMAKE_STAMP";

/// A table slot: one string, or an ordered list of strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EnvValue {
    /// Single string value.
    Str(String),
    /// Ordered list of strings.
    List(Vec<String>),
}

impl EnvValue {
    /// Render the value the way `${KEY}` expansion does: lists joined by a
    /// single space.
    pub fn render(&self) -> String {
        match self {
            EnvValue::Str(s) => s.clone(),
            EnvValue::List(items) => items.join(" "),
        }
    }
}

/// How `list_delete` selects items to drop.
#[derive(Debug, Clone)]
pub enum ListMatcher {
    /// Drop items equal to the string.
    Exact(String),
    /// Drop items matching the regular expression.
    Pattern(Regex),
}

impl ListMatcher {
    fn matches(&self, item: &str) -> bool {
        match self {
            ListMatcher::Exact(s) => item == s,
            ListMatcher::Pattern(re) => re.is_match(item),
        }
    }
}

/// The environment table proper. Unit-testable on its own; the process-wide
/// instance is behind [`with`]/[`with_mut`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvTable {
    entries: BTreeMap<String, EnvValue>,
}

impl EnvTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a string slot.
    ///
    /// Fails with an env error when the key currently holds a list; string
    /// and list operations may not mix on one key.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into();
        if let Some(EnvValue::List(_)) = self.entries.get(&key) {
            return Err(Error::Env(format!("'{key}' holds a list, not a string")));
        }
        self.entries.insert(key, EnvValue::Str(value.into()));
        Ok(())
    }

    /// Look up a slot.
    pub fn get(&self, key: &str) -> Option<&EnvValue> {
        self.entries.get(key)
    }

    /// Remove a slot of either shape. Returns whether it existed.
    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Append to a list slot, creating it when absent.
    pub fn list_append(&mut self, key: impl Into<String>, item: impl Into<String>) -> Result<()> {
        let key = key.into();
        match self
            .entries
            .entry(key.clone())
            .or_insert_with(|| EnvValue::List(Vec::new()))
        {
            EnvValue::List(items) => {
                items.push(item.into());
                Ok(())
            }
            EnvValue::Str(_) => Err(Error::Env(format!("'{key}' holds a string, not a list"))),
        }
    }

    /// Prepend to a list slot, creating it when absent.
    pub fn list_prepend(&mut self, key: impl Into<String>, item: impl Into<String>) -> Result<()> {
        let key = key.into();
        match self
            .entries
            .entry(key.clone())
            .or_insert_with(|| EnvValue::List(Vec::new()))
        {
            EnvValue::List(items) => {
                items.insert(0, item.into());
                Ok(())
            }
            EnvValue::Str(_) => Err(Error::Env(format!("'{key}' holds a string, not a list"))),
        }
    }

    /// Read a list slot. A missing key reads as the empty list.
    pub fn list_get(&self, key: &str) -> Result<Vec<String>> {
        match self.entries.get(key) {
            None => Ok(Vec::new()),
            Some(EnvValue::List(items)) => Ok(items.clone()),
            Some(EnvValue::Str(_)) => {
                Err(Error::Env(format!("'{key}' holds a string, not a list")))
            }
        }
    }

    /// Remove matching items from a list slot. Returns how many were dropped.
    pub fn list_delete(&mut self, key: &str, matcher: &ListMatcher) -> Result<usize> {
        match self.entries.get_mut(key) {
            None => Ok(0),
            Some(EnvValue::List(items)) => {
                let before = items.len();
                items.retain(|item| !matcher.matches(item));
                Ok(before - items.len())
            }
            Some(EnvValue::Str(_)) => {
                Err(Error::Env(format!("'{key}' holds a string, not a list")))
            }
        }
    }

    /// Fold over all entries in key order.
    pub fn reduce<T, F>(&self, init: T, mut f: F) -> T
    where
        F: FnMut(T, &str, &EnvValue) -> T,
    {
        self.entries
            .iter()
            .fold(init, |acc, (key, value)| f(acc, key, value))
    }

    /// Expand `${NAME}` occurrences over `text`.
    ///
    /// Applied once, left to right, not recursive: replacement text is never
    /// rescanned. Unknown names are left in place, as are unterminated `${`.
    pub fn expand(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let name = &after[..end];
                    match self.entries.get(name) {
                        Some(value) => out.push_str(&value.render()),
                        None => {
                            out.push_str("${");
                            out.push_str(name);
                            out.push('}');
                        }
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

static GLOBAL: LazyLock<RwLock<EnvTable>> = LazyLock::new(|| RwLock::new(EnvTable::new()));

fn read_global() -> RwLockReadGuard<'static, EnvTable> {
    match GLOBAL.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_global() -> RwLockWriteGuard<'static, EnvTable> {
    match GLOBAL.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Run `f` against the process-wide table, read-only.
pub fn with<R>(f: impl FnOnce(&EnvTable) -> R) -> R {
    f(&read_global())
}

/// Run `f` against the process-wide table, mutably.
pub fn with_mut<R>(f: impl FnOnce(&mut EnvTable) -> R) -> R {
    f(&mut write_global())
}

/// Set a string slot on the process-wide table.
pub fn put(key: impl Into<String>, value: impl Into<String>) -> Result<()> {
    with_mut(|t| t.put(key, value))
}

/// Look up a slot on the process-wide table.
pub fn get(key: &str) -> Option<EnvValue> {
    with(|t| t.get(key).cloned())
}

/// Remove a slot from the process-wide table.
pub fn delete(key: &str) -> bool {
    with_mut(|t| t.delete(key))
}

/// Append to a list slot on the process-wide table.
pub fn list_append(key: impl Into<String>, item: impl Into<String>) -> Result<()> {
    with_mut(|t| t.list_append(key, item))
}

/// Prepend to a list slot on the process-wide table.
pub fn list_prepend(key: impl Into<String>, item: impl Into<String>) -> Result<()> {
    with_mut(|t| t.list_prepend(key, item))
}

/// Read a list slot from the process-wide table.
pub fn list_get(key: &str) -> Result<Vec<String>> {
    with(|t| t.list_get(key))
}

/// Remove matching items from a list slot on the process-wide table.
pub fn list_delete(key: &str, matcher: &ListMatcher) -> Result<usize> {
    with_mut(|t| t.list_delete(key, matcher))
}

/// Expand `${NAME}` occurrences against the process-wide table.
pub fn expand(text: &str) -> String {
    with(|t| t.expand(text))
}

/// Replace the process-wide table wholesale (cache restore discards any
/// in-memory table first).
pub fn replace(table: EnvTable) {
    *write_global() = table;
}

/// Clone of the process-wide table.
pub fn snapshot() -> EnvTable {
    read_global().clone()
}

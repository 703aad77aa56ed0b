//! Per-bucket `.meta` sidecar.
//!
//! A single JSON document per bucket directory holding the monotonic ID
//! counter, per-key expiry timestamps, and per-key extra string maps. Writes
//! go through `.meta.tmp` and an atomic rename. Empty maps collapse to
//! absent fields, and an expiry of `0` is a deletion.

use crate::error::Result;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

const META_FILE: &str = ".meta";

/// The persisted per-bucket record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Metadata {
    /// Monotonic ID counter, one increment per novel key insertion. Stored
    /// as a decimal string so it never wraps and never loses precision in
    /// JSON.
    #[serde(with = "counter_serde")]
    counter: BigUint,

    #[serde(
        rename = "expiryDate",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    expiry_date: Option<BTreeMap<String, i64>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    extra: Option<BTreeMap<String, BTreeMap<String, String>>>,

    #[serde(skip)]
    path: PathBuf,
}

impl Metadata {
    fn fresh(path: PathBuf) -> Self {
        Self {
            counter: BigUint::default(),
            expiry_date: None,
            extra: None,
            path,
        }
    }

    /// Loads the record from `<dir>/.meta`, or returns a counter-zero
    /// record if the file does not exist yet.
    pub(crate) fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(META_FILE);
        match File::open(&path) {
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Self::fresh(path)),
            Err(err) => Err(err.into()),
            Ok(file) => {
                let mut meta: Metadata = serde_json::from_reader(BufReader::new(file))?;
                meta.path = path;
                Ok(meta)
            }
        }
    }

    /// Persists the record crash-safely: write `.meta.tmp`, flush, rename.
    pub(crate) fn store(&self) -> Result<()> {
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let mut w = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer(&mut w, self)?;
        w.flush()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// The current counter value.
    pub(crate) fn counter(&self) -> &BigUint {
        &self.counter
    }

    /// Advances the counter by one.
    pub(crate) fn inc_counter(&mut self) {
        self.counter += 1u32;
    }

    /// The expiry timestamp for `key`, if one is set.
    pub(crate) fn expiry_date(&self, key: &str) -> Option<i64> {
        self.expiry_date.as_ref()?.get(key).copied()
    }

    /// Sets the expiry for `key`; a timestamp of `0` deletes it, and an
    /// emptied map is dropped entirely.
    pub(crate) fn set_expiry_date(&mut self, key: &str, ts: i64) {
        if ts == 0 {
            if let Some(map) = self.expiry_date.as_mut() {
                map.remove(key);
                if map.is_empty() {
                    self.expiry_date = None;
                }
            }
        } else {
            self.expiry_date
                .get_or_insert_with(BTreeMap::new)
                .insert(key.to_string(), ts);
        }
    }

    /// Sets one extra tag on `file_key`; an empty value deletes the tag,
    /// and emptied maps collapse away.
    pub(crate) fn set_extra_data(&mut self, file_key: &str, tag: &str, value: &str) {
        if value.is_empty() {
            let Some(extra) = self.extra.as_mut() else {
                return;
            };
            if let Some(tags) = extra.get_mut(file_key) {
                tags.remove(tag);
                if tags.is_empty() {
                    extra.remove(file_key);
                }
            }
            if extra.is_empty() {
                self.extra = None;
            }
        } else {
            self.extra
                .get_or_insert_with(BTreeMap::new)
                .entry(file_key.to_string())
                .or_default()
                .insert(tag.to_string(), value.to_string());
        }
    }

    /// One extra tag value for `file_key`.
    pub(crate) fn extra_value(&self, file_key: &str, tag: &str) -> Option<String> {
        self.extra.as_ref()?.get(file_key)?.get(tag).cloned()
    }

    /// An independently owned copy of the extra map for `file_key`.
    pub(crate) fn copy_extra(&self, file_key: &str) -> BTreeMap<String, String> {
        self.extra
            .as_ref()
            .and_then(|extra| extra.get(file_key))
            .cloned()
            .unwrap_or_default()
    }

    /// Drops the expiry and extra entries for `key`, collapsing emptied
    /// maps.
    pub(crate) fn remove_key(&mut self, key: &str) {
        if let Some(map) = self.expiry_date.as_mut() {
            map.remove(key);
            if map.is_empty() {
                self.expiry_date = None;
            }
        }
        if let Some(map) = self.extra.as_mut() {
            map.remove(key);
            if map.is_empty() {
                self.extra = None;
            }
        }
    }

    /// Prunes expiry/extra entries whose key is not accepted by `known`.
    /// Returns `true` if anything was removed.
    pub(crate) fn retain_known<F>(&mut self, mut known: F) -> bool
    where
        F: FnMut(&str) -> bool,
    {
        let mut changed = false;
        if let Some(map) = self.expiry_date.as_mut() {
            let before = map.len();
            map.retain(|key, _| known(key));
            changed |= map.len() != before;
            if map.is_empty() {
                self.expiry_date = None;
            }
        }
        if let Some(map) = self.extra.as_mut() {
            let before = map.len();
            map.retain(|key, _| known(key));
            changed |= map.len() != before;
            if map.is_empty() {
                self.extra = None;
            }
        }
        changed
    }
}

mod counter_serde {
    use num_bigint::BigUint;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigUint, ser: S) -> Result<S::Ok, S::Error> {
        ser.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<BigUint, D::Error> {
        let s = String::deserialize(de)?;
        s.parse::<BigUint>().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_missing_yields_fresh_record() {
        let dir = TempDir::new().unwrap();
        let meta = Metadata::load(dir.path()).unwrap();
        assert_eq!(meta.counter(), &BigUint::default());
        assert!(meta.expiry_date.is_none());
    }

    #[test]
    fn store_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut meta = Metadata::load(dir.path()).unwrap();
        meta.inc_counter();
        meta.inc_counter();
        meta.set_expiry_date("k", 12345);
        meta.set_extra_data("k", "tag", "value");
        meta.store().unwrap();

        let loaded = Metadata::load(dir.path()).unwrap();
        assert_eq!(loaded.counter().to_string(), "2");
        assert_eq!(loaded.expiry_date("k"), Some(12345));
        assert_eq!(loaded.extra_value("k", "tag").as_deref(), Some("value"));
        assert!(!dir.path().join(".meta.tmp").exists());
    }

    #[test]
    fn counter_serialises_as_decimal_string() {
        let dir = TempDir::new().unwrap();
        let mut meta = Metadata::load(dir.path()).unwrap();
        for _ in 0..7 {
            meta.inc_counter();
        }
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains(r#""counter":"7""#), "got {json}");
        assert!(!json.contains("expiryDate"), "empty maps are omitted");
    }

    #[test]
    fn zero_expiry_deletes_and_collapses() {
        let dir = TempDir::new().unwrap();
        let mut meta = Metadata::load(dir.path()).unwrap();
        meta.set_expiry_date("k", 99);
        assert_eq!(meta.expiry_date("k"), Some(99));
        meta.set_expiry_date("k", 0);
        assert_eq!(meta.expiry_date("k"), None);
        assert!(meta.expiry_date.is_none(), "map collapses when emptied");
    }

    #[test]
    fn empty_extra_value_deletes_and_collapses() {
        let dir = TempDir::new().unwrap();
        let mut meta = Metadata::load(dir.path()).unwrap();
        meta.set_extra_data("k", "a", "1");
        meta.set_extra_data("k", "b", "2");
        meta.set_extra_data("k", "a", "");
        assert_eq!(meta.extra_value("k", "a"), None);
        assert_eq!(meta.extra_value("k", "b").as_deref(), Some("2"));
        meta.set_extra_data("k", "b", "");
        assert!(meta.extra.is_none());
    }

    #[test]
    fn remove_key_clears_both_maps() {
        let dir = TempDir::new().unwrap();
        let mut meta = Metadata::load(dir.path()).unwrap();
        meta.set_expiry_date("k", 1);
        meta.set_extra_data("k", "t", "v");
        meta.remove_key("k");
        assert!(meta.expiry_date.is_none());
        assert!(meta.extra.is_none());
    }

    #[test]
    fn retain_known_prunes_orphans() {
        let dir = TempDir::new().unwrap();
        let mut meta = Metadata::load(dir.path()).unwrap();
        meta.set_expiry_date("live", 1);
        meta.set_expiry_date("gone", 2);
        meta.set_extra_data("gone", "t", "v");
        assert!(meta.retain_known(|k| k == "live"));
        assert_eq!(meta.expiry_date("live"), Some(1));
        assert_eq!(meta.expiry_date("gone"), None);
        assert!(meta.extra.is_none());
        assert!(!meta.retain_known(|k| k == "live"), "second pass is a no-op");
    }

    #[test]
    fn big_counter_survives_json() {
        let big = "340282366920938463463374607431768211456"; // 2^128
        let json = format!(r#"{{"counter":"{big}"}}"#);
        let meta: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(meta.counter().to_string(), big);
    }
}

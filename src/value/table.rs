// Table: map from arbitrary non-null, non-NaN keys to values.
//
// Stores carry modified bookkeeping so a barrier re-scan can revisit only
// the entries touched since the last full trace. A plain HashMap has no
// per-node flag bits to spare, so the flags are rendered as a bounded log
// of (key, value) pairs; past the cap the log overflows and the re-scan
// degrades to a full re-trace.

use crate::value::Value;
use ahash::RandomState;
use std::collections::HashMap;

/// Why a key was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKeyError {
    NullKey,
    NanKey,
}

const MODIFIED_LOG_CAP: usize = 64;

pub struct CrocTable {
    data: HashMap<Value, Value, RandomState>,
    modified: Vec<(Value, Value)>,
    modified_overflow: bool,
}

impl CrocTable {
    pub fn new() -> Self {
        CrocTable {
            data: HashMap::with_hasher(RandomState::new()),
            modified: Vec::new(),
            modified_overflow: false,
        }
    }

    pub fn with_capacity(cap: usize) -> Self {
        CrocTable {
            data: HashMap::with_capacity_and_hasher(cap, RandomState::new()),
            modified: Vec::new(),
            modified_overflow: false,
        }
    }

    fn check_key(key: &Value) -> Result<Value, TableKeyError> {
        if key.is_null() {
            return Err(TableKeyError::NullKey);
        }
        if let Some(f) = key.as_float() {
            if f.is_nan() {
                return Err(TableKeyError::NanKey);
            }
        }
        Ok(key.normalized_key())
    }

    /// Raw lookup. Missing keys yield None; the interpreter maps that to null.
    pub fn get(&self, key: &Value) -> Result<Option<Value>, TableKeyError> {
        let key = Self::check_key(key)?;
        Ok(self.data.get(&key).copied())
    }

    /// Raw store. Writing null removes the key.
    pub fn set(&mut self, key: Value, value: Value) -> Result<(), TableKeyError> {
        let key = Self::check_key(&key)?;
        if value.is_null() {
            // Removals introduce no new references; nothing to log.
            self.data.remove(&key);
        } else {
            self.data.insert(key, value);
            self.note_modified(key, value);
        }
        Ok(())
    }

    fn note_modified(&mut self, key: Value, value: Value) {
        if self.modified_overflow {
            return;
        }
        if self.modified.len() >= MODIFIED_LOG_CAP {
            self.modified.clear();
            self.modified_overflow = true;
            return;
        }
        self.modified.push((key, value));
    }

    /// Entries stored since the last scan, or None when the log overflowed
    /// and the caller must re-trace everything. Resets the bookkeeping
    /// either way.
    pub fn take_modified(&mut self) -> Option<Vec<(Value, Value)>> {
        if self.modified_overflow {
            self.modified_overflow = false;
            None
        } else {
            Some(std::mem::take(&mut self.modified))
        }
    }

    pub fn clear_modified(&mut self) {
        self.modified.clear();
        self.modified_overflow = false;
    }

    pub fn contains_key(&self, key: &Value) -> Result<bool, TableKeyError> {
        let key = Self::check_key(key)?;
        Ok(self.data.contains_key(&key))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.data.iter()
    }

    /// Snapshot of all pairs, for GC tracing and serialization.
    pub fn pairs(&self) -> Vec<(Value, Value)> {
        self.data.iter().map(|(k, v)| (*k, *v)).collect()
    }
}

impl Default for CrocTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_and_nan_keys_rejected() {
        let mut t = CrocTable::new();
        assert_eq!(
            t.set(Value::null(), Value::int(1)),
            Err(TableKeyError::NullKey)
        );
        assert_eq!(
            t.set(Value::float(f64::NAN), Value::int(1)),
            Err(TableKeyError::NanKey)
        );
    }

    #[test]
    fn null_value_removes() {
        let mut t = CrocTable::new();
        t.set(Value::int(1), Value::int(10)).unwrap();
        assert_eq!(t.len(), 1);
        t.set(Value::int(1), Value::null()).unwrap();
        assert_eq!(t.len(), 0);
        assert_eq!(t.get(&Value::int(1)).unwrap(), None);
    }

    #[test]
    fn negative_zero_key_folds_to_zero() {
        let mut t = CrocTable::new();
        t.set(Value::float(-0.0), Value::int(7)).unwrap();
        assert_eq!(t.get(&Value::float(0.0)).unwrap(), Some(Value::int(7)));
    }

    #[test]
    fn stores_are_logged_for_rescan() {
        let mut t = CrocTable::new();
        t.set(Value::int(1), Value::int(10)).unwrap();
        t.set(Value::int(2), Value::null()).unwrap(); // removal: not logged
        let touched = t.take_modified().expect("no overflow");
        assert_eq!(touched, vec![(Value::int(1), Value::int(10))]);
        assert_eq!(t.take_modified(), Some(vec![]));
    }

    #[test]
    fn modified_log_overflow_requests_a_full_retrace() {
        let mut t = CrocTable::new();
        for i in 0..(MODIFIED_LOG_CAP as i64 + 8) {
            t.set(Value::int(i), Value::int(i)).unwrap();
        }
        assert_eq!(t.take_modified(), None);
        // Overflow resets; later stores log normally again.
        t.set(Value::int(-1), Value::int(-1)).unwrap();
        assert_eq!(
            t.take_modified(),
            Some(vec![(Value::int(-1), Value::int(-1))])
        );
    }
}

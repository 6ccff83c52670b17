use crate::object::{Obj, ObjData, ObjRef};
use crate::value::Value;

const MAX_LOAD: f64 = 0.75;

#[derive(Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    value: Value,
}

/// Open-addressing hash table with linear probing, power-of-two capacity
/// and tombstone deletion. Keys are always interned strings, so key
/// equality is pointer equality. Used for globals, instance fields, class
/// methods, and (with the value slot unused) the string-intern set.
pub struct Table {
    entries: Vec<Entry>,
    count: usize,
}

fn string_hash(key: ObjRef) -> u32 {
    match &key.data {
        ObjData::String(_, hash) => *hash,
        _ => unreachable!("table keys are always interned strings"),
    }
}

impl Table {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Probes starting at `hash % capacity`; stops at the first empty slot,
    /// reusing the first tombstone seen along the way.
    fn find_entry(entries: &[Entry], capacity: usize, key: ObjRef) -> usize {
        let mut index = (string_hash(key) as usize) % capacity;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                None if entry.value == Value::Nil => {
                    return tombstone.unwrap_or(index);
                }
                None => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(k) if Obj::ptr_eq(k, key) => return index,
                Some(_) => {}
            }
            index = (index + 1) % capacity;
        }
    }

    fn grow(&mut self, new_capacity: usize) {
        let mut new_entries = vec![
            Entry {
                key: None,
                value: Value::Nil,
            };
            new_capacity
        ];
        let mut live = 0;
        for entry in &self.entries {
            if let Some(key) = entry.key {
                let idx = Self::find_entry(&new_entries, new_capacity, key);
                new_entries[idx] = *entry;
                live += 1;
            }
        }
        self.entries = new_entries;
        self.count = live;
    }

    /// Returns whether `key` was not already present.
    pub fn set(&mut self, key: ObjRef, value: Value) -> bool {
        if (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD {
            let new_capacity = (self.capacity() * 2).max(8);
            self.grow(new_capacity);
        }
        let idx = Self::find_entry(&self.entries, self.capacity(), key);
        let is_new_key = self.entries[idx].key.is_none();
        if is_new_key && self.entries[idx].value == Value::Nil {
            self.count += 1;
        }
        self.entries[idx] = Entry {
            key: Some(key),
            value,
        };
        is_new_key
    }

    pub fn get(&self, key: ObjRef) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = Self::find_entry(&self.entries, self.capacity(), key);
        self.entries[idx].key.map(|_| self.entries[idx].value)
    }

    pub fn delete(&mut self, key: ObjRef) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let idx = Self::find_entry(&self.entries, self.capacity(), key);
        if self.entries[idx].key.is_none() {
            return false;
        }
        self.entries[idx] = Entry {
            key: None,
            value: Value::Bool(true),
        };
        true
    }

    /// Copies live entries from `self` into `dst`, used to propagate
    /// methods on `INHERIT`.
    pub fn add_all(&self, dst: &mut Table) {
        for entry in &self.entries {
            if let Some(key) = entry.key {
                dst.set(key, entry.value);
            }
        }
    }

    /// Used only by the intern table: probes by hash and compares the
    /// bytes directly, since the caller doesn't have an `ObjRef` yet to
    /// compare by identity.
    pub fn find_string(&self, s: &str, hash: u32) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.capacity();
        let mut index = (hash as usize) % capacity;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None if entry.value == Value::Nil => return None,
                Some(key) => {
                    if let ObjData::String(text, h) = &key.data {
                        if *h == hash && text.as_str() == s {
                            return Some(key);
                        }
                    }
                }
                None => {}
            }
            index = (index + 1) % capacity;
        }
    }

    /// Deletes every key whose object is unmarked. Called after tracing,
    /// before sweep, so the intern table doesn't keep dead strings alive.
    pub fn remove_white(&mut self) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !key.marked.get() {
                    entry.key = None;
                    entry.value = Value::Bool(true);
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Heap;

    #[test]
    fn set_then_get_returns_value() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let key = heap.intern("x");
        table.set(key, Value::Number(1.0));
        assert_eq!(table.get(key), Some(Value::Number(1.0)));
    }

    #[test]
    fn overwrite_replaces_value_without_growing_count() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let key = heap.intern("x");
        table.set(key, Value::Number(1.0));
        table.set(key, Value::Number(2.0));
        assert_eq!(table.get(key), Some(Value::Number(2.0)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn delete_then_get_returns_none() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let key = heap.intern("x");
        table.set(key, Value::Number(1.0));
        assert!(table.delete(key));
        assert_eq!(table.get(key), None);
    }

    #[test]
    fn set_after_delete_reuses_tombstone() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let key = heap.intern("x");
        table.set(key, Value::Number(1.0));
        table.delete(key);
        let before = table.len();
        table.set(key, Value::Number(3.0));
        assert_eq!(table.len(), before);
        assert_eq!(table.get(key), Some(Value::Number(3.0)));
    }

    #[test]
    fn interned_strings_are_pointer_equal() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        assert!(Obj::ptr_eq(a, b));
    }
}

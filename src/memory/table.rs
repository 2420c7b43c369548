use super::object::Object;
use super::Gc;
use crate::vm::value::Value;

/// String-keyed hash table with open addressing and linear probing. Keys are
/// interned strings, so equality is pointer identity and every key carries
/// its hash. Deletions leave tombstones (empty key, `true` value) to keep
/// probe sequences intact; a slot with an empty key and `nil` value
/// terminates a probe.
#[derive(Debug, Default)]
pub struct Table {
    /// Live entries plus tombstones; the load factor is computed over both.
    count: usize,
    entries: Vec<Entry>,
}

#[derive(Debug, Copy, Clone)]
struct Entry {
    key: Option<Gc<Object>>,
    value: Value,
}

impl Entry {
    const EMPTY: Entry = Entry {
        key: None,
        value: Value::Nil,
    };

    const TOMBSTONE: Entry = Entry {
        key: None,
        value: Value::Bool(true),
    };

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && matches!(self.value, Value::Bool(true))
    }
}

fn key_hash(key: &Gc<Object>) -> u32 {
    key.as_ref().as_string().hash
}

/// Index of the slot `key` lives in, or of the slot it should be inserted
/// into: the first tombstone passed over if any, else the terminating empty
/// slot. The capacity ceiling guarantees a free slot always exists.
fn find_entry(entries: &[Entry], key: Gc<Object>) -> usize {
    let mut index = key_hash(&key) as usize & (entries.len() - 1);
    let mut tombstone = None;

    loop {
        let entry = &entries[index];
        match entry.key {
            None => {
                if entry.is_tombstone() {
                    tombstone.get_or_insert(index);
                } else {
                    return tombstone.unwrap_or(index);
                }
            }
            Some(entry_key) => {
                if Gc::ptr_eq(&entry_key, &key) {
                    return index;
                }
            }
        }
        index = (index + 1) & (entries.len() - 1);
    }
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: Gc<Object>) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let entry = &self.entries[find_entry(&self.entries, key)];
        entry.key.map(|_| entry.value)
    }

    /// Inserts or overwrites. Returns true when the key was not present.
    /// Filling a tombstone does not change the count; it was already charged.
    pub fn set(&mut self, key: Gc<Object>, value: Value) -> bool {
        if (self.count + 1) * 4 > self.entries.len() * 3 {
            self.grow();
        }

        let index = find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        if is_new && !entry.is_tombstone() {
            self.count += 1;
        }
        *entry = Entry {
            key: Some(key),
            value,
        };
        is_new
    }

    /// Replaces the entry with a tombstone. Returns true when the key was
    /// present.
    pub fn delete(&mut self, key: Gc<Object>) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = find_entry(&self.entries, key);
        if self.entries[index].key.is_none() {
            return false;
        }
        self.entries[index] = Entry::TOMBSTONE;
        true
    }

    /// Inserts every live entry of `other` into `self`.
    pub fn add_all(&mut self, other: &Table) {
        for (key, value) in other.iter() {
            self.set(key, value);
        }
    }

    /// Locates an already interned string by bytes and hash, without
    /// allocating. Only the intern table needs this; everywhere else key
    /// identity suffices.
    pub fn find_string(&self, s: &str, hash: u32) -> Option<Gc<Object>> {
        if self.count == 0 {
            return None;
        }

        let mut index = hash as usize & (self.entries.len() - 1);
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if !entry.is_tombstone() {
                        return None;
                    }
                }
                Some(key) => {
                    let string = key.as_ref().as_string();
                    if string.hash == hash && string.as_str() == s {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) & (self.entries.len() - 1);
        }
    }

    /// Drops every entry whose key was not marked by the current collection
    /// cycle. Run before the sweep so the intern table never holds freed
    /// strings.
    pub(super) fn remove_unmarked(&mut self) {
        for entry in self.entries.iter_mut() {
            if let Some(key) = entry.key {
                if !key.marked() {
                    *entry = Entry::TOMBSTONE;
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Gc<Object>, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|entry| entry.key.map(|key| (key, entry.value)))
    }

    /// Rebuilds at double capacity. Tombstones are not carried over, so the
    /// count is recomputed from live entries.
    fn grow(&mut self) {
        let capacity = std::cmp::max(8, self.entries.len() * 2);
        let old = std::mem::replace(&mut self.entries, vec![Entry::EMPTY; capacity]);

        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let index = find_entry(&self.entries, key);
                self.entries[index] = entry;
                self.count += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::object::LoxString;
    use super::super::trace::Traced;
    use super::*;

    /// Boxed strings standing in for heap allocations; the boxes must stay
    /// alive for as long as the table holds the keys.
    struct Strings {
        boxes: Vec<Box<Traced<Object>>>,
    }

    impl Strings {
        fn new() -> Self {
            Self { boxes: Vec::new() }
        }

        fn make(&mut self, s: &str) -> Gc<Object> {
            let mut boxed = Box::new(Traced::new(Object::String(LoxString::new(s.to_owned()))));
            let gc = Gc::new(boxed.as_mut());
            self.boxes.push(boxed);
            gc
        }
    }

    #[test]
    fn set_get_overwrite() {
        let mut strings = Strings::new();
        let key = strings.make("key");
        let mut table = Table::new();

        assert_eq!(table.get(key), None);
        assert!(table.set(key, Value::Number(1.0)));
        assert_eq!(table.get(key), Some(Value::Number(1.0)));
        assert!(!table.set(key, Value::Number(2.0)));
        assert_eq!(table.get(key), Some(Value::Number(2.0)));
    }

    #[test]
    fn delete_leaves_reusable_tombstone() {
        let mut strings = Strings::new();
        let a = strings.make("a");
        let b = strings.make("b");
        let mut table = Table::new();

        table.set(a, Value::Number(1.0));
        table.set(b, Value::Number(2.0));
        assert!(table.delete(a));
        assert!(!table.delete(a));
        assert_eq!(table.get(a), None);
        // The other entry is still reachable through the probe sequence.
        assert_eq!(table.get(b), Some(Value::Number(2.0)));

        // Setting the key again reuses the tombstone without growing count.
        let count_before = table.count;
        assert!(table.set(a, Value::Number(3.0)));
        assert_eq!(table.count, count_before);
        assert_eq!(table.get(a), Some(Value::Number(3.0)));
    }

    #[test]
    fn grows_past_load_factor() {
        let mut strings = Strings::new();
        let mut table = Table::new();
        let keys: Vec<_> = (0..64).map(|i| strings.make(&format!("key{}", i))).collect();

        for (i, key) in keys.iter().enumerate() {
            table.set(*key, Value::Number(i as f64));
        }
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(table.get(*key), Some(Value::Number(i as f64)));
        }
        assert!(table.entries.len().is_power_of_two());
        assert!(table.count * 4 <= table.entries.len() * 3);
    }

    #[test]
    fn resize_discards_tombstones() {
        let mut strings = Strings::new();
        let mut table = Table::new();
        let keys: Vec<_> = (0..16).map(|i| strings.make(&format!("key{}", i))).collect();

        for key in keys.iter() {
            table.set(*key, Value::Nil);
        }
        for key in keys.iter().take(8) {
            table.delete(*key);
        }
        let live = table.iter().count();
        // Force a rebuild and check tombstones were dropped from the count.
        for i in 16..32 {
            table.set(strings.make(&format!("key{}", i)), Value::Nil);
        }
        assert_eq!(table.iter().count(), live + 16);
    }

    #[test]
    fn find_string_matches_bytes_not_identity() {
        let mut strings = Strings::new();
        let key = strings.make("hello");
        let mut table = Table::new();
        table.set(key, Value::Nil);

        let hash = LoxString::hash_of("hello");
        let found = table.find_string("hello", hash).unwrap();
        assert!(Gc::ptr_eq(&found, &key));
        assert!(table.find_string("world", LoxString::hash_of("world")).is_none());
    }

    #[test]
    fn add_all_copies_live_entries() {
        let mut strings = Strings::new();
        let a = strings.make("a");
        let b = strings.make("b");

        let mut src = Table::new();
        src.set(a, Value::Number(1.0));
        src.set(b, Value::Number(2.0));
        src.delete(b);

        let mut dst = Table::new();
        dst.add_all(&src);
        assert_eq!(dst.get(a), Some(Value::Number(1.0)));
        assert_eq!(dst.get(b), None);
    }
}

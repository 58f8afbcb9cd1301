//! Object registry (C3): a separately chained hash table keyed on the
//! canonical name's FNV-1a hash, plus the append-only BFS search list.
//! Grounded in `original_source/rtld/object.c`'s `make_hash`,
//! `add_to_hash_table`, and `get_object`.

use crate::object::{Object, ObjectId};
use crate::Vec;

const INITIAL_CAPACITY: usize = 16;

/// FNV-1a over a byte string, as `original_source/rtld/object.c`'s
/// `make_hash` computes it. Distinct from the ELF hash algorithm in
/// `symbol.rs`, which hashes symbol names within an object rather than
/// object canonical names within the registry — the two must never be
/// conflated even though both are "a hash of a byte string".
pub fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// The object registry and the search list it owns.
pub struct Registry {
    objects: Vec<Object>,
    buckets: Vec<Option<ObjectId>>,
    count: usize,
    search_head: Option<ObjectId>,
    search_tail: Option<ObjectId>,
}

impl Registry {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(INITIAL_CAPACITY);
        buckets.resize(INITIAL_CAPACITY, None);
        Self {
            objects: Vec::new(),
            buckets,
            count: 0,
            search_head: None,
            search_tail: None,
        }
    }

    pub fn get(&self, id: ObjectId) -> &Object {
        &self.objects[id.0]
    }

    pub fn get_mut(&mut self, id: ObjectId) -> &mut Object {
        &mut self.objects[id.0]
    }

    pub fn search_head(&self) -> Option<ObjectId> {
        self.search_head
    }

    /// Insert a freshly built object into the registry and return its ID.
    /// Does not append it to the search list; callers decide that (some
    /// callers, like the bootstrap's own record, never enter the search
    /// list at all).
    pub fn insert(&mut self, mut object: Object) -> ObjectId {
        if self.count + 1 > self.buckets.len() - self.buckets.len() / 4 {
            self.grow();
        }

        let id = ObjectId(self.objects.len());
        object.id = id;

        let bucket = (object.name_hash as usize) % self.buckets.len();
        object.table_next = self.buckets[bucket];
        object.table_prev = None;

        self.objects.push(object);
        if let Some(old_head) = self.buckets[bucket] {
            self.objects[old_head.0].table_prev = Some(id);
        }
        self.buckets[bucket] = Some(id);
        self.count += 1;
        id
    }

    fn grow(&mut self) {
        let new_capacity = self.buckets.len() * 2;
        let mut new_buckets = Vec::with_capacity(new_capacity);
        new_buckets.resize(new_capacity, None);

        for obj in self.objects.iter_mut() {
            obj.table_prev = None;
            obj.table_next = None;
        }

        // Rehash every existing entry, preserving the doubly linked chain
        // pointers within each (new) bucket, as
        // `original_source/rtld/object.c`'s `add_to_hash_table` does.
        for i in 0..self.objects.len() {
            let id = ObjectId(i);
            let hash = self.objects[i].name_hash;
            let bucket = (hash as usize) % new_capacity;
            let old_head = new_buckets[bucket];
            self.objects[i].table_next = old_head;
            self.objects[i].table_prev = None;
            if let Some(head) = old_head {
                self.objects[head.0].table_prev = Some(id);
            }
            new_buckets[bucket] = Some(id);
        }

        self.buckets = new_buckets;
    }

    /// Look up by canonical name: hash, then walk the bucket comparing
    /// hash, length, then bytes (spec §4.3).
    pub fn lookup(&self, name: &[u8]) -> Option<ObjectId> {
        let hash = fnv1a(name);
        let bucket = (hash as usize) % self.buckets.len();
        let mut cur = self.buckets[bucket];
        while let Some(id) = cur {
            let obj = &self.objects[id.0];
            if obj.name_hash == hash && obj.name.as_bytes() == name {
                return Some(id);
            }
            cur = obj.table_next;
        }
        None
    }

    /// Append `id` to the tail of the search list. O(1); the list is
    /// never reordered (spec §3/§4.3).
    pub fn append_search(&mut self, id: ObjectId) {
        match self.search_tail {
            None => {
                self.search_head = Some(id);
                self.search_tail = Some(id);
            }
            Some(tail) => {
                self.objects[tail.0].search_next = Some(id);
                self.search_tail = Some(id);
            }
        }
    }

    /// Iterate the search list in BFS discovery order.
    pub fn search_list(&self) -> SearchListIter<'_> {
        SearchListIter {
            registry: self,
            next: self.search_head,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }
}

pub struct SearchListIter<'a> {
    registry: &'a Registry,
    next: Option<ObjectId>,
}

impl<'a> Iterator for SearchListIter<'a> {
    type Item = ObjectId;

    fn next(&mut self) -> Option<ObjectId> {
        let id = self.next?;
        self.next = self.registry.get(id).search_next;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{HashIndex, RelocState, SymbolTableView};

    fn obj(name: &str) -> Object {
        Object {
            id: ObjectId(0),
            name: crate::String::from(name),
            name_hash: fnv1a(name.as_bytes()),
            table_prev: None,
            table_next: None,
            search_next: None,
            dynamic: 0,
            slide: 0,
            symbols: SymbolTableView {
                symtab: 0,
                strtab: 0,
                syment: 0,
                hash: HashIndex { nbuckets: 0, buckets: 0, chains: 0 },
            },
            rpath: None,
            runpath: None,
            map_base: 0,
            map_len: 0,
            reloc_state: RelocState::Unrelocated,
            skip_relocation: false,
        }
    }

    #[test]
    fn insert_then_lookup_roundtrips() {
        let mut reg = Registry::new();
        let id = reg.insert(obj("libfoo.so"));
        assert_eq!(reg.lookup(b"libfoo.so"), Some(id));
        assert_eq!(reg.lookup(b"libbar.so"), None);
    }

    #[test]
    fn lookups_are_pointer_stable() {
        let mut reg = Registry::new();
        let id = reg.insert(obj("a"));
        for i in 0..100 {
            let name = alloc::format!("obj{i}");
            reg.insert(obj(&name));
        }
        // The object grew and rehashed several times; the original name
        // must still resolve to the same id (spec §8: "successive lookups
        // with identical names produce pointer-equal record references").
        assert_eq!(reg.lookup(b"a"), Some(id));
    }

    #[test]
    fn grows_past_75_percent_load() {
        let mut reg = Registry::new();
        assert_eq!(reg.capacity(), INITIAL_CAPACITY);
        for i in 0..13 {
            let name = alloc::format!("obj{i}");
            reg.insert(obj(&name));
        }
        // 13 entries in a 16-slot table exceeds the 75% threshold (12),
        // so the table must have already doubled.
        assert!(reg.capacity() > INITIAL_CAPACITY);
    }

    #[test]
    fn search_list_is_append_order() {
        let mut reg = Registry::new();
        let a = reg.insert(obj("a"));
        let b = reg.insert(obj("b"));
        let c = reg.insert(obj("c"));
        reg.append_search(a);
        reg.append_search(b);
        reg.append_search(c);
        let order: alloc::vec::Vec<_> = reg.search_list().collect();
        assert_eq!(order, alloc::vec![a, b, c]);
    }
}

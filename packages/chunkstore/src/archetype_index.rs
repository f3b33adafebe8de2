//! Lookup from component type sets to archetypes.
//!
//! The index is a small open-addressing hash table with linear probing. Keys
//! are exact sorted type sets, so `{A, B}` and `{B, A}` (once sorted) always
//! resolve to the same archetype.

use std::fmt::{self, Debug};
use std::hash::Hasher;

use rustc_hash::FxHasher;

use crate::archetype::ArchetypeId;
use crate::component::ComponentType;
use crate::error::{Result, StorageError};

/// Hash a sorted type set.
fn hash_types(types: &[ComponentType]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write_usize(types.len());
    for ty in types {
        hasher.write_u32(ty.raw());
    }
    hasher.finish()
}

enum IndexSlot {
    Empty,
    Tombstone,
    Occupied {
        hash: u64,
        types: Box<[ComponentType]>,
        archetype: ArchetypeId,
    },
}

impl IndexSlot {
    fn matches(&self, hash: u64, types: &[ComponentType]) -> bool {
        match self {
            IndexSlot::Occupied { hash: h, types: t, .. } => *h == hash && &t[..] == types,
            _ => false,
        }
    }
}

/// An open-addressing map from sorted type sets to archetype ids.
///
/// The slot count is always a power of two. The table grows when fewer than a
/// third of its slots are free and shrinks when fewer than a third hold a
/// live entry.
pub struct ArchetypeIndex {
    slots: Vec<IndexSlot>,
    occupied: usize,
    tombstones: usize,
    min_size: usize,
}

impl ArchetypeIndex {
    /// Create an empty index with `min_size` slots.
    ///
    /// `min_size` is rounded up to a power of two, and is never less than 4.
    pub fn new(min_size: usize) -> ArchetypeIndex {
        let min_size = min_size.max(4).next_power_of_two();
        ArchetypeIndex {
            slots: empty_slots(min_size),
            occupied: 0,
            tombstones: 0,
            min_size,
        }
    }

    /// The number of type sets in the index.
    pub fn len(&self) -> usize {
        self.occupied
    }

    /// Returns true if no type sets are stored.
    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// The current number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The number of slots holding removed entries.
    pub fn tombstones(&self) -> usize {
        self.tombstones
    }

    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    /// Probe for the slot holding `types`.
    fn find(&self, hash: u64, types: &[ComponentType]) -> Option<usize> {
        let mask = self.mask();
        let start = hash as usize & mask;

        for step in 0..self.slots.len() {
            let idx = (start + step) & mask;
            match &self.slots[idx] {
                IndexSlot::Empty => return None,
                slot if slot.matches(hash, types) => return Some(idx),
                _ => {}
            }
        }

        None
    }

    /// Look up the archetype storing exactly `types`.
    pub fn get(&self, types: &[ComponentType]) -> Option<ArchetypeId> {
        let hash = hash_types(types);
        self.find(hash, types).and_then(|idx| match &self.slots[idx] {
            IndexSlot::Occupied { archetype, .. } => Some(*archetype),
            _ => None,
        })
    }

    /// Add a new type set to the index.
    ///
    /// Fails if the type set is already present.
    pub fn insert(&mut self, types: &[ComponentType], archetype: ArchetypeId) -> Result<()> {
        let hash = hash_types(types);
        if self.find(hash, types).is_some() {
            return Err(StorageError::InvalidArgument(
                format!("archetype {:?} is already indexed", types)));
        }

        let free = self.slots.len() - self.occupied - self.tombstones;
        if free.saturating_sub(1) * 3 < self.slots.len() {
            self.resize(self.slots.len() * 2);
        }

        let types = types.to_vec().into_boxed_slice();
        self.place(hash, types, archetype);
        Ok(())
    }

    fn place(&mut self, hash: u64, types: Box<[ComponentType]>, archetype: ArchetypeId) {
        let mask = self.mask();
        let mut idx = hash as usize & mask;

        loop {
            match self.slots[idx] {
                IndexSlot::Occupied { .. } => idx = (idx + 1) & mask,
                IndexSlot::Tombstone => {
                    self.tombstones -= 1;
                    break;
                }
                IndexSlot::Empty => break,
            }
        }

        self.slots[idx] = IndexSlot::Occupied { hash, types, archetype };
        self.occupied += 1;
    }

    /// Remove a type set, returning the archetype it mapped to.
    pub fn remove(&mut self, types: &[ComponentType]) -> Option<ArchetypeId> {
        let hash = hash_types(types);
        let idx = self.find(hash, types)?;

        let archetype = match std::mem::replace(&mut self.slots[idx], IndexSlot::Tombstone) {
            IndexSlot::Occupied { archetype, .. } => archetype,
            _ => return None,
        };
        self.occupied -= 1;
        self.tombstones += 1;

        if self.occupied * 3 < self.slots.len() && self.slots.len() > self.min_size {
            self.resize(self.slots.len() / 2);
        }

        Some(archetype)
    }

    /// Iterate over every indexed type set and its archetype.
    pub fn iter(&self) -> impl Iterator<Item=(&[ComponentType], ArchetypeId)> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            IndexSlot::Occupied { types, archetype, .. } => Some((&types[..], *archetype)),
            _ => None,
        })
    }

    /// Rehash every live entry into a table of `size` slots, dropping
    /// tombstones.
    fn resize(&mut self, size: usize) {
        let size = size.max(self.min_size);
        log::trace!("resizing archetype index from {} to {} slots", self.slots.len(), size);

        let old = std::mem::replace(&mut self.slots, empty_slots(size));
        self.occupied = 0;
        self.tombstones = 0;

        for slot in old {
            if let IndexSlot::Occupied { hash, types, archetype } = slot {
                self.place(hash, types, archetype);
            }
        }
    }
}

fn empty_slots(size: usize) -> Vec<IndexSlot> {
    let mut slots = Vec::with_capacity(size);
    slots.resize_with(size, || IndexSlot::Empty);
    slots
}

impl Debug for ArchetypeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::component::ComponentRegistry;

    fn types(registry: &ComponentRegistry) -> Vec<ComponentType> {
        #[derive(Default)]
        struct A(u32);
        #[derive(Default)]
        struct B(u64);
        #[derive(Default)]
        struct C(u8);

        let mut types = vec![
            registry.register::<A>().unwrap(),
            registry.register::<B>().unwrap(),
            registry.register::<C>().unwrap(),
        ];
        types.sort();
        types
    }

    #[test]
    fn test_insert_get_remove() {
        let registry = ComponentRegistry::new();
        let t = types(&registry);
        let mut index = ArchetypeIndex::new(8);

        index.insert(&[t[0]], ArchetypeId::new(0)).unwrap();
        index.insert(&[t[0], t[1]], ArchetypeId::new(1)).unwrap();
        index.insert(&[], ArchetypeId::new(2)).unwrap();

        assert_eq!(index.len(), 3);
        assert_eq!(index.get(&[t[0]]), Some(ArchetypeId::new(0)));
        assert_eq!(index.get(&[t[0], t[1]]), Some(ArchetypeId::new(1)));
        assert_eq!(index.get(&[]), Some(ArchetypeId::new(2)));
        assert_eq!(index.get(&[t[1]]), None);
        assert_eq!(index.get(&[t[0], t[1], t[2]]), None);

        assert!(matches!(index.insert(&[t[0]], ArchetypeId::new(9)), Err(StorageError::InvalidArgument(_))));

        assert_eq!(index.remove(&[t[0]]), Some(ArchetypeId::new(0)));
        assert_eq!(index.remove(&[t[0]]), None);
        assert_eq!(index.get(&[t[0]]), None);
        assert_eq!(index.get(&[t[0], t[1]]), Some(ArchetypeId::new(1)));
    }

    #[test]
    fn test_probe_past_tombstones() {
        let registry = ComponentRegistry::new();
        let t = types(&registry);
        let mut index = ArchetypeIndex::new(16);
        let sets: Vec<Vec<ComponentType>> = vec![
            vec![t[0]], vec![t[1]], vec![t[2]],
            vec![t[0], t[1]], vec![t[0], t[2]], vec![t[1], t[2]],
        ];

        for (i, set) in sets.iter().enumerate() {
            index.insert(set, ArchetypeId::new(i)).unwrap();
        }
        assert_eq!(index.capacity(), 16);

        for set in sets.iter().step_by(2) {
            assert!(index.remove(set).is_some());
        }
        assert_eq!(index.tombstones(), 3);

        for (i, set) in sets.iter().enumerate().skip(1).step_by(2) {
            assert_eq!(index.get(set), Some(ArchetypeId::new(i)));
        }

        index.insert(&sets[0], ArchetypeId::new(10)).unwrap();
        assert_eq!(index.get(&sets[0]), Some(ArchetypeId::new(10)));
    }

    #[test]
    fn test_grow_and_shrink() {
        let registry = ComponentRegistry::with_max_types(64);
        let mut all = Vec::new();
        macro_rules! register {
            ($($n:ident),*) => {
                $(
                    #[derive(Default)]
                    struct $n(u32);
                    all.push(registry.register::<$n>().unwrap());
                )*
            };
        }
        register!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11);

        let mut index = ArchetypeIndex::new(4);
        assert_eq!(index.capacity(), 4);

        for (i, ty) in all.iter().enumerate() {
            index.insert(&[*ty], ArchetypeId::new(i)).unwrap();
            let free = index.capacity() - index.len() - index.tombstones();
            assert!(free * 3 >= index.capacity(), "{} free of {}", free, index.capacity());
        }
        assert_eq!(index.len(), 12);
        assert_eq!(index.capacity(), 32);

        for (i, ty) in all.iter().enumerate() {
            assert_eq!(index.get(&[*ty]), Some(ArchetypeId::new(i)));
        }

        for ty in all.iter().skip(1) {
            index.remove(&[*ty]).unwrap();
        }
        assert_eq!(index.len(), 1);
        assert_eq!(index.capacity(), 4);
        assert_eq!(index.get(&[all[0]]), Some(ArchetypeId::new(0)));
    }

    #[test]
    fn test_min_size_rounding() {
        assert_eq!(ArchetypeIndex::new(0).capacity(), 4);
        assert_eq!(ArchetypeIndex::new(20).capacity(), 32);
    }
}

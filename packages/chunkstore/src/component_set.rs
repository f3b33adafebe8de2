//! Sorted sets of component types.
//!
//! Archetypes are identified by the exact set of component types they store.
//! The helpers in this module work on strictly ascending slices, which lets
//! every set operation run as a single merge pass.

use std::cmp::Ordering;
use std::ops::Deref;

use crate::component::ComponentType;
use crate::error::{Result, StorageError};

/// Check that `types` is strictly ascending and does not name the entity
/// handle type.
pub fn validate(types: &[ComponentType]) -> Result<()> {
    if types.contains(&ComponentType::ENTITY) {
        return Err(StorageError::InvalidArgument(
            "the entity handle type cannot be added or removed".to_owned()));
    }

    for pair in types.windows(2) {
        match pair[0].cmp(&pair[1]) {
            Ordering::Less => {}
            Ordering::Equal => {
                return Err(StorageError::InvalidArgument(
                    format!("duplicate component type {:?}", pair[0])));
            }
            Ordering::Greater => {
                return Err(StorageError::InvalidArgument(
                    format!("component types {:?} and {:?} are not sorted", pair[0], pair[1])));
            }
        }
    }

    Ok(())
}

/// Merge two sorted sets into their sorted union.
pub fn union(a: &[ComponentType], b: &[ComponentType]) -> Vec<ComponentType> {
    let mut result = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);

    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            Ordering::Less => {
                result.push(a[i]);
                i += 1;
            }
            Ordering::Greater => {
                result.push(b[j]);
                j += 1;
            }
            Ordering::Equal => {
                result.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }

    result.extend_from_slice(&a[i..]);
    result.extend_from_slice(&b[j..]);
    result
}

/// Copy the sorted set `a` without any of the types in the sorted set `b`.
pub fn difference(a: &[ComponentType], b: &[ComponentType]) -> Vec<ComponentType> {
    let mut result = Vec::with_capacity(a.len());
    let mut j = 0;

    for ty in a.iter().copied() {
        while j < b.len() && b[j] < ty {
            j += 1;
        }

        if j < b.len() && b[j] == ty {
            continue;
        }

        result.push(ty);
    }

    result
}

/// Returns true if the sorted set `haystack` contains every type in the sorted
/// set `needles`.
pub fn includes_all(haystack: &[ComponentType], needles: &[ComponentType]) -> bool {
    let mut i = 0;

    for needle in needles {
        while i < haystack.len() && haystack[i] < *needle {
            i += 1;
        }

        if i >= haystack.len() || haystack[i] != *needle {
            return false;
        }
    }

    true
}

/// Returns true if the sorted sets share at least one type.
pub fn intersects(a: &[ComponentType], b: &[ComponentType]) -> bool {
    let (mut i, mut j) = (0, 0);

    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => return true,
        }
    }

    false
}

/// Find the position of every type in `needles` within `haystack`.
///
/// Returns `None` if any type is missing.
pub fn indices_of(haystack: &[ComponentType], needles: &[ComponentType]) -> Option<Vec<usize>> {
    let mut indices = Vec::with_capacity(needles.len());
    let mut i = 0;

    for needle in needles {
        while i < haystack.len() && haystack[i] < *needle {
            i += 1;
        }

        if i >= haystack.len() || haystack[i] != *needle {
            return None;
        }

        indices.push(i);
    }

    Some(indices)
}

/// An owned, sorted set of component types.
///
/// The entity handle type is implicit in every archetype and is never part of
/// a `ComponentSet`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ComponentSet(Vec<ComponentType>);

impl ComponentSet {
    /// Create an empty set.
    pub fn empty() -> ComponentSet {
        ComponentSet(Vec::new())
    }

    /// Create a set from component types in any order.
    ///
    /// Duplicates are rejected rather than merged.
    pub fn new(mut types: Vec<ComponentType>) -> Result<ComponentSet> {
        types.sort();
        validate(&types)?;
        Ok(ComponentSet(types))
    }

    /// Create a set from a slice which is already strictly ascending.
    pub fn from_sorted(types: &[ComponentType]) -> Result<ComponentSet> {
        validate(types)?;
        Ok(ComponentSet(types.to_owned()))
    }

    /// Return the sorted contents of this set.
    pub fn as_slice(&self) -> &[ComponentType] {
        &self.0
    }

    /// Returns true if this set contains the given component type.
    pub fn includes(&self, ty: ComponentType) -> bool {
        self.0.binary_search(&ty).is_ok()
    }

    /// Returns true if this set contains every type in `types`.
    pub fn includes_all(&self, types: &[ComponentType]) -> bool {
        includes_all(&self.0, types)
    }

    /// Insert a component type into this set.
    ///
    /// Returns true if the type was not already present.
    pub fn insert(&mut self, ty: ComponentType) -> Result<bool> {
        validate(&[ty])?;
        match self.0.binary_search(&ty) {
            Ok(_) => Ok(false),
            Err(idx) => {
                self.0.insert(idx, ty);
                Ok(true)
            }
        }
    }

    /// Remove a component type from this set.
    ///
    /// Returns true if the type was present.
    pub fn remove(&mut self, ty: ComponentType) -> bool {
        match self.0.binary_search(&ty) {
            Ok(idx) => {
                self.0.remove(idx);
                true
            }
            Err(_) => false,
        }
    }

    /// Return the union of this set and another.
    pub fn union(&self, other: &ComponentSet) -> ComponentSet {
        ComponentSet(union(&self.0, &other.0))
    }

    /// Return this set without the types in `other`.
    pub fn difference(&self, other: &ComponentSet) -> ComponentSet {
        ComponentSet(difference(&self.0, &other.0))
    }
}

impl Deref for ComponentSet {
    type Target = [ComponentType];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<[ComponentType]> for ComponentSet {
    fn as_ref(&self) -> &[ComponentType] {
        &self.0
    }
}

impl From<ComponentType> for ComponentSet {
    fn from(ty: ComponentType) -> Self {
        ComponentSet(vec![ty])
    }
}

/// Shortcut for building a `ComponentSet` from types in any order.
///
/// Evaluates to a `Result`, failing on duplicates.
#[macro_export]
macro_rules! component_set {
    () => { $crate::component_set::ComponentSet::new(Vec::new()) };
    ($($x:expr),+ $(,)?) => {
        $crate::component_set::ComponentSet::new(vec![$($x),+])
    };
}

//! Entity handles and the table mapping them to storage locations.

use std::fmt::{self, Debug, Formatter};

use bytemuck::{Pod, Zeroable};

use crate::archetype::ArchetypeId;
use crate::error::{Result, StorageError};

/// A handle to a single entity.
///
/// Handles are only meaningful for the `EntityManager` which issued them. A
/// handle stays valid until its entity is destroyed; afterwards the slot may be
/// reused with a newer version.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
pub struct Entity {
    index: i32,
    version: u32,
}

impl Entity {
    /// A handle which never refers to a live entity.
    pub const NULL: Entity = Entity { index: -1, version: 0 };

    /// Construct a handle from its raw parts.
    pub const fn new(index: i32, version: u32) -> Entity {
        Entity { index, version }
    }

    /// The index of this entity in the entity table.
    pub fn index(&self) -> i32 {
        self.index
    }

    /// The version of the entity table slot this handle refers to.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Returns true if this is the null handle.
    pub fn is_null(&self) -> bool {
        self.index < 0
    }
}

impl Default for Entity {
    fn default() -> Self {
        Entity::NULL
    }
}

impl Debug for Entity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Entity(null)")
        } else {
            write!(f, "Entity({}v{})", self.index, self.version)
        }
    }
}

/// Where the components of a live entity are stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntityLocation {
    /// The archetype which owns the entity.
    pub archetype: ArchetypeId,
    /// The dense index of the entity within its archetype.
    pub index: usize,
}

#[derive(Clone, Copy, Debug)]
enum EntitySlot {
    Live { location: Option<EntityLocation> },
    Free { next: Option<u32> },
}

#[derive(Clone, Copy, Debug)]
struct EntityRecord {
    version: u32,
    slot: EntitySlot,
}

/// The table of every entity slot ever allocated.
///
/// Freed slots are chained into a free-list and reused before the table grows.
#[derive(Debug, Default)]
pub(crate) struct EntityTable {
    records: Vec<EntityRecord>,
    free_head: Option<u32>,
    live: usize,
}

impl EntityTable {
    pub fn new() -> EntityTable {
        EntityTable::default()
    }

    /// The number of live entities.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Allocate a live slot with no location.
    pub fn allocate(&mut self) -> Result<Entity> {
        let index = match self.free_head {
            Some(index) => {
                let record = &mut self.records[index as usize];
                self.free_head = match record.slot {
                    EntitySlot::Free { next } => next,
                    EntitySlot::Live { .. } => {
                        return Err(StorageError::out_of_range("free entity", index as usize, self.records.len()));
                    }
                };
                record.slot = EntitySlot::Live { location: None };
                index
            }
            None => {
                if self.records.len() >= i32::MAX as usize {
                    return Err(StorageError::capacity("entity table", i32::MAX as usize));
                }

                self.records.push(EntityRecord {
                    version: 1,
                    slot: EntitySlot::Live { location: None },
                });
                (self.records.len() - 1) as u32
            }
        };

        self.live += 1;
        Ok(Entity::new(index as i32, self.records[index as usize].version))
    }

    /// Release the slot of a live entity, invalidating every handle to it.
    pub fn free(&mut self, entity: Entity) -> Result<()> {
        self.check(entity)?;
        let record = &mut self.records[entity.index as usize];
        record.version = record.version.wrapping_add(1);
        record.slot = EntitySlot::Free { next: self.free_head };
        self.free_head = Some(entity.index as u32);
        self.live -= 1;
        Ok(())
    }

    /// Returns true if `entity` refers to a live slot.
    pub fn is_valid(&self, entity: Entity) -> bool {
        self.check(entity).is_ok()
    }

    fn check(&self, entity: Entity) -> Result<&EntityRecord> {
        if entity.index < 0 {
            return Err(StorageError::InvalidHandle(entity));
        }

        match self.records.get(entity.index as usize) {
            Some(record) if record.version == entity.version
                && matches!(record.slot, EntitySlot::Live { .. }) => Ok(record),
            _ => Err(StorageError::InvalidHandle(entity)),
        }
    }

    /// Look up the storage location of a live entity.
    pub fn location(&self, entity: Entity) -> Result<Option<EntityLocation>> {
        match self.check(entity)?.slot {
            EntitySlot::Live { location } => Ok(location),
            EntitySlot::Free { .. } => Err(StorageError::InvalidHandle(entity)),
        }
    }

    /// Overwrite the storage location of a live entity.
    pub fn set_location(&mut self, entity: Entity, location: Option<EntityLocation>) -> Result<()> {
        self.check(entity)?;
        self.records[entity.index as usize].slot = EntitySlot::Live { location };
        Ok(())
    }

    /// Iterate over every live entity.
    pub fn iter_live(&self) -> impl Iterator<Item=(Entity, Option<EntityLocation>)> + '_ {
        self.records.iter()
            .enumerate()
            .filter_map(|(index, record)| match record.slot {
                EntitySlot::Live { location } => Some((Entity::new(index as i32, record.version), location)),
                EntitySlot::Free { .. } => None,
            })
    }
}

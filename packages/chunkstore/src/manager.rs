//! The entity manager owns every entity and archetype.
//!
//! Entities move between archetypes whenever their component set changes.
//! All structural changes require `&mut EntityManager`; chunk data can be read
//! concurrently through shared references, and written in parallel one chunk
//! per worker through `par_chunks_mut`.

use std::fmt::{self, Debug};
use std::ptr::NonNull;
use std::sync::Arc;

use rayon::iter::IndexedParallelIterator;

use crate::archetype::{Archetype, ArchetypeId, Reservation};
use crate::archetype_index::ArchetypeIndex;
use crate::chunk::{ChunkPool, ChunkViewMut};
use crate::component::{Component, ComponentRegistry, ComponentType};
use crate::component_set::{self, ComponentSet};
use crate::config::StorageConfig;
use crate::entity::{Entity, EntityLocation, EntityTable};
use crate::error::{Result, StorageError};

enum ArchetypeSlot {
    Active(Box<Archetype>),
    Free { next: Option<usize> },
}

impl ArchetypeSlot {
    fn get(&self) -> Option<&Archetype> {
        match self {
            ArchetypeSlot::Active(a) => Some(a),
            ArchetypeSlot::Free { .. } => None,
        }
    }

    fn get_mut(&mut self) -> Option<&mut Archetype> {
        match self {
            ArchetypeSlot::Active(a) => Some(a),
            ArchetypeSlot::Free { .. } => None,
        }
    }
}

/// The owner of a set of entities and their components.
pub struct EntityManager {
    registry: Arc<ComponentRegistry>,
    config: StorageConfig,
    pool: Arc<ChunkPool>,
    entities: EntityTable,
    archetypes: Vec<ArchetypeSlot>,
    free_archetype: Option<usize>,
    active_archetypes: usize,
    index: ArchetypeIndex,
    version: u32,
}

impl EntityManager {
    /// Create a new manager with the default configuration.
    pub fn new(registry: Arc<ComponentRegistry>) -> Result<EntityManager> {
        EntityManager::with_config(registry, StorageConfig::default())
    }

    /// Create a new manager with a custom configuration.
    pub fn with_config(registry: Arc<ComponentRegistry>, config: StorageConfig) -> Result<EntityManager> {
        let pool = Arc::new(ChunkPool::new(config.chunk_size(), config.retained_chunks())?);
        let index = ArchetypeIndex::new(config.index_min_size());

        Ok(EntityManager {
            registry,
            config,
            pool,
            entities: EntityTable::new(),
            archetypes: Vec::new(),
            free_archetype: None,
            active_archetypes: 0,
            index,
            version: 1,
        })
    }

    /// Return the component registry used by this manager.
    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    /// Return the storage configuration.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Return the pool chunks are allocated from.
    pub fn chunk_pool(&self) -> &Arc<ChunkPool> {
        &self.pool
    }

    /// The version stamped onto every column written from now on.
    pub fn global_version(&self) -> u32 {
        self.version
    }

    /// Advance the global version, returning the new value.
    ///
    /// Zero is skipped, since it means "never" to change filters.
    pub fn bump_global_version(&mut self) -> u32 {
        self.version = self.version.wrapping_add(1);
        if self.version == 0 {
            self.version = 1;
        }
        self.version
    }

    /// Return the number of live entities.
    pub fn entity_count(&self) -> usize {
        self.entities.live()
    }

    /// Return the number of archetypes in use.
    pub fn archetype_count(&self) -> usize {
        self.active_archetypes
    }

    /// Get an archetype by id, if it is in use.
    pub fn archetype(&self, id: ArchetypeId) -> Option<&Archetype> {
        self.archetypes.get(id.index()).and_then(|slot| slot.get())
    }

    /// Iterate over every archetype in use.
    pub fn archetypes(&self) -> impl Iterator<Item=&Archetype> + '_ {
        self.archetypes.iter().filter_map(|slot| slot.get())
    }

    /// Iterate over the archetypes containing every type in `all` and none
    /// of the types in `none`.
    ///
    /// Both sets must be strictly ascending.
    pub fn matching_archetypes<'a>(
        &'a self,
        all: &'a [ComponentType],
        none: &'a [ComponentType],
    ) -> Result<impl Iterator<Item=&'a Archetype> + 'a> {
        component_set::validate(all)?;
        component_set::validate(none)?;

        Ok(self.archetypes()
            .filter(move |a| a.has_components(all) && a.lacks_components(none)))
    }

    /// Iterate over the chunks of an archetype for writing.
    ///
    /// Columns borrowed mutably are stamped with the global version.
    pub fn chunks_mut(&mut self, id: ArchetypeId) -> Option<impl Iterator<Item=ChunkViewMut<'_>> + '_> {
        let version = self.version;
        self.archetypes.get_mut(id.index())
            .and_then(|slot| slot.get_mut())
            .map(move |a| a.chunks_mut(version))
    }

    /// Iterate over the chunks of an archetype for writing, in parallel.
    pub fn par_chunks_mut(&mut self, id: ArchetypeId)
        -> Option<impl IndexedParallelIterator<Item=ChunkViewMut<'_>> + '_>
    {
        let version = self.version;
        self.archetypes.get_mut(id.index())
            .and_then(|slot| slot.get_mut())
            .map(move |a| a.par_chunks_mut(version))
    }

    fn archetype_ref(&self, id: ArchetypeId) -> Result<&Archetype> {
        self.archetype(id)
            .ok_or_else(|| StorageError::out_of_range("archetype", id.index(), self.archetypes.len()))
    }

    fn archetype_mut(&mut self, id: ArchetypeId) -> Result<&mut Archetype> {
        let len = self.archetypes.len();
        self.archetypes.get_mut(id.index())
            .and_then(|slot| slot.get_mut())
            .ok_or_else(|| StorageError::out_of_range("archetype", id.index(), len))
    }

    fn archetype_pair_mut(&mut self, a: ArchetypeId, b: ArchetypeId) -> Result<(&mut Archetype, &mut Archetype)> {
        let (ai, bi) = (a.index(), b.index());
        let len = self.archetypes.len();
        if ai == bi || ai.max(bi) >= len {
            return Err(StorageError::out_of_range("archetype", ai.max(bi), len));
        }

        let (lo, hi) = self.archetypes.split_at_mut(ai.max(bi));
        let (low, high) = (&mut lo[ai.min(bi)], &mut hi[0]);
        let (first, second) = if ai < bi { (low, high) } else { (high, low) };

        match (first.get_mut(), second.get_mut()) {
            (Some(first), Some(second)) => Ok((first, second)),
            _ => Err(StorageError::out_of_range("archetype", ai.max(bi), len)),
        }
    }

    /// Find or create the archetype storing exactly `types`.
    ///
    /// `types` must be strictly ascending and must not include the entity
    /// handle type.
    fn resolve_archetype(&mut self, types: &[ComponentType]) -> Result<ArchetypeId> {
        if let Some(id) = self.index.get(types) {
            return Ok(id);
        }

        let mut all = Vec::with_capacity(types.len() + 1);
        all.push(ComponentType::ENTITY);
        all.extend_from_slice(types);
        let registrations = self.registry.registrations(&all)?;

        let slot = self.free_archetype.unwrap_or(self.archetypes.len());
        let id = ArchetypeId::new(slot);
        let archetype = Archetype::new(id, registrations, &self.config, self.pool.clone())?;
        self.index.insert(types, id)?;

        if slot == self.archetypes.len() {
            self.archetypes.push(ArchetypeSlot::Active(Box::new(archetype)));
        } else {
            self.free_archetype = match self.archetypes[slot] {
                ArchetypeSlot::Free { next } => next,
                ArchetypeSlot::Active(_) => {
                    return Err(StorageError::out_of_range("free archetype", slot, self.archetypes.len()));
                }
            };
            self.archetypes[slot] = ArchetypeSlot::Active(Box::new(archetype));
        }

        self.active_archetypes += 1;
        Ok(id)
    }

    /// Return an archetype to the free-list if it no longer holds entities.
    fn recycle_if_empty(&mut self, id: ArchetypeId) {
        let empty = match self.archetype(id) {
            Some(archetype) => archetype.is_empty(),
            None => return,
        };
        if !empty {
            return;
        }

        if let ArchetypeSlot::Active(archetype) = std::mem::replace(
            &mut self.archetypes[id.index()],
            ArchetypeSlot::Free { next: self.free_archetype },
        ) {
            self.index.remove(&archetype.types()[1..]);
            log::debug!("recycled archetype {:?} {:?}", id, &archetype.types()[1..]);
        }

        self.free_archetype = Some(id.index());
        self.active_archetypes -= 1;
    }

    /// Returns true if the handle refers to a live entity.
    pub fn is_valid(&self, entity: Entity) -> bool {
        self.entities.is_valid(entity)
    }

    /// Return the archetype an entity is stored in.
    ///
    /// Entities without components are not stored in any archetype.
    pub fn archetype_of(&self, entity: Entity) -> Result<Option<ArchetypeId>> {
        Ok(self.entities.location(entity)?.map(|l| l.archetype))
    }

    /// Returns true if the entity has at least one component.
    pub fn has_archetype(&self, entity: Entity) -> Result<bool> {
        Ok(self.entities.location(entity)?.is_some())
    }

    /// Return the set of components attached to an entity.
    pub fn component_types(&self, entity: Entity) -> Result<ComponentSet> {
        match self.entities.location(entity)? {
            Some(location) => ComponentSet::from_sorted(&self.archetype_ref(location.archetype)?.types()[1..]),
            None => Ok(ComponentSet::empty()),
        }
    }

    /// Returns true if the entity has a component of type `ty`.
    pub fn has_component(&self, entity: Entity, ty: ComponentType) -> Result<bool> {
        match self.entities.location(entity)? {
            Some(location) => Ok(self.archetype_ref(location.archetype)?.has_component(ty)),
            None => Ok(false),
        }
    }

    /// Returns true if the entity has every component in the sorted set.
    pub fn has_components(&self, entity: Entity, types: &[ComponentType]) -> Result<bool> {
        component_set::validate(types)?;
        match self.entities.location(entity)? {
            Some(location) => Ok(self.archetype_ref(location.archetype)?.has_components(types)),
            None => Ok(types.is_empty()),
        }
    }

    /// Create an entity with no components.
    pub fn create_entity(&mut self) -> Result<Entity> {
        self.entities.allocate()
    }

    /// Create an entity with default values for every type in the sorted set.
    pub fn create_entity_with(&mut self, types: &[ComponentType]) -> Result<Entity> {
        component_set::validate(types)?;
        let entity = self.entities.allocate()?;

        if !types.is_empty() {
            if let Err(err) = self.insert_new(entity, types) {
                self.entities.free(entity)?;
                return Err(err);
            }
        }

        Ok(entity)
    }

    /// Place an entity with no archetype into the archetype for `types`.
    fn insert_new(&mut self, entity: Entity, types: &[ComponentType]) -> Result<()> {
        let id = self.resolve_archetype(types)?;
        let version = self.version;

        let archetype = self.archetype_mut(id)?;
        let type_count = archetype.layout().type_count();
        let index = match archetype.create_entity(version) {
            Ok(index) => index,
            Err(err) => {
                self.recycle_if_empty(id);
                return Err(err);
            }
        };

        let mut slot = Reservation::new(archetype, index, version);
        slot.set_entity(entity)?;
        for type_index in 1..type_count {
            slot.construct(type_index)?;
        }
        let index = slot.commit();

        self.entities.set_location(entity, Some(EntityLocation { archetype: id, index }))
    }

    /// Remove an entity from its archetype, dropping all of its components.
    fn remove_all(&mut self, entity: Entity, location: EntityLocation) -> Result<()> {
        let version = self.version;
        let archetype = self.archetype_mut(location.archetype)?;

        for type_index in 1..archetype.layout().type_count() {
            unsafe { archetype.destruct_at(type_index, location.index)? };
        }

        let displaced = archetype.remove_entity(location.index, version)?;
        if let Some(displaced) = displaced {
            self.entities.set_location(displaced, Some(location))?;
        }

        self.entities.set_location(entity, None)?;
        self.recycle_if_empty(location.archetype);
        Ok(())
    }

    /// Move an entity to the archetype storing exactly `types`.
    fn move_entity(&mut self, entity: Entity, types: &[ComponentType]) -> Result<()> {
        let source = match self.entities.location(entity)? {
            Some(location) => location,
            None if types.is_empty() => return Ok(()),
            None => return self.insert_new(entity, types),
        };

        if types.is_empty() {
            return self.remove_all(entity, source);
        }

        let target = self.resolve_archetype(types)?;
        if target == source.archetype {
            return Ok(());
        }

        let version = self.version;
        let (src, dst) = self.archetype_pair_mut(source.archetype, target)?;
        let index = match dst.create_entity(version) {
            Ok(index) => index,
            Err(err) => {
                self.recycle_if_empty(target);
                return Err(err);
            }
        };

        let src_types = src.types().to_vec();
        let dst_types = dst.types().to_vec();
        let mut slot = Reservation::new(dst, index, version);

        // Every default is built before any shared value is copied. Until the
        // slot commits, the source owns every shared value.
        let mut shared = Vec::new();
        let mut source_only = Vec::new();
        let (mut i, mut j) = (0, 0);

        while i < src_types.len() || j < dst_types.len() {
            if j >= dst_types.len() || (i < src_types.len() && src_types[i] < dst_types[j]) {
                source_only.push(i);
                i += 1;
            } else if i >= src_types.len() || dst_types[j] < src_types[i] {
                slot.construct(j)?;
                j += 1;
            } else {
                shared.push((i, j));
                i += 1;
                j += 1;
            }
        }

        for (i, j) in shared {
            let bytes = src.component_bytes(i, source.index)?.as_ptr();
            unsafe { slot.copy_from(j, bytes)? };
        }
        let index = slot.commit();

        for type_index in source_only {
            unsafe { src.destruct_at(type_index, source.index)? };
        }

        let displaced = src.remove_entity(source.index, version)?;
        if let Some(displaced) = displaced {
            self.entities.set_location(displaced, Some(source))?;
        }

        self.entities.set_location(entity, Some(EntityLocation { archetype: target, index }))?;
        self.recycle_if_empty(source.archetype);
        Ok(())
    }

    /// Add a component with its default value.
    ///
    /// Does nothing if the entity already has the component.
    pub fn add_component(&mut self, entity: Entity, ty: ComponentType) -> Result<()> {
        self.add_components(entity, &[ty])
    }

    /// Add default values for every component in the sorted set which the
    /// entity does not already have.
    pub fn add_components(&mut self, entity: Entity, types: &[ComponentType]) -> Result<()> {
        component_set::validate(types)?;
        let current = self.component_types(entity)?;
        let target = component_set::union(&current, types);
        if target.len() == current.len() {
            return Ok(());
        }

        log::trace!("adding {:?} to {:?}", types, entity);
        self.move_entity(entity, &target)
    }

    /// Remove a component, dropping its value.
    ///
    /// Does nothing if the entity does not have the component.
    pub fn remove_component(&mut self, entity: Entity, ty: ComponentType) -> Result<()> {
        self.remove_components(entity, &[ty])
    }

    /// Remove every component in the sorted set from the entity.
    pub fn remove_components(&mut self, entity: Entity, types: &[ComponentType]) -> Result<()> {
        component_set::validate(types)?;
        let current = self.component_types(entity)?;
        let target = component_set::difference(&current, types);
        if target.len() == current.len() {
            return Ok(());
        }

        log::trace!("removing {:?} from {:?}", types, entity);
        self.move_entity(entity, &target)
    }

    /// Destroy an entity and all of its components.
    ///
    /// The handle, and every copy of it, becomes invalid.
    pub fn destroy_entity(&mut self, entity: Entity) -> Result<()> {
        if let Some(location) = self.entities.location(entity)? {
            self.remove_all(entity, location)?;
        }
        self.entities.free(entity)
    }

    /// Get the raw bytes of one component of an entity.
    ///
    /// Returns `None` if the entity does not have the component.
    ///
    /// # Safety
    /// The component type must have no padding bytes, since those are
    /// uninitialised. Use `get` for typed access.
    pub unsafe fn component(&self, entity: Entity, ty: ComponentType) -> Result<Option<&[u8]>> {
        let location = match self.entities.location(entity)? {
            Some(location) => location,
            None => return Ok(None),
        };

        let archetype = self.archetype_ref(location.archetype)?;
        match archetype.index_of(ty) {
            Some(type_index) => archetype.component_bytes(type_index, location.index).map(Some),
            None => Ok(None),
        }
    }

    /// Get the raw bytes of one component of an entity for writing.
    ///
    /// The column of the entity's chunk is stamped with the global version.
    ///
    /// # Safety
    /// The component type must have no padding bytes, and the bytes must hold
    /// a valid value of that type when the borrow ends. Overwriting the bytes
    /// does not drop the old value. Use `get_mut` for typed access.
    pub unsafe fn component_mut(&mut self, entity: Entity, ty: ComponentType) -> Result<Option<&mut [u8]>> {
        if ty == ComponentType::ENTITY {
            return Err(StorageError::InvalidArgument("entity handles are read-only".to_owned()));
        }

        let location = match self.entities.location(entity)? {
            Some(location) => location,
            None => return Ok(None),
        };

        let version = self.version;
        let archetype = self.archetype_mut(location.archetype)?;
        match archetype.index_of(ty) {
            Some(type_index) => archetype.component_bytes_mut(type_index, location.index, version).map(Some),
            None => Ok(None),
        }
    }

    /// Get a reference to the `T` component of an entity.
    pub fn get<T: Component>(&self, entity: Entity) -> Result<Option<&T>> {
        let ty = match self.registry.lookup::<T>() {
            Some(ty) => ty,
            None => {
                self.entities.location(entity)?;
                return Ok(None);
            }
        };

        unsafe {
            Ok(self.component(entity, ty)?.map(|bytes| &*value_ptr::<T>(bytes.as_ptr() as *mut u8)))
        }
    }

    /// Get a mutable reference to the `T` component of an entity.
    pub fn get_mut<T: Component>(&mut self, entity: Entity) -> Result<Option<&mut T>> {
        let ty = match self.registry.lookup::<T>() {
            Some(ty) => ty,
            None => {
                self.entities.location(entity)?;
                return Ok(None);
            }
        };

        unsafe {
            Ok(self.component_mut(entity, ty)?.map(|bytes| &mut *value_ptr::<T>(bytes.as_mut_ptr())))
        }
    }

    /// Set the `T` component of an entity, adding it if it is missing.
    pub fn set<T: Component>(&mut self, entity: Entity, value: T) -> Result<()> {
        let ty = self.registry.register::<T>()?;
        self.add_component(entity, ty)?;

        match self.get_mut::<T>(entity)? {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(StorageError::InvalidArgument(format!("{:?} is not a {}", ty, std::any::type_name::<T>()))),
        }
    }
}

/// Turn the address of a stored value into a typed pointer.
///
/// Zero sized values have no storage, so any well aligned pointer will do.
fn value_ptr<T>(ptr: *mut u8) -> *mut T {
    if std::mem::size_of::<T>() == 0 {
        NonNull::<T>::dangling().as_ptr()
    } else {
        ptr as *mut T
    }
}

impl Debug for EntityManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "EntityManager {{ entities: {}, archetypes: {}, version: {} }}",
                 self.entity_count(), self.archetype_count(), self.version)?;

        for archetype in self.archetypes() {
            writeln!(f, "  {:?}", archetype)?;
            for (i, chunk) in archetype.chunks().enumerate() {
                let versions: Vec<_> = archetype.types().iter()
                    .filter_map(|ty| chunk.version(*ty))
                    .collect();
                writeln!(f, "    chunk #{}: {} entities, versions {:?}", i, chunk.len(), versions)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::component_set;

    #[derive(Default, Clone, Copy, Debug, PartialEq)]
    struct A(i32);
    #[derive(Default, Clone, Copy, Debug, PartialEq)]
    struct B(f64);
    #[derive(Default, Clone, Copy, Debug, PartialEq)]
    struct C(u8);
    #[derive(Default, Debug, PartialEq)]
    struct Tag;

    struct Fixture {
        manager: EntityManager,
        a: ComponentType,
        b: ComponentType,
        c: ComponentType,
        tag: ComponentType,
    }

    fn fixture() -> Fixture {
        fixture_with(StorageConfig::new())
    }

    fn fixture_with(config: StorageConfig) -> Fixture {
        let registry = Arc::new(ComponentRegistry::new());
        let a = registry.register::<A>().unwrap();
        let b = registry.register::<B>().unwrap();
        let c = registry.register::<C>().unwrap();
        let tag = registry.register::<Tag>().unwrap();
        let manager = EntityManager::with_config(registry, config).unwrap();
        Fixture { manager, a, b, c, tag }
    }

    fn check_locations(manager: &EntityManager) {
        for (entity, location) in manager.entities.iter_live() {
            if let Some(location) = location {
                let archetype = manager.archetype(location.archetype).unwrap();
                assert_eq!(archetype.entity_at(location.index).unwrap(), entity);
            }
        }
    }

    #[test]
    fn test_create_with_components() {
        let Fixture { mut manager, a, b, tag, .. } = fixture();
        let set = component_set![tag, b, a].unwrap();
        let e = manager.create_entity_with(&set).unwrap();

        assert!(manager.has_component(e, a).unwrap());
        assert!(manager.has_components(e, &set).unwrap());
        assert_eq!(manager.get::<A>(e).unwrap(), Some(&A(0)));
        assert_eq!(manager.get::<Tag>(e).unwrap(), Some(&Tag));
        assert_eq!(unsafe { manager.component(e, a) }.unwrap(), Some(&[0u8; 4][..]));
        assert_eq!(manager.component_types(e).unwrap(), set);
        assert_eq!(manager.entity_count(), 1);
        assert_eq!(manager.archetype_count(), 1);

        let empty = manager.create_entity().unwrap();
        assert!(!manager.has_archetype(empty).unwrap());
        assert!(manager.has_components(empty, &[]).unwrap());
        assert_eq!(unsafe { manager.component(empty, a) }.unwrap(), None);
        assert_eq!(manager.archetype_count(), 1);
    }

    #[test]
    fn test_unsorted_sets_are_rejected() {
        let Fixture { mut manager, a, b, .. } = fixture();
        let mut set = vec![a, b];
        set.sort();
        set.reverse();

        assert!(matches!(manager.create_entity_with(&set), Err(StorageError::InvalidArgument(_))));
        assert!(matches!(manager.create_entity_with(&[a, a]), Err(StorageError::InvalidArgument(_))));
        assert!(matches!(manager.create_entity_with(&[ComponentType::ENTITY]), Err(StorageError::InvalidArgument(_))));
        assert_eq!(manager.entity_count(), 0);

        let e = manager.create_entity().unwrap();
        assert!(matches!(manager.add_components(e, &set), Err(StorageError::InvalidArgument(_))));
        assert!(matches!(manager.remove_component(e, ComponentType::ENTITY), Err(StorageError::InvalidArgument(_))));
        assert!(!manager.has_archetype(e).unwrap());

        let both = manager.create_entity_with(&component_set![a, b].unwrap()).unwrap();
        assert!(manager.has_components(both, &component_set![b, a].unwrap()).unwrap());
        assert!(matches!(manager.has_components(both, &set), Err(StorageError::InvalidArgument(_))));
        assert!(matches!(manager.has_components(e, &set), Err(StorageError::InvalidArgument(_))));
        assert!(matches!(manager.has_components(both, &[a, a]), Err(StorageError::InvalidArgument(_))));
    }

    #[test]
    fn test_add_keeps_values() {
        let Fixture { mut manager, a, b, c, .. } = fixture();
        let e = manager.create_entity_with(&component_set![a, b].unwrap()).unwrap();
        *manager.get_mut::<A>(e).unwrap().unwrap() = A(7);
        *manager.get_mut::<B>(e).unwrap().unwrap() = B(2.5);

        manager.add_components(e, &[c]).unwrap();

        assert!(manager.has_component(e, a).unwrap());
        assert!(manager.has_component(e, b).unwrap());
        assert!(manager.has_component(e, c).unwrap());
        assert_eq!(manager.get::<A>(e).unwrap(), Some(&A(7)));
        assert_eq!(manager.get::<B>(e).unwrap(), Some(&B(2.5)));
        assert_eq!(manager.get::<C>(e).unwrap(), Some(&C(0)));

        let id = manager.archetype_of(e).unwrap().unwrap();
        let mut expected = vec![ComponentType::ENTITY, a, b, c];
        expected.sort();
        assert_eq!(manager.archetype(id).unwrap().types(), &expected[..]);
    }

    #[test]
    fn test_remove_last_component() {
        let Fixture { mut manager, a, .. } = fixture();
        let e = manager.create_entity_with(&[a]).unwrap();
        manager.remove_components(e, &[a]).unwrap();

        assert!(!manager.has_archetype(e).unwrap());
        assert!(!manager.has_component(e, a).unwrap());
        assert!(manager.is_valid(e));
        assert_eq!(manager.archetype_count(), 0);
    }

    #[test]
    fn test_archetype_identity() {
        let Fixture { mut manager, a, b, .. } = fixture();
        let first = manager.create_entity_with(&component_set![a, b].unwrap()).unwrap();
        let second = manager.create_entity_with(&component_set![b, a].unwrap()).unwrap();
        let third = manager.create_entity_with(&[a]).unwrap();
        manager.add_component(third, b).unwrap();

        let id = manager.archetype_of(first).unwrap();
        assert_eq!(manager.archetype_of(second).unwrap(), id);
        assert_eq!(manager.archetype_of(third).unwrap(), id);
        assert_eq!(manager.archetype_count(), 1);
    }

    #[test]
    fn test_round_trip() {
        let Fixture { mut manager, a, b, c, .. } = fixture();
        let base = component_set![a].unwrap();
        let extra = component_set![b, c].unwrap();

        let others: Vec<_> = (0..5).map(|_| manager.create_entity_with(&base).unwrap()).collect();
        let e = manager.create_entity_with(&base).unwrap();
        manager.set(e, A(42)).unwrap();
        let home = manager.archetype_of(e).unwrap();

        manager.add_components(e, &extra).unwrap();
        assert_ne!(manager.archetype_of(e).unwrap(), home);
        manager.remove_components(e, &extra).unwrap();

        assert_eq!(manager.archetype_of(e).unwrap(), home);
        assert_eq!(manager.component_types(e).unwrap(), base);
        assert_eq!(manager.get::<A>(e).unwrap(), Some(&A(42)));
        for other in others {
            assert_eq!(manager.get::<A>(other).unwrap(), Some(&A(0)));
        }
        check_locations(&manager);
    }

    #[test]
    fn test_add_is_idempotent() {
        let Fixture { mut manager, a, b, .. } = fixture();
        let e = manager.create_entity_with(&component_set![a, b].unwrap()).unwrap();
        let before = manager.entities.location(e).unwrap();
        let version = manager.archetype(before.unwrap().archetype).unwrap().chunk_version(0, 1).unwrap();

        manager.bump_global_version();
        manager.add_components(e, &[a]).unwrap();
        manager.add_component(e, b).unwrap();
        manager.remove_components(e, &[]).unwrap();

        assert_eq!(manager.entities.location(e).unwrap(), before);
        assert_eq!(manager.archetype(before.unwrap().archetype).unwrap().chunk_version(0, 1).unwrap(), version);
    }

    #[test]
    fn test_destroy_patches_displaced() {
        let Fixture { mut manager, a, .. } = fixture();
        let entities: Vec<_> = (0..10).map(|i| {
            let e = manager.create_entity_with(&[a]).unwrap();
            manager.set(e, A(i)).unwrap();
            e
        }).collect();

        manager.destroy_entity(entities[2]).unwrap();
        manager.destroy_entity(entities[0]).unwrap();
        check_locations(&manager);

        assert!(!manager.is_valid(entities[2]));
        assert_eq!(manager.get::<A>(entities[9]).unwrap(), Some(&A(9)));
        assert_eq!(manager.get::<A>(entities[8]).unwrap(), Some(&A(8)));
        assert_eq!(manager.entities.location(entities[9]).unwrap().unwrap().index, 2);
        assert_eq!(manager.entity_count(), 8);
    }

    #[test]
    fn test_stale_handles() {
        let Fixture { mut manager, a, .. } = fixture();
        let e = manager.create_entity_with(&[a]).unwrap();
        manager.destroy_entity(e).unwrap();

        assert!(!manager.is_valid(e));
        assert_eq!(manager.has_component(e, a), Err(StorageError::InvalidHandle(e)));
        assert_eq!(unsafe { manager.component(e, a) }, Err(StorageError::InvalidHandle(e)));
        assert_eq!(manager.add_component(e, a), Err(StorageError::InvalidHandle(e)));
        assert_eq!(manager.destroy_entity(e), Err(StorageError::InvalidHandle(e)));
        assert_eq!(manager.get::<A>(e), Err(StorageError::InvalidHandle(e)));
        assert_eq!(manager.get::<Vec<u32>>(e), Err(StorageError::InvalidHandle(e)));

        let reused = manager.create_entity().unwrap();
        assert_eq!(reused.index(), e.index());
        assert_ne!(reused.version(), e.version());
        assert!(manager.is_valid(reused));
        assert!(!manager.is_valid(Entity::NULL));
    }

    #[test]
    fn test_archetypes_are_recycled() {
        let Fixture { mut manager, a, b, c, .. } = fixture();
        let e = manager.create_entity_with(&[a]).unwrap();
        let first = manager.archetype_of(e).unwrap().unwrap();

        manager.add_component(e, b).unwrap();
        assert!(manager.archetype(first).is_none());
        assert_eq!(manager.archetype_count(), 1);

        let f = manager.create_entity_with(&[c]).unwrap();
        assert_eq!(manager.archetype_of(f).unwrap(), Some(first));
        assert_eq!(manager.archetype(first).unwrap().types()[1..], [c]);
        assert_eq!(manager.archetype_count(), 2);
    }

    #[test]
    fn test_component_mut_stamps_version() {
        let Fixture { mut manager, a, b, .. } = fixture();
        let e = manager.create_entity_with(&component_set![a, b].unwrap()).unwrap();
        let id = manager.archetype_of(e).unwrap().unwrap();
        let since = manager.global_version();
        let a_index = manager.archetype(id).unwrap().index_of(a).unwrap();
        let b_index = manager.archetype(id).unwrap().index_of(b).unwrap();

        let version = manager.bump_global_version();
        unsafe { manager.component_mut(e, a) }.unwrap().unwrap().copy_from_slice(&5i32.to_ne_bytes());

        let archetype = manager.archetype(id).unwrap();
        assert_eq!(archetype.chunk_version(0, a_index).unwrap(), version);
        assert!(archetype.chunk(0).unwrap().did_change(a, since));
        assert!(!archetype.chunk(0).unwrap().did_change(b, since));
        assert_eq!(archetype.chunk_version(0, b_index).unwrap(), since);
        assert_eq!(manager.get::<A>(e).unwrap(), Some(&A(5)));
        assert!(unsafe { manager.component_mut(e, ComponentType::ENTITY) }.is_err());
    }

    #[test]
    fn test_matching_archetypes() {
        let Fixture { mut manager, a, b, c, tag } = fixture();
        manager.create_entity_with(&[a]).unwrap();
        manager.create_entity_with(&component_set![a, b].unwrap()).unwrap();
        manager.create_entity_with(&component_set![a, c, tag].unwrap()).unwrap();
        manager.create_entity_with(&[b]).unwrap();

        let count = |all: &[ComponentType], none: &[ComponentType]| {
            manager.matching_archetypes(all, none).unwrap().count()
        };
        assert_eq!(count(&[a], &[]), 3);
        assert_eq!(count(&[a], &[b]), 2);
        assert_eq!(count(&[a], &component_set![b, tag].unwrap()), 1);
        assert_eq!(count(&[], &[]), 4);
        assert!(manager.matching_archetypes(&[a, a], &[]).is_err());
    }

    #[test]
    fn test_parallel_chunk_writes() {
        use rayon::iter::ParallelIterator;

        let Fixture { mut manager, a, .. } = fixture_with(StorageConfig::new().with_chunk_size(1024));
        let entities: Vec<_> = (0..500).map(|_| manager.create_entity_with(&[a]).unwrap()).collect();
        let id = manager.archetype_of(entities[0]).unwrap().unwrap();
        assert!(manager.archetype(id).unwrap().chunk_count() > 1);

        manager.par_chunks_mut(id).unwrap().for_each(|mut chunk| {
            for value in chunk.components_mut::<A>(a).unwrap() {
                value.0 += 3;
            }
        });
        for chunk in manager.chunks_mut(id).unwrap() {
            assert!(!chunk.is_empty());
        }

        for e in entities {
            assert_eq!(manager.get::<A>(e).unwrap(), Some(&A(3)));
        }
    }

    #[test]
    fn test_capacity_failure_leaves_entity_intact() {
        let Fixture { mut manager, a, b, .. } = fixture_with(
            StorageConfig::new().with_chunk_size(256).with_max_chunks_per_archetype(1));
        let ab = component_set![a, b].unwrap();
        let e = manager.create_entity_with(&[a]).unwrap();
        manager.set(e, A(11)).unwrap();

        let cap = manager.archetype(manager.archetype_of(e).unwrap().unwrap()).unwrap().chunk_capacity();
        let filler = manager.create_entity_with(&ab).unwrap();
        let ab_id = manager.archetype_of(filler).unwrap().unwrap();
        while manager.archetype(ab_id).unwrap().count() < manager.archetype(ab_id).unwrap().chunk_capacity() {
            manager.create_entity_with(&ab).unwrap();
        }
        assert!(cap >= 2);

        let result = manager.add_component(e, b);
        assert!(matches!(result, Err(StorageError::CapacityExceeded { .. })));
        assert_eq!(manager.component_types(e).unwrap().as_slice(), &[a]);
        assert_eq!(manager.get::<A>(e).unwrap(), Some(&A(11)));
        check_locations(&manager);
    }

    #[test]
    fn test_destructors_run_once() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        #[derive(Default)]
        struct Counted(#[allow(dead_code)] Box<u32>);

        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let registry = Arc::new(ComponentRegistry::new());
        let counted = registry.register::<Counted>().unwrap();
        let a = registry.register::<A>().unwrap();
        let mut manager = EntityManager::new(registry).unwrap();

        let entities: Vec<_> = (0..20).map(|_| manager.create_entity_with(&[counted]).unwrap()).collect();
        for e in entities.iter().take(10) {
            manager.add_component(*e, a).unwrap();
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 0);

        manager.set(entities[0], Counted(Box::new(3))).unwrap();
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);

        manager.destroy_entity(entities[1]).unwrap();
        manager.remove_component(entities[15], counted).unwrap();
        assert_eq!(DROPS.load(Ordering::SeqCst), 3);

        drop(manager);
        assert_eq!(DROPS.load(Ordering::SeqCst), 3 + 18);
    }

    #[test]
    fn test_panicking_default_is_unwound() {
        use std::panic::{catch_unwind, AssertUnwindSafe};

        static KEPT_DROPS: AtomicUsize = AtomicUsize::new(0);
        static FAILED_DROPS: AtomicUsize = AtomicUsize::new(0);

        #[derive(Default)]
        struct Kept(#[allow(dead_code)] Box<u32>);

        impl Drop for Kept {
            fn drop(&mut self) {
                KEPT_DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        struct Failing(#[allow(dead_code)] Box<u32>);

        impl Default for Failing {
            fn default() -> Failing {
                panic!("no default for Failing")
            }
        }

        impl Drop for Failing {
            fn drop(&mut self) {
                FAILED_DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let registry = Arc::new(ComponentRegistry::new());
        let kept = registry.register::<Kept>().unwrap();
        let failing = registry.register::<Failing>().unwrap();
        let a = registry.register::<A>().unwrap();
        let mut manager = EntityManager::new(registry).unwrap();

        let e = manager.create_entity_with(&component_set![kept, a].unwrap()).unwrap();
        manager.set(e, A(6)).unwrap();
        let home = manager.archetype_of(e).unwrap();

        let result = catch_unwind(AssertUnwindSafe(|| manager.add_component(e, failing)));
        assert!(result.is_err());
        assert_eq!(manager.archetype_of(e).unwrap(), home);
        assert_eq!(manager.get::<A>(e).unwrap(), Some(&A(6)));
        assert!(!manager.has_component(e, failing).unwrap());
        check_locations(&manager);
        assert_eq!(KEPT_DROPS.load(Ordering::SeqCst), 0);

        let set = component_set![kept, failing].unwrap();
        let result = catch_unwind(AssertUnwindSafe(|| manager.create_entity_with(&set)));
        assert!(result.is_err());
        assert_eq!(KEPT_DROPS.load(Ordering::SeqCst), 1);
        check_locations(&manager);

        manager.remove_component(e, a).unwrap();
        assert_eq!(KEPT_DROPS.load(Ordering::SeqCst), 1);

        drop(manager);
        assert_eq!(KEPT_DROPS.load(Ordering::SeqCst), 2);
        assert_eq!(FAILED_DROPS.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_raw_bytes_of_plain_components() {
        let Fixture { mut manager, a, b, .. } = fixture();
        let e = manager.create_entity_with(&component_set![a, b].unwrap()).unwrap();

        // `A` wraps an `i32`, so every byte pattern is a valid value.
        unsafe {
            let bytes = manager.component_mut(e, a).unwrap().unwrap();
            assert_eq!(bytes.len(), std::mem::size_of::<A>());
            bytes.copy_from_slice(&(-3i32).to_ne_bytes());
        }
        assert_eq!(manager.get::<A>(e).unwrap(), Some(&A(-3)));

        manager.get_mut::<B>(e).unwrap().unwrap().0 = 1.5;
        let raw = unsafe { manager.component(e, b) }.unwrap().unwrap();
        assert_eq!(raw, &1.5f64.to_ne_bytes()[..]);
    }

    #[test]
    fn test_debug_dump() {
        let Fixture { mut manager, a, .. } = fixture();
        manager.create_entity_with(&[a]).unwrap();
        let dump = format!("{:?}", manager);
        assert!(dump.contains("entities: 1"));
        assert!(dump.contains("chunk #0: 1 entities"));
    }
}

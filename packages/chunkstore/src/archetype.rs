//! Archetypes are the 'layout' of entities, containing a list of the attached
//! components.
//!
//! Every entity with exactly the same component set lives in the same
//! archetype. The archetype packs its entities densely into chunks: only the
//! last chunk may be partially filled, and removing an entity fills the hole
//! with the archetype's last entity.

use std::fmt::{self, Debug};
use std::ops::Range;
use std::sync::Arc;

use rayon::iter::{IndexedParallelIterator, IntoParallelRefIterator, IntoParallelRefMutIterator, ParallelIterator};

use crate::chunk::{Chunk, ChunkPool, ChunkView, ChunkViewMut};
use crate::component::{ComponentRegistration, ComponentType};
use crate::component_set;
use crate::config::{StorageConfig, COLUMN_ALIGN};
use crate::entity::Entity;
use crate::error::{Result, StorageError};

/// The unique id of an archetype within its `EntityManager`.
///
/// Ids of recycled archetypes are reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ArchetypeId(u32);

impl ArchetypeId {
    /// Construct an id from its index.
    pub fn new(index: usize) -> ArchetypeId {
        ArchetypeId(index as u32)
    }

    /// Return the index of this archetype in its manager.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// The layout of the columns of each chunk in an archetype.
///
/// Column `i` of a chunk starts at `offsets()[i]` and holds `capacity()`
/// values of `sizes()[i]` bytes. Column 0 always holds the entity handles.
pub struct ChunkLayout {
    types: Vec<ComponentType>,
    registrations: Vec<ComponentRegistration>,
    sizes: Vec<usize>,
    offsets: Vec<usize>,
    capacity: usize,
}

impl ChunkLayout {
    /// Compute the layout for a sorted list of registrations.
    pub(crate) fn new(registrations: Vec<ComponentRegistration>, buffer_size: usize) -> Result<ChunkLayout> {
        let types: Vec<_> = registrations.iter().map(|r| r.component_type()).collect();
        let sizes: Vec<_> = registrations.iter().map(|r| r.size()).collect();

        let total: usize = sizes.iter().sum();
        let mut capacity = if total == 0 { 0 } else { buffer_size / total };

        // Column padding can push the naive estimate over the buffer.
        while capacity > 0 && ChunkLayout::required_size(&sizes, capacity) > buffer_size {
            capacity -= 1;
        }

        if capacity < 2 {
            return Err(StorageError::capacity("chunk component bytes", buffer_size));
        }

        let mut offsets = Vec::with_capacity(sizes.len());
        let mut offset = 0;
        for size in sizes.iter() {
            offsets.push(offset);
            offset += ChunkLayout::aligned_size(*size, capacity);
        }

        Ok(ChunkLayout {
            types,
            registrations,
            sizes,
            offsets,
            capacity,
        })
    }

    /// The size of a column of `count` values of `size` bytes, padded to the
    /// column alignment.
    pub fn aligned_size(size: usize, count: usize) -> usize {
        (size * count + COLUMN_ALIGN - 1) & !(COLUMN_ALIGN - 1)
    }

    /// The number of bytes needed to store `capacity` entities.
    pub fn required_size(sizes: &[usize], capacity: usize) -> usize {
        sizes.iter().map(|size| ChunkLayout::aligned_size(*size, capacity)).sum()
    }

    /// Return the maximum number of entities in one chunk.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Return the sorted component types, entity handle first.
    pub fn types(&self) -> &[ComponentType] {
        &self.types
    }

    /// Return the registration of each column.
    pub fn registrations(&self) -> &[ComponentRegistration] {
        &self.registrations
    }

    /// Return the size in bytes of a single value in each column.
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Return the byte offset of each column from the start of chunk data.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Return the number of columns, including the entity handle column.
    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    /// Find the column index of a component type.
    pub fn index_of(&self, ty: ComponentType) -> Option<usize> {
        self.types.binary_search(&ty).ok()
    }

    /// The byte range of the first `len` values of a column.
    pub fn column_range(&self, type_index: usize, len: usize) -> Result<Range<usize>> {
        if type_index >= self.types.len() {
            return Err(StorageError::out_of_range("component", type_index, self.types.len()));
        }
        if len > self.capacity {
            return Err(StorageError::out_of_range("chunk entity", len, self.capacity));
        }

        let start = self.offsets[type_index];
        Ok(start..start + self.sizes[type_index] * len)
    }

    /// The byte range of a single value in a column.
    pub fn component_range(&self, type_index: usize, in_chunk: usize) -> Result<Range<usize>> {
        if type_index >= self.types.len() {
            return Err(StorageError::out_of_range("component", type_index, self.types.len()));
        }
        if in_chunk >= self.capacity {
            return Err(StorageError::out_of_range("chunk entity", in_chunk, self.capacity));
        }

        let size = self.sizes[type_index];
        let start = self.offsets[type_index] + size * in_chunk;
        Ok(start..start + size)
    }
}

impl Debug for ChunkLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkLayout")
            .field("types", &self.types)
            .field("sizes", &self.sizes)
            .field("offsets", &self.offsets)
            .field("capacity", &self.capacity)
            .finish()
    }
}

fn chunk_pair(chunks: &mut [Chunk], src: usize, dst: usize) -> (&Chunk, &mut Chunk) {
    if src < dst {
        let (a, b) = chunks.split_at_mut(dst);
        (&a[src], &mut b[0])
    } else {
        let (a, b) = chunks.split_at_mut(src);
        (&b[0], &mut a[dst])
    }
}

/// An archetype represents a particular layout of an entity.
///
/// It owns the chunks storing every entity with exactly its component set.
pub struct Archetype {
    id: ArchetypeId,
    layout: ChunkLayout,
    chunks: Vec<Chunk>,
    count: usize,
    max_chunks: usize,
    pool: Arc<ChunkPool>,
}

impl Archetype {
    /// Create a new archetype from the registrations of its component types.
    ///
    /// The registrations must be sorted by component type, starting with the
    /// entity handle.
    pub fn new(
        id: ArchetypeId,
        registrations: Vec<ComponentRegistration>,
        config: &StorageConfig,
        pool: Arc<ChunkPool>,
    ) -> Result<Archetype> {
        if registrations.is_empty() {
            return Err(StorageError::InvalidArgument("archetypes need at least one component type".to_owned()));
        }
        if registrations.len() > config.max_archetype_types() {
            return Err(StorageError::capacity("archetype component types", config.max_archetype_types()));
        }
        if registrations[0].component_type() != ComponentType::ENTITY {
            return Err(StorageError::InvalidArgument("archetypes must start with the entity handle".to_owned()));
        }

        let types: Vec<_> = registrations[1..].iter().map(|r| r.component_type()).collect();
        component_set::validate(&types)?;

        let layout = ChunkLayout::new(registrations, config.chunk_buffer_size())?;
        log::debug!("created archetype {:?} {:?} with {} entities per chunk",
                    id, layout.types(), layout.capacity());

        Ok(Archetype {
            id,
            layout,
            chunks: Vec::new(),
            count: 0,
            max_chunks: config.max_chunks_per_archetype(),
            pool,
        })
    }

    /// Return the unique archetype ID for this manager.
    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    /// Return the chunk layout of this archetype.
    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    /// Return the sorted list of component types, entity handle first.
    pub fn types(&self) -> &[ComponentType] {
        self.layout.types()
    }

    /// Return the column offsets of each chunk.
    pub fn offsets(&self) -> &[usize] {
        self.layout.offsets()
    }

    /// Return the value size of each column.
    pub fn sizes(&self) -> &[usize] {
        self.layout.sizes()
    }

    /// Get the maximum number of entities per chunk.
    pub fn chunk_capacity(&self) -> usize {
        self.layout.capacity()
    }

    /// Return the number of entities in this archetype.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns true if this archetype holds no entities.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Return the number of chunks currently owned by this archetype.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Returns true if this archetype contains the given component type.
    pub fn has_component(&self, ty: ComponentType) -> bool {
        self.layout.index_of(ty).is_some()
    }

    /// Returns true if this archetype contains every type in the sorted set.
    pub fn has_components(&self, types: &[ComponentType]) -> bool {
        component_set::includes_all(self.layout.types(), types)
    }

    /// Returns true if this archetype contains none of the types in the sorted
    /// set.
    pub fn lacks_components(&self, types: &[ComponentType]) -> bool {
        !component_set::intersects(self.layout.types(), types)
    }

    /// Get the column index of a component type.
    pub fn index_of(&self, ty: ComponentType) -> Option<usize> {
        self.layout.index_of(ty)
    }

    /// Get the column indices of every type in the sorted set, or `None` if
    /// any is missing.
    pub fn indices_of(&self, types: &[ComponentType]) -> Option<Vec<usize>> {
        component_set::indices_of(self.layout.types(), types)
    }

    fn locate(&self, index: usize) -> Result<(usize, usize)> {
        if index >= self.count {
            return Err(StorageError::out_of_range("entity", index, self.count));
        }

        let capacity = self.layout.capacity();
        Ok((index / capacity, index % capacity))
    }

    /// Reserve a slot at the end of the archetype, returning its index.
    ///
    /// The slot's bytes are uninitialised until the caller fills them, usually
    /// through a `Reservation`. A freshly allocated chunk has every column
    /// stamped with `version`.
    pub(crate) fn create_entity(&mut self, version: u32) -> Result<usize> {
        let capacity = self.layout.capacity();
        let needs_chunk = self.chunks.last().map_or(true, |c| c.len() == capacity);

        if needs_chunk {
            if self.chunks.len() >= self.max_chunks {
                return Err(StorageError::capacity("archetype chunks", self.max_chunks));
            }

            let chunk = Chunk::new(self.pool.clone(), self.layout.type_count(), version)?;
            log::trace!("archetype {:?} allocated chunk #{}", self.id, self.chunks.len());
            self.chunks.push(chunk);
        }

        let chunk = self.chunks.last_mut()
            .ok_or_else(|| StorageError::out_of_range("chunk", 0, 0))?;
        chunk.set_len(chunk.len() + 1);
        self.count += 1;
        Ok(self.count - 1)
    }

    /// Remove the entity at `index`.
    ///
    /// The bytes at `index` are not dropped: callers either destruct them or
    /// have moved them elsewhere first. If `index` was not the last entity, the
    /// last entity is moved into the hole and its handle is returned so the
    /// caller can update its location.
    pub(crate) fn remove_entity(&mut self, index: usize, version: u32) -> Result<Option<Entity>> {
        if self.count == 0 {
            return Err(StorageError::out_of_range("entity", index, 0));
        }

        let last = self.count - 1;
        let displaced = if index != last {
            self.copy_entity(last, index, version)?;
            Some(self.entity_at(index)?)
        } else {
            self.locate(index)?;
            None
        };

        self.truncate();
        Ok(displaced)
    }

    /// Drop the last slot, freeing its chunk if that leaves it empty.
    ///
    /// Returns the index of the slot which was removed.
    fn truncate(&mut self) -> usize {
        if let Some(chunk) = self.chunks.last_mut() {
            chunk.set_len(chunk.len() - 1);
            if chunk.is_empty() {
                self.chunks.pop();
                log::trace!("archetype {:?} released chunk #{}", self.id, self.chunks.len());
            }
        }

        self.count -= 1;
        self.count
    }

    /// Copy every column of the entity at `from` over the entity at `to`.
    fn copy_entity(&mut self, from: usize, to: usize, version: u32) -> Result<()> {
        let (from_chunk, from_idx) = self.locate(from)?;
        let (to_chunk, to_idx) = self.locate(to)?;

        for type_index in 0..self.layout.type_count() {
            if self.layout.sizes()[type_index] == 0 {
                continue;
            }

            let src = self.layout.component_range(type_index, from_idx)?;
            let dst = self.layout.component_range(type_index, to_idx)?;

            if from_chunk == to_chunk {
                self.chunks[to_chunk].data_mut().copy_within(src, dst.start);
            } else {
                let (src_chunk, dst_chunk) = chunk_pair(&mut self.chunks, from_chunk, to_chunk);
                dst_chunk.data_mut()[dst].copy_from_slice(&src_chunk.data()[src]);
            }
        }

        self.chunks[to_chunk].stamp_all(version);
        Ok(())
    }

    fn slot_mut(&mut self, type_index: usize, index: usize) -> Result<(&mut Chunk, Range<usize>)> {
        let (chunk_index, in_chunk) = self.locate(index)?;
        let range = self.layout.component_range(type_index, in_chunk)?;
        Ok((&mut self.chunks[chunk_index], range))
    }

    /// Get the bytes of one component of one entity.
    pub(crate) fn component_bytes(&self, type_index: usize, index: usize) -> Result<&[u8]> {
        let (chunk_index, in_chunk) = self.locate(index)?;
        let range = self.layout.component_range(type_index, in_chunk)?;
        Ok(&self.chunks[chunk_index].data()[range])
    }

    /// Get the bytes of one component of one entity for writing, stamping the
    /// column of its chunk with `version`.
    pub(crate) fn component_bytes_mut(&mut self, type_index: usize, index: usize, version: u32) -> Result<&mut [u8]> {
        let (chunk, range) = self.slot_mut(type_index, index)?;
        chunk.stamp(type_index, version);
        Ok(&mut chunk.data_mut()[range])
    }

    /// Return the handle stored for the entity at `index`.
    pub fn entity_at(&self, index: usize) -> Result<Entity> {
        let bytes = self.component_bytes(0, index)?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    pub(crate) fn set_entity_at(&mut self, index: usize, entity: Entity, version: u32) -> Result<()> {
        let bytes = self.component_bytes_mut(0, index, version)?;
        bytes.copy_from_slice(bytemuck::bytes_of(&entity));
        Ok(())
    }

    /// Write the default value of a column into the slot at `index`.
    pub(crate) fn construct_at(&mut self, type_index: usize, index: usize, version: u32) -> Result<()> {
        let registration = self.layout.registrations()[type_index];
        let bytes = self.component_bytes_mut(type_index, index, version)?;
        unsafe { registration.construct(bytes) };
        Ok(())
    }

    /// Drop the value of a column stored in the slot at `index`.
    ///
    /// # Safety
    /// The slot must hold a live value, which must not be used again.
    pub(crate) unsafe fn destruct_at(&mut self, type_index: usize, index: usize) -> Result<()> {
        let registration = self.layout.registrations()[type_index];
        if registration.needs_drop() {
            let (chunk, range) = self.slot_mut(type_index, index)?;
            registration.destruct(&mut chunk.data_mut()[range]);
        }
        Ok(())
    }

    /// Return the version the given column of a chunk was last written in.
    pub fn chunk_version(&self, chunk_index: usize, type_index: usize) -> Result<u32> {
        let chunk = self.chunks.get(chunk_index)
            .ok_or_else(|| StorageError::out_of_range("chunk", chunk_index, self.chunks.len()))?;
        chunk.versions().get(type_index).copied()
            .ok_or_else(|| StorageError::out_of_range("component", type_index, self.layout.type_count()))
    }

    /// Get a read-only view of one chunk.
    pub fn chunk(&self, chunk_index: usize) -> Option<ChunkView<'_>> {
        self.chunks.get(chunk_index).map(|c| ChunkView::new(&self.layout, c))
    }

    /// Create an iterator over all chunks.
    pub fn chunks(&self) -> impl Iterator<Item=ChunkView<'_>> + '_ {
        self.chunks.iter().map(move |c| ChunkView::new(&self.layout, c))
    }

    /// Create an iterator over all chunks for writing.
    ///
    /// Columns borrowed mutably are stamped with `version`.
    pub fn chunks_mut(&mut self, version: u32) -> impl Iterator<Item=ChunkViewMut<'_>> + '_ {
        let layout = &self.layout;
        self.chunks.iter_mut().map(move |c| ChunkViewMut::new(layout, c, version))
    }

    /// Create a parallel iterator over all chunks.
    pub fn par_chunks(&self) -> impl IndexedParallelIterator<Item=ChunkView<'_>> + '_ {
        let layout = &self.layout;
        self.chunks.par_iter().map(move |c| ChunkView::new(layout, c))
    }

    /// Create a parallel iterator over all chunks for writing.
    ///
    /// Each chunk is handed to exactly one worker.
    pub fn par_chunks_mut(&mut self, version: u32) -> impl IndexedParallelIterator<Item=ChunkViewMut<'_>> + '_ {
        let layout = &self.layout;
        self.chunks.par_iter_mut().map(move |c| ChunkViewMut::new(layout, c, version))
    }
}

/// A slot reserved at the end of an archetype while it is being filled.
///
/// Until `commit` is called, dropping the reservation (including while
/// unwinding from a panicking `Default`) drops the columns it constructed and
/// releases the slot. Bytes copied in from elsewhere are never dropped, so
/// their original owner keeps them.
pub(crate) struct Reservation<'a> {
    archetype: &'a mut Archetype,
    index: usize,
    version: u32,
    constructed: Vec<usize>,
    committed: bool,
}

impl<'a> Reservation<'a> {
    /// Take charge of the slot just returned by `Archetype::create_entity`.
    pub fn new(archetype: &'a mut Archetype, index: usize, version: u32) -> Reservation<'a> {
        Reservation {
            archetype,
            index,
            version,
            constructed: Vec::new(),
            committed: false,
        }
    }

    pub fn set_entity(&mut self, entity: Entity) -> Result<()> {
        self.archetype.set_entity_at(self.index, entity, self.version)
    }

    /// Write the default value of a column.
    pub fn construct(&mut self, type_index: usize) -> Result<()> {
        self.archetype.construct_at(type_index, self.index, self.version)?;
        self.constructed.push(type_index);
        Ok(())
    }

    /// Copy the raw bytes of a value owned elsewhere into a column.
    ///
    /// # Safety
    /// `bytes` must be the complete storage of a live value of the column's
    /// type, and its owner must give it up once the reservation commits.
    pub unsafe fn copy_from(&mut self, type_index: usize, bytes: *const u8) -> Result<()> {
        let slot = self.archetype.component_bytes_mut(type_index, self.index, self.version)?;
        std::ptr::copy_nonoverlapping(bytes, slot.as_mut_ptr(), slot.len());
        Ok(())
    }

    /// Keep the slot, returning its index.
    pub fn commit(mut self) -> usize {
        self.committed = true;
        self.index
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        for type_index in self.constructed.drain(..) {
            let _ = unsafe { self.archetype.destruct_at(type_index, self.index) };
        }
        self.archetype.truncate();
        log::debug!("archetype {:?} released an unfinished slot {}", self.archetype.id, self.index);
    }
}

impl Drop for Archetype {
    fn drop(&mut self) {
        let layout = &self.layout;
        for chunk in self.chunks.iter_mut() {
            for (type_index, registration) in layout.registrations().iter().enumerate() {
                if !registration.needs_drop() {
                    continue;
                }

                for in_chunk in 0..chunk.len() {
                    if let Ok(range) = layout.component_range(type_index, in_chunk) {
                        unsafe { registration.destruct(&mut chunk.data_mut()[range]) };
                    }
                }
            }
        }
    }
}

impl Debug for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archetype")
            .field("id", &self.id)
            .field("types", &self.layout.types())
            .field("count", &self.count)
            .field("chunks", &self.chunks.len())
            .field("chunk_capacity", &self.layout.capacity())
            .finish()
    }
}

//! Fixed-size chunks of entity storage.
//!
//! A chunk is a single allocation holding a struct of arrays: one contiguous,
//! 64-byte aligned column per component type. The column layout is owned by
//! the archetype (see `ChunkLayout`); the chunk itself only knows how many
//! entities it holds and when each column was last written.

use std::alloc::{self, Layout};
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicUsize};

use bit_vec::BitVec;
use crossbeam_queue::SegQueue;

use crate::archetype::ChunkLayout;
use crate::component::{Component, ComponentType};
use crate::config::{CHUNK_HEADER_SIZE, COLUMN_ALIGN};
use crate::entity::Entity;
use crate::error::{Result, StorageError};

/// Returns true if something written at `version` happened after `since`.
///
/// The comparison is wraparound safe: only the relative order of the two
/// versions matters. A `since` of zero means "never", so every version counts
/// as changed.
pub fn did_change(version: u32, since: u32) -> bool {
    since == 0 || (version.wrapping_sub(since) as i32) > 0
}

/// A pool of chunk-sized allocations shared by every archetype of a manager.
///
/// Released buffers are kept for reuse up to the configured limit, the rest
/// are returned to the allocator immediately.
pub struct ChunkPool {
    layout: Layout,
    retain: usize,
    free_list: SegQueue<NonNull<u8>>,
    allocated: AtomicUsize,
}

unsafe impl Send for ChunkPool {}
unsafe impl Sync for ChunkPool {}

impl ChunkPool {
    /// Create a pool handing out `chunk_size` byte buffers.
    pub fn new(chunk_size: usize, retain: usize) -> Result<ChunkPool> {
        let layout = Layout::from_size_align(chunk_size, COLUMN_ALIGN)
            .map_err(|_| StorageError::InvalidArgument(format!("invalid chunk size {}", chunk_size)))?;

        Ok(ChunkPool {
            layout,
            retain,
            free_list: SegQueue::new(),
            allocated: AtomicUsize::new(0),
        })
    }

    /// The size of each buffer in bytes.
    pub fn chunk_size(&self) -> usize {
        self.layout.size()
    }

    /// Returns the number of buffers currently allocated.
    ///
    /// This includes unused buffers retained for reuse.
    pub fn allocated(&self) -> usize {
        self.allocated.load(atomic::Ordering::Relaxed)
    }

    /// Returns the number of unused buffers retained for reuse.
    pub fn retained(&self) -> usize {
        self.free_list.len()
    }

    fn allocate(&self) -> Result<NonNull<u8>> {
        if let Some(ptr) = self.free_list.pop() {
            return Ok(ptr);
        }

        let raw_ptr = unsafe { alloc::alloc_zeroed(self.layout) };
        let ptr = NonNull::new(raw_ptr)
            .ok_or(StorageError::AllocationFailure { size: self.layout.size() })?;
        self.allocated.fetch_add(1, atomic::Ordering::Relaxed);
        Ok(ptr)
    }

    /// Return a buffer obtained from `allocate`.
    unsafe fn release(&self, ptr: NonNull<u8>) {
        if self.free_list.len() < self.retain {
            self.free_list.push(ptr);
        } else {
            alloc::dealloc(ptr.as_ptr(), self.layout);
            self.allocated.fetch_sub(1, atomic::Ordering::Relaxed);
        }
    }

    /// Deallocate all retained buffers.
    pub fn flush(&self) {
        while let Some(ptr) = self.free_list.pop() {
            unsafe { alloc::dealloc(ptr.as_ptr(), self.layout) };
            self.allocated.fetch_sub(1, atomic::Ordering::Relaxed);
        }
    }
}

impl Drop for ChunkPool {
    fn drop(&mut self) {
        self.flush()
    }
}

impl Debug for ChunkPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkPool {{ chunk_size: {}, allocated: {}, retained: {} }}",
               self.chunk_size(), self.allocated(), self.retained())
    }
}

/// A single chunk of entities belonging to one archetype.
pub struct Chunk {
    pool: Arc<ChunkPool>,
    ptr: NonNull<u8>,
    len: usize,
    versions: Box<[u32]>,
}

unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    /// Allocate an empty chunk with `type_count` version counters, all stamped
    /// with `version`.
    pub(crate) fn new(pool: Arc<ChunkPool>, type_count: usize, version: u32) -> Result<Chunk> {
        let ptr = pool.allocate()?;

        Ok(Chunk {
            pool,
            ptr,
            len: 0,
            versions: vec![version; type_count].into_boxed_slice(),
        })
    }

    /// Get the number of entities stored in this chunk.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if this chunk holds no entities.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn set_len(&mut self, len: usize) {
        self.len = len;
    }

    /// Return the last version each column was written in.
    pub fn versions(&self) -> &[u32] {
        &self.versions
    }

    pub(crate) fn stamp(&mut self, type_index: usize, version: u32) {
        self.versions[type_index] = version;
    }

    pub(crate) fn stamp_all(&mut self, version: u32) {
        for v in self.versions.iter_mut() {
            *v = version;
        }
    }

    fn buffer_size(&self) -> usize {
        self.pool.chunk_size() - CHUNK_HEADER_SIZE
    }

    fn data_ptr(&self) -> *mut u8 {
        unsafe { self.ptr.as_ptr().add(CHUNK_HEADER_SIZE) }
    }

    /// The data region of the chunk, after the header.
    pub(crate) fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data_ptr(), self.buffer_size()) }
    }

    /// The mutable data region of the chunk, after the header.
    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data_ptr(), self.buffer_size()) }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        unsafe { self.pool.release(self.ptr) };
    }
}

impl Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chunk {{ ptr: {:?}, len: {}, versions: {:?} }}", self.ptr, self.len, self.versions)
    }
}

fn column<'a>(layout: &ChunkLayout, chunk: &'a Chunk, type_index: usize) -> Result<&'a [u8]> {
    let range = layout.column_range(type_index, chunk.len())?;
    Ok(&chunk.data()[range])
}

unsafe fn cast_column<T>(bytes: &[u8], len: usize) -> &[T] {
    if std::mem::size_of::<T>() == 0 {
        return std::slice::from_raw_parts(NonNull::<T>::dangling().as_ptr(), len);
    }
    std::slice::from_raw_parts(bytes.as_ptr() as *const T, len)
}

unsafe fn cast_column_mut<T>(bytes: &mut [u8], len: usize) -> &mut [T] {
    if std::mem::size_of::<T>() == 0 {
        return std::slice::from_raw_parts_mut(NonNull::<T>::dangling().as_ptr(), len);
    }
    std::slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut T, len)
}

/// Read-only access to one chunk and the layout describing it.
#[derive(Clone, Copy)]
pub struct ChunkView<'a> {
    layout: &'a ChunkLayout,
    chunk: &'a Chunk,
}

impl<'a> ChunkView<'a> {
    pub(crate) fn new(layout: &'a ChunkLayout, chunk: &'a Chunk) -> ChunkView<'a> {
        ChunkView { layout, chunk }
    }

    /// Get the number of entities in this chunk.
    pub fn len(&self) -> usize {
        self.chunk.len()
    }

    /// Returns true if the chunk holds no entities.
    pub fn is_empty(&self) -> bool {
        self.chunk.is_empty()
    }

    /// Return the handles of the entities stored in this chunk.
    pub fn entities(&self) -> &'a [Entity] {
        let bytes = &self.chunk.data()[self.layout.column_range(0, self.chunk.len()).unwrap_or(0..0)];
        bytemuck::cast_slice(bytes)
    }

    /// Return the raw bytes of a column by its index in the archetype.
    ///
    /// # Safety
    /// The column must hold values without padding bytes, since those are
    /// uninitialised. Use `components` for typed access.
    pub unsafe fn column(&self, type_index: usize) -> Result<&'a [u8]> {
        column(self.layout, self.chunk, type_index)
    }

    /// Return the raw bytes of a component column, if the archetype has it.
    ///
    /// # Safety
    /// As for `column`.
    pub unsafe fn column_of(&self, ty: ComponentType) -> Option<&'a [u8]> {
        let type_index = self.layout.index_of(ty)?;
        column(self.layout, self.chunk, type_index).ok()
    }

    /// Get the typed slice of all `T` components stored under `ty`.
    ///
    /// Returns `None` if the archetype lacks `ty` or `ty` does not describe `T`.
    pub fn components<T: Component>(&self, ty: ComponentType) -> Option<&'a [T]> {
        let type_index = self.layout.index_of(ty)?;
        if !self.layout.registrations()[type_index].is::<T>() {
            return None;
        }

        let bytes = column(self.layout, self.chunk, type_index).ok()?;
        Some(unsafe { cast_column(bytes, self.chunk.len()) })
    }

    /// Return the version a column was last written in.
    pub fn version(&self, ty: ComponentType) -> Option<u32> {
        self.layout.index_of(ty).map(|idx| self.chunk.versions()[idx])
    }

    /// Returns true if the column for `ty` was written after `since`.
    pub fn did_change(&self, ty: ComponentType, since: u32) -> bool {
        self.version(ty).map_or(false, |v| did_change(v, since))
    }
}

/// Mutable access to one chunk.
///
/// Every mutable column borrow stamps that column with the view's version.
pub struct ChunkViewMut<'a> {
    layout: &'a ChunkLayout,
    chunk: &'a mut Chunk,
    version: u32,
}

impl<'a> ChunkViewMut<'a> {
    pub(crate) fn new(layout: &'a ChunkLayout, chunk: &'a mut Chunk, version: u32) -> ChunkViewMut<'a> {
        ChunkViewMut { layout, chunk, version }
    }

    /// Borrow this view immutably.
    pub fn as_view(&self) -> ChunkView<'_> {
        ChunkView::new(self.layout, self.chunk)
    }

    /// Get the number of entities in this chunk.
    pub fn len(&self) -> usize {
        self.chunk.len()
    }

    /// Returns true if the chunk holds no entities.
    pub fn is_empty(&self) -> bool {
        self.chunk.is_empty()
    }

    /// Return the raw bytes of a column for writing.
    ///
    /// # Safety
    /// The column must hold values without padding bytes, and every value
    /// left in it must be a valid value of the column's type. Writing bytes
    /// over a value does not drop it. Use `components_mut` for typed access.
    pub unsafe fn column_mut(&mut self, type_index: usize) -> Result<&mut [u8]> {
        let range = self.layout.column_range(type_index, self.chunk.len())?;
        if type_index == 0 {
            return Err(StorageError::InvalidArgument("entity handles are read-only".to_owned()));
        }

        self.chunk.stamp(type_index, self.version);
        Ok(&mut self.chunk.data_mut()[range])
    }

    /// Get the typed mutable slice of all `T` components stored under `ty`.
    pub fn components_mut<T: Component>(&mut self, ty: ComponentType) -> Option<&mut [T]> {
        let type_index = self.layout.index_of(ty)?;
        if !self.layout.registrations()[type_index].is::<T>() {
            return None;
        }

        let len = self.chunk.len();
        unsafe {
            let bytes = self.column_mut(type_index).ok()?;
            Some(cast_column_mut(bytes, len))
        }
    }

    /// Split the chunk into independently borrowable columns.
    pub fn columns(&mut self) -> ChunkColumns<'_> {
        ChunkColumns::new(self.layout, self.chunk, self.version)
    }
}

/// A utility for accessing multiple component columns of a chunk at the same
/// time.
///
/// Any number of shared borrows of a column may coexist, but a mutable borrow
/// excludes every other borrow of that column.
pub struct ChunkColumns<'a> {
    layout: &'a ChunkLayout,
    data: NonNull<u8>,
    len: usize,
    versions: &'a mut [u32],
    version: u32,
    locked: BitVec,
    _chunk: PhantomData<&'a mut [u8]>,
}

impl<'a> ChunkColumns<'a> {
    fn new(layout: &'a ChunkLayout, chunk: &'a mut Chunk, version: u32) -> ChunkColumns<'a> {
        let num_components = layout.type_count();
        let len = chunk.len();
        let data = unsafe { NonNull::new_unchecked(chunk.data_ptr()) };

        ChunkColumns {
            layout,
            data,
            len,
            versions: &mut chunk.versions[..],
            version,
            locked: BitVec::from_elem(num_components << 1, false),
            _chunk: PhantomData,
        }
    }

    fn mark_type(&mut self, ty: ComponentType, mutable: bool) -> Option<usize> {
        let index = self.layout.index_of(ty)?;
        let offset = index << 1;
        let const_taken = self.locked[offset];
        let mut_taken = self.locked[offset + 1];

        if mutable && index != 0 && !mut_taken && !const_taken {
            self.locked.set(offset + 1, true);
            Some(index)
        } else if !mutable && !mut_taken {
            self.locked.set(offset, true);
            Some(index)
        } else {
            None
        }
    }

    fn column_ptr(&self, index: usize) -> Option<*mut u8> {
        let range = self.layout.column_range(index, self.len).ok()?;
        Some(unsafe { self.data.as_ptr().add(range.start) })
    }

    /// Borrow the column of `ty` as a slice of `T`.
    ///
    /// Returns `None` if the column is missing, is not a `T` column, or is
    /// already borrowed mutably.
    pub fn components<T: Component>(&mut self, ty: ComponentType) -> Option<&'a [T]> {
        let index = self.layout.index_of(ty)?;
        if !self.layout.registrations()[index].is::<T>() {
            return None;
        }

        let index = self.mark_type(ty, false)?;
        let ptr = self.column_ptr(index)?;
        let bytes = unsafe { std::slice::from_raw_parts(ptr, self.layout.sizes()[index] * self.len) };
        Some(unsafe { cast_column(bytes, self.len) })
    }

    /// Borrow the column of `ty` as a mutable slice of `T`.
    ///
    /// Returns `None` if the column is missing, is not a `T` column, or is
    /// already borrowed.
    pub fn components_mut<T: Component>(&mut self, ty: ComponentType) -> Option<&'a mut [T]> {
        let index = self.layout.index_of(ty)?;
        if !self.layout.registrations()[index].is::<T>() {
            return None;
        }

        let index = self.mark_type(ty, true)?;
        let ptr = self.column_ptr(index)?;
        self.versions[index] = self.version;
        let bytes = unsafe { std::slice::from_raw_parts_mut(ptr, self.layout.sizes()[index] * self.len) };
        Some(unsafe { cast_column_mut(bytes, self.len) })
    }
}

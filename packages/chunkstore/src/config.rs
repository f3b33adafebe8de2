//! Tunables for entity storage.

/// Size in bytes of a single chunk allocation, header included.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Bytes reserved at the start of every chunk.
pub const CHUNK_HEADER_SIZE: usize = 64;

/// Alignment of every component column within a chunk.
pub const COLUMN_ALIGN: usize = 64;

/// Storage configuration shared by every archetype of an `EntityManager`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageConfig {
    chunk_size: usize,
    max_archetype_types: usize,
    max_chunks_per_archetype: usize,
    retained_chunks: usize,
    index_min_size: usize,
}

impl StorageConfig {
    /// Create a configuration with the default settings.
    pub fn new() -> StorageConfig {
        StorageConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_archetype_types: 128,
            max_chunks_per_archetype: 1 << 16,
            retained_chunks: 0,
            index_min_size: 32,
        }
    }

    /// Use chunks of `chunk_size` bytes.
    ///
    /// The size includes the reserved header and is rounded up to a multiple of
    /// the column alignment.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> StorageConfig {
        let chunk_size = chunk_size.max(CHUNK_HEADER_SIZE + COLUMN_ALIGN);
        self.chunk_size = (chunk_size + COLUMN_ALIGN - 1) & !(COLUMN_ALIGN - 1);
        self
    }

    /// Limit the number of component types in a single archetype, including
    /// the entity handle itself.
    pub fn with_max_archetype_types(mut self, max: usize) -> StorageConfig {
        self.max_archetype_types = max.max(1);
        self
    }

    /// Limit the number of chunks a single archetype may own.
    pub fn with_max_chunks_per_archetype(mut self, max: usize) -> StorageConfig {
        self.max_chunks_per_archetype = max.max(1);
        self
    }

    /// Keep up to `count` released chunk buffers around for reuse.
    pub fn with_retained_chunks(mut self, count: usize) -> StorageConfig {
        self.retained_chunks = count;
        self
    }

    /// Set the minimum slot count of the archetype index.
    ///
    /// Rounded up to a power of two.
    pub fn with_index_min_size(mut self, size: usize) -> StorageConfig {
        self.index_min_size = size.max(4).next_power_of_two();
        self
    }

    /// Total size of a chunk allocation.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Bytes available for component data in each chunk.
    pub fn chunk_buffer_size(&self) -> usize {
        self.chunk_size - CHUNK_HEADER_SIZE
    }

    /// Maximum number of types in one archetype.
    pub fn max_archetype_types(&self) -> usize {
        self.max_archetype_types
    }

    /// Maximum number of chunks in one archetype.
    pub fn max_chunks_per_archetype(&self) -> usize {
        self.max_chunks_per_archetype
    }

    /// Number of released chunks kept for reuse.
    pub fn retained_chunks(&self) -> usize {
        self.retained_chunks
    }

    /// Minimum archetype index size.
    pub fn index_min_size(&self) -> usize {
        self.index_min_size
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::new()
    }
}

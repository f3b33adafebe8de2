//! Chunked archetype storage for an entity component system.
//!
//! Entities with the same set of components share an `Archetype`, which packs
//! their component values column by column into fixed-size chunks. The
//! `EntityManager` owns the archetypes and moves entities between them as
//! components are added and removed.
//!
//! ```
//! use std::sync::Arc;
//! use chunkstore::{ComponentRegistry, EntityManager};
//!
//! #[derive(Default, Debug, PartialEq)]
//! struct Position(f32, f32);
//!
//! let registry = Arc::new(ComponentRegistry::new());
//! let position = registry.register::<Position>().unwrap();
//! let mut manager = EntityManager::new(registry).unwrap();
//!
//! let entity = manager.create_entity_with(&[position]).unwrap();
//! manager.set(entity, Position(1.0, 2.0)).unwrap();
//! assert_eq!(manager.get::<Position>(entity).unwrap(), Some(&Position(1.0, 2.0)));
//! ```

pub use archetype::{Archetype, ArchetypeId, ChunkLayout};
pub use archetype_index::ArchetypeIndex;
pub use chunk::{did_change, Chunk, ChunkColumns, ChunkPool, ChunkView, ChunkViewMut};
pub use command_buffer::{CommandBuffer, CommandTarget, PendingEntity};
pub use component::{
    Component,
    ComponentFlags,
    ComponentRegistration,
    ComponentRegistry,
    ComponentType,
};
pub use component_set::ComponentSet;
pub use config::StorageConfig;
pub use entity::{Entity, EntityLocation};
pub use error::{Result, StorageError};
pub use manager::EntityManager;

pub mod error;
pub mod config;
pub mod entity;
pub mod component;
pub mod component_set;

pub mod chunk;
pub mod archetype;
pub mod archetype_index;

pub mod manager;
mod command_buffer;

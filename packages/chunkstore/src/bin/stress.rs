use std::sync::Arc;
use std::time::Instant;

use chunkstore::{CommandBuffer, ComponentRegistry, ComponentSet, EntityManager, Result};
use rayon::iter::ParallelIterator;

#[derive(Debug, Clone, Copy, Default)]
pub struct MyComponent(i32);

#[derive(Debug, Clone, Copy, Default)]
pub struct Marker;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let registry = Arc::new(ComponentRegistry::new());
    let my_component = registry.register::<MyComponent>()?;
    let marker = registry.register::<Marker>()?;
    let mut manager = EntityManager::new(registry)?;
    let mut to_delete = Vec::new();
    let start = Instant::now();

    for round in 0..8 {
        let mut command_buffer = CommandBuffer::new();

        for entity in to_delete.drain(..) {
            command_buffer.remove_components(entity, ComponentSet::from(my_component));
        }

        let mut pending = Vec::new();
        for idx in 0..512 {
            let entity = command_buffer.create_entity(ComponentSet::from(marker));
            command_buffer.set_component(entity, MyComponent(32));
            pending.push((idx, entity));
        }

        let created = command_buffer.playback(&mut manager)?;
        for (idx, entity) in pending {
            if idx % 12 == 11 {
                to_delete.push(created[entity.index()]);
            }
        }

        let version = manager.bump_global_version();
        let ids: Vec<_> = manager.matching_archetypes(&[my_component], &[])?
            .map(|a| a.id())
            .collect();
        for id in ids {
            if let Some(chunks) = manager.par_chunks_mut(id) {
                chunks.for_each(|mut chunk| {
                    if let Some(values) = chunk.components_mut::<MyComponent>(my_component) {
                        for value in values {
                            value.0 += 1;
                        }
                    }
                });
            }
        }

        log::info!("round {}: {} entities in {} archetypes, version {}",
                   round, manager.entity_count(), manager.archetype_count(), version);
    }

    println!("manager: {:?}", manager);
    println!("elapsed: {:?}", start.elapsed());
    Ok(())
}

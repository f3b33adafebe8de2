use std::sync::Arc;

use chunkstore::{ComponentRegistry, EntityManager, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct MyComponent(i32);

#[derive(Debug, Clone, Copy, Default)]
pub struct Velocity(f32);

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();

    let registry = Arc::new(ComponentRegistry::new());
    let my_component = registry.register::<MyComponent>()?;
    let velocity = registry.register::<Velocity>()?;
    let mut manager = EntityManager::new(registry)?;

    let entity = manager.create_entity_with(&[my_component])?;
    manager.set(entity, MyComponent(3))?;
    manager.add_component(entity, velocity)?;

    println!("manager: {:?}", manager);
    println!("entity: {:?}", entity);

    for component in manager.component_types(entity)?.as_slice() {
        let registration = manager.registry().registration(*component)?;
        println!("component: {:?} ({})", component, registration.name());
    }

    println!("value: {:?}", manager.get::<MyComponent>(entity)?);
    Ok(())
}

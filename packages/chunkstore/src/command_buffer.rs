use std::fmt::{self, Debug};

use crate::component::{Component, ComponentType};
use crate::component_set::ComponentSet;
use crate::entity::Entity;
use crate::error::{Result, StorageError};
use crate::manager::EntityManager;

/// An entity which will be created when a command buffer is played back.
///
/// The value is the position of the entity in the list returned by
/// `CommandBuffer::playback`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PendingEntity(usize);

impl PendingEntity {
    /// Return the position of this entity in the playback result.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// The entity a command applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandTarget {
    /// An entity which already exists.
    Existing(Entity),
    /// An entity created earlier in the same buffer.
    Pending(PendingEntity),
}

impl From<Entity> for CommandTarget {
    fn from(entity: Entity) -> Self {
        CommandTarget::Existing(entity)
    }
}

impl From<PendingEntity> for CommandTarget {
    fn from(pending: PendingEntity) -> Self {
        CommandTarget::Pending(pending)
    }
}

type SetFn = Box<dyn FnOnce(&mut EntityManager, Entity) -> Result<()> + Send>;

enum Command {
    Create(ComponentSet),
    Destroy(CommandTarget),
    Add(CommandTarget, ComponentSet),
    Remove(CommandTarget, ComponentSet),
    Set(CommandTarget, &'static str, SetFn),
}

impl Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Create(set) => write!(f, "Create({:?})", set.as_slice()),
            Command::Destroy(target) => write!(f, "Destroy({:?})", target),
            Command::Add(target, set) => write!(f, "Add({:?}, {:?})", target, set.as_slice()),
            Command::Remove(target, set) => write!(f, "Remove({:?}, {:?})", target, set.as_slice()),
            Command::Set(target, name, _) => write!(f, "Set({:?}, {})", target, name),
        }
    }
}

/// A command buffer for structural entity changes.
///
/// Structural changes need exclusive access to the `EntityManager`. A
/// `CommandBuffer` records them instead, so jobs running in parallel over
/// chunk data can each fill their own buffer and the owner of the manager can
/// apply them afterwards, in recording order.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
    created: usize,
}

impl CommandBuffer {
    /// Create a new, empty, command buffer.
    pub fn new() -> CommandBuffer {
        CommandBuffer::default()
    }

    /// Merge multiple command buffers.
    ///
    /// Commands are kept in buffer order. Pending entities of later buffers
    /// are renumbered, so `PendingEntity` values handed out by the inputs are
    /// only meaningful for the first buffer.
    pub fn merge(buffers: Vec<CommandBuffer>) -> CommandBuffer {
        let mut dest = CommandBuffer::new();
        dest.commands.reserve(buffers.iter().map(|b| b.commands.len()).sum());

        for buffer in buffers {
            dest.append(buffer);
        }

        dest
    }

    /// Move every command of `other` to the end of this buffer.
    pub fn append(&mut self, other: CommandBuffer) {
        let offset = self.created;
        let shift = |target: CommandTarget| match target {
            CommandTarget::Pending(p) => CommandTarget::Pending(PendingEntity(p.0 + offset)),
            existing => existing,
        };

        for command in other.commands {
            let command = match command {
                Command::Create(set) => Command::Create(set),
                Command::Destroy(t) => Command::Destroy(shift(t)),
                Command::Add(t, set) => Command::Add(shift(t), set),
                Command::Remove(t, set) => Command::Remove(shift(t), set),
                Command::Set(t, name, f) => Command::Set(shift(t), name, f),
            };
            self.commands.push(command);
        }

        self.created += other.created;
    }

    /// Return the number of recorded commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns true if no commands are recorded.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Record the creation of an entity with default values for `types`.
    pub fn create_entity(&mut self, types: ComponentSet) -> PendingEntity {
        let pending = PendingEntity(self.created);
        self.created += 1;
        self.commands.push(Command::Create(types));
        pending
    }

    /// Record the destruction of an entity.
    pub fn destroy_entity(&mut self, target: impl Into<CommandTarget>) {
        self.commands.push(Command::Destroy(target.into()));
    }

    /// Record adding components to an entity.
    pub fn add_components(&mut self, target: impl Into<CommandTarget>, types: ComponentSet) {
        self.commands.push(Command::Add(target.into(), types));
    }

    /// Record adding a single component to an entity.
    pub fn add_component(&mut self, target: impl Into<CommandTarget>, ty: ComponentType) {
        self.add_components(target, ComponentSet::from(ty));
    }

    /// Record removing components from an entity.
    pub fn remove_components(&mut self, target: impl Into<CommandTarget>, types: ComponentSet) {
        self.commands.push(Command::Remove(target.into(), types));
    }

    /// Record setting a component on an entity, adding it if it is missing.
    pub fn set_component<T: Component>(&mut self, target: impl Into<CommandTarget>, component: T) {
        let apply: SetFn = Box::new(move |manager, entity| manager.set(entity, component));
        self.commands.push(Command::Set(target.into(), std::any::type_name::<T>(), apply));
    }

    /// Apply every recorded command to `manager`, emptying the buffer.
    ///
    /// Returns the handles of the created entities, indexed by
    /// `PendingEntity::index`. Playback stops at the first failing command;
    /// commands before it stay applied.
    pub fn playback(&mut self, manager: &mut EntityManager) -> Result<Vec<Entity>> {
        let mut created = Vec::with_capacity(self.created);
        let commands = std::mem::take(&mut self.commands);
        self.created = 0;
        log::trace!("playing back {} commands", commands.len());

        let resolve = |created: &[Entity], target: CommandTarget| match target {
            CommandTarget::Existing(entity) => Ok(entity),
            CommandTarget::Pending(p) => created.get(p.0).copied()
                .ok_or_else(|| StorageError::out_of_range("pending entity", p.0, created.len())),
        };

        for command in commands {
            match command {
                Command::Create(set) => created.push(manager.create_entity_with(&set)?),
                Command::Destroy(t) => manager.destroy_entity(resolve(&created, t)?)?,
                Command::Add(t, set) => manager.add_components(resolve(&created, t)?, &set)?,
                Command::Remove(t, set) => manager.remove_components(resolve(&created, t)?, &set)?,
                Command::Set(t, _, apply) => apply(manager, resolve(&created, t)?)?,
            }
        }

        Ok(created)
    }
}

//! Base definitions for components.
//!
//! Every entity is built out of components. Each component type is registered
//! once with a `ComponentRegistry`, which hands out a small dense
//! `ComponentType` id and records how to construct and destroy values of that
//! type inside raw chunk memory.

use std::any::{type_name, TypeId};
use std::fmt::{self, Debug, Formatter};
use std::mem::{align_of, needs_drop, size_of};
use std::ops::BitOr;
use std::ptr::NonNull;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::config::COLUMN_ALIGN;
use crate::entity::Entity;
use crate::error::{Result, StorageError};

/// The maximum number of component types a registry can hold.
pub const MAX_COMPONENT_TYPES: usize = 1 << INDEX_BITS;

/// The largest component size which can be registered.
pub const MAX_COMPONENT_SIZE: usize = 0x7fff;

const INDEX_BITS: u32 = 13;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const PREFAB_BIT: u32 = 1 << 29;
const DISABLED_BIT: u32 = 1 << 30;
const ZERO_SIZED_BIT: u32 = 1 << 31;
const FLAG_MASK: u32 = PREFAB_BIT | DISABLED_BIT;

/// Any type which can be stored in a chunk.
pub trait Component: Default + Send + Sync + 'static {}

impl<T: Default + Send + Sync + 'static> Component for T {}

/// Marker flags which distinguish otherwise identical component types.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ComponentFlags(u32);

impl ComponentFlags {
    /// No flags.
    pub const NONE: ComponentFlags = ComponentFlags(0);
    /// The component marks prefab entities.
    pub const PREFAB: ComponentFlags = ComponentFlags(PREFAB_BIT);
    /// The component marks disabled entities.
    pub const DISABLED: ComponentFlags = ComponentFlags(DISABLED_BIT);

    /// Returns true if every flag in `other` is also set in `self`.
    pub fn contains(&self, other: ComponentFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ComponentFlags {
    type Output = ComponentFlags;

    fn bitor(self, rhs: ComponentFlags) -> ComponentFlags {
        ComponentFlags(self.0 | rhs.0)
    }
}

impl Debug for ComponentFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_set();
        if self.contains(ComponentFlags::PREFAB) {
            list.entry(&"PREFAB");
        }
        if self.contains(ComponentFlags::DISABLED) {
            list.entry(&"DISABLED");
        }
        list.finish()
    }
}

/// A registered component type.
///
/// The low bits hold the dense registry index, the high bits hold flags. The
/// derived ordering compares the raw value, so sets sorted by `ComponentType`
/// keep the entity handle first and zero-sized tags last.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentType(u32);

impl ComponentType {
    /// The entity handle pseudo-component present in every archetype.
    pub const ENTITY: ComponentType = ComponentType(0);

    fn from_parts(index: usize, flags: ComponentFlags, zero_sized: bool) -> ComponentType {
        let zero_sized = if zero_sized { ZERO_SIZED_BIT } else { 0 };
        ComponentType(index as u32 | flags.0 | zero_sized)
    }

    /// Return the dense registry index of this type.
    pub fn index(&self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    /// Return the flags this type was registered with.
    pub fn flags(&self) -> ComponentFlags {
        ComponentFlags(self.0 & FLAG_MASK)
    }

    /// Returns true if this type has no payload.
    pub fn is_zero_sized(&self) -> bool {
        self.0 & ZERO_SIZED_BIT != 0
    }

    /// Returns true if this is a prefab marker type.
    pub fn is_prefab(&self) -> bool {
        self.0 & PREFAB_BIT != 0
    }

    /// Returns true if this is a disabled marker type.
    pub fn is_disabled(&self) -> bool {
        self.0 & DISABLED_BIT != 0
    }

    /// Return the raw value, as used for ordering and hashing.
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl Debug for ComponentType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentType(#{}", self.index())?;
        if self.is_zero_sized() {
            write!(f, " tag")?;
        }
        if self.flags() != ComponentFlags::NONE {
            write!(f, " {:?}", self.flags())?;
        }
        write!(f, ")")
    }
}

/// The dynamic description of a registered component type.
#[derive(Clone, Copy)]
pub struct ComponentRegistration {
    component_type: ComponentType,
    type_id: TypeId,
    name: &'static str,
    size: usize,
    align: usize,
    construct: fn(&mut [u8]),
    destruct: Option<unsafe fn(&mut [u8])>,
}

impl ComponentRegistration {
    fn new<T: Component>(component_type: ComponentType) -> ComponentRegistration {
        fn construct<T: Component>(bytes: &mut [u8]) {
            assert_eq!(bytes.len(), size_of::<T>());
            if size_of::<T>() == 0 {
                std::mem::forget(T::default());
                return;
            }

            let ptr = bytes.as_mut_ptr() as *mut T;
            assert_eq!(ptr as usize % align_of::<T>(), 0, "misaligned component storage");
            unsafe { ptr.write(T::default()) };
        }

        unsafe fn destruct<T: Component>(bytes: &mut [u8]) {
            debug_assert_eq!(bytes.len(), size_of::<T>());
            let ptr = if size_of::<T>() == 0 {
                NonNull::<T>::dangling().as_ptr()
            } else {
                bytes.as_mut_ptr() as *mut T
            };
            std::ptr::drop_in_place(ptr);
        }

        ComponentRegistration {
            component_type,
            type_id: TypeId::of::<T>(),
            name: type_name::<T>(),
            size: size_of::<T>(),
            align: align_of::<T>(),
            construct: construct::<T>,
            destruct: if needs_drop::<T>() { Some(destruct::<T> as unsafe fn(&mut [u8])) } else { None },
        }
    }

    /// Return the component type this registration describes.
    pub fn component_type(&self) -> ComponentType {
        self.component_type
    }

    /// Return the Rust type name of the component.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Return the size of a single value in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Return the alignment of a single value.
    pub fn align(&self) -> usize {
        self.align
    }

    /// Returns true if values of this type run code when dropped.
    pub fn needs_drop(&self) -> bool {
        self.destruct.is_some()
    }

    /// Returns true if this registration describes the Rust type `T`.
    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// Fill uninitialised component storage with the default value.
    ///
    /// Any value previously stored in `bytes` is overwritten without being
    /// dropped.
    ///
    /// # Safety
    /// `bytes` must be storage reserved for a value of this type, suitably
    /// aligned, and must not be read as plain bytes afterwards unless the type
    /// has no padding. The written value is owned by the caller, who must
    /// eventually `destruct` it exactly once.
    pub unsafe fn construct(&self, bytes: &mut [u8]) {
        (self.construct)(bytes)
    }

    /// Drop the value stored in `bytes`.
    ///
    /// # Safety
    /// `bytes` must hold an initialised, suitably aligned value of this type,
    /// which must not be used again afterwards.
    pub unsafe fn destruct(&self, bytes: &mut [u8]) {
        if let Some(destruct) = self.destruct {
            destruct(bytes)
        }
    }
}

impl Debug for ComponentRegistration {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "<ComponentRegistration {} {:?}>", self.name, self.component_type)
    }
}

struct RegistryInner {
    registrations: Vec<ComponentRegistration>,
    lookup: FxHashMap<(TypeId, ComponentFlags), ComponentType>,
}

/// The registry of every component type known to an `EntityManager`.
///
/// Types are registered lazily on first use and never removed. The registry is
/// internally locked so it can be shared behind an `Arc`.
pub struct ComponentRegistry {
    max_types: usize,
    inner: RwLock<RegistryInner>,
}

impl ComponentRegistry {
    /// Create a new registry containing only the entity handle type.
    pub fn new() -> ComponentRegistry {
        ComponentRegistry::with_max_types(MAX_COMPONENT_TYPES)
    }

    /// Create a new registry which accepts at most `max_types` types,
    /// including the entity handle type.
    pub fn with_max_types(max_types: usize) -> ComponentRegistry {
        let entity = ComponentRegistration::new::<Entity>(ComponentType::ENTITY);
        let mut lookup = FxHashMap::default();
        lookup.insert((TypeId::of::<Entity>(), ComponentFlags::NONE), ComponentType::ENTITY);

        ComponentRegistry {
            max_types: max_types.clamp(1, MAX_COMPONENT_TYPES),
            inner: RwLock::new(RegistryInner {
                registrations: vec![entity],
                lookup,
            }),
        }
    }

    /// Return the entity handle pseudo-component type.
    pub fn entity_type(&self) -> ComponentType {
        ComponentType::ENTITY
    }

    /// Register `T`, or return its existing registration.
    pub fn register<T: Component>(&self) -> Result<ComponentType> {
        self.register_with_flags::<T>(ComponentFlags::NONE)
    }

    /// Register `T` with the given flags, or return its existing registration.
    ///
    /// Registering the same Rust type with different flags produces distinct
    /// component types.
    pub fn register_with_flags<T: Component>(&self, flags: ComponentFlags) -> Result<ComponentType> {
        let key = (TypeId::of::<T>(), flags);
        if let Some(ty) = self.inner.read().lookup.get(&key) {
            return Ok(*ty);
        }

        if size_of::<T>() > MAX_COMPONENT_SIZE {
            return Err(StorageError::InvalidArgument(format!(
                "component {} is {} bytes, the limit is {}",
                type_name::<T>(), size_of::<T>(), MAX_COMPONENT_SIZE)));
        }

        if align_of::<T>() > COLUMN_ALIGN {
            return Err(StorageError::InvalidArgument(format!(
                "component {} requires {} byte alignment, the limit is {}",
                type_name::<T>(), align_of::<T>(), COLUMN_ALIGN)));
        }

        let mut inner = self.inner.write();
        if let Some(ty) = inner.lookup.get(&key) {
            return Ok(*ty);
        }

        let index = inner.registrations.len();
        if index >= self.max_types {
            return Err(StorageError::capacity("component type registry", self.max_types));
        }

        let ty = ComponentType::from_parts(index, flags, size_of::<T>() == 0);
        inner.registrations.push(ComponentRegistration::new::<T>(ty));
        inner.lookup.insert(key, ty);
        log::debug!("registered component {} as {:?}", type_name::<T>(), ty);
        Ok(ty)
    }

    /// Look up the unflagged registration of `T` without registering it.
    pub fn lookup<T: Component>(&self) -> Option<ComponentType> {
        self.lookup_with_flags::<T>(ComponentFlags::NONE)
    }

    /// Look up the registration of `T` with the given flags.
    pub fn lookup_with_flags<T: Component>(&self, flags: ComponentFlags) -> Option<ComponentType> {
        self.inner.read().lookup.get(&(TypeId::of::<T>(), flags)).copied()
    }

    /// Fetch the registration of a component type.
    pub fn registration(&self, ty: ComponentType) -> Result<ComponentRegistration> {
        let inner = self.inner.read();
        match inner.registrations.get(ty.index()) {
            Some(reg) if reg.component_type == ty => Ok(*reg),
            Some(_) => Err(StorageError::InvalidArgument(format!("unknown component type {:?}", ty))),
            None => Err(StorageError::out_of_range("component type", ty.index(), inner.registrations.len())),
        }
    }

    /// Fetch the registrations of several component types, in order.
    pub fn registrations(&self, types: &[ComponentType]) -> Result<Vec<ComponentRegistration>> {
        types.iter().map(|ty| self.registration(*ty)).collect()
    }

    /// Return the number of registered types, including the entity handle.
    pub fn len(&self) -> usize {
        self.inner.read().registrations.len()
    }

    /// Returns true if only the entity handle type is registered.
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        ComponentRegistry::new()
    }
}

impl Debug for ComponentRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.inner.read().registrations.iter())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_uniqueness() {
        #[derive(Default)]
        struct A(u32);
        #[derive(Default)]
        struct B(u32);

        let registry = ComponentRegistry::new();
        let a = registry.register::<A>().unwrap();
        let b = registry.register::<B>().unwrap();

        assert_ne!(ComponentType::ENTITY, a);
        assert_ne!(ComponentType::ENTITY, b);
        assert_ne!(a, b);
        assert_eq!(registry.register::<A>().unwrap(), a);
        assert_eq!(registry.lookup::<B>(), Some(b));
        assert_eq!(registry.register::<Entity>().unwrap(), ComponentType::ENTITY);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_flags_are_distinct_types() {
        #[derive(Default)]
        struct A(u32);

        let registry = ComponentRegistry::new();
        let plain = registry.register::<A>().unwrap();
        let prefab = registry.register_with_flags::<A>(ComponentFlags::PREFAB).unwrap();
        let disabled = registry.register_with_flags::<A>(ComponentFlags::DISABLED).unwrap();

        assert_ne!(plain, prefab);
        assert_ne!(prefab, disabled);
        assert!(prefab.is_prefab());
        assert!(!prefab.is_disabled());
        assert!(disabled.is_disabled());
        assert_eq!(registry.lookup_with_flags::<A>(ComponentFlags::PREFAB), Some(prefab));
        assert_eq!(registry.registration(prefab).unwrap().size(), 4);
    }

    #[test]
    fn test_zero_sized_types_sort_last() {
        #[derive(Default)]
        struct Tag;
        #[derive(Default)]
        struct Value(u64);

        let registry = ComponentRegistry::new();
        let tag = registry.register::<Tag>().unwrap();
        let value = registry.register::<Value>().unwrap();

        assert!(tag.is_zero_sized());
        assert!(!value.is_zero_sized());
        assert!(tag.index() < value.index());
        assert!(value < tag);
        assert!(ComponentType::ENTITY < value);
        assert_eq!(registry.registration(tag).unwrap().size(), 0);
    }

    #[test]
    fn test_rejected_types() {
        #[derive(Clone, Copy)]
        struct Huge([u8; 40000]);
        impl Default for Huge {
            fn default() -> Huge {
                Huge([0; 40000])
            }
        }

        #[repr(align(128))]
        #[derive(Default)]
        struct OverAligned(u8);

        let registry = ComponentRegistry::new();
        assert!(matches!(registry.register::<Huge>(), Err(StorageError::InvalidArgument(_))));
        assert!(matches!(registry.register::<OverAligned>(), Err(StorageError::InvalidArgument(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_capacity() {
        #[derive(Default)]
        struct A;
        #[derive(Default)]
        struct B;
        #[derive(Default)]
        struct C;

        let registry = ComponentRegistry::with_max_types(3);
        registry.register::<A>().unwrap();
        registry.register::<B>().unwrap();
        assert_eq!(
            registry.register::<C>(),
            Err(StorageError::CapacityExceeded { what: "component type registry", limit: 3 }));
        assert_eq!(registry.lookup::<C>(), None);
    }

    #[test]
    fn test_default() {
        #[derive(Debug, Clone, Copy)]
        struct A(u8);

        impl Default for A {
            fn default() -> A {
                A(42)
            }
        }

        let registry = ComponentRegistry::new();
        let ty = registry.register::<A>().unwrap();
        let component_type = registry.registration(ty).unwrap();
        assert_eq!(component_type.component_type(), ty);
        assert_eq!(component_type.size(), 1);
        assert!(component_type.is::<A>());
        assert!(!component_type.needs_drop());

        let raw = &mut [0];
        unsafe { component_type.construct(raw) };
        assert_eq!(raw[0], 42);
    }

    #[test]
    fn test_destruct() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        #[derive(Default)]
        struct Counted(#[allow(dead_code)] u64);

        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let registry = ComponentRegistry::new();
        let ty = registry.register::<Counted>().unwrap();
        let registration = registry.registration(ty).unwrap();
        assert!(registration.needs_drop());

        let mut storage = [0u64; 1];
        let bytes = bytemuck::bytes_of_mut(&mut storage);
        unsafe {
            registration.construct(bytes);
            registration.destruct(bytes);
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    }
}

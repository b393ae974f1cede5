// Copyright 2025 Strata Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Data type registry
//!
//! Every type stored by the world must be registered here first. The registry
//! classifies each type as a component, relation or resource, assigns it a
//! compact numeric id, and keeps the structural metadata (layout, drop and
//! optional constructors) that the type-erased storage dispatches through.

use std::alloc::Layout;
use std::any::TypeId;

use rustc_hash::FxHashMap;

/// Compact id assigned to each registered data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataTypeId(pub u32);

/// What kind of data a registered type holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Attached to a single entity, stored in dense tables.
    Component,
    /// Connects two entities, stored in sparse relation tables.
    Relation {
        /// `(a, b)` and `(b, a)` are the same relation instance.
        symmetric: bool,
        /// Each from-entity has at most one outgoing edge; the graph is a forest.
        tree: bool,
    },
    /// Singleton value addressed by type.
    Resource,
}

impl Category {
    fn describe(self) -> &'static str {
        match self {
            Category::Component => "component",
            Category::Relation { .. } => "relation",
            Category::Resource => "resource",
        }
    }

    fn same_kind(self, other: Category) -> bool {
        matches!(
            (self, other),
            (Category::Component, Category::Component)
                | (Category::Relation { .. }, Category::Relation { .. })
                | (Category::Resource, Category::Resource)
        )
    }
}

/// Structural metadata for a registered type.
///
/// Moves are bitwise, so no move constructor is modelled. The drop function is
/// `None` exactly when the type is trivially droppable; default and clone
/// constructors are optional and gate the world operations that need them.
pub struct TypeInfo {
    name: &'static str,
    layout: Layout,
    drop_fn: Option<unsafe fn(*mut u8)>,
    default_fn: Option<unsafe fn(*mut u8)>,
    clone_fn: Option<unsafe fn(*const u8, *mut u8)>,
}

impl TypeInfo {
    /// Metadata for `T` with only the drop glue.
    pub fn of<T: 'static>() -> Self {
        Self {
            name: std::any::type_name::<T>(),
            layout: Layout::new::<T>(),
            drop_fn: if std::mem::needs_drop::<T>() {
                Some(|ptr| unsafe {
                    std::ptr::drop_in_place(ptr as *mut T);
                })
            } else {
                None
            },
            default_fn: None,
            clone_fn: None,
        }
    }

    /// Metadata for `T` with drop glue and a default constructor.
    pub fn of_default<T: 'static + Default>() -> Self {
        let mut info = Self::of::<T>();
        info.default_fn = Some(|dst| unsafe {
            std::ptr::write(dst as *mut T, T::default());
        });
        info
    }

    /// Metadata for `T` with drop glue and a clone constructor.
    pub fn of_clone<T: 'static + Clone>() -> Self {
        let mut info = Self::of::<T>();
        info.clone_fn = Some(|src, dst| unsafe {
            std::ptr::write(dst as *mut T, (*(src as *const T)).clone());
        });
        info
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub(crate) fn drop_fn(&self) -> Option<unsafe fn(*mut u8)> {
        self.drop_fn
    }

    pub(crate) fn default_fn(&self) -> Option<unsafe fn(*mut u8)> {
        self.default_fn
    }

    pub(crate) fn clone_fn(&self) -> Option<unsafe fn(*const u8, *mut u8)> {
        self.clone_fn
    }
}

/// Catalog of every data type known to a world.
#[derive(Default)]
pub struct TypeRegistry {
    infos: Vec<TypeInfo>,
    categories: Vec<Category>,
    by_type: FxHashMap<TypeId, DataTypeId>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` as a component. Re-registering under the same category
    /// returns the existing id.
    pub fn register_component<T: 'static>(&mut self) -> DataTypeId {
        self.register_with::<T>(Category::Component, TypeInfo::of::<T>())
    }

    /// Register `T` as a relation with the given flags.
    pub fn register_relation<T: 'static>(&mut self, symmetric: bool, tree: bool) -> DataTypeId {
        self.register_with::<T>(Category::Relation { symmetric, tree }, TypeInfo::of::<T>())
    }

    /// Register `T` as a resource.
    pub fn register_resource<T: 'static>(&mut self) -> DataTypeId {
        self.register_with::<T>(Category::Resource, TypeInfo::of::<T>())
    }

    /// Register with caller-supplied metadata, e.g. to attach optional
    /// constructors via [`TypeInfo::of_default`] or [`TypeInfo::of_clone`].
    ///
    /// # Panics
    /// Panics if `T` is already registered under a different category.
    pub fn register_with<T: 'static>(&mut self, category: Category, info: TypeInfo) -> DataTypeId {
        if let Some(&id) = self.by_type.get(&TypeId::of::<T>()) {
            let existing = self.categories[id.0 as usize];
            assert!(
                existing.same_kind(category),
                "type '{}' is already registered as a {}, cannot re-register as a {}",
                info.name(),
                existing.describe(),
                category.describe(),
            );
            return id;
        }

        let id = DataTypeId(self.infos.len() as u32);
        self.by_type.insert(TypeId::of::<T>(), id);
        self.infos.push(info);
        self.categories.push(category);
        tracing::trace!(name = self.infos[id.0 as usize].name(), id = id.0, "registered type");
        id
    }

    /// Id of a previously registered type.
    ///
    /// # Panics
    /// Panics if `T` was never registered; using an unregistered type is a
    /// programming error.
    pub fn id_of<T: 'static>(&self) -> DataTypeId {
        match self.try_id_of::<T>() {
            Some(id) => id,
            None => panic!(
                "type '{}' was never registered with the world",
                std::any::type_name::<T>()
            ),
        }
    }

    pub fn try_id_of<T: 'static>(&self) -> Option<DataTypeId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Metadata for a registered type id.
    ///
    /// # Panics
    /// Panics on an out-of-range id.
    pub fn info(&self, id: DataTypeId) -> &TypeInfo {
        &self.infos[id.0 as usize]
    }

    pub fn category(&self, id: DataTypeId) -> Category {
        self.categories[id.0 as usize]
    }

    pub fn is_component(&self, id: DataTypeId) -> bool {
        matches!(self.category(id), Category::Component)
    }

    pub fn is_relation(&self, id: DataTypeId) -> bool {
        matches!(self.category(id), Category::Relation { .. })
    }

    pub fn is_resource(&self, id: DataTypeId) -> bool {
        matches!(self.category(id), Category::Resource)
    }

    /// Symmetric/tree flags of a relation type.
    ///
    /// # Panics
    /// Panics if `id` is not a relation.
    pub fn relation_flags(&self, id: DataTypeId) -> (bool, bool) {
        match self.category(id) {
            Category::Relation { symmetric, tree } => (symmetric, tree),
            _ => panic!(
                "type '{}' is not registered as a relation",
                self.info(id).name()
            ),
        }
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        struct Health(u32);
        struct ChildOf;

        let mut types = TypeRegistry::new();
        let health = types.register_component::<Health>();
        let child_of = types.register_relation::<ChildOf>(false, true);

        assert_eq!(types.id_of::<Health>(), health);
        assert!(types.is_component(health));
        assert!(types.is_relation(child_of));
        assert_eq!(types.relation_flags(child_of), (false, true));
    }

    #[test]
    fn test_double_registration_same_category() {
        struct Health(u32);

        let mut types = TypeRegistry::new();
        let a = types.register_component::<Health>();
        let b = types.register_component::<Health>();
        assert_eq!(a, b);
        assert_eq!(types.len(), 1);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_double_registration_other_category() {
        struct Health(u32);

        let mut types = TypeRegistry::new();
        types.register_component::<Health>();
        types.register_relation::<Health>(false, false);
    }

    #[test]
    #[should_panic(expected = "never registered")]
    fn test_unknown_type_is_fatal() {
        struct Missing;

        let types = TypeRegistry::new();
        types.id_of::<Missing>();
    }

    #[test]
    fn test_drop_glue_presence() {
        let plain = TypeInfo::of::<u32>();
        assert!(plain.drop_fn().is_none());

        let boxed = TypeInfo::of::<Vec<u8>>();
        assert!(boxed.drop_fn().is_some());
    }
}

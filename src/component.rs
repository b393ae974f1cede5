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

//! Component and Bundle traits
//!
//! Components are data attached to entities. Bundles group multiple
//! components for spawning. Bundle types must already be registered with the
//! world's type registry; using an unregistered type is a programming error.

use smallvec::{smallvec, SmallVec};

use crate::types::{DataTypeId, TypeRegistry};

/// Maximum number of components supported by Bundle implementations
pub const MAX_BUNDLE_COMPONENTS: usize = 8;

/// Marker trait for data stored by the world.
///
/// Instances must be 'static (no borrowed data) and sendable across threads.
pub trait Component: 'static + Send + Sync {}

impl<T: 'static + Send + Sync> Component for T {}

/// Bundle of components for spawning entities.
pub trait Bundle: Send + 'static {
    /// Registered type ids of all components in the bundle, in tuple order.
    ///
    /// # Panics
    /// Panics if any member type was never registered.
    fn type_ids(types: &TypeRegistry) -> SmallVec<[DataTypeId; MAX_BUNDLE_COMPONENTS]>
    where
        Self: Sized;

    /// Write the components to the per-column slots, in tuple order.
    ///
    /// # Safety
    /// `ptrs` must hold one valid, writable slot per component, aligned for
    /// the respective type. Ownership of the values is transferred.
    unsafe fn write(self, ptrs: &[*mut u8]);
}

impl Bundle for () {
    fn type_ids(_types: &TypeRegistry) -> SmallVec<[DataTypeId; MAX_BUNDLE_COMPONENTS]> {
        SmallVec::new()
    }

    unsafe fn write(self, _ptrs: &[*mut u8]) {}
}

macro_rules! impl_bundle {
    ($($T:ident),*) => {
        impl<$($T: Component),*> Bundle for ($($T,)*) {
            fn type_ids(types: &TypeRegistry) -> SmallVec<[DataTypeId; MAX_BUNDLE_COMPONENTS]> {
                smallvec![$(types.id_of::<$T>()),*]
            }

            #[allow(non_snake_case)]
            unsafe fn write(self, ptrs: &[*mut u8]) {
                let ($($T,)*) = self;
                let mut i = 0;
                $(
                    std::ptr::write(ptrs[i] as *mut $T, $T);
                    i += 1;
                )*
                let _ = i;
            }
        }
    };
}

impl_bundle!(A);
impl_bundle!(A, B);
impl_bundle!(A, B, C);
impl_bundle!(A, B, C, D);
impl_bundle!(A, B, C, D, E);
impl_bundle!(A, B, C, D, E, F);
impl_bundle!(A, B, C, D, E, F, G);
impl_bundle!(A, B, C, D, E, F, G, H);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_type_ids_in_tuple_order() {
        #[derive(Debug)]
        struct Position {
            _x: f32,
        }
        #[derive(Debug)]
        struct Velocity {
            _x: f32,
        }

        let mut types = TypeRegistry::new();
        let pos = types.register_component::<Position>();
        let vel = types.register_component::<Velocity>();

        let ids = <(Velocity, Position)>::type_ids(&types);
        assert_eq!(ids.as_slice(), &[vel, pos]);
    }

    #[test]
    #[should_panic(expected = "never registered")]
    fn test_unregistered_bundle_member_is_fatal() {
        struct Unregistered;

        let types = TypeRegistry::new();
        <(Unregistered,)>::type_ids(&types);
    }
}

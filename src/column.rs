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

//! Type-erased column storage
//!
//! `AnyVec` is a contiguous buffer of values of a single registered type. All
//! construction and destruction goes through the registry-supplied function
//! pointers; the buffer itself only ever moves bytes. Allocation honours the
//! element's alignment, unlike a plain byte vector.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::types::{DataTypeId, TypeInfo};

/// Type-erased contiguous buffer of elements of one data type.
pub struct AnyVec {
    data: NonNull<u8>,
    len: usize,
    cap: usize,
    item_layout: Layout,
    drop_fn: Option<unsafe fn(*mut u8)>,
    element_type: DataTypeId,
}

// Elements are required to be Send + Sync at registration time (the Component
// trait bound), so moving the erased buffer across threads is sound.
unsafe impl Send for AnyVec {}
unsafe impl Sync for AnyVec {}

impl AnyVec {
    pub fn new(element_type: DataTypeId, info: &TypeInfo) -> Self {
        let item_layout = info.layout();
        Self {
            data: NonNull::dangling(),
            len: 0,
            // Zero-sized elements never allocate.
            cap: if item_layout.size() == 0 { usize::MAX } else { 0 },
            item_layout,
            drop_fn: info.drop_fn(),
            element_type,
        }
    }

    pub fn element_type(&self) -> DataTypeId {
        self.element_type
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn item_size(&self) -> usize {
        self.item_layout.size()
    }

    fn array_layout(&self, cap: usize) -> Layout {
        Layout::from_size_align(self.item_size() * cap, self.item_layout.align())
            .expect("column allocation overflow")
    }

    fn reserve_one(&mut self) {
        if self.len < self.cap {
            return;
        }

        let new_cap = (self.cap * 2).max(4);
        let new_layout = self.array_layout(new_cap);
        let ptr = if self.cap == 0 {
            unsafe { alloc::alloc(new_layout) }
        } else {
            let old_layout = self.array_layout(self.cap);
            unsafe { alloc::realloc(self.data.as_ptr(), old_layout, new_layout.size()) }
        };
        self.data = NonNull::new(ptr).unwrap_or_else(|| alloc::handle_alloc_error(new_layout));
        self.cap = new_cap;
    }

    /// Pointer to the element at `row`.
    ///
    /// # Safety
    /// `row` must be within bounds. The caller is responsible for aliasing
    /// discipline on the returned pointer.
    pub unsafe fn get(&self, row: usize) -> *mut u8 {
        debug_assert!(row < self.len, "column row {row} out of bounds ({})", self.len);
        self.data.as_ptr().add(row * self.item_size())
    }

    /// Append an element by moving its bytes in from `src`.
    ///
    /// # Safety
    /// `src` must point to a valid value of the element type; ownership is
    /// transferred, so the caller must not drop the source value.
    pub unsafe fn push_from(&mut self, src: *const u8) {
        self.reserve_one();
        let dst = self.data.as_ptr().add(self.len * self.item_size());
        std::ptr::copy_nonoverlapping(src, dst, self.item_size());
        self.len += 1;
    }

    /// Append an uninitialized slot and return its pointer.
    ///
    /// # Safety
    /// The caller must immediately write a valid value through the returned
    /// pointer before any other column operation runs.
    pub unsafe fn push_uninit(&mut self) -> *mut u8 {
        self.reserve_one();
        let dst = self.data.as_ptr().add(self.len * self.item_size());
        self.len += 1;
        dst
    }

    /// Append a default-constructed element. Requires the registered default
    /// constructor.
    pub fn push_default(&mut self, info: &TypeInfo) {
        let default_fn = info
            .default_fn()
            .unwrap_or_else(|| panic!("type '{}' has no default constructor", info.name()));
        unsafe {
            let dst = self.push_uninit();
            default_fn(dst);
        }
    }

    /// Append a copy of the value at `src`. Requires the registered clone
    /// constructor.
    ///
    /// # Safety
    /// `src` must point to a valid value of the element type; the source is
    /// left intact.
    pub unsafe fn push_clone(&mut self, src: *const u8, info: &TypeInfo) {
        let clone_fn = info
            .clone_fn()
            .unwrap_or_else(|| panic!("type '{}' has no clone constructor", info.name()));
        let dst = self.push_uninit();
        clone_fn(src, dst);
    }

    /// Drop the element at `row` and overwrite it with the value at `src`.
    ///
    /// # Safety
    /// `row` must be in bounds and `src` must point to a valid value of the
    /// element type; ownership of the source value is transferred.
    pub unsafe fn replace_from(&mut self, row: usize, src: *const u8) {
        let dst = self.get(row);
        if let Some(drop_fn) = self.drop_fn {
            drop_fn(dst);
        }
        std::ptr::copy_nonoverlapping(src, dst, self.item_size());
    }

    /// Drop the element at `row` and move the last element into its slot.
    pub fn swap_remove_drop(&mut self, row: usize) {
        assert!(row < self.len);
        unsafe {
            let ptr = self.get(row);
            if let Some(drop_fn) = self.drop_fn {
                drop_fn(ptr);
            }
        }
        self.backfill(row);
    }

    /// Move the last element into `row` without dropping the value there.
    ///
    /// # Safety
    /// The value at `row` must already have been moved out or destroyed.
    pub unsafe fn swap_remove_forget(&mut self, row: usize) {
        debug_assert!(row < self.len);
        self.backfill(row);
    }

    /// Move the element at `row` out into `dst`, back-filling from the last
    /// row.
    ///
    /// # Safety
    /// `dst` must be valid for a write of the element type and must not
    /// overlap the column storage.
    pub unsafe fn swap_remove_into(&mut self, row: usize, dst: *mut u8) {
        debug_assert!(row < self.len);
        std::ptr::copy_nonoverlapping(self.get(row), dst, self.item_size());
        self.backfill(row);
    }

    fn backfill(&mut self, row: usize) {
        let last = self.len - 1;
        if row != last {
            unsafe {
                let src = self.data.as_ptr().add(last * self.item_size());
                let dst = self.data.as_ptr().add(row * self.item_size());
                std::ptr::copy_nonoverlapping(src, dst, self.item_size());
            }
        }
        self.len = last;
    }

    /// Drop all elements, keeping the allocation.
    pub fn clear(&mut self) {
        if let Some(drop_fn) = self.drop_fn {
            for row in 0..self.len {
                unsafe {
                    drop_fn(self.data.as_ptr().add(row * self.item_size()));
                }
            }
        }
        self.len = 0;
    }
}

impl Drop for AnyVec {
    fn drop(&mut self) {
        self.clear();
        if self.item_size() != 0 && self.cap != 0 {
            unsafe {
                alloc::dealloc(self.data.as_ptr(), self.array_layout(self.cap));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct Probe(u64);

    impl Drop for Probe {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn push_value<T>(vec: &mut AnyVec, value: T) {
        unsafe {
            vec.push_from(&value as *const T as *const u8);
        }
        std::mem::forget(value);
    }

    unsafe fn read_value<T: Copy>(vec: &AnyVec, row: usize) -> T {
        *(vec.get(row) as *const T)
    }

    #[test]
    fn test_push_and_get() {
        let info = TypeInfo::of::<u64>();
        let mut vec = AnyVec::new(DataTypeId(0), &info);

        push_value(&mut vec, 11u64);
        push_value(&mut vec, 22u64);
        push_value(&mut vec, 33u64);

        assert_eq!(vec.len(), 3);
        unsafe {
            assert_eq!(read_value::<u64>(&vec, 0), 11);
            assert_eq!(read_value::<u64>(&vec, 2), 33);
        }
    }

    #[test]
    fn test_swap_remove_backfills() {
        let info = TypeInfo::of::<u64>();
        let mut vec = AnyVec::new(DataTypeId(0), &info);
        for v in [1u64, 2, 3, 4] {
            push_value(&mut vec, v);
        }

        vec.swap_remove_drop(1);
        assert_eq!(vec.len(), 3);
        unsafe {
            assert_eq!(read_value::<u64>(&vec, 1), 4);
        }
    }

    #[test]
    fn test_drop_glue_runs() {
        DROPS.store(0, Ordering::SeqCst);
        let info = TypeInfo::of::<Probe>();
        {
            let mut vec = AnyVec::new(DataTypeId(0), &info);
            push_value(&mut vec, Probe(1));
            push_value(&mut vec, Probe(2));
            push_value(&mut vec, Probe(3));

            vec.swap_remove_drop(0);
            assert_eq!(DROPS.load(Ordering::SeqCst), 1);
        }
        // Remaining two dropped with the vector.
        assert_eq!(DROPS.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_move_out_skips_drop() {
        DROPS.store(0, Ordering::SeqCst);
        let info = TypeInfo::of::<Probe>();
        let mut vec = AnyVec::new(DataTypeId(0), &info);
        push_value(&mut vec, Probe(7));

        let mut slot = std::mem::MaybeUninit::<Probe>::uninit();
        unsafe {
            vec.swap_remove_into(0, slot.as_mut_ptr() as *mut u8);
            let value = slot.assume_init();
            assert_eq!(value.0, 7);
            assert_eq!(DROPS.load(Ordering::SeqCst), 0);
            drop(value);
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_optional_constructors() {
        let info = TypeInfo::of_default::<u64>();
        let mut column = AnyVec::new(DataTypeId(0), &info);
        column.push_default(&info);
        unsafe {
            assert_eq!(read_value::<u64>(&column, 0), 0);
        }

        let info = TypeInfo::of_clone::<Vec<u8>>();
        let mut column = AnyVec::new(DataTypeId(1), &info);
        let source = vec![1u8, 2, 3];
        unsafe {
            column.push_clone(&source as *const Vec<u8> as *const u8, &info);
            assert_eq!(*(column.get(0) as *const Vec<u8>), vec![1, 2, 3]);
        }
        // The source is still owned by the caller.
        assert_eq!(source.len(), 3);
    }

    #[test]
    #[should_panic(expected = "no default constructor")]
    fn test_missing_constructor_is_fatal() {
        let info = TypeInfo::of::<u64>();
        let mut column = AnyVec::new(DataTypeId(0), &info);
        column.push_default(&info);
    }

    #[test]
    fn test_zero_sized_elements() {
        struct Marker;
        let info = TypeInfo::of::<Marker>();
        let mut vec = AnyVec::new(DataTypeId(0), &info);
        push_value(&mut vec, Marker);
        push_value(&mut vec, Marker);
        assert_eq!(vec.len(), 2);
        vec.swap_remove_drop(0);
        assert_eq!(vec.len(), 1);
    }
}

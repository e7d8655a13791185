//! Growable array with a fixed memory layout
//!
//! Token streams describe dynamic containers by offset only, so the tracer
//! must find an array's element base and length without knowing the element
//! type. `ManagedArray<T>` is `#[repr(C)]` with the header layout
//! `(data, len, capacity)` for every `T`, which `RawArrayHeader` mirrors.

use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// Growable array usable as a traced field
#[repr(C)]
pub struct ManagedArray<T> {
    data: NonNull<T>,
    len: usize,
    capacity: usize,
    _owns: PhantomData<T>,
}

/// Type-erased view of a `ManagedArray` header
#[repr(C)]
pub(crate) struct RawArrayHeader {
    pub(crate) data: *mut u8,
    pub(crate) len: usize,
    _capacity: usize,
}

// SAFETY: ManagedArray owns its elements like Vec<T>.
unsafe impl<T: Send> Send for ManagedArray<T> {}
unsafe impl<T: Sync> Sync for ManagedArray<T> {}

impl<T> ManagedArray<T> {
    /// Create an empty array
    pub fn new() -> Self {
        Self::from(Vec::new())
    }

    /// Create an empty array with room for `capacity` elements
    pub fn with_capacity(capacity: usize) -> Self {
        Self::from(Vec::with_capacity(capacity))
    }

    /// Append an element
    pub fn push(&mut self, value: T) {
        self.edit(|v| v.push(value));
    }

    /// Remove the last element
    pub fn pop(&mut self) -> Option<T> {
        self.edit(|v| v.pop())
    }

    /// Insert at `index`, shifting later elements
    pub fn insert(&mut self, index: usize, value: T) {
        self.edit(|v| v.insert(index, value));
    }

    /// Remove at `index`, shifting later elements
    pub fn remove(&mut self, index: usize) -> T {
        self.edit(|v| v.remove(index))
    }

    /// Remove at `index`, replacing it with the last element
    pub fn swap_remove(&mut self, index: usize) -> T {
        self.edit(|v| v.swap_remove(index))
    }

    /// Shorten to `len` elements
    pub fn truncate(&mut self, len: usize) {
        self.edit(|v| v.truncate(len));
    }

    /// Remove all elements
    pub fn clear(&mut self) {
        self.edit(|v| v.clear());
    }

    /// Keep only elements matching `keep`
    pub fn retain<F: FnMut(&T) -> bool>(&mut self, keep: F) {
        self.edit(|v| v.retain(keep));
    }

    /// Convert into a `Vec`
    pub fn into_vec(self) -> Vec<T> {
        let this = ManuallyDrop::new(self);
        // SAFETY: parts were produced by a Vec<T> and ownership moves back.
        unsafe { Vec::from_raw_parts(this.data.as_ptr(), this.len, this.capacity) }
    }

    /// Run `f` on the array as a `Vec`, writing the parts back even on panic
    fn edit<R>(&mut self, f: impl FnOnce(&mut Vec<T>) -> R) -> R {
        struct WriteBack<'a, T> {
            array: &'a mut ManagedArray<T>,
            vec: ManuallyDrop<Vec<T>>,
        }

        impl<T> Drop for WriteBack<'_, T> {
            fn drop(&mut self) {
                self.array.data = NonNull::new(self.vec.as_mut_ptr()).unwrap_or_else(NonNull::dangling);
                self.array.len = self.vec.len();
                self.array.capacity = self.vec.capacity();
            }
        }

        // SAFETY: parts were produced by a Vec<T>; the guard hands them back.
        let vec = unsafe { Vec::from_raw_parts(self.data.as_ptr(), self.len, self.capacity) };
        let mut guard = WriteBack {
            array: self,
            vec: ManuallyDrop::new(vec),
        };
        f(&mut guard.vec)
    }
}

impl RawArrayHeader {
    /// Read the header of a `ManagedArray` located at `field`
    ///
    /// # Safety
    ///
    /// `field` must point to a live `ManagedArray<T>` for some `T`.
    #[inline(always)]
    pub(crate) unsafe fn read<'a>(field: *const u8) -> &'a RawArrayHeader {
        &*(field as *const RawArrayHeader)
    }
}

impl<T> From<Vec<T>> for ManagedArray<T> {
    fn from(vec: Vec<T>) -> Self {
        let mut vec = ManuallyDrop::new(vec);
        Self {
            data: NonNull::new(vec.as_mut_ptr()).unwrap_or_else(NonNull::dangling),
            len: vec.len(),
            capacity: vec.capacity(),
            _owns: PhantomData,
        }
    }
}

impl<T> FromIterator<T> for ManagedArray<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<Vec<T>>())
    }
}

impl<T> Extend<T> for ManagedArray<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.edit(|v| v.extend(iter));
    }
}

impl<T> Drop for ManagedArray<T> {
    fn drop(&mut self) {
        // SAFETY: parts were produced by a Vec<T> that we still own.
        drop(unsafe { Vec::from_raw_parts(self.data.as_ptr(), self.len, self.capacity) });
    }
}

impl<T> Deref for ManagedArray<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: data is valid for len initialised elements.
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }
}

impl<T> DerefMut for ManagedArray<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: data is valid for len initialised elements.
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
    }
}

impl<T> Default for ManagedArray<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Clone for ManagedArray<T> {
    fn clone(&self) -> Self {
        Self::from(self.to_vec())
    }
}

impl<T: fmt::Debug> fmt::Debug for ManagedArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T: PartialEq> PartialEq for ManagedArray<T> {
    fn eq(&self, other: &Self) -> bool {
        self[..] == other[..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjectId, ObjectRef};

    #[test]
    fn test_push_pop() {
        let mut array = ManagedArray::new();
        assert!(array.is_empty());
        array.push(1);
        array.push(2);
        array.push(3);
        assert_eq!(&array[..], &[1, 2, 3]);
        assert_eq!(array.pop(), Some(3));
        assert_eq!(array.len(), 2);
    }

    #[test]
    fn test_insert_remove_retain() {
        let mut array: ManagedArray<i32> = (0..6).collect();
        array.insert(0, 10);
        assert_eq!(array.remove(1), 0);
        array.retain(|&x| x % 2 == 0);
        assert_eq!(array.into_vec(), vec![10, 2, 4]);
    }

    #[test]
    fn test_raw_header_matches() {
        let array: ManagedArray<ObjectRef> = vec![
            ObjectRef::new(ObjectId(1), 0),
            ObjectRef::new(ObjectId(2), 0),
        ]
        .into();
        let header = unsafe { RawArrayHeader::read(&array as *const _ as *const u8) };
        assert_eq!(header.len, 2);
        assert_eq!(header.data as *const ObjectRef, array.as_ptr());
    }

    #[test]
    fn test_drops_elements() {
        use std::rc::Rc;

        let marker = Rc::new(());
        {
            let mut array = ManagedArray::new();
            for _ in 0..10 {
                array.push(marker.clone());
            }
            assert_eq!(Rc::strong_count(&marker), 11);
            array.truncate(5);
            assert_eq!(Rc::strong_count(&marker), 6);
        }
        assert_eq!(Rc::strong_count(&marker), 1);
    }

    #[test]
    fn test_clone_and_eq() {
        let array: ManagedArray<u8> = vec![1, 2, 3].into();
        let copy = array.clone();
        assert_eq!(array, copy);
        assert_eq!(format!("{:?}", copy), "[1, 2, 3]");
    }
}

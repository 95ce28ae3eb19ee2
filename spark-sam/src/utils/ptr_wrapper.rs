use std::ops::Deref;

/// Raw base pointer of a scratch arena that can cross into the worker pool.
///
/// The executor hands out disjoint sub-slices derived from this pointer; the
/// allocator guarantees that a node's output never overlaps a live input.
#[derive(Copy, Clone)]
pub(crate) struct SafeVecPtr<T>(*mut T);

impl<T> SafeVecPtr<T> {
    pub(crate) fn new(ptr: *mut T) -> Self {
        SafeVecPtr(ptr)
    }

    /// # Safety
    /// `offset + len` must lie inside the allocation and no mutable slice may
    /// overlap the returned range while it is alive.
    pub(crate) unsafe fn slice<'a>(&self, offset: usize, len: usize) -> &'a [T] {
        std::slice::from_raw_parts(self.0.add(offset), len)
    }

    /// # Safety
    /// `offset + len` must lie inside the allocation and the range must not be
    /// aliased by any other live slice.
    pub(crate) unsafe fn slice_mut<'a>(&self, offset: usize, len: usize) -> &'a mut [T] {
        std::slice::from_raw_parts_mut(self.0.add(offset), len)
    }
}

impl<T> Deref for SafeVecPtr<T> {
    type Target = *mut T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

unsafe impl<T> Send for SafeVecPtr<T> {}
unsafe impl<T> Sync for SafeVecPtr<T> {}

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use super::trace::Traced;

/// A raw handle to a heap object. The pointee is owned by the heap's object
/// vector (boxed, so its address is stable); the handle stays valid until
/// the collector frees the object.
pub struct Gc<T: ?Sized> {
    ptr: NonNull<Traced<T>>,
}

impl<T> Gc<T> {
    /// Called by the heap when it registers a new allocation.
    pub(super) fn new(ptr: &mut Traced<T>) -> Self {
        Self {
            ptr: NonNull::new(ptr).unwrap(),
        }
    }

    pub fn as_ref(&self) -> &T {
        unsafe { &self.ptr.as_ref().data }
    }

    pub fn as_mut(&mut self) -> &mut T {
        unsafe { &mut self.ptr.as_mut().data }
    }

    pub fn ptr_eq(lhs: &Gc<T>, rhs: &Gc<T>) -> bool {
        lhs.ptr == rhs.ptr
    }

    pub(super) fn marked(&self) -> bool {
        unsafe { self.ptr.as_ref().marked() }
    }

    pub(super) fn mark(&self) {
        unsafe { self.ptr.as_ref().set_mark(true) }
    }
}

impl<T> Copy for Gc<T> {}

impl<T> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Deref for Gc<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.as_ref()
    }
}

impl<T> DerefMut for Gc<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut()
    }
}

impl<T: fmt::Debug> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gc {{ ptr: {:?} }}", self.ptr.as_ptr())
    }
}

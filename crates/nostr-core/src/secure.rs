//! Wipe-on-drop storage for secret material.
//!
//! A [`SecretBuffer`] is a page-aligned heap region that is zero-initialized,
//! locked against swap when the platform allows it, wiped with volatile
//! writes on drop, and compared in constant time. It is deliberately not
//! `Clone`; duplication is an explicit `duplicate()` call.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use subtle::ConstantTimeEq;
use zeroize::Zeroize;

fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 { sz as usize } else { 4096 }
}

/// Owned secret bytes with wipe-on-drop and best-effort mlock.
pub struct SecretBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
    locked: bool,
}

// The buffer is exclusively owned and the raw pointer is never aliased
// outside `as_slice`/`as_mut_slice` borrows.
unsafe impl Send for SecretBuffer {}
unsafe impl Sync for SecretBuffer {}

impl SecretBuffer {
    /// Allocate `len` zeroed bytes, page-aligned, and attempt to lock the
    /// pages against swap. mlock failure is recorded, not fatal.
    pub fn new(len: usize) -> Self {
        assert!(len > 0, "SecretBuffer length must be non-zero");
        let page = page_size();
        let size = len.div_ceil(page) * page;
        let layout = Layout::from_size_align(size, page).expect("valid secret buffer layout");
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout)
        };
        // SAFETY: ptr covers `size` bytes owned by this allocation.
        let locked = unsafe { libc::mlock(ptr.as_ptr() as *const libc::c_void, size) == 0 };
        SecretBuffer {
            ptr,
            len,
            layout,
            locked,
        }
    }

    /// Allocate and fill from `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut buf = Self::new(data.len());
        buf.as_mut_slice().copy_from_slice(data);
        buf
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the pages were successfully locked against swap.
    pub fn locked(&self) -> bool {
        self.locked
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for len bytes and we hold &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Constant-time equality. Never short-circuits on mismatch; buffers
    /// of different length compare unequal after a full-width pass.
    pub fn ct_eq(&self, other: &SecretBuffer) -> bool {
        if self.len != other.len {
            // Burn the same comparison work against self to keep timing
            // independent of content.
            let _ = self.as_slice().ct_eq(self.as_slice());
            return false;
        }
        self.as_slice().ct_eq(other.as_slice()).into()
    }

    /// Explicit deep copy into a fresh buffer. The only duplication path.
    pub fn duplicate(&self) -> SecretBuffer {
        SecretBuffer::from_slice(self.as_slice())
    }
}

impl Drop for SecretBuffer {
    fn drop(&mut self) {
        let size = self.layout.size();
        // SAFETY: ptr is valid for the full allocation size.
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr(), size).zeroize();
            if self.locked {
                libc::munlock(self.ptr.as_ptr() as *const libc::c_void, size);
            }
            alloc::dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

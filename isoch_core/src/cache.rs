//! Cache-line padding helper.
//!
//! On most modern x86/ARM CPUs, the destructive interference size is 64
//! bytes. Padding hot atomics onto separate cache lines prevents false
//! sharing between a producer and a consumer running on different cores.

/// Wraps a value so it occupies its own cache line.
#[repr(align(64))]
pub struct CachePadded<T>(pub T);

impl<T> CachePadded<T> {
    /// Wrap `value` in a cache-line-aligned cell.
    pub const fn new(value: T) -> Self {
        CachePadded(value)
    }
}

impl<T> core::ops::Deref for CachePadded<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> core::ops::DerefMut for CachePadded<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::align_of;

    #[test]
    fn is_cache_line_aligned() {
        assert_eq!(align_of::<CachePadded<u8>>(), 64);
    }
}

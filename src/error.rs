use alloc::alloc::handle_alloc_error;
use alloc::vec::Vec;
use core::alloc::Layout;

/// The error type for `try_*` methods that may need to allocate.
///
/// A failed operation leaves the table exactly as it was before the call:
/// no chunk, bucket array, or free-list change becomes visible.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TryReserveError {
    /// The requested capacity exceeds what the table can address, or the
    /// byte size of the allocation overflows `isize`.
    #[error("capacity overflow")]
    CapacityOverflow,

    /// The global allocator returned an error.
    #[error("memory allocation of {} bytes failed", .layout.size())]
    AllocError {
        /// The layout of the allocation request that failed.
        layout: Layout,
    },
}

/// Reserves room for exactly `additional` more elements in `vec`, mapping
/// failures onto [`TryReserveError`].
pub(crate) fn try_reserve_exact<T>(
    vec: &mut Vec<T>,
    additional: usize,
) -> Result<(), TryReserveError> {
    let wanted = vec
        .len()
        .checked_add(additional)
        .ok_or(TryReserveError::CapacityOverflow)?;
    let layout = Layout::array::<T>(wanted).map_err(|_| TryReserveError::CapacityOverflow)?;
    vec.try_reserve_exact(additional)
        .map_err(|_| TryReserveError::AllocError { layout })
}

/// Unwraps the result of a fallible operation for the infallible API
/// surface, diverting to the global allocation error handler the same way
/// the standard collections do.
#[inline]
pub(crate) fn infallible<T>(result: Result<T, TryReserveError>) -> T {
    match result {
        Ok(value) => value,
        Err(TryReserveError::CapacityOverflow) => panic!("capacity overflow"),
        Err(TryReserveError::AllocError { layout }) => handle_alloc_error(layout),
    }
}

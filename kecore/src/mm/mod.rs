//! Host physical page management.
//!
//! Page tables and other hypervisor bookkeeping live in fixed-size pages taken
//! from a [`PagePool`]. A pool manages one contiguous [`PoolRegion`] with a
//! bitmap; a set bit means the page is allocated.
mod pool;
mod region;

pub use pool::PagePool;
pub use region::PoolRegion;

//! Rate limiting
//!
//! Token buckets layered per peer, per download and per session, plus the
//! allocator that divides session caps between downloads.

pub mod allocator;
pub mod bucket;
pub mod limiter;
pub mod meter;

pub use allocator::{Allocation, AllocationInput, RateAllocator};
pub use bucket::TokenBucket;
pub use limiter::{is_local_peer, BucketPair, Direction, PeerLimiter, RateFudge, SharedBucket};
pub use meter::RateMeter;

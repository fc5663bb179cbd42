/// Least-recently-used eviction with time-based expiry.
pub mod lru;

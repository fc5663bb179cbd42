/// Async-backed cache implementation.
pub mod async_backed;
/// Cache eviction policies.
pub mod eviction;

//! `Arc` and atomics, swapped for loom's under `cfg(loom)`.
//!
//! Only the eviction tracker's shared state goes through here. Types that are coerced to trait
//! objects keep using `std::sync::Arc`.
pub mod atomic;

#[cfg(loom)]
pub use loom::sync::Arc;

#[cfg(not(loom))]
pub use std::sync::Arc;

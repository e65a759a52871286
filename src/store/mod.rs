//! Durable cache stores for offline resource access.
//!
//! Each resource class gets its own named, versioned store on disk.
//! Entries map a normalized absolute URL to a stored response and are
//! written atomically - a failed download never leaves a truncated
//! entry behind. Stale store generations are deleted once at worker
//! startup.

pub mod cache;
pub mod generation;

pub use cache::{CacheStore, CachedResponse, EMPTY_FEATURE_COLLECTION};
pub use generation::{clean_stale_generations, CacheGeneration, StoreClass};

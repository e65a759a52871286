//! HTTP fetch layer.
//!
//! This module provides the `HttpFetcher` used by the worker runtime to
//! reach the chart server and the allow-listed external hosts. All
//! cache misses funnel through it.

pub mod client;
pub mod error;

pub use client::HttpFetcher;
pub use error::FetchError;

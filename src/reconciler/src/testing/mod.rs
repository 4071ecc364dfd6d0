//! Test utilities for the reconciler.
//!
//! This module is only available when the `testing` feature is enabled or during tests:
//!
//! ```toml
//! [dev-dependencies]
//! reconciler = { path = "../reconciler", features = ["testing"] }
//! ```

mod memory;

pub use memory::{Call, MemoryEndpoint};

//! Lifecycle integration stories for Canopy
//!
//! These tests drive the controllers end to end against the in-memory
//! control plane, object store and project store. They need no cluster:
//!
//! ```bash
//! cargo test --test lifecycle
//! ```

mod lifecycle_tests;

//! Integration stories for project lifecycles
//!
//! # Test Organization
//!
//! - `environment`: starting projects, idempotent re-apply and isolation of
//!   per-container failures
//!
//! - `hibernation`: idle detection, archive round trips through a real
//!   scratch volume, and resume
//!
//! - `concurrency`: transitions racing on the same project under both lock
//!   policies
//!
//! - `routing`: regional routing stability as projects come and go
//!
//! Shared setup lives in `fixtures`.

mod concurrency;
mod environment;
mod fixtures;
mod hibernation;
mod routing;

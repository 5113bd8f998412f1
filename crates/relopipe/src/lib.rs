//! Public facade crate for `relopipe`.
//!
//! This crate intentionally contains no IO or provider-specific logic.
//! It re-exports the backend-agnostic types/traits from `relopipe-core`.

pub use relopipe_core::*;

//! Trait seams for the store and the external collaborators.
//!
//! Stages receive these as `Arc<dyn Trait>` at construction; nothing in the
//! crate reaches for a global handle.

pub mod external_api;
pub mod knowledge;
pub mod model;
pub mod searcher;
pub mod store;

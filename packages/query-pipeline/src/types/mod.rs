//! Records that cross stage boundaries.
//!
//! Everything here is `Serialize + Deserialize`: stages hand these off by
//! value through the broker, never by reference.

pub mod config;
pub mod feedback;
pub mod generation;
pub mod intent;
pub mod retrieval;

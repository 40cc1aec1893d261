//! Pipeline stages.

pub mod feedback;
pub mod generation;
pub mod intent;
pub mod retrieval;

pub use feedback::FeedbackStage;
pub use generation::GenerationStage;
pub use intent::IntentStage;
pub use retrieval::{RetrievalService, RetrievalStage};

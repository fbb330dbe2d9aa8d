pub mod backoff;
pub mod clock;
mod conflict;
pub mod engine;
pub mod index;
pub mod mapping;
pub mod marker;
pub mod metadata;
pub mod queue;
pub mod task_store;

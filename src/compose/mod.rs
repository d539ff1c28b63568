//! Compose side of the pipeline: discover surfaces, keep a beacon in their
//! body and register the message when it is sent.

pub mod extract;
pub mod guard;
pub mod interceptor;
pub mod watcher;

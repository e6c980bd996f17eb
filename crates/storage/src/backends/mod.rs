//! Storage backend implementations.

pub mod large_object;

//! # Context Feeder Core
//!
//! Runtime-agnostic logic for Context Feeder: the entity model, attribute
//! classification, measurement document assembly, index naming and
//! lifecycle, bulk batching, and the two I/O seams ([`broker::ContextBroker`]
//! and [`store::DocumentStore`]) that the application crate implements over
//! HTTP.
//!
//! This crate contains no tokio, HTTP, or filesystem dependencies. The
//! in-memory implementations in [`broker::memory`] and [`store::memory`]
//! record every call so that the pipeline can be exercised without a
//! running broker or document store.

pub mod broker;
pub mod bulk;
pub mod classify;
pub mod document;
pub mod index;
pub mod models;
pub mod pipeline;
pub mod store;

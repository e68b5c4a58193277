//! # Context Feeder
//!
//! Feeds live entity state from an NGSI v2 context broker into per-tenant
//! Elasticsearch indices, one measurement document per attribute.
//!
//! Each configured task either polls the broker on a schedule or keeps a
//! standing subscription whose notifications arrive at the built-in
//! receiver. Either way, entities go through the same pipeline:
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  fetch / notify  ┌────────────────┐   bulk   ┌───────────────┐
//! │ Context      │─────────────────▶│ Task           │─────────▶│ Elasticsearch │
//! │ broker       │                  │ filter+classify│          │ per-domain +  │
//! │ (NGSI v2)    │◀─── subscribe ───│ build+route    │          │ tenant index  │
//! └──────────────┘                  └───────▲────────┘          └───────────────┘
//!                                           │
//!                                   ┌───────┴────────┐
//!                                   │ Orchestrator   │
//!                                   │ + receiver     │
//!                                   └────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! feeder --config ./config/feeder.toml check   # probe broker and store
//! feeder --config ./config/feeder.toml run     # start feeding
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`ngsi`] | Context broker HTTP client |
//! | [`elastic`] | Document store HTTP client |
//! | [`task`] | Task lifecycle and feeding cycles |
//! | [`orchestrator`] | Staggered start-up and scheduling |
//! | [`server`] | Push-notification receiver |
//! | [`check`] | Connectivity check command |
//! | [`error`] | Cycle faults |
//!
//! The pure pipeline (classification, documents, index naming, bulk
//! batching) lives in the `context-feeder-core` crate.

pub mod check;
pub mod config;
pub mod elastic;
pub mod error;
pub mod ngsi;
pub mod orchestrator;
pub mod server;
pub mod task;

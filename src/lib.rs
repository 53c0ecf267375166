//! # imagegraph
//!
//! A partially loaded, continuously extended graph of geotagged images, backed by a remote
//! data provider.
//!
//! ## Overview
//!
//! Consumers ask for an image by id and get it back once it is usable: core data fetched,
//! binary assets loaded and navigation edges computed. The graph fetches only what is missing
//! and never runs two fetches for the same cache key at once. Work in progress is cancelled
//! when the consumer's intent changes (graph mode switch, filter change, reset).
//!
//! ### Key Features
//!
//! - **Single-flight caching**: concurrent requests for one key share one fetch
//! - **Cancellable pipelines**: per-image phases abandoned on reset, mode or filter change
//! - **Navigation edges**: sequence (`Next`/`Prev`) and spatial (step/spherical) edges
//! - **Bounded memory**: `uncache` evicts everything outside the caller's working set
//! - **Live data**: provider notifications refresh cached cells and invalidate spatial edges
//!
//! ## Architecture
//!
//! - **[`provider`]**: the [`provider::DataProvider`] capability interface, entity contracts and
//!   an in-memory provider
//! - **[`graph`]**: entity store, cache-key tracker and the [`graph::Graph`] operations
//! - **[`service`]**: [`service::GraphService`], the per-image pipeline and mode/filter/reset
//!   handling
//! - **[`cancel`]**: cooperative cancellation tokens
//! - **[`config`]**: TOML-backed graph configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use imagegraph::{graph::Graph, provider::MemoryProvider, service::GraphService};
//! use std::sync::Arc;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let provider = Arc::new(MemoryProvider::from_json_path("./dataset.json")?);
//!     let service = GraphService::new(Graph::new(provider));
//!
//!     let image = service.cache_image("image-id").await?;
//!     for edge in image.sequence_edges.edges.iter().chain(&image.spatial_edges.edges) {
//!         println!("{:?} -> {}", edge.data.direction, edge.target);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Concurrency
//!
//! Fetches run on their own tokio tasks and always complete, updating the graph even when the
//! pipeline that started them has been cancelled. Cancelling a pipeline only stops it from
//! reacting to those completions. Graph state sits behind a single lock that is never held
//! across an `.await`.
//!
//! ## Features
//!
//! - `bin`: the `imagegraph` command line tool

pub mod cancel;
pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod provider;
pub mod service;
#[cfg(test)]
mod tests;

pub use error::*;

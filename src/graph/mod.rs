//! The image graph: entities, their cache bookkeeping and the operations that fill them.
//!
//! [Graph] owns an [EntityStore] of images, sequences and cells plus a [CacheTracker] that
//! guarantees at most one fetch per [CacheKey]. Network-bound operations return a [Pending]
//! handle; predicates (`has_*`, `is_caching_*`) and edge computations are synchronous.

mod base;
mod edges;
mod filter;
mod image;
mod store;
mod tracker;

pub use base::{Graph, GraphState};
pub use edges::{bearing, distance, DefaultEdgeCalculator, EdgeCalculator};
pub use filter::{ComparisonOperator, FilterExpression, FilterKey, FilterValue, SetOperator};
pub use image::{
    Cell, Image, ImageAssets, ImageCache, NavigationDirection, NavigationEdge,
    NavigationEdgeData, NavigationEdgeStatus, Sequence,
};
pub use store::{Entity, EntityStore, Store};
pub use tracker::{settled, Begin, CacheKey, CacheTracker, Pending};

//! Data provider interface: the remote source of images, sequences and cell listings.
//!
//! The graph never talks to the network itself. Everything it knows arrives through a
//! [DataProvider], whose entity contracts are defined here. A dataset-backed implementation,
//! [MemoryProvider], is included for tooling and tests.

mod geometry;
mod memory;

pub use geometry::{GeometryProvider, GridGeometry};
pub use memory::{Dataset, MemoryProvider};

use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::sync::broadcast;

use crate::{error::GraphError, event::ProviderEvent};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LngLat {
    pub lng: f64,
    pub lat: f64,
}

impl LngLat {
    pub fn new(lng: f64, lat: f64) -> Self {
        LngLat { lng, lat }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct IdEnt {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CreatorEnt {
    pub id: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UrlEnt {
    pub id: String,
    pub url: String,
}

/// Identity and location of an image; what a cell listing carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreImageEnt {
    pub id: String,
    pub geometry: LngLat,
    #[serde(default)]
    pub computed_geometry: Option<LngLat>,
    pub sequence: IdEnt,
}

/// Attributes that make an image complete. Fetched by id, never by cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SpatialImageEnt {
    pub id: String,
    pub altitude: Option<f64>,
    pub atomic_scale: Option<f64>,
    pub camera_parameters: Vec<f64>,
    pub camera_type: String,
    pub captured_at: i64,
    pub cluster: UrlEnt,
    pub compass_angle: f64,
    pub computed_altitude: Option<f64>,
    pub computed_compass_angle: Option<f64>,
    pub computed_rotation: Option<[f64; 3]>,
    pub creator: CreatorEnt,
    pub exif_orientation: u8,
    pub height: u32,
    pub merge_id: Option<String>,
    pub mesh: UrlEnt,
    pub owner: IdEnt,
    pub private: Option<bool>,
    pub quality_score: Option<f64>,
    pub thumb: UrlEnt,
    pub width: u32,
}

/// Core and spatial attributes together, as returned for a full fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageEnt {
    #[serde(flatten)]
    pub core: CoreImageEnt,
    pub spatial: SpatialImageEnt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SequenceEnt {
    pub id: String,
    pub image_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreImagesContract {
    pub cell_id: String,
    pub images: Vec<CoreImageEnt>,
}

/// One entry of a by-id response. `node` is `None` when the provider does not know the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntResult<T> {
    pub node_id: String,
    pub node: Option<T>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MeshContract {
    pub vertices: Vec<f32>,
    pub faces: Vec<u32>,
}

/// Source of every entity the graph caches.
///
/// Implementations report failures as [GraphError::Provider]; the graph propagates them to the
/// caller that triggered the fetch and never retries.
pub trait DataProvider: Send + Sync + 'static {
    fn geometry(&self) -> &dyn GeometryProvider;

    /// Core images located in a cell.
    fn get_core_images(
        &self,
        cell_id: &str,
    ) -> impl Future<Output = Result<CoreImagesContract, GraphError>> + Send;

    /// Core and spatial attributes for each requested id.
    fn get_images(
        &self,
        image_ids: &[String],
    ) -> impl Future<Output = Result<Vec<EntResult<ImageEnt>>, GraphError>> + Send;

    /// Spatial attributes only, for images whose core is already known.
    fn get_spatial_images(
        &self,
        image_ids: &[String],
    ) -> impl Future<Output = Result<Vec<EntResult<SpatialImageEnt>>, GraphError>> + Send;

    fn get_sequence(
        &self,
        sequence_id: &str,
    ) -> impl Future<Output = Result<Option<SequenceEnt>, GraphError>> + Send;

    fn get_image_buffer(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<Vec<u8>, GraphError>> + Send;

    fn get_mesh(&self, url: &str) -> impl Future<Output = Result<MeshContract, GraphError>> + Send;

    /// Push notifications about data published after the graph was populated.
    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent>;
}

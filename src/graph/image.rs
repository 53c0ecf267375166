//! Entities held by the graph: images, sequences, cells and the navigation edges between
//! images.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt, sync::Arc};

use super::filter::{FilterKey, FilterValue};
use crate::provider::{CoreImageEnt, LngLat, MeshContract, SequenceEnt, SpatialImageEnt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NavigationDirection {
    Next,
    Prev,
    StepForward,
    StepBackward,
    StepLeft,
    StepRight,
    TurnLeft,
    TurnRight,
    TurnU,
    Spherical,
    Similar,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationEdgeData {
    pub direction: NavigationDirection,
    /// Radians, clockwise from north. Absent for sequence edges.
    pub world_motion_azimuth: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationEdge {
    pub source: String,
    pub target: String,
    pub data: NavigationEdgeData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NavigationEdgeStatus {
    pub cached: bool,
    pub edges: Vec<NavigationEdge>,
}

impl NavigationEdgeStatus {
    pub fn cache(&mut self, edges: Vec<NavigationEdge>) {
        self.cached = true;
        self.edges = edges;
    }

    pub fn reset(&mut self) {
        self.cached = false;
        self.edges.clear();
    }
}

/// Binary assets of an image, as delivered by the provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageAssets {
    pub image: Vec<u8>,
    pub mesh: MeshContract,
}

/// Per-image cache created on first use by a consumer and dropped on eviction.
#[derive(Debug, Clone, Default)]
pub struct ImageCache {
    pub assets: Option<Arc<ImageAssets>>,
}

/// A geotagged image.
#[derive(Debug, Clone)]
pub struct Image {
    core: CoreImageEnt,
    spatial: Option<SpatialImageEnt>,
    cache: Option<ImageCache>,
    pub sequence_edges: NavigationEdgeStatus,
    pub spatial_edges: NavigationEdgeStatus,
}

impl Image {
    pub fn new(core: CoreImageEnt) -> Self {
        Image {
            core,
            spatial: None,
            cache: None,
            sequence_edges: NavigationEdgeStatus::default(),
            spatial_edges: NavigationEdgeStatus::default(),
        }
    }

    pub fn new_complete(core: CoreImageEnt, spatial: SpatialImageEnt) -> Self {
        let mut image = Image::new(core);
        image.make_complete(spatial);
        image
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn sequence_id(&self) -> &str {
        &self.core.sequence.id
    }

    pub fn core(&self) -> &CoreImageEnt {
        &self.core
    }

    pub fn spatial(&self) -> Option<&SpatialImageEnt> {
        self.spatial.as_ref()
    }

    /// Position as originally recorded; used for cell bucketing.
    pub fn original_lng_lat(&self) -> LngLat {
        self.core.geometry
    }

    /// Best known position: computed when available, original otherwise.
    pub fn lng_lat(&self) -> LngLat {
        self.core.computed_geometry.unwrap_or(self.core.geometry)
    }

    /// Best known compass angle in degrees.
    pub fn compass_angle(&self) -> Option<f64> {
        self.spatial
            .as_ref()
            .map(|s| s.computed_compass_angle.unwrap_or(s.compass_angle))
    }

    pub fn is_spherical(&self) -> bool {
        self.spatial
            .as_ref()
            .is_some_and(|s| s.camera_type == "spherical" || s.camera_type == "equirectangular")
    }

    /// Whether the spatial attributes have been fetched.
    pub fn complete(&self) -> bool {
        self.spatial.is_some()
    }

    pub(crate) fn make_complete(&mut self, spatial: SpatialImageEnt) {
        if spatial.id != self.core.id {
            tracing::warn!(
                "Spatial attributes for {} attached to image {}",
                spatial.id,
                self.core.id
            );
        }
        self.spatial = Some(spatial);
    }

    pub fn has_initialized_cache(&self) -> bool {
        self.cache.is_some()
    }

    pub(crate) fn initialize_cache(&mut self) {
        if self.cache.is_none() {
            self.cache = Some(ImageCache::default());
        }
    }

    pub fn assets_cached(&self) -> bool {
        self.assets().is_some()
    }

    pub fn assets(&self) -> Option<&Arc<ImageAssets>> {
        self.cache.as_ref().and_then(|c| c.assets.as_ref())
    }

    pub(crate) fn set_assets(&mut self, assets: ImageAssets) {
        self.cache.get_or_insert_with(ImageCache::default).assets = Some(Arc::new(assets));
    }

    /// Drops the image cache and every edge derived from it. Core and spatial attributes stay.
    pub(crate) fn dispose(&mut self) {
        self.cache = None;
        self.sequence_edges.reset();
        self.spatial_edges.reset();
    }

    pub fn filter_value(&self, key: FilterKey) -> FilterValue {
        let spatial = self.spatial.as_ref();
        let string = |v: Option<&String>| {
            v.map(|s| FilterValue::String(s.clone()))
                .unwrap_or(FilterValue::Null)
        };
        match key {
            FilterKey::Id => FilterValue::String(self.core.id.clone()),
            FilterKey::SequenceId => FilterValue::String(self.core.sequence.id.clone()),
            FilterKey::CameraType => string(spatial.map(|s| &s.camera_type)),
            FilterKey::CapturedAt => spatial
                .map(|s| FilterValue::Number(s.captured_at as f64))
                .unwrap_or(FilterValue::Null),
            FilterKey::ClusterId => string(spatial.map(|s| &s.cluster.id)),
            FilterKey::CreatorId => string(spatial.and_then(|s| s.creator.id.as_ref())),
            FilterKey::CreatorUsername => {
                string(spatial.and_then(|s| s.creator.username.as_ref()))
            }
            FilterKey::ExifOrientation => spatial
                .map(|s| FilterValue::Number(s.exif_orientation as f64))
                .unwrap_or(FilterValue::Null),
            FilterKey::Height => spatial
                .map(|s| FilterValue::Number(s.height as f64))
                .unwrap_or(FilterValue::Null),
            FilterKey::MergeId => string(spatial.and_then(|s| s.merge_id.as_ref())),
            FilterKey::Merged => spatial
                .map(|s| FilterValue::Bool(s.merge_id.is_some()))
                .unwrap_or(FilterValue::Null),
            FilterKey::OwnerId => string(spatial.map(|s| &s.owner.id)),
            FilterKey::Private => spatial
                .and_then(|s| s.private)
                .map(FilterValue::Bool)
                .unwrap_or(FilterValue::Null),
            FilterKey::QualityScore => spatial
                .and_then(|s| s.quality_score)
                .map(FilterValue::Number)
                .unwrap_or(FilterValue::Null),
            FilterKey::Width => spatial
                .map(|s| FilterValue::Number(s.width as f64))
                .unwrap_or(FilterValue::Null),
        }
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Image({}, sequence {}, {})",
            self.core.id,
            self.core.sequence.id,
            if self.complete() { "complete" } else { "core" }
        )
    }
}

/// An ordered capture run. The order of `image_ids` defines sequence adjacency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    id: String,
    image_ids: Vec<String>,
}

impl Sequence {
    pub fn new(ent: SequenceEnt) -> Self {
        Sequence {
            id: ent.id,
            image_ids: ent.image_ids,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn image_ids(&self) -> &[String] {
        &self.image_ids
    }

    pub fn find_prev(&self, image_id: &str) -> Option<&str> {
        let index = self.image_ids.iter().position(|id| id == image_id)?;
        index
            .checked_sub(1)
            .map(|prev| self.image_ids[prev].as_str())
    }

    pub fn find_next(&self, image_id: &str) -> Option<&str> {
        let index = self.image_ids.iter().position(|id| id == image_id)?;
        self.image_ids.get(index + 1).map(String::as_str)
    }
}

/// Spatial bucket of image ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cell {
    id: String,
    pub image_ids: BTreeSet<String>,
    pub cached: bool,
}

impl Cell {
    pub fn new(id: &str) -> Self {
        Cell {
            id: id.to_string(),
            image_ids: BTreeSet::new(),
            cached: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

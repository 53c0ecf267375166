use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs::read_to_string,
    path::Path,
};
use tokio::sync::broadcast;

use super::{
    CoreImagesContract, EntResult, GeometryProvider, GridGeometry, ImageEnt, MeshContract,
    SequenceEnt, SpatialImageEnt,
};
use crate::{error::GraphError, event::ProviderEvent};

const EVENT_CAPACITY: usize = 64;

/// Serializable content of a [MemoryProvider].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dataset {
    pub images: Vec<ImageEnt>,
    pub sequences: Vec<SequenceEnt>,
    /// Mesh per mesh url. Images whose mesh is not listed get an empty mesh.
    pub meshes: BTreeMap<String, MeshContract>,
}

#[derive(Debug, Default)]
struct Tables {
    images: BTreeMap<String, ImageEnt>,
    cells: BTreeMap<String, BTreeSet<String>>,
    sequences: BTreeMap<String, SequenceEnt>,
    meshes: BTreeMap<String, MeshContract>,
}

/// A [super::DataProvider] answering from an in-memory [Dataset].
pub struct MemoryProvider {
    geometry: GridGeometry,
    tables: RwLock<Tables>,
    events: broadcast::Sender<ProviderEvent>,
}

impl MemoryProvider {
    pub fn new(dataset: Dataset) -> Self {
        MemoryProvider::with_geometry(dataset, GridGeometry::default())
    }

    pub fn with_geometry(dataset: Dataset, geometry: GridGeometry) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let provider = MemoryProvider {
            geometry,
            tables: RwLock::new(Tables::default()),
            events,
        };
        {
            let mut tables = provider.tables.write();
            for sequence in dataset.sequences {
                tables.sequences.insert(sequence.id.clone(), sequence);
            }
            tables.meshes = dataset.meshes;
        }
        for image in dataset.images {
            provider.insert_image(image);
        }
        provider
    }

    pub fn from_json_path<P: AsRef<Path>>(path: P) -> Result<Self, GraphError> {
        tracing::debug!("Reading dataset {:?}", path.as_ref());
        let content = read_to_string(path)?;
        let dataset: Dataset = serde_json::from_str(&content)?;
        Ok(MemoryProvider::new(dataset))
    }

    /// Adds or replaces an image and returns the cell it was placed in.
    pub fn insert_image(&self, image: ImageEnt) -> String {
        let cell_id = self.geometry.lng_lat_to_cell_id(image.core.geometry);
        let mut tables = self.tables.write();
        if let Some(previous) = tables.images.get(&image.core.id) {
            let previous_cell = self.geometry.lng_lat_to_cell_id(previous.core.geometry);
            if let Some(ids) = tables.cells.get_mut(&previous_cell) {
                ids.remove(&image.core.id);
            }
        }
        tables
            .cells
            .entry(cell_id.clone())
            .or_default()
            .insert(image.core.id.clone());
        tables.images.insert(image.core.id.clone(), image);
        cell_id
    }

    pub fn insert_sequence(&self, sequence: SequenceEnt) {
        self.tables
            .write()
            .sequences
            .insert(sequence.id.clone(), sequence);
    }

    /// Announces new data for the given cells to every subscriber.
    pub fn publish(&self, cell_ids: Vec<String>) {
        let event = ProviderEvent::DataCreated { cell_ids };
        if self.events.send(event).is_err() {
            tracing::debug!("No subscribers for provider event");
        }
    }

    /// Inserts the images and publishes one data-created event covering their cells.
    pub fn add_images(&self, images: Vec<ImageEnt>) {
        let cells = images
            .into_iter()
            .map(|image| self.insert_image(image))
            .collect::<BTreeSet<_>>();
        self.publish(cells.into_iter().collect());
    }
}

impl super::DataProvider for MemoryProvider {
    fn geometry(&self) -> &dyn GeometryProvider {
        &self.geometry
    }

    async fn get_core_images(&self, cell_id: &str) -> Result<CoreImagesContract, GraphError> {
        let tables = self.tables.read();
        let images = tables
            .cells
            .get(cell_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.images.get(id))
                    .map(|image| image.core.clone())
                    .collect()
            })
            .unwrap_or_default();
        Ok(CoreImagesContract {
            cell_id: cell_id.to_string(),
            images,
        })
    }

    async fn get_images(
        &self,
        image_ids: &[String],
    ) -> Result<Vec<EntResult<ImageEnt>>, GraphError> {
        let tables = self.tables.read();
        Ok(image_ids
            .iter()
            .map(|id| EntResult {
                node_id: id.clone(),
                node: tables.images.get(id).cloned(),
            })
            .collect())
    }

    async fn get_spatial_images(
        &self,
        image_ids: &[String],
    ) -> Result<Vec<EntResult<SpatialImageEnt>>, GraphError> {
        let tables = self.tables.read();
        Ok(image_ids
            .iter()
            .map(|id| EntResult {
                node_id: id.clone(),
                node: tables.images.get(id).map(|image| image.spatial.clone()),
            })
            .collect())
    }

    async fn get_sequence(&self, sequence_id: &str) -> Result<Option<SequenceEnt>, GraphError> {
        Ok(self.tables.read().sequences.get(sequence_id).cloned())
    }

    async fn get_image_buffer(&self, url: &str) -> Result<Vec<u8>, GraphError> {
        if url.is_empty() {
            return Err(GraphError::Provider("empty image url".to_string()));
        }
        Ok(url.as_bytes().to_vec())
    }

    async fn get_mesh(&self, url: &str) -> Result<MeshContract, GraphError> {
        Ok(self
            .tables
            .read()
            .meshes
            .get(url)
            .cloned()
            .unwrap_or_default())
    }

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }
}

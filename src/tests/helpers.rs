//! Shared test utilities for graph and service testing

use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{broadcast, Semaphore};

use crate::{
    config::GraphConfiguration,
    error::GraphError,
    event::ProviderEvent,
    graph::Graph,
    provider::{
        CoreImageEnt, CoreImagesContract, DataProvider, Dataset, EntResult, GeometryProvider,
        IdEnt, ImageEnt, LngLat, MemoryProvider, MeshContract, SequenceEnt, SpatialImageEnt,
        UrlEnt,
    },
    service::GraphService,
};

/// Initialize logging for tests
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Provider wrapper that records every call and can hold or fail individual calls.
///
/// Calls are labelled `images:<ids>`, `spatial:<ids>`, `cell:<cell id>`, `sequence:<id>`,
/// `buffer:<url>` and `mesh:<url>`, with multiple ids joined by commas.
pub struct GatedProvider {
    data: MemoryProvider,
    calls: Mutex<Vec<String>>,
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    failures: Mutex<HashMap<String, GraphError>>,
    panics: Mutex<HashSet<String>>,
}

impl GatedProvider {
    pub fn new(dataset: Dataset) -> Self {
        GatedProvider {
            data: MemoryProvider::new(dataset),
            calls: Mutex::new(Vec::new()),
            gates: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            panics: Mutex::new(HashSet::new()),
        }
    }

    pub fn data(&self) -> &MemoryProvider {
        &self.data
    }

    /// Calls with this label wait until [GatedProvider::release] is called.
    pub fn hold(&self, label: &str) {
        self.gates
            .lock()
            .insert(label.to_string(), Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, label: &str) {
        if let Some(gate) = self.gates.lock().remove(label) {
            gate.close();
        }
    }

    pub fn fail(&self, label: &str, error: GraphError) {
        self.failures.lock().insert(label.to_string(), error);
    }

    /// Later calls with this label succeed again. Calls already held keep their failure.
    pub fn recover(&self, label: &str) {
        self.failures.lock().remove(label);
        self.panics.lock().remove(label);
    }

    /// Calls with this label panic.
    pub fn panic_on(&self, label: &str) {
        self.panics.lock().insert(label.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, label: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == label).count()
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    async fn enter(&self, label: String) -> Result<(), GraphError> {
        self.calls.lock().push(label.clone());
        let failure = self.failures.lock().get(&label).cloned();
        let panics = self.panics.lock().contains(&label);
        let gate = self.gates.lock().get(&label).cloned();
        if let Some(gate) = gate {
            // Closing the semaphore opens the gate.
            let _ = gate.acquire().await;
        }
        if panics {
            panic!("provider call {label} panicked");
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl DataProvider for GatedProvider {
    fn geometry(&self) -> &dyn GeometryProvider {
        self.data.geometry()
    }

    async fn get_core_images(&self, cell_id: &str) -> Result<CoreImagesContract, GraphError> {
        self.enter(format!("cell:{cell_id}")).await?;
        self.data.get_core_images(cell_id).await
    }

    async fn get_images(
        &self,
        image_ids: &[String],
    ) -> Result<Vec<EntResult<ImageEnt>>, GraphError> {
        self.enter(format!("images:{}", image_ids.join(","))).await?;
        self.data.get_images(image_ids).await
    }

    async fn get_spatial_images(
        &self,
        image_ids: &[String],
    ) -> Result<Vec<EntResult<SpatialImageEnt>>, GraphError> {
        self.enter(format!("spatial:{}", image_ids.join(","))).await?;
        self.data.get_spatial_images(image_ids).await
    }

    async fn get_sequence(&self, sequence_id: &str) -> Result<Option<SequenceEnt>, GraphError> {
        self.enter(format!("sequence:{sequence_id}")).await?;
        self.data.get_sequence(sequence_id).await
    }

    async fn get_image_buffer(&self, url: &str) -> Result<Vec<u8>, GraphError> {
        self.enter(format!("buffer:{url}")).await?;
        self.data.get_image_buffer(url).await
    }

    async fn get_mesh(&self, url: &str) -> Result<MeshContract, GraphError> {
        self.enter(format!("mesh:{url}")).await?;
        self.data.get_mesh(url).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.data.subscribe()
    }
}

/// Reference point of the fixtures, well inside grid cell `0_0`.
pub const ORIGIN: LngLat = LngLat {
    lng: 0.001,
    lat: 0.001,
};

const METRES_PER_DEGREE: f64 = 111_195.0;

/// Position offset from [ORIGIN] by the given number of metres.
pub fn offset(north: f64, east: f64) -> LngLat {
    LngLat::new(
        ORIGIN.lng + east / METRES_PER_DEGREE,
        ORIGIN.lat + north / METRES_PER_DEGREE,
    )
}

pub fn core_ent(id: &str, sequence_id: &str, position: LngLat) -> CoreImageEnt {
    CoreImageEnt {
        id: id.to_string(),
        geometry: position,
        computed_geometry: None,
        sequence: IdEnt {
            id: sequence_id.to_string(),
        },
    }
}

pub fn image_ent(
    id: &str,
    sequence_id: &str,
    position: LngLat,
    compass_angle: f64,
    camera_type: &str,
) -> ImageEnt {
    ImageEnt {
        core: core_ent(id, sequence_id, position),
        spatial: SpatialImageEnt {
            id: id.to_string(),
            camera_type: camera_type.to_string(),
            compass_angle,
            thumb: UrlEnt {
                id: format!("thumb-{id}"),
                url: format!("thumb/{id}"),
            },
            mesh: UrlEnt {
                id: format!("mesh-{id}"),
                url: format!("mesh/{id}"),
            },
            ..Default::default()
        },
    }
}

/// Images around [ORIGIN], all facing north:
///
/// - sequence `s1`: `a` at the origin, `b` 5 m and `c` 10 m north of it
/// - sequence `s2`: `d` 4 m east of `a`, and `e`, a spherical image 6 m west of `a`
/// - sequence `s3`: `far`, 1 km north, outside the cells around `a`
pub fn fixture_dataset() -> Dataset {
    let sequence = |id: &str, image_ids: &[&str]| SequenceEnt {
        id: id.to_string(),
        image_ids: image_ids.iter().map(|s| s.to_string()).collect(),
    };
    Dataset {
        images: vec![
            image_ent("a", "s1", offset(0.0, 0.0), 0.0, "perspective"),
            image_ent("b", "s1", offset(5.0, 0.0), 0.0, "perspective"),
            image_ent("c", "s1", offset(10.0, 0.0), 0.0, "perspective"),
            image_ent("d", "s2", offset(0.0, 4.0), 0.0, "perspective"),
            image_ent("e", "s2", offset(0.0, -6.0), 0.0, "spherical"),
            image_ent("far", "s3", offset(1000.0, 0.0), 0.0, "perspective"),
        ],
        sequences: vec![
            sequence("s1", &["a", "b", "c"]),
            sequence("s2", &["d", "e"]),
            sequence("s3", &["far"]),
        ],
        meshes: Default::default(),
    }
}

pub fn gated_provider() -> Arc<GatedProvider> {
    init_logging();
    Arc::new(GatedProvider::new(fixture_dataset()))
}

pub fn graph_with(
    provider: &Arc<GatedProvider>,
    config: GraphConfiguration,
) -> Graph<GatedProvider> {
    Graph::with_configuration(provider.clone(), config)
}

pub fn service_with(provider: &Arc<GatedProvider>) -> GraphService<GatedProvider> {
    GraphService::new(Graph::new(provider.clone()))
}

/// Yields to other tasks until the provider has seen a call with `label`.
pub async fn wait_for_call(provider: &GatedProvider, label: &str) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while provider.call_count(label) == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no call {label:?}, saw {:?}", provider.calls()));
}

/// Lets spawned tasks run to quiescence.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

//! Orchestration of the graph for consumers.
//!
//! [GraphService::cache_image] turns an image id into a navigable [Image] by running the
//! phases existence, cache initialization, assets, sequence edges and, in
//! [GraphMode::Spatial], spatial edges. Pipelines are registered while they run so that a mode
//! switch, a filter change or a reset can cancel them.

use futures::{future::join_all, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, future::Future, str::FromStr, sync::Arc};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::Instrument;

use crate::{
    cancel::CancelToken,
    error::GraphError,
    graph::{FilterExpression, Graph, Image, Sequence},
    provider::{DataProvider, LngLat},
};

const DATA_ADDED_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GraphMode {
    /// Sequence edges only.
    Sequence,
    /// Sequence edges plus tiles and spatial edges.
    #[default]
    Spatial,
}

impl fmt::Display for GraphMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphMode::Sequence => write!(f, "sequence"),
            GraphMode::Spatial => write!(f, "spatial"),
        }
    }
}

impl FromStr for GraphMode {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequence" => Ok(GraphMode::Sequence),
            "spatial" => Ok(GraphMode::Spatial),
            other => Err(GraphError::Config(format!("unknown graph mode {other:?}"))),
        }
    }
}

struct PipelineEntry {
    image_id: String,
    token: CancelToken,
    /// Present while the pipeline may still compute spatial edges.
    spatial: Option<CancelToken>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    pipelines: HashMap<u64, PipelineEntry>,
}

struct ServiceInner<P: DataProvider> {
    graph: Graph<P>,
    registry: Mutex<Registry>,
    mode: watch::Sender<GraphMode>,
    data_added: broadcast::Sender<String>,
    listener: JoinHandle<()>,
}

impl<P: DataProvider> Drop for ServiceInner<P> {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl<P: DataProvider> ServiceInner<P> {
    fn mode(&self) -> GraphMode {
        *self.mode.borrow()
    }

    fn register(self: &Arc<Self>, image_id: &str) -> PipelineGuard<P> {
        let mut registry = self.registry.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        let token = CancelToken::new();
        let spatial = (self.mode() == GraphMode::Spatial).then(|| token.child());
        registry.pipelines.insert(
            id,
            PipelineEntry {
                image_id: image_id.to_string(),
                token: token.clone(),
                spatial,
            },
        );
        PipelineGuard {
            id,
            token,
            inner: self.clone(),
        }
    }

    /// Token for the spatial phase of a pipeline, if the pipeline still has one.
    fn spatial_token(&self, pipeline_id: u64) -> Option<CancelToken> {
        let registry = self.registry.lock();
        registry
            .pipelines
            .get(&pipeline_id)
            .and_then(|entry| entry.spatial.clone())
            .filter(|token| !token.is_cancelled())
    }
}

/// Deregisters a pipeline when its future completes or is dropped.
struct PipelineGuard<P: DataProvider> {
    id: u64,
    token: CancelToken,
    inner: Arc<ServiceInner<P>>,
}

impl<P: DataProvider> Drop for PipelineGuard<P> {
    fn drop(&mut self) {
        self.inner.registry.lock().pipelines.remove(&self.id);
    }
}

/// Stateful front of a [Graph]. Cloning yields another handle to the same service.
pub struct GraphService<P: DataProvider> {
    inner: Arc<ServiceInner<P>>,
}

impl<P: DataProvider> Clone for GraphService<P> {
    fn clone(&self) -> Self {
        GraphService {
            inner: self.inner.clone(),
        }
    }
}

impl<P: DataProvider> GraphService<P> {
    /// Creates the service in [GraphMode::Spatial] and starts listening to the provider's
    /// data-created notifications. Must be called within a tokio runtime.
    pub fn new(graph: Graph<P>) -> Self {
        let (mode, _) = watch::channel(GraphMode::Spatial);
        let (data_added, _) = broadcast::channel(DATA_ADDED_CAPACITY);
        let events = graph.api().subscribe();
        let listener = tokio::spawn(listen(graph.clone(), events, data_added.clone()));
        GraphService {
            inner: Arc::new(ServiceInner {
                graph,
                registry: Mutex::new(Registry::default()),
                mode,
                data_added,
                listener,
            }),
        }
    }

    pub fn graph(&self) -> &Graph<P> {
        &self.inner.graph
    }

    pub fn mode(&self) -> GraphMode {
        self.inner.mode()
    }

    /// Receiver of the current mode. It is only notified of actual changes.
    pub fn graph_mode(&self) -> watch::Receiver<GraphMode> {
        self.inner.mode.subscribe()
    }

    /// Ids of cells with new provider data, each sent after spatial edges were reset.
    pub fn data_added(&self) -> broadcast::Receiver<String> {
        self.inner.data_added.subscribe()
    }

    /// Ids of the images with a pipeline in progress.
    pub fn active_pipelines(&self) -> Vec<String> {
        let registry = self.inner.registry.lock();
        let mut ids = registry
            .pipelines
            .values()
            .map(|entry| entry.image_id.clone())
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn set_graph_mode(&self, mode: GraphMode) {
        let mut registry = self.inner.registry.lock();
        if self.inner.mode() == mode {
            return;
        }
        if mode != GraphMode::Spatial {
            for entry in registry.pipelines.values_mut() {
                if let Some(spatial) = entry.spatial.take() {
                    spatial.cancel();
                }
            }
        }
        self.inner.mode.send_replace(mode);
        tracing::info!("Graph mode set to {}", mode);
    }

    /// Resolves image `id` into a usable image.
    ///
    /// Fails with [GraphError::NotFound] when the provider does not know the image and with
    /// [GraphError::Cancelled] when the pipeline is abandoned by [GraphService::reset]. Spatial
    /// edges are best effort: failures or cancellation of that phase leave the image without
    /// them but do not fail the call.
    pub fn cache_image(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Image, GraphError>> + Send + 'static {
        let service = self.clone();
        let id = id.to_string();
        let span = tracing::debug_span!("cache_image", id = %id);
        async move {
            let pipeline = service.inner.register(&id);
            let token = pipeline.token.clone();
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(GraphError::Cancelled),
                result = service.run_pipeline(&pipeline, &id) => result,
            }
        }
        .instrument(span)
    }

    async fn run_pipeline(
        &self,
        pipeline: &PipelineGuard<P>,
        id: &str,
    ) -> Result<Image, GraphError> {
        let graph = &self.inner.graph;
        let token = &pipeline.token;

        token.check()?;
        if let Some(pending) = graph.cache_existence(id) {
            pending.await?;
            token.check()?;
        }
        if !graph.has_node(id) {
            return Err(GraphError::NotFound(format!("image {id}")));
        }

        if !graph.has_initialized_cache(id) {
            graph.initialize_cache(id)?;
        }

        graph.cache_assets(id)?.await?;
        token.check()?;

        let sequence_edges_cached = graph
            .get_node(id)
            .is_some_and(|image| image.sequence_edges.cached);
        if !sequence_edges_cached {
            if !graph.has_node_sequence(id) {
                graph.cache_node_sequence(id)?.await?;
                token.check()?;
            }
            graph.cache_sequence_edges(id)?;
        }

        if let Some(spatial) = self.inner.spatial_token(pipeline.id) {
            match self.spatial_phase(id, &spatial).await {
                Ok(()) => {}
                Err(e) if e.is_cancellation() => {
                    tracing::debug!("Spatial edges of {} abandoned", id);
                }
                Err(e) => tracing::warn!("Spatial edges of {} unavailable: {}", id, e),
            }
        }

        token.check()?;
        graph
            .get_node(id)
            .ok_or_else(|| GraphError::NotFound(format!("image {id}")))
    }

    async fn spatial_phase(&self, id: &str, token: &CancelToken) -> Result<(), GraphError> {
        let graph = &self.inner.graph;
        if graph
            .get_node(id)
            .is_some_and(|image| image.spatial_edges.cached)
        {
            return Ok(());
        }
        let work = async {
            if !graph.has_tiles(id) {
                let results = join_all(graph.cache_tiles(id)?).await;
                for e in results.into_iter().filter_map(Result::err) {
                    tracing::warn!("Tile around {} failed: {}", id, e);
                }
                token.check()?;
                if !graph.has_tiles(id) {
                    tracing::debug!("Tiles around {} unavailable, no spatial edges", id);
                    return Ok(());
                }
            }
            if !graph.has_spatial_area(id) {
                graph.cache_spatial_area(id)?.await?;
                token.check()?;
            }
            if graph.has_spatial_area(id) {
                token.check()?;
                graph.cache_spatial_edges(id)?;
            }
            Ok(())
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(GraphError::Cancelled),
            result = work => result,
        }
    }

    /// Cancels spatial work in progress, resets spatial edges and replaces the filter.
    /// Pipelines that have not reached their spatial phase yet run it under the new filter.
    pub fn set_filter(&self, filter: FilterExpression) {
        {
            let mut registry = self.inner.registry.lock();
            for entry in registry.pipelines.values_mut() {
                if let Some(spatial) = entry.spatial.take() {
                    spatial.cancel();
                    entry.spatial = Some(entry.token.child());
                }
            }
        }
        self.inner.graph.reset_spatial_edges();
        self.inner.graph.set_filter(filter);
    }

    /// Cancels every pipeline in progress and evicts everything but `keep_ids`.
    pub fn reset(&self, keep_ids: &[String]) {
        let cancelled = {
            let mut registry = self.inner.registry.lock();
            let count = registry.pipelines.len();
            for (_, entry) in registry.pipelines.drain() {
                entry.token.cancel();
            }
            count
        };
        tracing::info!("Graph service reset, {} pipelines cancelled", cancelled);
        self.inner.graph.uncache(keep_ids, &[], None);
    }

    /// Evicts everything outside the working set. Images with a pipeline in progress are
    /// kept along with `keep_ids`.
    pub fn uncache(
        &self,
        keep_ids: &[String],
        keep_cell_ids: &[String],
        keep_sequence_id: Option<&str>,
    ) {
        let mut keep = keep_ids.to_vec();
        keep.extend(self.active_pipelines());
        self.inner
            .graph
            .uncache(&keep, keep_cell_ids, keep_sequence_id);
    }

    pub async fn cache_sequence(&self, sequence_id: &str) -> Result<Sequence, GraphError> {
        let graph = &self.inner.graph;
        graph.cache_sequence(sequence_id).await?;
        graph
            .get_sequence(sequence_id)
            .ok_or_else(|| GraphError::NotFound(format!("sequence {sequence_id}")))
    }

    /// Caches a sequence and every image in it, prioritizing the images around
    /// `reference_id`. Resolves with the images in sequence order.
    pub async fn cache_sequence_images(
        &self,
        sequence_id: &str,
        reference_id: Option<&str>,
    ) -> Result<Vec<Image>, GraphError> {
        let sequence = self.cache_sequence(sequence_id).await?;
        let graph = &self.inner.graph;
        graph
            .cache_sequence_nodes(sequence_id, reference_id)?
            .await?;
        Ok(sequence
            .image_ids()
            .iter()
            .filter_map(|id| graph.get_node(id))
            .collect())
    }

    pub async fn cache_bounding_box(
        &self,
        sw: LngLat,
        ne: LngLat,
    ) -> Result<Vec<Image>, GraphError> {
        self.inner.graph.cache_bounding_box(sw, ne).await
    }

    pub async fn cache_cell(&self, cell_id: &str) -> Result<Vec<Image>, GraphError> {
        self.inner.graph.cache_cell(cell_id).await
    }
}

/// Forwards provider data notifications: each announced cell is refreshed, spatial edges are
/// reset and the cell id is published.
async fn listen<P: DataProvider>(
    graph: Graph<P>,
    mut events: broadcast::Receiver<crate::event::ProviderEvent>,
    data_added: broadcast::Sender<String>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Missed {} provider events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        tracing::debug!("Provider event {}", event);
        let mut updates = graph.update_cells(event.cell_ids().to_vec());
        while let Some(update) = updates.next().await {
            match update {
                Ok(cell_id) => {
                    graph.reset_spatial_edges();
                    if data_added.send(cell_id).is_err() {
                        tracing::trace!("No data-added subscribers");
                    }
                }
                Err(e) => tracing::warn!("Cell update failed: {}", e),
            }
        }
    }
}

use futures::{
    future::{try_join, try_join_all, FutureExt},
    stream::{FuturesUnordered, Stream},
};
use parking_lot::RwLock;
use std::{
    collections::{BTreeSet, HashSet},
    future::Future,
    panic::AssertUnwindSafe,
    sync::Arc,
};
use tokio::sync::Semaphore;

use super::{
    edges::{distance, DefaultEdgeCalculator, EdgeCalculator},
    filter::FilterExpression,
    image::{Image, ImageAssets, Sequence},
    store::EntityStore,
    tracker::{settled, Begin, CacheKey, CacheTracker, Pending},
};
use crate::{
    config::GraphConfiguration,
    error::GraphError,
    provider::{CoreImageEnt, DataProvider, LngLat, MeshContract},
};

/// Everything the graph mutates, behind one lock.
#[derive(Debug, Default)]
pub struct GraphState {
    pub store: EntityStore,
    pub tracker: CacheTracker,
    pub filter: FilterExpression,
}

impl GraphState {
    fn require_image(&self, id: &str) -> Result<&Image, GraphError> {
        self.store.images.get(id).ok_or_else(|| {
            GraphError::InvalidOperation(format!("image {id} is not in the graph"))
        })
    }

    fn images_in_cells<'a>(&'a self, cell_ids: &[String]) -> Vec<&'a Image> {
        let mut images = Vec::new();
        for cell in cell_ids.iter().filter_map(|id| self.store.cells.peek(id)) {
            images.extend(
                cell.image_ids
                    .iter()
                    .filter_map(|id| self.store.images.peek(id)),
            );
        }
        images
    }

    /// Adds the listed core images to a cell and marks the cell cached.
    fn add_cell_images(&mut self, cell_id: &str, images: Vec<CoreImageEnt>) -> usize {
        let mut added = 0;
        for core in images {
            if !self.store.images.has(&core.id) {
                self.store.images.put(Image::new(core.clone()));
                added += 1;
            }
            self.store.cell_entry(cell_id).image_ids.insert(core.id);
        }
        self.store.cell_entry(cell_id).cached = true;
        added
    }
}

/// The partially loaded image graph.
///
/// Asynchronous operations return a [Pending] shared by every caller of the same cache key.
/// The underlying fetch runs on its own task: it completes and updates the graph even when no
/// caller is waiting for it anymore.
pub struct Graph<P: DataProvider> {
    api: Arc<P>,
    state: Arc<RwLock<GraphState>>,
    edges: Arc<dyn EdgeCalculator>,
    config: Arc<GraphConfiguration>,
    batches: Arc<Semaphore>,
}

impl<P: DataProvider> Clone for Graph<P> {
    fn clone(&self) -> Self {
        Graph {
            api: self.api.clone(),
            state: self.state.clone(),
            edges: self.edges.clone(),
            config: self.config.clone(),
            batches: self.batches.clone(),
        }
    }
}

impl<P: DataProvider> Graph<P> {
    pub fn new(api: Arc<P>) -> Self {
        Graph::with_configuration(api, GraphConfiguration::default())
    }

    pub fn with_configuration(api: Arc<P>, config: GraphConfiguration) -> Self {
        let permits = config.max_concurrent_batches.max(1);
        Graph {
            api,
            state: Arc::new(RwLock::new(GraphState::default())),
            edges: Arc::new(DefaultEdgeCalculator),
            config: Arc::new(config),
            batches: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn with_edge_calculator(mut self, edges: Arc<dyn EdgeCalculator>) -> Self {
        self.edges = edges;
        self
    }

    pub fn api(&self) -> &Arc<P> {
        &self.api
    }

    pub fn configuration(&self) -> &GraphConfiguration {
        &self.config
    }

    /// Runs `work` on its own task and returns the shared handle to its outcome. When the work
    /// is done, or has panicked, every key registered under `ticket` is released;
    /// `SequenceImages` keys are recorded as cached on success.
    fn spawn_fetch<Fut>(&self, keys: Vec<CacheKey>, ticket: u64, work: Fut) -> Pending
    where
        Fut: Future<Output = Result<(), GraphError>> + Send + 'static,
    {
        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            let result = AssertUnwindSafe(work)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(GraphError::Provider("fetch panicked".to_string())));
            let mut state = state.write();
            for key in keys {
                let current = state.tracker.finish(&key, ticket);
                if current && result.is_ok() && matches!(key, CacheKey::SequenceImages(_)) {
                    state.tracker.mark_cached(key);
                }
            }
            if let Err(e) = &result {
                tracing::debug!("Fetch failed: {}", e);
            }
            result
        });
        async move { handle.await? }.boxed().shared()
    }

    fn begin<F, Fut>(&self, state: &mut GraphState, key: CacheKey, work: F) -> Begin
    where
        F: FnOnce(Graph<P>) -> Fut,
        Fut: Future<Output = Result<(), GraphError>> + Send + 'static,
    {
        let keys = vec![key.clone()];
        let label = key.to_string();
        let begin = state
            .tracker
            .mark_caching(key, |ticket| self.spawn_fetch(keys, ticket, work(self.clone())));
        if begin.started() {
            tracing::debug!("Fetching {}", label);
        }
        begin
    }

    fn begin_batch<Fut>(&self, state: &mut GraphState, keys: Vec<CacheKey>, work: Fut) -> Pending
    where
        Fut: Future<Output = Result<(), GraphError>> + Send + 'static,
    {
        let registered = keys.clone();
        state
            .tracker
            .mark_caching_all(&registered, |ticket| self.spawn_fetch(keys, ticket, work))
    }

    // ----- existence -----

    pub fn has_node(&self, id: &str) -> bool {
        self.state.read().store.images.has(id)
    }

    pub fn get_node(&self, id: &str) -> Option<Image> {
        self.state.read().store.images.get(id).cloned()
    }

    pub fn is_caching_full(&self, id: &str) -> bool {
        self.state
            .read()
            .tracker
            .is_caching(&CacheKey::Full(id.to_string()))
    }

    pub fn is_caching_fill(&self, id: &str) -> bool {
        self.state
            .read()
            .tracker
            .is_caching(&CacheKey::Fill(id.to_string()))
    }

    /// Fetches core and spatial attributes of an image not yet in the graph. Joins a fetch
    /// already in flight for the same id.
    #[tracing::instrument(skip(self))]
    pub fn cache_full(&self, id: &str) -> Result<Pending, GraphError> {
        let mut state = self.state.write();
        if state.store.images.has(id) {
            return Err(GraphError::InvalidOperation(format!(
                "cannot fetch image {id} in full, it is already in the graph"
            )));
        }
        Ok(self.start_full(&mut state, id))
    }

    fn start_full(&self, state: &mut GraphState, id: &str) -> Pending {
        let ids = vec![id.to_string()];
        self.begin(state, CacheKey::Full(id.to_string()), |graph| {
            graph.fetch_full(ids)
        })
        .pending()
    }

    async fn fetch_full(self, ids: Vec<String>) -> Result<(), GraphError> {
        let _permit = self
            .batches
            .acquire()
            .await
            .map_err(|e| GraphError::Provider(e.to_string()))?;
        let results = self.api.get_images(&ids).await?;
        let mut state = self.state.write();
        for result in results {
            let Some(ent) = result.node else {
                tracing::debug!("Provider has no image {}", result.node_id);
                continue;
            };
            match state.store.images.get_mut(&ent.core.id) {
                Some(image) if !image.complete() => image.make_complete(ent.spatial),
                Some(_) => {}
                None => {
                    state
                        .store
                        .images
                        .put(Image::new_complete(ent.core, ent.spatial));
                }
            }
        }
        Ok(())
    }

    /// Fetches the spatial attributes of a known but incomplete image. Joins a fill already in
    /// flight for the same id.
    #[tracing::instrument(skip(self))]
    pub fn cache_fill(&self, id: &str) -> Result<Pending, GraphError> {
        let mut state = self.state.write();
        if state.tracker.is_caching(&CacheKey::Full(id.to_string())) {
            return Err(GraphError::InvalidOperation(format!(
                "cannot fill image {id} while it is being fetched in full"
            )));
        }
        if state.require_image(id)?.complete() {
            return Err(GraphError::InvalidOperation(format!(
                "cannot fill image {id}, it is already complete"
            )));
        }
        Ok(self.start_fill(&mut state, id))
    }

    fn start_fill(&self, state: &mut GraphState, id: &str) -> Pending {
        let ids = vec![id.to_string()];
        self.begin(state, CacheKey::Fill(id.to_string()), |graph| {
            graph.fetch_fill(ids)
        })
        .pending()
    }

    async fn fetch_fill(self, ids: Vec<String>) -> Result<(), GraphError> {
        let _permit = self
            .batches
            .acquire()
            .await
            .map_err(|e| GraphError::Provider(e.to_string()))?;
        let results = self.api.get_spatial_images(&ids).await?;
        let mut state = self.state.write();
        for result in results {
            let Some(spatial) = result.node else {
                tracing::warn!("Provider has no spatial attributes for {}", result.node_id);
                continue;
            };
            match state.store.images.get_mut(&result.node_id) {
                Some(image) if !image.complete() => image.make_complete(spatial),
                Some(_) => {}
                None => tracing::debug!("Image {} left the graph during fill", result.node_id),
            }
        }
        Ok(())
    }

    /// Decides, in one step, what it takes for `id` to be present and complete: joins an
    /// in-flight full fetch, starts a full fetch for an absent image, joins or starts a fill
    /// for an incomplete one. Returns `None` when the image is already complete.
    pub fn cache_existence(&self, id: &str) -> Option<Pending> {
        let mut state = self.state.write();
        if let Some(pending) = state.tracker.pending(&CacheKey::Full(id.to_string())) {
            return Some(pending);
        }
        match state.store.images.get(id).map(Image::complete) {
            None => Some(self.start_full(&mut state, id)),
            Some(false) => Some(self.start_fill(&mut state, id)),
            Some(true) => None,
        }
    }

    /// Completes the given images: absent ones in full, incomplete ones by fill, in batches.
    /// Images already in flight are joined.
    async fn complete_images(&self, ids: Vec<String>) -> Result<(), GraphError> {
        let pendings = {
            let mut state = self.state.write();
            let mut pendings = Vec::new();
            let mut missing = Vec::new();
            let mut incomplete = Vec::new();
            for id in ids {
                let full = CacheKey::Full(id.clone());
                let fill = CacheKey::Fill(id.clone());
                if let Some(pending) = state
                    .tracker
                    .pending(&full)
                    .or_else(|| state.tracker.pending(&fill))
                {
                    pendings.push(pending);
                    continue;
                }
                match state.store.images.peek(&id).map(Image::complete) {
                    None => missing.push(id),
                    Some(false) => incomplete.push(id),
                    Some(true) => {}
                }
            }
            let batch_size = self.config.fill_batch_size.max(1);
            for batch in missing.chunks(batch_size) {
                let keys = batch.iter().cloned().map(CacheKey::Full).collect();
                let work = self.clone().fetch_full(batch.to_vec());
                pendings.push(self.begin_batch(&mut state, keys, work));
            }
            for batch in incomplete.chunks(batch_size) {
                let keys = batch.iter().cloned().map(CacheKey::Fill).collect();
                let work = self.clone().fetch_fill(batch.to_vec());
                pendings.push(self.begin_batch(&mut state, keys, work));
            }
            pendings
        };
        try_join_all(pendings).await.map(|_| ())
    }

    // ----- image cache and assets -----

    pub fn has_initialized_cache(&self, id: &str) -> bool {
        self.state
            .read()
            .store
            .images
            .get(id)
            .is_some_and(Image::has_initialized_cache)
    }

    /// Creates the image's cache. Does nothing when it already exists.
    pub fn initialize_cache(&self, id: &str) -> Result<(), GraphError> {
        let mut state = self.state.write();
        let image = state.store.images.get_mut(id).ok_or_else(|| {
            GraphError::InvalidOperation(format!("cannot initialize cache of unknown image {id}"))
        })?;
        image.initialize_cache();
        Ok(())
    }

    pub fn is_caching_assets(&self, id: &str) -> bool {
        self.state
            .read()
            .tracker
            .is_caching(&CacheKey::Assets(id.to_string()))
    }

    /// Loads the image buffer and mesh of a complete image with an initialized cache.
    #[tracing::instrument(skip(self))]
    pub fn cache_assets(&self, id: &str) -> Result<Pending, GraphError> {
        let mut state = self.state.write();
        let image = state.require_image(id)?;
        if !image.has_initialized_cache() || !image.complete() {
            return Err(GraphError::InvalidOperation(format!(
                "assets of image {id} need a complete image with an initialized cache"
            )));
        }
        if image.assets_cached() {
            return Ok(settled(Ok(())));
        }
        let (image_url, mesh_url) = match image.spatial() {
            Some(spatial) => (spatial.thumb.url.clone(), spatial.mesh.url.clone()),
            None => (String::new(), String::new()),
        };
        let id = id.to_string();
        let key = CacheKey::Assets(id.clone());
        Ok(self
            .begin(&mut state, key, |graph| async move {
                let mesh = async {
                    if mesh_url.is_empty() {
                        Ok(MeshContract::default())
                    } else {
                        graph.api.get_mesh(&mesh_url).await
                    }
                };
                let (buffer, mesh) = try_join(graph.api.get_image_buffer(&image_url), mesh).await?;
                let mut state = graph.state.write();
                match state.store.images.get_mut(&id) {
                    Some(image) if image.has_initialized_cache() => {
                        image.set_assets(ImageAssets {
                            image: buffer,
                            mesh,
                        });
                    }
                    _ => tracing::debug!("Image {} was disposed while loading assets", id),
                }
                Ok(())
            })
            .pending())
    }

    // ----- sequences -----

    pub fn has_sequence(&self, sequence_id: &str) -> bool {
        self.state.read().store.sequences.has(sequence_id)
    }

    pub fn is_caching_sequence(&self, sequence_id: &str) -> bool {
        self.state
            .read()
            .tracker
            .is_caching(&CacheKey::Sequence(sequence_id.to_string()))
    }

    pub fn get_sequence(&self, sequence_id: &str) -> Option<Sequence> {
        self.state.read().store.sequences.get(sequence_id).cloned()
    }

    pub fn has_node_sequence(&self, id: &str) -> bool {
        let state = self.state.read();
        state
            .store
            .images
            .get(id)
            .is_some_and(|image| state.store.sequences.has(image.sequence_id()))
    }

    pub fn is_caching_node_sequence(&self, id: &str) -> bool {
        let state = self.state.read();
        state.store.images.get(id).is_some_and(|image| {
            state
                .tracker
                .is_caching(&CacheKey::Sequence(image.sequence_id().to_string()))
        })
    }

    /// Fetches a sequence unless it is already present. A sequence unknown to the provider
    /// resolves without storing anything.
    #[tracing::instrument(skip(self))]
    pub fn cache_sequence(&self, sequence_id: &str) -> Pending {
        let mut state = self.state.write();
        self.start_sequence(&mut state, sequence_id)
    }

    fn start_sequence(&self, state: &mut GraphState, sequence_id: &str) -> Pending {
        if state.store.sequences.has(sequence_id) {
            return settled(Ok(()));
        }
        let sequence_id = sequence_id.to_string();
        let key = CacheKey::Sequence(sequence_id.clone());
        self.begin(state, key, |graph| async move {
            let Some(ent) = graph.api.get_sequence(&sequence_id).await? else {
                tracing::warn!("Provider has no sequence {}", sequence_id);
                return Ok(());
            };
            let mut state = graph.state.write();
            if !state.store.sequences.has(&ent.id) {
                state.store.sequences.put(Sequence::new(ent));
            }
            Ok(())
        })
        .pending()
    }

    /// Fetches the sequence owning image `id`.
    pub fn cache_node_sequence(&self, id: &str) -> Result<Pending, GraphError> {
        let mut state = self.state.write();
        let sequence_id = state.require_image(id)?.sequence_id().to_string();
        Ok(self.start_sequence(&mut state, &sequence_id))
    }

    /// Computes `Next`/`Prev` edges of image `id` from its cached sequence. With no sequence
    /// cached the image ends up with no sequence edges.
    pub fn cache_sequence_edges(&self, id: &str) -> Result<(), GraphError> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let image = state.require_image(id)?;
        let edges = match state.store.sequences.get(image.sequence_id()) {
            Some(sequence) => self.edges.compute_sequence_edges(image, sequence),
            None => {
                tracing::warn!(
                    "Sequence {} of image {} is not cached, no sequence edges",
                    image.sequence_id(),
                    id
                );
                Vec::new()
            }
        };
        if let Some(image) = state.store.images.get_mut(id) {
            image.sequence_edges.cache(edges);
        }
        Ok(())
    }

    pub fn has_sequence_nodes(&self, sequence_id: &str) -> bool {
        self.state
            .read()
            .tracker
            .has(&CacheKey::SequenceImages(sequence_id.to_string()))
    }

    pub fn is_caching_sequence_nodes(&self, sequence_id: &str) -> bool {
        self.state
            .read()
            .tracker
            .is_caching(&CacheKey::SequenceImages(sequence_id.to_string()))
    }

    /// Completes every image of a cached sequence. With a reference image, the window of
    /// images around it is requested first.
    #[tracing::instrument(skip(self))]
    pub fn cache_sequence_nodes(
        &self,
        sequence_id: &str,
        reference_id: Option<&str>,
    ) -> Result<Pending, GraphError> {
        let mut state = self.state.write();
        let key = CacheKey::SequenceImages(sequence_id.to_string());
        if state.tracker.has(&key) {
            return Ok(settled(Ok(())));
        }
        let Some(sequence) = state.store.sequences.get(sequence_id) else {
            return Err(GraphError::InvalidOperation(format!(
                "cannot cache images of sequence {sequence_id} before the sequence itself"
            )));
        };
        let ids = self.prioritize(sequence.image_ids(), reference_id);
        Ok(self
            .begin(&mut state, key, |graph| async move {
                graph.complete_images(ids).await
            })
            .pending())
    }

    fn prioritize(&self, ids: &[String], reference_id: Option<&str>) -> Vec<String> {
        let Some(index) = reference_id.and_then(|r| ids.iter().position(|id| id == r)) else {
            return ids.to_vec();
        };
        let half = self.config.sequence_batch_window / 2;
        let start = index.saturating_sub(half);
        let end = (index + half).min(ids.len());
        let mut ordered = ids[start..end].to_vec();
        ordered.extend_from_slice(&ids[..start]);
        ordered.extend_from_slice(&ids[end..]);
        ordered
    }

    // ----- tiles -----

    fn required_cells(&self, image: &Image) -> Vec<String> {
        let geometry = self.api.geometry();
        let cell_id = geometry.lng_lat_to_cell_id(image.original_lng_lat());
        let mut cells = vec![cell_id.clone()];
        cells.extend(geometry.get_adjacent(&cell_id));
        cells
    }

    pub fn has_tile(&self, cell_id: &str) -> bool {
        self.state
            .read()
            .store
            .cells
            .get(cell_id)
            .is_some_and(|cell| cell.cached)
    }

    pub fn is_caching_tile(&self, cell_id: &str) -> bool {
        self.state
            .read()
            .tracker
            .is_caching(&CacheKey::Cell(cell_id.to_string()))
    }

    /// Whether every cell around image `id` is cached.
    pub fn has_tiles(&self, id: &str) -> bool {
        let state = self.state.read();
        let Some(image) = state.store.images.get(id) else {
            return false;
        };
        self.required_cells(image).iter().all(|cell_id| {
            state
                .store
                .cells
                .get(cell_id)
                .is_some_and(|cell| cell.cached)
        })
    }

    pub fn is_caching_tiles(&self, id: &str) -> bool {
        let state = self.state.read();
        let Some(image) = state.store.images.get(id) else {
            return false;
        };
        self.required_cells(image)
            .into_iter()
            .any(|cell_id| state.tracker.is_caching(&CacheKey::Cell(cell_id)))
    }

    fn start_cell(&self, state: &mut GraphState, cell_id: &str) -> Option<Pending> {
        if state.store.cells.get(cell_id).is_some_and(|cell| cell.cached) {
            return None;
        }
        let cell_id = cell_id.to_string();
        let key = CacheKey::Cell(cell_id.clone());
        let begin = self.begin(state, key, |graph| async move {
            let contract = graph.api.get_core_images(&cell_id).await?;
            let added = graph
                .state
                .write()
                .add_cell_images(&cell_id, contract.images);
            tracing::debug!("Cached cell {} with {} new images", cell_id, added);
            Ok(())
        });
        Some(begin.pending())
    }

    /// Fetches the listings of the cells around image `id` that are not cached yet, one
    /// pending result per cell.
    #[tracing::instrument(skip(self))]
    pub fn cache_tiles(&self, id: &str) -> Result<Vec<Pending>, GraphError> {
        let mut state = self.state.write();
        let cells = self.required_cells(state.require_image(id)?);
        Ok(cells
            .iter()
            .filter_map(|cell_id| self.start_cell(&mut state, cell_id))
            .collect())
    }

    /// Caches a cell and completes its images. Resolves with the images passing the filter.
    #[tracing::instrument(skip(self))]
    pub async fn cache_cell(&self, cell_id: &str) -> Result<Vec<Image>, GraphError> {
        let cell_ids = vec![cell_id.to_string()];
        self.cache_cells(&cell_ids, |_| true).await
    }

    /// Caches every cell intersecting the box and completes the images inside it. Resolves
    /// with the images in the box passing the filter.
    #[tracing::instrument(skip(self))]
    pub async fn cache_bounding_box(
        &self,
        sw: LngLat,
        ne: LngLat,
    ) -> Result<Vec<Image>, GraphError> {
        let cell_ids = self.api.geometry().bbox_to_cell_ids(sw, ne);
        let inside = |image: &Image| {
            let p = image.original_lng_lat();
            p.lng >= sw.lng && p.lng <= ne.lng && p.lat >= sw.lat && p.lat <= ne.lat
        };
        self.cache_cells(&cell_ids, inside).await
    }

    async fn cache_cells<F>(&self, cell_ids: &[String], select: F) -> Result<Vec<Image>, GraphError>
    where
        F: Fn(&Image) -> bool,
    {
        let pendings = {
            let mut state = self.state.write();
            cell_ids
                .iter()
                .filter_map(|cell_id| self.start_cell(&mut state, cell_id))
                .collect::<Vec<_>>()
        };
        try_join_all(pendings).await?;

        let ids = {
            let state = self.state.read();
            state
                .images_in_cells(cell_ids)
                .into_iter()
                .filter(|image| select(image))
                .map(|image| image.id().to_string())
                .collect::<Vec<_>>()
        };
        self.complete_images(ids.clone()).await?;

        let state = self.state.read();
        Ok(ids
            .iter()
            .filter_map(|id| state.store.images.get(id))
            .filter(|image| state.filter.matches(image))
            .cloned()
            .collect())
    }

    /// Refreshes the listings of the given cells and yields each cell id once its refresh is
    /// done. Cells neither cached nor being cached need no refresh and are yielded right away.
    /// A cell whose first fetch is in flight is refreshed after it, even if it fails.
    pub fn update_cells(
        &self,
        cell_ids: Vec<String>,
    ) -> impl Stream<Item = Result<String, GraphError>> + Send + Unpin + 'static {
        let updates = FuturesUnordered::new();
        let state = self.state.read();
        for cell_id in cell_ids {
            let cached = state.store.cells.get(&cell_id).is_some_and(|c| c.cached);
            let in_flight = state.tracker.pending(&CacheKey::Cell(cell_id.clone()));
            if !cached && in_flight.is_none() {
                updates.push(futures::future::ready(Ok(cell_id)).boxed());
                continue;
            }
            let graph = self.clone();
            updates.push(
                async move {
                    if let Some(pending) = in_flight {
                        if let Err(e) = pending.await {
                            tracing::warn!("Cell {} fetch failed, refreshing: {}", cell_id, e);
                        }
                    }
                    let contract = graph.api.get_core_images(&cell_id).await?;
                    let added = graph
                        .state
                        .write()
                        .add_cell_images(&cell_id, contract.images);
                    tracing::debug!("Updated cell {} with {} new images", cell_id, added);
                    Ok(cell_id)
                }
                .boxed(),
            );
        }
        updates
    }

    // ----- spatial area and edges -----

    /// Ids of the images within the spatial threshold of image `id`, found in its cells.
    pub fn spatial_area(&self, id: &str) -> Vec<String> {
        let state = self.state.read();
        self.spatial_area_in(&state, id)
            .into_iter()
            .map(|image| image.id().to_string())
            .collect()
    }

    fn spatial_area_in<'a>(&self, state: &'a GraphState, id: &str) -> Vec<&'a Image> {
        let Some(image) = state.store.images.peek(id) else {
            return Vec::new();
        };
        let origin = image.lng_lat();
        let cells = self.required_cells(image);
        state
            .images_in_cells(&cells)
            .into_iter()
            .filter(|other| other.id() != id)
            .filter(|other| distance(origin, other.lng_lat()) <= self.config.spatial_threshold)
            .collect()
    }

    /// True when the image's tiles are cached, every image around it is complete and at least
    /// one of them passes the filter.
    pub fn has_spatial_area(&self, id: &str) -> bool {
        if !self.has_tiles(id) {
            return false;
        }
        let state = self.state.read();
        let area = self.spatial_area_in(&state, id);
        area.iter().all(|image| image.complete())
            && area.iter().any(|image| state.filter.matches(image))
    }

    pub fn is_caching_spatial_area(&self, id: &str) -> bool {
        self.state
            .read()
            .tracker
            .is_caching(&CacheKey::SpatialArea(id.to_string()))
    }

    /// Completes the images around image `id`. Requires its tiles.
    #[tracing::instrument(skip(self))]
    pub fn cache_spatial_area(&self, id: &str) -> Result<Pending, GraphError> {
        if !self.has_tiles(id) {
            return Err(GraphError::InvalidOperation(format!(
                "cannot cache spatial area of image {id} before its tiles"
            )));
        }
        let mut state = self.state.write();
        let incomplete = self
            .spatial_area_in(&state, id)
            .into_iter()
            .filter(|image| !image.complete())
            .map(|image| image.id().to_string())
            .collect::<Vec<_>>();
        if incomplete.is_empty() {
            return Ok(settled(Ok(())));
        }
        let key = CacheKey::SpatialArea(id.to_string());
        Ok(self
            .begin(&mut state, key, |graph| async move {
                graph.complete_images(incomplete).await
            })
            .pending())
    }

    /// Computes the spatial edges of image `id` from the filtered images around it.
    pub fn cache_spatial_edges(&self, id: &str) -> Result<(), GraphError> {
        let precondition = {
            let state = self.state.read();
            match state.store.images.get(id) {
                None => Some("it is not in the graph"),
                Some(image) if !image.sequence_edges.cached => Some("sequence edges come first"),
                Some(_) => None,
            }
        };
        if let Some(reason) = precondition {
            return Err(GraphError::InvalidOperation(format!(
                "cannot compute spatial edges of image {id}: {reason}"
            )));
        }
        if !self.has_spatial_area(id) {
            return Err(GraphError::InvalidOperation(format!(
                "cannot compute spatial edges of image {id} without a complete spatial area"
            )));
        }

        let mut guard = self.state.write();
        let state = &mut *guard;
        let edges = {
            let neighbours = self
                .spatial_area_in(state, id)
                .into_iter()
                .filter(|image| image.complete() && state.filter.matches(image))
                .collect::<Vec<_>>();
            let image = state.require_image(id)?;
            self.edges.compute_spatial_edges(image, &neighbours)
        };
        tracing::debug!("Image {} has {} spatial edges", id, edges.len());
        if let Some(image) = state.store.images.get_mut(id) {
            image.spatial_edges.cache(edges);
        }
        Ok(())
    }

    /// Invalidates the spatial edges of every image.
    pub fn reset_spatial_edges(&self) {
        let mut state = self.state.write();
        for image in state.store.images.values_mut() {
            image.spatial_edges.reset();
        }
    }

    pub fn filter(&self) -> FilterExpression {
        self.state.read().filter.clone()
    }

    pub fn set_filter(&self, filter: FilterExpression) {
        if filter.passes_all() {
            tracing::debug!("Graph filter cleared");
        } else {
            tracing::debug!("Graph filter set to {}", filter);
        }
        self.state.write().filter = filter;
    }

    // ----- eviction -----

    /// Evicts what is not needed to keep the given images, cells and sequence usable.
    ///
    /// Images with a fetch in flight count as kept. The cells around every kept image are
    /// kept, as are their sequences. Beyond that, the configured number of most recently used
    /// entities of each family survives.
    #[tracing::instrument(skip(self))]
    pub fn uncache(
        &self,
        keep_ids: &[String],
        keep_cell_ids: &[String],
        keep_sequence_id: Option<&str>,
    ) {
        let mut guard = self.state.write();
        let state = &mut *guard;

        let mut in_use: HashSet<String> = keep_ids.iter().cloned().collect();
        let mut keep_cells: HashSet<String> = keep_cell_ids.iter().cloned().collect();
        let mut keep_sequences: HashSet<String> =
            keep_sequence_id.map(String::from).into_iter().collect();
        for key in state.tracker.in_flight() {
            match key {
                CacheKey::Cell(cell_id) => {
                    keep_cells.insert(cell_id.clone());
                }
                CacheKey::Sequence(sequence_id) | CacheKey::SequenceImages(sequence_id) => {
                    keep_sequences.insert(sequence_id.clone());
                }
                other => {
                    if let Some(id) = other.image_id() {
                        in_use.insert(id.to_string());
                    }
                }
            }
        }
        for id in &in_use {
            if let Some(image) = state.store.images.peek(id) {
                keep_cells.extend(self.required_cells(image));
                keep_sequences.insert(image.sequence_id().to_string());
            }
        }

        let max = &self.config;
        let unused_cells = state
            .store
            .cells
            .ids_by_recency(|cell| cell.cached && !keep_cells.contains(cell.id()));
        // Sequences that lost images no longer have all of them cached.
        let mut incomplete_sequences = BTreeSet::new();
        let mut removed_images = 0;
        for cell_id in unused_cells.iter().skip(max.max_unused_tiles) {
            if let Some(cell) = state.store.cells.remove(cell_id) {
                for image_id in cell.image_ids.iter().filter(|id| !in_use.contains(*id)) {
                    if let Some(image) = state.store.images.remove(image_id) {
                        incomplete_sequences.insert(image.sequence_id().to_string());
                        removed_images += 1;
                    }
                }
            }
        }

        let listed: BTreeSet<&str> = state
            .store
            .cells
            .values()
            .filter(|cell| cell.cached)
            .flat_map(|cell| cell.image_ids.iter().map(String::as_str))
            .collect();
        let prestored = state
            .store
            .images
            .ids_by_recency(|image| !in_use.contains(image.id()) && !listed.contains(image.id()));
        for id in prestored.iter().skip(max.max_unused_prestored_images) {
            if let Some(image) = state.store.images.remove(id) {
                incomplete_sequences.insert(image.sequence_id().to_string());
                removed_images += 1;
            }
        }
        for sequence_id in incomplete_sequences {
            state.tracker.forget(&CacheKey::SequenceImages(sequence_id));
        }

        let disposable = state
            .store
            .images
            .ids_by_recency(|image| {
                image.has_initialized_cache() && !in_use.contains(image.id())
            });
        for id in disposable.iter().skip(max.max_unused_images) {
            if let Some(image) = state.store.images.get_mut(id) {
                image.dispose();
            }
        }

        let unused_sequences = state
            .store
            .sequences
            .ids_by_recency(|sequence| !keep_sequences.contains(sequence.id()));
        for id in unused_sequences.iter().skip(max.max_sequences) {
            state.store.sequences.remove(id);
            state.tracker.forget(&CacheKey::SequenceImages(id.clone()));
        }

        tracing::debug!(
            "Uncached {} cells, {} images, {} sequences",
            unused_cells.len().saturating_sub(max.max_unused_tiles),
            removed_images,
            unused_sequences.len().saturating_sub(max.max_sequences)
        );
    }
}

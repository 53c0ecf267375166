//! Integration tests for GraphService over a JSON dataset
//!
//! These tests verify end-to-end behavior using the public API:
//! - Dataset loading and TOML configuration
//! - Image resolution with sequence and spatial edges
//! - Sequence and bounding box caching
//! - Eviction and provider data notifications
//!
//! Tests focus on observable behavior rather than internal implementation details.

mod common;

use common::{image, init_logging, street_dataset, write_dataset, METRE};
use imagegraph::{
    config::{ConfigProvider, GraphConfiguration, TomlConfigProvider},
    graph::{FilterExpression, Graph, NavigationDirection},
    provider::{LngLat, MemoryProvider},
    service::{GraphMode, GraphService},
    GraphError,
};
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;

fn street_service(
    temp_dir: &TempDir,
    config: GraphConfiguration,
) -> GraphService<MemoryProvider> {
    let path = write_dataset(temp_dir, &street_dataset());
    let provider = Arc::new(MemoryProvider::from_json_path(path).unwrap());
    GraphService::new(Graph::with_configuration(provider, config))
}

fn directions(edges: &[imagegraph::graph::NavigationEdge]) -> Vec<(NavigationDirection, &str)> {
    edges
        .iter()
        .map(|e| (e.data.direction, e.target.as_str()))
        .collect()
}

#[tokio::test]
async fn test_cache_image_end_to_end() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let service = street_service(&temp_dir, GraphConfiguration::default());

    let image = service.cache_image("street-1").await.unwrap();

    assert!(image.complete());
    assert_eq!(
        image.assets().map(|assets| assets.image.clone()),
        Some(b"https://images.test/street-1.jpg".to_vec())
    );
    assert_eq!(
        directions(&image.sequence_edges.edges),
        vec![
            (NavigationDirection::Next, "street-2"),
            (NavigationDirection::Prev, "street-0"),
        ]
    );
    assert_eq!(
        directions(&image.spatial_edges.edges),
        vec![
            (NavigationDirection::StepForward, "street-2"),
            (NavigationDirection::StepBackward, "street-0"),
            (NavigationDirection::StepLeft, "pano"),
            (NavigationDirection::Spherical, "pano"),
        ]
    );
}

#[tokio::test]
async fn test_sequence_mode_from_text() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let service = street_service(&temp_dir, GraphConfiguration::default());
    service.set_graph_mode("sequence".parse::<GraphMode>().unwrap());

    let image = service.cache_image("street-4").await.unwrap();

    assert_eq!(
        directions(&image.sequence_edges.edges),
        vec![(NavigationDirection::Prev, "street-3")]
    );
    assert!(!image.spatial_edges.cached);
    assert!(!service.graph().has_tile("0_0"));
}

#[tokio::test]
async fn test_cache_sequence_images_in_order() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let config = GraphConfiguration {
        fill_batch_size: 2,
        ..Default::default()
    };
    let service = street_service(&temp_dir, config);

    let images = service
        .cache_sequence_images("street", Some("street-3"))
        .await
        .unwrap();

    let ids = images.iter().map(|i| i.id()).collect::<Vec<_>>();
    assert_eq!(
        ids,
        vec!["street-0", "street-1", "street-2", "street-3", "street-4"]
    );
    assert!(images.iter().all(|i| i.complete()));
    assert!(service.graph().has_sequence_nodes("street"));
}

#[tokio::test]
async fn test_bounding_box_honours_filter() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let service = street_service(&temp_dir, GraphConfiguration::default());
    let sw = LngLat::new(0.0012 - 10.0 * METRE, 0.0011 - METRE);
    let ne = LngLat::new(0.0012 + METRE, 0.0011 + 12.0 * METRE);

    let mut ids = service
        .cache_bounding_box(sw, ne)
        .await
        .unwrap()
        .iter()
        .map(|i| i.id().to_string())
        .collect::<Vec<_>>();
    ids.sort();
    assert_eq!(ids, vec!["pano", "street-0", "street-1"]);

    let filter: FilterExpression =
        serde_json::from_str(r#"["==", "cameraType", "spherical"]"#).unwrap();
    service.set_filter(filter);
    let images = service.cache_bounding_box(sw, ne).await.unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].id(), "pano");
}

#[tokio::test]
async fn test_configuration_from_toml_file() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("graph.toml");
    std::fs::write(&config_path, "spatial_threshold = 6.0\nmax_unused_tiles = 4\n").unwrap();
    let config = TomlConfigProvider::new(config_path)
        .get_configuration()
        .unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.max_unused_tiles, 4);
    let service = street_service(&temp_dir, config);

    // Only the spherical image is within six metres.
    let image = service.cache_image("street-1").await.unwrap();
    assert_eq!(
        directions(&image.spatial_edges.edges),
        vec![
            (NavigationDirection::StepLeft, "pano"),
            (NavigationDirection::Spherical, "pano"),
        ]
    );

    service.reset(&["street-1".to_string()]);
    let graph = service.graph();
    assert!(graph.has_tiles("street-1"));
    assert!(graph.has_initialized_cache("street-1"));
    assert!(graph.has_sequence("street"));
    assert!(!graph.has_sequence("panos"));
}

#[test]
fn test_missing_dataset_is_not_found() {
    let temp_dir = TempDir::new().unwrap();
    let result = MemoryProvider::from_json_path(temp_dir.path().join("missing.json"));
    assert!(matches!(result, Err(GraphError::NotFound(_))));
}

#[tokio::test]
async fn test_new_images_are_announced() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let service = street_service(&temp_dir, GraphConfiguration::default());
    let mut added = service.data_added();
    service.cache_image("street-0").await.unwrap();

    let provider = service.graph().api().clone();
    provider.add_images(vec![image(
        "street-5",
        "street",
        0.0012,
        0.0011 + 40.0 * METRE,
        "perspective",
    )]);

    let cell_id = tokio::time::timeout(Duration::from_secs(2), added.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cell_id, "0_0");
    assert!(service.graph().has_node("street-5"));
    assert!(!service
        .graph()
        .get_node("street-0")
        .unwrap()
        .spatial_edges
        .cached);
}

//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use imagegraph::provider::{
    CoreImageEnt, Dataset, IdEnt, ImageEnt, LngLat, SequenceEnt, SpatialImageEnt, UrlEnt,
};
use std::path::PathBuf;
use tempfile::TempDir;

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times; later calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Roughly one metre of latitude, in degrees.
pub const METRE: f64 = 1.0 / 111_195.0;

#[allow(dead_code)]
pub fn image(id: &str, sequence_id: &str, lng: f64, lat: f64, camera_type: &str) -> ImageEnt {
    ImageEnt {
        core: CoreImageEnt {
            id: id.to_string(),
            geometry: LngLat::new(lng, lat),
            computed_geometry: None,
            sequence: IdEnt {
                id: sequence_id.to_string(),
            },
        },
        spatial: SpatialImageEnt {
            id: id.to_string(),
            camera_type: camera_type.to_string(),
            thumb: UrlEnt {
                id: format!("{id}-thumb"),
                url: format!("https://images.test/{id}.jpg"),
            },
            ..Default::default()
        },
    }
}

/// A street of five north-facing images, 8 m apart, with a spherical image beside the
/// second one.
#[allow(dead_code)]
pub fn street_dataset() -> Dataset {
    let (lng, lat) = (0.0012, 0.0011);
    let mut images = (0..5)
        .map(|i| {
            image(
                &format!("street-{i}"),
                "street",
                lng,
                lat + 8.0 * i as f64 * METRE,
                "perspective",
            )
        })
        .collect::<Vec<_>>();
    images.push(image("pano", "panos", lng - 5.0 * METRE, lat + 8.0 * METRE, "spherical"));
    Dataset {
        sequences: vec![
            SequenceEnt {
                id: "street".to_string(),
                image_ids: (0..5).map(|i| format!("street-{i}")).collect(),
            },
            SequenceEnt {
                id: "panos".to_string(),
                image_ids: vec!["pano".to_string()],
            },
        ],
        images,
        ..Default::default()
    }
}

/// Writes the dataset as JSON into the temp dir and returns its path.
#[allow(dead_code)]
pub fn write_dataset(temp_dir: &TempDir, dataset: &Dataset) -> PathBuf {
    let path = temp_dir.path().join("dataset.json");
    std::fs::write(&path, serde_json::to_string_pretty(dataset).unwrap()).unwrap();
    path
}

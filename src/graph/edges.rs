use std::collections::BTreeMap;

use super::image::{Image, NavigationDirection, NavigationEdge, NavigationEdgeData, Sequence};
use crate::provider::LngLat;

const EARTH_RADIUS: f64 = 6_371_008.8;

/// Great-circle distance in metres.
pub fn distance(a: LngLat, b: LngLat) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = lat2 - lat1;
    let dlng = (b.lng - a.lng).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS * h.sqrt().min(1.0).asin()
}

/// Initial bearing from `a` to `b`, in degrees clockwise from north within `[0, 360)`.
pub fn bearing(a: LngLat, b: LngLat) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlng = (b.lng - a.lng).to_radians();
    let y = dlng.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlng.cos();
    y.atan2(x).to_degrees().rem_euclid(360.0)
}

/// Turns cached entities into navigation edges. The graph decides when to call it.
pub trait EdgeCalculator: Send + Sync {
    fn compute_sequence_edges(&self, image: &Image, sequence: &Sequence) -> Vec<NavigationEdge>;

    /// `neighbours` are complete, filtered images of the image's spatial area.
    fn compute_spatial_edges(&self, image: &Image, neighbours: &[&Image]) -> Vec<NavigationEdge>;
}

/// Sequence order for `Next`/`Prev`; nearest neighbour per heading-relative quadrant for the
/// step directions, and the nearest spherical neighbour for `Spherical`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEdgeCalculator;

impl DefaultEdgeCalculator {
    fn step_direction(relative: f64) -> NavigationDirection {
        if relative.abs() <= 45.0 {
            NavigationDirection::StepForward
        } else if relative.abs() >= 135.0 {
            NavigationDirection::StepBackward
        } else if relative > 0.0 {
            NavigationDirection::StepRight
        } else {
            NavigationDirection::StepLeft
        }
    }
}

impl EdgeCalculator for DefaultEdgeCalculator {
    fn compute_sequence_edges(&self, image: &Image, sequence: &Sequence) -> Vec<NavigationEdge> {
        let edge = |target: &str, direction| NavigationEdge {
            source: image.id().to_string(),
            target: target.to_string(),
            data: NavigationEdgeData {
                direction,
                world_motion_azimuth: None,
            },
        };
        let mut edges = Vec::with_capacity(2);
        if let Some(next) = sequence.find_next(image.id()) {
            edges.push(edge(next, NavigationDirection::Next));
        }
        if let Some(prev) = sequence.find_prev(image.id()) {
            edges.push(edge(prev, NavigationDirection::Prev));
        }
        edges
    }

    fn compute_spatial_edges(&self, image: &Image, neighbours: &[&Image]) -> Vec<NavigationEdge> {
        let origin = image.lng_lat();
        let heading = image.compass_angle();
        let mut nearest: BTreeMap<NavigationDirection, (f64, f64, &str)> = BTreeMap::new();
        let mut keep = |direction, metres: f64, azimuth: f64, id| {
            let entry = nearest.entry(direction).or_insert((metres, azimuth, id));
            if metres < entry.0 {
                *entry = (metres, azimuth, id);
            }
        };

        for neighbour in neighbours.iter().filter(|n| n.id() != image.id()) {
            let position = neighbour.lng_lat();
            let metres = distance(origin, position);
            let azimuth = bearing(origin, position);
            if let Some(heading) = heading {
                let relative = (azimuth - heading + 180.0).rem_euclid(360.0) - 180.0;
                keep(
                    DefaultEdgeCalculator::step_direction(relative),
                    metres,
                    azimuth,
                    neighbour.id(),
                );
            }
            if neighbour.is_spherical() {
                keep(NavigationDirection::Spherical, metres, azimuth, neighbour.id());
            }
        }

        nearest
            .into_iter()
            .map(|(direction, (_, azimuth, target))| NavigationEdge {
                source: image.id().to_string(),
                target: target.to_string(),
                data: NavigationEdgeData {
                    direction,
                    world_motion_azimuth: Some(azimuth.to_radians()),
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CoreImageEnt, IdEnt, SequenceEnt, SpatialImageEnt};

    fn image(id: &str, lng: f64, lat: f64, compass: f64, camera_type: &str) -> Image {
        Image::new_complete(
            CoreImageEnt {
                id: id.to_string(),
                geometry: LngLat::new(lng, lat),
                computed_geometry: None,
                sequence: IdEnt { id: "s".into() },
            },
            SpatialImageEnt {
                id: id.to_string(),
                compass_angle: compass,
                camera_type: camera_type.to_string(),
                ..Default::default()
            },
        )
    }

    fn directions(edges: &[NavigationEdge]) -> Vec<(NavigationDirection, &str)> {
        edges
            .iter()
            .map(|e| (e.data.direction, e.target.as_str()))
            .collect()
    }

    #[test]
    fn test_geodesy() {
        let a = LngLat::new(0.0, 0.0);
        let north = LngLat::new(0.0, 0.0001);
        let east = LngLat::new(0.0001, 0.0);
        assert!((distance(a, north) - 11.12).abs() < 0.05);
        assert!(bearing(a, north).abs() < 1e-6);
        assert!((bearing(a, east) - 90.0).abs() < 1e-6);
    }

    #[test]
    fn test_sequence_edges_follow_order() {
        let sequence = Sequence::new(SequenceEnt {
            id: "s".into(),
            image_ids: vec!["a".into(), "b".into(), "c".into()],
        });
        let calc = DefaultEdgeCalculator;
        let middle = image("b", 0.0, 0.0, 0.0, "perspective");
        assert_eq!(
            directions(&calc.compute_sequence_edges(&middle, &sequence)),
            vec![
                (NavigationDirection::Next, "c"),
                (NavigationDirection::Prev, "a")
            ]
        );
        let first = image("a", 0.0, 0.0, 0.0, "perspective");
        assert_eq!(
            directions(&calc.compute_sequence_edges(&first, &sequence)),
            vec![(NavigationDirection::Next, "b")]
        );
    }

    #[test]
    fn test_spatial_edges_pick_nearest_per_direction() {
        // Facing east.
        let origin = image("o", 0.0, 0.0, 90.0, "perspective");
        let ahead_near = image("ahead-near", 0.00005, 0.0, 0.0, "perspective");
        let ahead_far = image("ahead-far", 0.0001, 0.0, 0.0, "perspective");
        let left = image("left", 0.0, 0.00005, 0.0, "perspective");
        let behind = image("behind", -0.00005, 0.0, 0.0, "spherical");
        let neighbours = vec![&ahead_far, &ahead_near, &left, &behind, &origin];

        let edges = DefaultEdgeCalculator.compute_spatial_edges(&origin, &neighbours);
        assert_eq!(
            directions(&edges),
            vec![
                (NavigationDirection::StepForward, "ahead-near"),
                (NavigationDirection::StepBackward, "behind"),
                (NavigationDirection::StepLeft, "left"),
                (NavigationDirection::Spherical, "behind"),
            ]
        );
        assert!(edges.iter().all(|e| e.source == "o"));
    }
}

use super::LngLat;

/// Spatial partitioning used to bucket images into cells.
pub trait GeometryProvider: Send + Sync {
    fn lng_lat_to_cell_id(&self, lng_lat: LngLat) -> String;

    /// Every cell intersecting the box spanned by `sw` and `ne`.
    fn bbox_to_cell_ids(&self, sw: LngLat, ne: LngLat) -> Vec<String>;

    /// Cells sharing an edge or a corner with `cell_id`.
    fn get_adjacent(&self, cell_id: &str) -> Vec<String>;
}

pub const DEFAULT_CELL_SIZE: f64 = 0.0025;

/// Regular longitude/latitude grid. Cell ids have the form `"{x}_{y}"` with
/// `x = floor(lng / size)` and `y = floor(lat / size)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridGeometry {
    cell_size: f64,
}

impl Default for GridGeometry {
    fn default() -> Self {
        GridGeometry {
            cell_size: DEFAULT_CELL_SIZE,
        }
    }
}

impl GridGeometry {
    pub fn new(cell_size: f64) -> Self {
        GridGeometry { cell_size }
    }

    fn index(&self, value: f64) -> i64 {
        (value / self.cell_size).floor() as i64
    }

    fn parse(cell_id: &str) -> Option<(i64, i64)> {
        let (x, y) = cell_id.split_once('_')?;
        Some((x.parse().ok()?, y.parse().ok()?))
    }

    fn format(x: i64, y: i64) -> String {
        format!("{x}_{y}")
    }
}

impl GeometryProvider for GridGeometry {
    fn lng_lat_to_cell_id(&self, lng_lat: LngLat) -> String {
        GridGeometry::format(self.index(lng_lat.lng), self.index(lng_lat.lat))
    }

    fn bbox_to_cell_ids(&self, sw: LngLat, ne: LngLat) -> Vec<String> {
        let (min_x, max_x) = (self.index(sw.lng), self.index(ne.lng));
        let (min_y, max_y) = (self.index(sw.lat), self.index(ne.lat));
        let mut cells = Vec::new();
        for x in min_x..=max_x {
            for y in min_y..=max_y {
                cells.push(GridGeometry::format(x, y));
            }
        }
        cells
    }

    fn get_adjacent(&self, cell_id: &str) -> Vec<String> {
        let Some((x, y)) = GridGeometry::parse(cell_id) else {
            tracing::warn!("Not a grid cell id: {:?}", cell_id);
            return Vec::new();
        };
        let mut cells = Vec::with_capacity(8);
        for dx in -1..=1 {
            for dy in -1..=1 {
                if dx != 0 || dy != 0 {
                    cells.push(GridGeometry::format(x + dx, y + dy));
                }
            }
        }
        cells
    }
}

//! Tile coordinate math and the precache planner.
//!
//! Converts geographic coordinates to slippy-map tile coordinates and
//! enumerates the full rectangular tile block covering a bounding box
//! across a zoom range. The resulting list drives the worker's batched
//! tile population.

use serde::{Deserialize, Serialize};

/// A slippy-map tile coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
    pub z: u8,
}

impl TileCoord {
    pub fn new(x: u32, y: u32, z: u8) -> Self {
        Self { x, y, z }
    }

    /// Relative path of this tile under a tile directory.
    pub fn path(&self, base_path: &str) -> String {
        format!(
            "{}/{}/{}/{}.png",
            base_path.trim_end_matches('/'),
            self.z,
            self.x,
            self.y
        )
    }
}

/// Two [lon, lat] corners of a geographic box. Corner ordering is
/// irrelevant: the planner takes min/max of x and y independently.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoundingBox(pub [[f64; 2]; 2]);

/// Convert a lat/lon pair to the containing tile at a zoom level,
/// using the standard Web Mercator tiling formula. Results are clamped
/// to the valid tile range for the zoom.
pub fn lat_lon_to_tile(lat: f64, lon: f64, zoom: u8) -> TileCoord {
    let n = 2f64.powi(i32::from(zoom));
    let max_index = n - 1.0;

    let x = ((lon + 180.0) / 360.0 * n).floor().clamp(0.0, max_index);

    let lat_rad = lat.to_radians();
    let y = ((1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / std::f64::consts::PI) / 2.0 * n)
        .floor()
        .clamp(0.0, max_index);

    TileCoord::new(x as u32, y as u32, zoom)
}

/// Compute the full tile working set for a bounding box over a zoom range:
/// at each zoom, the rectangular block spanned by the box's corner tiles.
/// Each (x, y, z) is generated exactly once.
pub fn plan_tiles(bounds: &BoundingBox, min_zoom: u8, max_zoom: u8) -> Vec<TileCoord> {
    let [[lon_a, lat_a], [lon_b, lat_b]] = bounds.0;

    let mut tiles = Vec::new();
    for z in min_zoom..=max_zoom {
        let a = lat_lon_to_tile(lat_a, lon_a, z);
        let b = lat_lon_to_tile(lat_b, lon_b, z);

        let (min_x, max_x) = (a.x.min(b.x), a.x.max(b.x));
        let (min_y, max_y) = (a.y.min(b.y), a.y.max(b.y));

        for x in min_x..=max_x {
            for y in min_y..=max_y {
                tiles.push(TileCoord::new(x, y, z));
            }
        }
    }
    tiles
}

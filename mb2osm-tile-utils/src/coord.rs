//! Tile addressing in the MBTiles and OSMAnd `.sqlitedb` numbering schemes.
//!
//! MBTiles stores tiles with [TMS](https://wiki.openstreetmap.org/wiki/TMS) numbering,
//! where row `0` is at the bottom of the map. OSMAnd's "BigPlanet" tile numbering uses
//! [slippy map](https://wiki.openstreetmap.org/wiki/Slippy_map_tilenames) rows (row `0` at the top)
//! and counts zoom levels backwards from [`OSMAND_MAX_ZOOM`].

use std::fmt::{Display, Formatter};

use serde::Serialize;

/// Largest zoom level an MBTiles tile address may use.
pub const MAX_ZOOM: u8 = 30;

/// The zoom level that OSMAnd's inverted zoom `z = 0` corresponds to.
pub const OSMAND_MAX_ZOOM: u8 = 17;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordError {
    #[error("zoom level {0} is outside of the convertible range 0..={OSMAND_MAX_ZOOM}")]
    ZoomOutOfRange(u8),

    #[error("tile row {y} does not exist at zoom level {z}")]
    RowOutOfRange { z: u8, y: u32 },
}

/// Tile address as stored in an MBTiles file (TMS rows).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TileCoord {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

/// Tile address as stored in an OSMAnd `.sqlitedb` file (XYZ rows, inverted zoom).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OsmAndCoord {
    pub x: u32,
    pub y: u32,
    pub z: u8,
}

impl Display for TileCoord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if f.alternate() {
            write!(f, "{}/{}/{}", self.z, self.x, self.y)
        } else {
            write!(f, "{},{},{}", self.z, self.x, self.y)
        }
    }
}

impl Display for OsmAndCoord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "x={} y={} z={}", self.x, self.y, self.z)
    }
}

/// Largest valid row or column index at the given zoom.
///
/// `zoom` must not exceed [`MAX_ZOOM`].
#[must_use]
pub fn max_tile_index(zoom: u8) -> u32 {
    (1_u32 << zoom) - 1
}

/// Convert a TMS row into an XYZ row or back, the operation is its own inverse.
///
/// `y` must be a valid row at `zoom`, see [`max_tile_index`].
#[must_use]
pub fn invert_y_value(zoom: u8, y: u32) -> u32 {
    max_tile_index(zoom) - y
}

impl TileCoord {
    /// Map an MBTiles address to the OSMAnd address of the same tile.
    ///
    /// ```text
    /// x = x
    /// y = (2^z - 1) - y
    /// z = 17 - z
    /// ```
    pub fn to_osmand(self) -> Result<OsmAndCoord, CoordError> {
        let Self { z, x, y } = self;
        if z > OSMAND_MAX_ZOOM {
            return Err(CoordError::ZoomOutOfRange(z));
        }
        if y > max_tile_index(z) {
            return Err(CoordError::RowOutOfRange { z, y });
        }
        Ok(OsmAndCoord {
            x,
            y: invert_y_value(z, y),
            z: OSMAND_MAX_ZOOM - z,
        })
    }
}

impl OsmAndCoord {
    /// Inverse of [`TileCoord::to_osmand`].
    pub fn to_tms(self) -> Result<TileCoord, CoordError> {
        let Self { x, y, z } = self;
        if z > OSMAND_MAX_ZOOM {
            return Err(CoordError::ZoomOutOfRange(z));
        }
        let zoom = OSMAND_MAX_ZOOM - z;
        if y > max_tile_index(zoom) {
            return Err(CoordError::RowOutOfRange { z: zoom, y });
        }
        Ok(TileCoord {
            z: zoom,
            x,
            y: invert_y_value(zoom, y),
        })
    }
}

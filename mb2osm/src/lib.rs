#![doc = include_str!("../README.md")]

mod converter;
pub use converter::{
    ConvertMode, ConvertState, ConvertSummary, DEFAULT_QUEUE_SIZE, DEFAULT_WORKERS,
    MbtilesConverter, convert,
};

mod errors;
pub use errors::{ConvError, ConvResult, TileError};

mod mbtiles;
pub use mbtiles::{Mbtiles, TileRecord, is_flat_tables_type};

mod pipeline;
pub use pipeline::{ConvertStats, SharedTransaction, TilePipeline, TranscodedTile, transcode};

mod recode;
pub use recode::recode;

mod sqlitedb;
pub use sqlitedb::{
    OsmAndDb, TILE_NUMBERING, compute_min_max_zoom, create_info_table, create_tiles_table,
    init_osmand_schema, insert_info, insert_tile, is_empty_database, rewrite_mbtiles_tables,
};

// Re-export so users of this crate do not need to add it as a direct dependency
pub use mb2osm_tile_utils;

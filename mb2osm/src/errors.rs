use std::path::PathBuf;

use mb2osm_tile_utils::{CoordError, Format};

use crate::converter::ConvertState;

/// Errors that abort a conversion. Nothing is committed to the destination once one of these is returned.
#[derive(thiserror::Error, Debug)]
pub enum ConvError {
    #[error("The source and destination files are the same: {}", .0.display())]
    SameSourceAndDestination(PathBuf),

    #[error("Source MBTiles file does not exist: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("Destination file {} already exists. Use --force to overwrite it", .0.display())]
    DestinationExists(PathBuf),

    #[error(transparent)]
    SqlxError(#[from] sqlx::Error),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("A conversion worker terminated abnormally: {0}")]
    WorkerFailed(#[from] tokio::task::JoinError),

    #[error("File path contains unsupported characters: {}", .0.display())]
    UnsupportedCharsInFilepath(PathBuf),

    #[error("Invalid conversion option: {0}")]
    InvalidOption(String),

    #[error("MBTiles file {0} cannot be rewritten in place: {1}")]
    UnsupportedSourceLayout(String, &'static str),

    #[error("Invalid {0} value {1} found in the destination tiles table")]
    InvalidZoomValue(&'static str, String),

    #[error("The destination transaction is still in use by a conversion worker")]
    TransactionStillShared,

    #[error("Conversion failed in state {state}: {source}")]
    Failed {
        state: ConvertState,
        #[source]
        source: Box<ConvError>,
    },
}

pub type ConvResult<T> = Result<T, ConvError>;

/// Errors affecting a single tile. The tile is logged and skipped, the conversion continues.
#[derive(thiserror::Error, Debug)]
pub enum TileError {
    #[error("Unable to read source row: {0}")]
    InvalidRow(#[source] sqlx::Error),

    #[error("Invalid tile index zoom_level={0}, tile_column={1}, tile_row={2}")]
    InvalidTileIndex(i64, i64, i64),

    #[error("Source row {0:#} has no tile data")]
    MissingTileData(mb2osm_tile_utils::TileCoord),

    #[error("Unsupported tile image format {}", .0.map_or("unknown", |f| f.as_str()))]
    UnsupportedFormat(Option<Format>),

    #[error("Unable to decode {0} tile image: {1}")]
    DecodeFailed(Format, #[source] image::ImageError),

    #[error("Unable to encode tile image as JPEG: {0}")]
    EncodeFailed(#[source] image::ImageError),

    #[error(transparent)]
    InvalidCoord(#[from] CoordError),

    #[error("Unable to insert tile: {0}")]
    InsertFailed(#[source] sqlx::Error),

    #[error("Recoding task terminated abnormally: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

use std::fmt::{Display, Formatter};
use std::path::Path;

use futures::{Stream, TryStreamExt as _};
use mb2osm_tile_utils::{MAX_ZOOM, TileCoord};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Connection as _, Row as _, SqliteConnection, SqliteExecutor, query, query_scalar};
use tracing::debug;

use crate::errors::{ConvError, ConvResult, TileError};

const SELECT_TILES: &str = "SELECT zoom_level, tile_column, tile_row, tile_data FROM tiles";

/// One row of the source `tiles` table, the unit of work handed to the conversion workers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileRecord {
    /// Source address, TMS numbering
    pub coord: TileCoord,
    pub data: Vec<u8>,
}

impl TileRecord {
    fn from_row(row: &SqliteRow) -> Result<Self, TileError> {
        let zoom_level: i64 = row.try_get(0).map_err(TileError::InvalidRow)?;
        let tile_column: i64 = row.try_get(1).map_err(TileError::InvalidRow)?;
        let tile_row: i64 = row.try_get(2).map_err(TileError::InvalidRow)?;
        let (Some(z), Ok(x), Ok(y)) = (
            u8::try_from(zoom_level).ok().filter(|z| *z <= MAX_ZOOM),
            u32::try_from(tile_column),
            u32::try_from(tile_row),
        ) else {
            return Err(TileError::InvalidTileIndex(zoom_level, tile_column, tile_row));
        };
        let coord = TileCoord { z, x, y };
        let data: Option<Vec<u8>> = row.try_get(3).map_err(TileError::InvalidRow)?;
        let data = data.ok_or(TileError::MissingTileData(coord))?;
        Ok(Self { coord, data })
    }
}

/// A source MBTiles file. Only ever opened for reading.
#[derive(Clone, Debug)]
pub struct Mbtiles {
    filepath: String,
}

impl Display for Mbtiles {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.filepath)
    }
}

impl Mbtiles {
    pub fn new<P: AsRef<Path>>(filepath: P) -> ConvResult<Self> {
        let path = filepath.as_ref();
        Ok(Self {
            filepath: path
                .to_str()
                .ok_or_else(|| ConvError::UnsupportedCharsInFilepath(path.to_path_buf()))?
                .to_string(),
        })
    }

    #[must_use]
    pub fn filepath(&self) -> &str {
        &self.filepath
    }

    /// Open the file read-only. A missing file is reported as [`ConvError::SourceNotFound`]
    /// rather than letting `SQLite` create an empty database.
    pub async fn open_readonly(&self) -> ConvResult<SqliteConnection> {
        let path = Path::new(self.filepath());
        if !path.is_file() {
            return Err(ConvError::SourceNotFound(path.to_path_buf()));
        }
        debug!("Opening as readonly {self}");
        let opt = SqliteConnectOptions::new()
            .filename(self.filepath())
            .read_only(true);
        Ok(SqliteConnection::connect_with(&opt).await?)
    }

    /// Number of rows in the `tiles` table or view
    pub async fn tile_count<T>(&self, conn: &mut T) -> ConvResult<u64>
    where
        for<'e> &'e mut T: SqliteExecutor<'e>,
    {
        let count: i64 = query_scalar("SELECT COUNT(*) FROM tiles")
            .fetch_one(&mut *conn)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Stream every tile of the file in the cursor's natural order.
    ///
    /// The outer `Result` is a cursor failure and ends the scan, the inner one is a single
    /// unusable row that can be skipped.
    pub fn stream_tiles<'e>(
        &self,
        conn: &'e mut SqliteConnection,
    ) -> impl Stream<Item = ConvResult<Result<TileRecord, TileError>>> + Send + 'e {
        debug!("Streaming tiles from {self} with {SELECT_TILES}");
        query(SELECT_TILES)
            .fetch(conn)
            .map_ok(|row| TileRecord::from_row(&row))
            .map_err(ConvError::from)
    }
}

/// Check if `tiles` is a real table with the flat `MBTiles` columns, and not a view
pub async fn is_flat_tables_type<T>(conn: &mut T) -> ConvResult<bool>
where
    for<'e> &'e mut T: SqliteExecutor<'e>,
{
    let is_valid: i64 = query_scalar(
        "SELECT (
             -- Has a 'tiles' table
             SELECT COUNT(*) = 1
             FROM sqlite_master
             WHERE name = 'tiles'
                 AND type = 'table'
             --
         ) AND (
             -- 'tiles' table's columns and their types are as expected:
             -- 4 columns (zoom_level, tile_column, tile_row, tile_data).
             -- The order and the case of the type names are not important
             SELECT COUNT(*) = 4
             FROM pragma_table_info('tiles')
             WHERE ((name = 'zoom_level' AND upper(type) = 'INTEGER')
                 OR (name = 'tile_column' AND upper(type) = 'INTEGER')
                 OR (name = 'tile_row' AND upper(type) = 'INTEGER')
                 OR (name = 'tile_data' AND upper(type) = 'BLOB'))
             --
         ) as is_valid;",
    )
    .fetch_one(&mut *conn)
    .await?;

    Ok(is_valid == 1)
}

#[cfg(test)]
pub(crate) mod tests {
    use futures::StreamExt as _;
    use sqlx::Executor as _;

    use super::*;

    pub(crate) const CREATE_FLAT_TILES: &str = "CREATE TABLE tiles (
             zoom_level integer NOT NULL,
             tile_column integer NOT NULL,
             tile_row integer NOT NULL,
             tile_data blob,
             PRIMARY KEY(zoom_level, tile_column, tile_row));";

    async fn mem_db(script: &str) -> SqliteConnection {
        let mut conn = SqliteConnection::connect(":memory:").await.unwrap();
        conn.execute(CREATE_FLAT_TILES).await.unwrap();
        if !script.is_empty() {
            conn.execute(script).await.unwrap();
        }
        conn
    }

    #[test]
    fn test_new() {
        let mbt = Mbtiles::new("../data/world.mbtiles").unwrap();
        assert_eq!(mbt.filepath(), "../data/world.mbtiles");
        assert_eq!(mbt.to_string(), "../data/world.mbtiles");
    }

    #[tokio::test]
    async fn test_open_missing() {
        let mbt = Mbtiles::new("does-not-exist.mbtiles").unwrap();
        let err = mbt.open_readonly().await.unwrap_err();
        assert!(matches!(err, ConvError::SourceNotFound(_)), "{err}");
    }

    #[tokio::test]
    async fn test_stream_tiles() {
        let mut conn = mem_db(
            "INSERT INTO tiles VALUES
                 (1, 0, 1, CAST('tl' AS BLOB))
               , (1, 1, 0, CAST('br' AS BLOB))
               , (2, 0, 0, NULL)
               , (-1, 0, 0, CAST('neg' AS BLOB))
               , (300, 0, 0, CAST('big' AS BLOB));",
        )
        .await;
        let mbt = Mbtiles::new(":memory:").unwrap();
        assert_eq!(mbt.tile_count(&mut conn).await.unwrap(), 5);

        let rows: Vec<_> = mbt.stream_tiles(&mut conn).collect().await;
        let mut tiles = Vec::new();
        let mut errors = Vec::new();
        for row in rows {
            match row.unwrap() {
                Ok(tile) => tiles.push(tile),
                Err(err) => errors.push(err.to_string()),
            }
        }
        tiles.sort_by_key(|t| t.coord);
        errors.sort();

        assert_eq!(
            tiles,
            vec![
                TileRecord {
                    coord: TileCoord { z: 1, x: 0, y: 1 },
                    data: b"tl".to_vec()
                },
                TileRecord {
                    coord: TileCoord { z: 1, x: 1, y: 0 },
                    data: b"br".to_vec()
                },
            ]
        );
        assert_eq!(
            errors,
            vec![
                "Invalid tile index zoom_level=-1, tile_column=0, tile_row=0",
                "Invalid tile index zoom_level=300, tile_column=0, tile_row=0",
                "Source row 2/0/0 has no tile data",
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_without_tiles_table() {
        let mut conn = SqliteConnection::connect(":memory:").await.unwrap();
        let mbt = Mbtiles::new(":memory:").unwrap();
        let first = mbt.stream_tiles(&mut conn).next().await.unwrap();
        assert!(first.is_err());
    }

    #[tokio::test]
    async fn test_is_flat() {
        let mut conn = mem_db("").await;
        assert!(is_flat_tables_type(&mut conn).await.unwrap());

        let mut conn = SqliteConnection::connect(":memory:").await.unwrap();
        conn.execute(
            "CREATE TABLE map (zoom_level INTEGER, tile_column INTEGER, tile_row INTEGER, tile_id TEXT);
             CREATE TABLE images (tile_data blob, tile_id text);
             CREATE VIEW tiles AS
                 SELECT map.zoom_level AS zoom_level, map.tile_column AS tile_column,
                        map.tile_row AS tile_row, images.tile_data AS tile_data
                 FROM map JOIN images ON images.tile_id = map.tile_id;",
        )
        .await
        .unwrap();
        assert!(!is_flat_tables_type(&mut conn).await.unwrap());
    }
}

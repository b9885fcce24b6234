//! Destination store: an OSMAnd-compatible `.sqlitedb` tile file.
//!
//! The layout is fixed by what OSMAnd expects to find:
//!
//! ```sql
//! CREATE TABLE tiles (x int, y int, z int, image blob, PRIMARY KEY (x, y, z));
//! CREATE INDEX IND ON tiles (x, y, z);
//! CREATE TABLE info (maxzoom int, minzoom int, tilenumbering text);
//! ```

use std::fmt::{Display, Formatter};
use std::path::Path;

use mb2osm_tile_utils::{OSMAND_MAX_ZOOM, OsmAndCoord};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{
    Connection as _, Executor as _, SqliteConnection, SqliteExecutor, SqlitePool, query, query_as,
    query_scalar,
};
use tracing::{debug, info, warn};

use crate::errors::{ConvError, ConvResult};

/// Value of `info.tilenumbering` for XYZ rows with inverted zoom levels
pub const TILE_NUMBERING: &str = "BigPlanet";

/// Kept as a single SQL text so the connection's statement cache prepares it only once.
const INSERT_TILE: &str = "INSERT INTO tiles (x, y, z, image) VALUES (?, ?, ?, ?)";

#[derive(Clone, Debug)]
pub struct OsmAndDb {
    filepath: String,
}

impl Display for OsmAndDb {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.filepath)
    }
}

impl OsmAndDb {
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

    fn connect_options(&self) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(self.filepath())
            .create_if_missing(true)
    }

    /// Open a pool with a single connection.
    ///
    /// `SQLite` allows one writer at a time, so every insert of a conversion goes
    /// through the same connection and the same transaction.
    pub async fn open_pool(&self) -> ConvResult<SqlitePool> {
        debug!("Opening or creating {self} as a single connection pool");
        Ok(SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(self.connect_options())
            .await?)
    }

    pub async fn open_or_new(&self) -> ConvResult<SqliteConnection> {
        debug!("Opening or creating {self}");
        Ok(SqliteConnection::connect_with(&self.connect_options()).await?)
    }
}

/// Returns true if the database is empty (no tables/indexes/...)
pub async fn is_empty_database<T>(conn: &mut T) -> ConvResult<bool>
where
    for<'e> &'e mut T: SqliteExecutor<'e>,
{
    Ok(query("SELECT 1 FROM sqlite_schema LIMIT 1")
        .fetch_optional(&mut *conn)
        .await?
        .is_none())
}

/// Create the `tiles` table and its index.
///
/// Uses plain `CREATE` statements: a destination that already has these objects is an error.
pub async fn create_tiles_table<T>(conn: &mut T) -> ConvResult<()>
where
    for<'e> &'e mut T: SqliteExecutor<'e>,
{
    debug!("Creating OSMAnd table: tiles(x,y,z,image)");
    conn.execute(
        "CREATE TABLE tiles (
             x int,
             y int,
             z int,
             image blob,
             PRIMARY KEY (x, y, z));
         CREATE INDEX IND ON tiles (x, y, z);",
    )
    .await?;

    Ok(())
}

pub async fn create_info_table<T>(conn: &mut T) -> ConvResult<()>
where
    for<'e> &'e mut T: SqliteExecutor<'e>,
{
    debug!("Creating OSMAnd table: info(maxzoom,minzoom,tilenumbering)");
    conn.execute("CREATE TABLE info (maxzoom int, minzoom int, tilenumbering text);")
        .await?;

    Ok(())
}

pub async fn init_osmand_schema<T>(conn: &mut T) -> ConvResult<()>
where
    for<'e> &'e mut T: SqliteExecutor<'e>,
{
    create_tiles_table(&mut *conn).await?;
    create_info_table(&mut *conn).await
}

pub async fn insert_tile<T>(conn: &mut T, coord: OsmAndCoord, image: &[u8]) -> Result<(), sqlx::Error>
where
    for<'e> &'e mut T: SqliteExecutor<'e>,
{
    query(INSERT_TILE)
        .bind(i64::from(coord.x))
        .bind(i64::from(coord.y))
        .bind(i64::from(coord.z))
        .bind(image)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn validate_zoom(zoom: Option<i64>, zoom_name: &'static str) -> ConvResult<Option<u8>> {
    if let Some(zoom) = zoom {
        let z = u8::try_from(zoom).ok().filter(|v| *v <= OSMAND_MAX_ZOOM);
        if z.is_none() {
            Err(ConvError::InvalidZoomValue(zoom_name, zoom.to_string()))
        } else {
            Ok(z)
        }
    } else {
        Ok(None)
    }
}

/// Compute `(min, max)` of the `z` column, or `None` if the `tiles` table is empty
pub async fn compute_min_max_zoom<T>(conn: &mut T) -> ConvResult<Option<(u8, u8)>>
where
    for<'e> &'e mut T: SqliteExecutor<'e>,
{
    let (min_zoom, max_zoom): (Option<i64>, Option<i64>) =
        query_as("SELECT min(z), max(z) FROM tiles")
            .fetch_one(&mut *conn)
            .await?;

    let min_zoom = validate_zoom(min_zoom, "minzoom")?;
    let max_zoom = validate_zoom(max_zoom, "maxzoom")?;

    match (min_zoom, max_zoom) {
        (Some(min_zoom), Some(max_zoom)) => Ok(Some((min_zoom, max_zoom))),
        _ => Ok(None),
    }
}

/// Write the single `info` row from the content of the `tiles` table.
///
/// Must only run once every tile has been inserted. An empty `tiles` table produces a row with
/// NULL zoom values.
pub async fn insert_info<T>(conn: &mut T) -> ConvResult<Option<(u8, u8)>>
where
    for<'e> &'e mut T: SqliteExecutor<'e>,
{
    let zooms = compute_min_max_zoom(&mut *conn).await?;
    if let Some((min_zoom, max_zoom)) = zooms {
        info!("Setting info maxzoom={max_zoom} minzoom={min_zoom} tilenumbering={TILE_NUMBERING}");
    } else {
        warn!("No tiles were written, info zoom range is left empty");
    }
    query("INSERT INTO info (maxzoom, minzoom, tilenumbering) VALUES (?, ?, ?)")
        .bind(zooms.map(|(_, max)| i64::from(max)))
        .bind(zooms.map(|(min, _)| i64::from(min)))
        .bind(TILE_NUMBERING)
        .execute(&mut *conn)
        .await?;
    Ok(zooms)
}

/// Drop every schema object except the `tiles` table and the objects `SQLite` manages itself.
///
/// Views and triggers go first, so that no leftover object refers to a table that is being dropped
/// or renamed.
async fn drop_all_except_tiles(conn: &mut SqliteConnection) -> ConvResult<()> {
    let objects: Vec<(String, String)> = query_as(
        "SELECT type, name
         FROM sqlite_schema
         WHERE name != 'tiles'
           AND name NOT LIKE 'sqlite_%'
         ORDER BY CASE type WHEN 'view' THEN 0 WHEN 'trigger' THEN 1 WHEN 'index' THEN 2 ELSE 3 END",
    )
    .fetch_all(&mut *conn)
    .await?;

    for (kind, name) in objects {
        let kind = match kind.as_str() {
            "view" => "VIEW",
            "trigger" => "TRIGGER",
            "index" => "INDEX",
            "table" => "TABLE",
            _ => continue,
        };
        debug!("Dropping MBTiles {kind} {name}");
        // Indexes and triggers of an already dropped table are gone too
        let sql = format!(r#"DROP {kind} IF EXISTS "{}""#, name.replace('"', r#""""#));
        conn.execute(sql.as_str()).await?;
    }
    Ok(())
}

/// Turn a byte-for-byte copy of a flat `MBTiles` file into the OSMAnd layout using SQL only.
///
/// Everything but the tiles is dropped, so the result holds only the OSMAnd objects.
///
/// The caller owns the transaction. Returns the number of source rows that were not copied
/// because their address has no OSMAnd equivalent or they have no data.
pub async fn rewrite_mbtiles_tables(conn: &mut SqliteConnection) -> ConvResult<u64> {
    drop_all_except_tiles(&mut *conn).await?;

    debug!("Moving MBTiles tiles aside");
    conn.execute("ALTER TABLE tiles RENAME TO mbtiles_tiles;")
        .await?;

    init_osmand_schema(&mut *conn).await?;

    let total: i64 = query_scalar("SELECT COUNT(*) FROM mbtiles_tiles")
        .fetch_one(&mut *conn)
        .await?;
    let copied = query(
        "INSERT OR IGNORE INTO tiles (x, y, z, image)
         SELECT tile_column
              , (1 << zoom_level) - 1 - tile_row
              , ? - zoom_level
              , tile_data
         FROM mbtiles_tiles
         WHERE zoom_level BETWEEN 0 AND ?
           AND tile_column >= 0
           AND tile_row BETWEEN 0 AND (1 << zoom_level) - 1
           AND tile_data NOT NULL",
    )
    .bind(i64::from(OSMAND_MAX_ZOOM))
    .bind(i64::from(OSMAND_MAX_ZOOM))
    .execute(&mut *conn)
    .await?
    .rows_affected();

    conn.execute("DROP TABLE mbtiles_tiles;").await?;

    Ok(u64::try_from(total).unwrap_or_default().saturating_sub(copied))
}

#[cfg(test)]
mod tests {
    use sqlx::Row as _;

    use super::*;

    async fn mem_db() -> SqliteConnection {
        let mut conn = SqliteConnection::connect(":memory:").await.unwrap();
        assert!(is_empty_database(&mut conn).await.unwrap());
        init_osmand_schema(&mut conn).await.unwrap();
        assert!(!is_empty_database(&mut conn).await.unwrap());
        conn
    }

    #[tokio::test]
    async fn test_schema() {
        let mut conn = mem_db().await;
        let objects: Vec<(String, String)> = query_as(
            "SELECT type, name FROM sqlite_schema WHERE name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&mut conn)
        .await
        .unwrap();
        assert_eq!(
            objects,
            vec![
                ("index".to_string(), "IND".to_string()),
                ("table".to_string(), "info".to_string()),
                ("table".to_string(), "tiles".to_string()),
            ]
        );

        // schema creation is not repeatable on the same file
        assert!(init_osmand_schema(&mut conn).await.is_err());
    }

    #[tokio::test]
    async fn test_primary_key() {
        let mut conn = mem_db().await;
        let coord = OsmAndCoord { x: 1, y: 2, z: 3 };
        insert_tile(&mut conn, coord, b"a").await.unwrap();
        let err = insert_tile(&mut conn, coord, b"b").await.unwrap_err();
        assert!(
            err.as_database_error()
                .is_some_and(|e| e.is_unique_violation())
        );
        let image: Vec<u8> = query_scalar("SELECT image FROM tiles")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(image, b"a");
    }

    #[tokio::test]
    async fn test_info() {
        let mut conn = mem_db().await;
        for z in [15, 12, 8] {
            insert_tile(&mut conn, OsmAndCoord { x: 0, y: 0, z }, b"t")
                .await
                .unwrap();
        }
        assert_eq!(compute_min_max_zoom(&mut conn).await.unwrap(), Some((8, 15)));
        assert_eq!(insert_info(&mut conn).await.unwrap(), Some((8, 15)));

        let row = query("SELECT maxzoom, minzoom, tilenumbering FROM info")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>(0), 15);
        assert_eq!(row.get::<i64, _>(1), 8);
        assert_eq!(row.get::<String, _>(2), "BigPlanet");
    }

    #[tokio::test]
    async fn test_info_empty() {
        let mut conn = mem_db().await;
        assert_eq!(insert_info(&mut conn).await.unwrap(), None);
        let (maxzoom, minzoom): (Option<i64>, Option<i64>) =
            query_as("SELECT maxzoom, minzoom FROM info")
                .fetch_one(&mut conn)
                .await
                .unwrap();
        assert_eq!((maxzoom, minzoom), (None, None));
    }

    #[tokio::test]
    async fn test_invalid_zoom_in_tiles() {
        let mut conn = mem_db().await;
        conn.execute("INSERT INTO tiles VALUES (0, 0, -1, NULL)")
            .await
            .unwrap();
        assert!(matches!(
            compute_min_max_zoom(&mut conn).await,
            Err(ConvError::InvalidZoomValue("minzoom", _))
        ));
    }

    #[tokio::test]
    async fn test_rewrite() {
        let mut conn = SqliteConnection::connect(":memory:").await.unwrap();
        conn.execute(crate::mbtiles::tests::CREATE_FLAT_TILES)
            .await
            .unwrap();
        conn.execute(
            "CREATE TABLE metadata (name text NOT NULL PRIMARY KEY, value text);
             INSERT INTO metadata VALUES ('name', 'test');
             CREATE TABLE grids (zoom_level integer, tile_column integer, tile_row integer, grid blob);
             CREATE TABLE keymap (key_name text, key_json text);
             CREATE UNIQUE INDEX keymap_lookup ON keymap (key_name);
             CREATE TABLE info (name text);
             CREATE VIEW tile_sizes AS SELECT zoom_level, length(tile_data) AS size FROM tiles;
             CREATE TRIGGER no_empty_tiles BEFORE INSERT ON tiles WHEN NEW.tile_data = ''
                 BEGIN SELECT RAISE(ABORT, 'empty tile'); END;
             INSERT INTO tiles VALUES
                 (10, 5, 3, CAST('a' AS BLOB))
               , (2, 1, 0, CAST('b' AS BLOB))
               , (18, 0, 0, CAST('too deep' AS BLOB))
               , (1, 0, 2, CAST('bad row' AS BLOB))
               , (3, 0, 0, NULL);",
        )
        .await
        .unwrap();

        assert_eq!(rewrite_mbtiles_tables(&mut conn).await.unwrap(), 3);
        assert_eq!(insert_info(&mut conn).await.unwrap(), Some((7, 15)));

        let tiles: Vec<(i64, i64, i64, Vec<u8>)> =
            query_as("SELECT x, y, z, image FROM tiles ORDER BY z")
                .fetch_all(&mut conn)
                .await
                .unwrap();
        assert_eq!(
            tiles,
            vec![(5, 1020, 7, b"a".to_vec()), (1, 3, 15, b"b".to_vec())]
        );
        let objects: Vec<(String, String)> = query_as(
            "SELECT type, name FROM sqlite_schema WHERE name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&mut conn)
        .await
        .unwrap();
        assert_eq!(
            objects,
            vec![
                ("index".to_string(), "IND".to_string()),
                ("table".to_string(), "info".to_string()),
                ("table".to_string(), "tiles".to_string()),
            ]
        );
    }
}

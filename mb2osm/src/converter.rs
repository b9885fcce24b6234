// See https://github.com/SeedyROM/enum-display/issues/1
#![allow(unused_qualifications)]

use std::fmt::{Display, Formatter};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

#[cfg(feature = "cli")]
use clap::{Args, ValueEnum};
use enum_display::EnumDisplay;
use futures::TryStreamExt as _;
use serde::Serialize;
use size_format::SizeFormatterBinary;
use sqlx::{Connection as _, Executor as _, SqliteConnection};
use tokio::sync::Mutex;
use tracing::{Instrument as _, debug, info, info_span, warn};

use crate::errors::{ConvError, ConvResult};
use crate::mbtiles::{Mbtiles, is_flat_tables_type};
use crate::pipeline::{ConvertStats, SharedTransaction, TilePipeline};
use crate::sqlitedb::{OsmAndDb, init_osmand_schema, insert_info, rewrite_mbtiles_tables};

pub const DEFAULT_WORKERS: usize = 5;
pub const DEFAULT_QUEUE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumDisplay)]
#[enum_display(case = "Kebab")]
#[cfg_attr(feature = "cli", derive(ValueEnum))]
pub enum ConvertMode {
    /// Read every tile, optionally re-encode it as JPEG, and write it into a new OSMAnd file
    #[default]
    Transcode,
    /// Copy the MBTiles file as is, and convert its tables to the OSMAnd layout with SQL.
    /// Faster for large files, but cannot re-encode images and requires a flat MBTiles file
    Rewrite,
}

/// Steps of a single conversion, in order. Any step may end in [`ConvertState::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumDisplay)]
#[enum_display(case = "Kebab")]
pub enum ConvertState {
    Init,
    SchemaReady,
    Streaming,
    Draining,
    Aggregating,
    Committed,
    Failed,
}

#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "cli", derive(Args))]
pub struct MbtilesConverter {
    /// MBTiles file to read from
    pub src_file: PathBuf,
    /// OSMAnd .sqlitedb file to write to
    pub dst_file: PathBuf,
    /// Re-encode all tiles as JPEG with this quality (1-100). 0 keeps the original tile images
    #[cfg_attr(
        feature = "cli",
        arg(long = "jpg", value_name = "QUALITY", default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=100))
    )]
    pub jpeg_quality: u8,
    /// Delete the destination file first if it already exists
    #[cfg_attr(feature = "cli", arg(short, long))]
    pub force: bool,
    /// Number of tiles processed concurrently
    #[cfg_attr(feature = "cli", arg(long, default_value_t = DEFAULT_WORKERS))]
    pub workers: usize,
    /// Number of tiles read ahead of the workers
    #[cfg_attr(feature = "cli", arg(long, default_value_t = DEFAULT_QUEUE_SIZE))]
    pub queue_size: usize,
    /// How the conversion is performed
    #[cfg_attr(feature = "cli", arg(long, value_enum, default_value_t = ConvertMode::default()))]
    pub mode: ConvertMode,
}

impl Default for MbtilesConverter {
    fn default() -> Self {
        Self {
            src_file: PathBuf::new(),
            dst_file: PathBuf::new(),
            jpeg_quality: 0,
            force: false,
            workers: DEFAULT_WORKERS,
            queue_size: DEFAULT_QUEUE_SIZE,
            mode: ConvertMode::default(),
        }
    }
}

/// Outcome of a successful conversion
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConvertSummary {
    pub tiles_read: u64,
    pub tiles_written: u64,
    pub tiles_skipped: u64,
    /// Tiles dropped because another tile already used the same OSMAnd address
    pub collisions: u64,
    /// Smallest `z` in the destination, i.e. the deepest source zoom level
    pub min_zoom: Option<u8>,
    pub max_zoom: Option<u8>,
    /// Size of the committed destination file in bytes
    pub file_size: u64,
}

impl Display for ConvertSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Converted {} of {} tiles ({} skipped, {} duplicate addresses)",
            self.tiles_written, self.tiles_read, self.tiles_skipped, self.collisions
        )?;
        if let (Some(min), Some(max)) = (self.min_zoom, self.max_zoom) {
            write!(f, ", OSMAnd zoom range {min}..={max}")?;
        }
        let file_size = SizeFormatterBinary::new(self.file_size);
        write!(f, ", {file_size:.2}B written")
    }
}

/// Convert an `MBTiles` file into a new OSMAnd `.sqlitedb` file with the default settings.
///
/// `jpeg_quality == 0` copies tile images unchanged, `1..=100` re-encodes them as JPEG.
/// With `overwrite`, an existing destination file is deleted first.
pub async fn convert<P: AsRef<Path>, Q: AsRef<Path>>(
    src_file: P,
    dst_file: Q,
    jpeg_quality: u8,
    overwrite: bool,
) -> ConvResult<ConvertSummary> {
    MbtilesConverter {
        jpeg_quality,
        force: overwrite,
        ..MbtilesConverter::new(src_file.as_ref(), dst_file.as_ref())
    }
    .run()
    .await
}

impl MbtilesConverter {
    #[must_use]
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(src_file: P, dst_file: Q) -> Self {
        Self {
            src_file: src_file.into(),
            dst_file: dst_file.into(),
            ..Self::default()
        }
    }

    pub async fn run(self) -> ConvResult<ConvertSummary> {
        self.validate()?;
        self.prepare_destination().await?;
        let span = info_span!(
            "convert",
            src = %self.src_file.display(),
            dst = %self.dst_file.display()
        );
        MbtilesConverterInt::new(self)?.run().instrument(span).await
    }

    fn validate(&self) -> ConvResult<()> {
        if self.jpeg_quality > 100 {
            return Err(ConvError::InvalidOption(format!(
                "JPEG quality must be between 0 and 100, got {}",
                self.jpeg_quality
            )));
        }
        if self.workers == 0 {
            return Err(ConvError::InvalidOption(
                "at least one worker is required".to_string(),
            ));
        }
        if self.queue_size == 0 {
            return Err(ConvError::InvalidOption(
                "queue size must be at least 1".to_string(),
            ));
        }
        if self.mode == ConvertMode::Rewrite && self.jpeg_quality > 0 {
            return Err(ConvError::InvalidOption(
                "tiles cannot be re-encoded in rewrite mode".to_string(),
            ));
        }
        // Paths are compared as given, two spellings of one file are not detected
        if self.src_file == self.dst_file {
            return Err(ConvError::SameSourceAndDestination(self.src_file.clone()));
        }
        Ok(())
    }

    /// Make sure nothing is at the destination path, deleting it if `force` is set
    async fn prepare_destination(&self) -> ConvResult<()> {
        let dst = &self.dst_file;
        match tokio::fs::metadata(dst).await {
            Ok(_) if self.force => {
                debug!("Overwrite is allowed, deleting existing {}", dst.display());
                tokio::fs::remove_file(dst).await?;
            }
            Ok(_) => return Err(ConvError::DestinationExists(dst.clone())),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

struct MbtilesConverterInt {
    src_mbtiles: Mbtiles,
    dst_db: OsmAndDb,
    options: MbtilesConverter,
    state: ConvertState,
    stats: Arc<ConvertStats>,
}

impl MbtilesConverterInt {
    fn new(options: MbtilesConverter) -> ConvResult<Self> {
        Ok(Self {
            src_mbtiles: Mbtiles::new(&options.src_file)?,
            dst_db: OsmAndDb::new(&options.dst_file)?,
            options,
            state: ConvertState::Init,
            stats: Arc::new(ConvertStats::default()),
        })
    }

    fn advance(&mut self, state: ConvertState) {
        debug!("Conversion state {} -> {state}", self.state);
        self.state = state;
    }

    async fn run(mut self) -> ConvResult<ConvertSummary> {
        let start = Instant::now();
        info!(
            "Converting {} to {} ({} mode, jpeg quality {})",
            self.src_mbtiles, self.dst_db, self.options.mode, self.options.jpeg_quality
        );

        let result = match self.options.mode {
            ConvertMode::Transcode => self.transcode().await,
            ConvertMode::Rewrite => self.rewrite().await,
        };

        match result {
            Ok(zooms) => {
                self.advance(ConvertState::Committed);
                let summary = ConvertSummary {
                    tiles_read: self.stats.read(),
                    tiles_written: self.stats.written(),
                    tiles_skipped: self.stats.skipped(),
                    collisions: self.stats.collisions(),
                    min_zoom: zooms.map(|(min, _)| min),
                    max_zoom: zooms.map(|(_, max)| max),
                    file_size: tokio::fs::metadata(self.dst_db.filepath())
                        .await
                        .map(|m| m.len())
                        .unwrap_or_default(),
                };
                info!("{summary} in {:.1?}", start.elapsed());
                Ok(summary)
            }
            Err(err) => {
                let state = self.state;
                self.advance(ConvertState::Failed);
                Err(ConvError::Failed {
                    state,
                    source: Box::new(err),
                })
            }
        }
    }

    async fn transcode(&mut self) -> ConvResult<Option<(u8, u8)>> {
        let mut src_conn = self.src_mbtiles.open_readonly().await?;
        let total = self.src_mbtiles.tile_count(&mut src_conn).await?;

        let pool = self.dst_db.open_pool().await?;
        // Rolled back on drop unless committed, on every path out of this function
        let mut tx = pool.begin().await?;
        init_osmand_schema(&mut *tx).await?;
        self.advance(ConvertState::SchemaReady);

        let tx: SharedTransaction = Arc::new(Mutex::new(tx));
        let pipeline = TilePipeline::start(
            self.options.workers,
            self.options.queue_size,
            self.options.jpeg_quality,
            &tx,
            &self.stats,
        );
        self.advance(ConvertState::Streaming);
        let streamed = self.stream_source(&mut src_conn, &pipeline, total).await;

        // Workers still hold the transaction, let them finish even if the scan failed.
        // A failed scan stays reported as a streaming failure.
        if streamed.is_ok() {
            self.advance(ConvertState::Draining);
        }
        let drained = pipeline.finish().await;
        streamed?;
        drained?;

        self.advance(ConvertState::Aggregating);
        let mut tx = Arc::into_inner(tx)
            .ok_or(ConvError::TransactionStillShared)?
            .into_inner();
        let zooms = insert_info(&mut *tx).await?;
        tx.commit().await?;
        pool.close().await;

        Ok(zooms)
    }

    async fn stream_source(
        &self,
        conn: &mut SqliteConnection,
        pipeline: &TilePipeline,
        total: u64,
    ) -> ConvResult<()> {
        let mut rows = self.src_mbtiles.stream_tiles(conn);
        let mut last_report_ts = Instant::now();
        while let Some(row) = rows.try_next().await? {
            self.stats.add_read();
            match row {
                Ok(tile) => {
                    if !pipeline.send(tile).await {
                        warn!("No conversion workers are left, stopping the scan");
                        break;
                    }
                }
                Err(e) => {
                    warn!("Skipping source row: {e}");
                    self.stats.add_skipped();
                }
            }
            if last_report_ts.elapsed().as_secs() >= 10 {
                info!("Processed {} of {total} tiles", self.stats.processed());
                last_report_ts = Instant::now();
            }
        }
        debug!("Read {} tiles from {}", self.stats.read(), self.src_mbtiles);
        Ok(())
    }

    async fn rewrite(&mut self) -> ConvResult<Option<(u8, u8)>> {
        let mut src_conn = self.src_mbtiles.open_readonly().await?;
        if !is_flat_tables_type(&mut src_conn).await? {
            return Err(ConvError::UnsupportedSourceLayout(
                self.src_mbtiles.filepath().to_string(),
                "only files with a flat tiles table can be rewritten, use transcode mode instead",
            ));
        }
        let total = self.src_mbtiles.tile_count(&mut src_conn).await?;
        src_conn.close().await?;

        debug!("Copying {} to {}", self.src_mbtiles, self.dst_db);
        tokio::fs::copy(self.src_mbtiles.filepath(), self.dst_db.filepath()).await?;

        let result = self.rewrite_copy(total).await;
        if result.is_err() {
            // A failed rewrite leaves a plain MBTiles copy behind, which must not pass for a result
            if let Err(e) = tokio::fs::remove_file(self.dst_db.filepath()).await {
                warn!("Unable to delete {}: {e}", self.dst_db);
            }
        }
        result
    }

    async fn rewrite_copy(&mut self, total: u64) -> ConvResult<Option<(u8, u8)>> {
        let mut conn = self.dst_db.open_or_new().await?;
        let mut tx = conn.begin().await?;

        self.advance(ConvertState::Streaming);
        let skipped = rewrite_mbtiles_tables(&mut tx).await?;
        if skipped > 0 {
            warn!("{skipped} tiles have no OSMAnd address or no data and were not copied");
        }
        self.stats.add_read_many(total);
        self.stats.add_skipped_many(skipped);
        self.stats.add_written_many(total.saturating_sub(skipped));

        self.advance(ConvertState::Aggregating);
        let zooms = insert_info(&mut *tx).await?;
        tx.commit().await?;

        debug!("Vacuuming {}", self.dst_db);
        conn.execute("VACUUM").await?;
        conn.close().await?;

        Ok(zooms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let conv = MbtilesConverter::new("a.mbtiles", "b.sqlitedb");
        assert_eq!(conv.workers, 5);
        assert_eq!(conv.queue_size, 100);
        assert_eq!(conv.jpeg_quality, 0);
        assert_eq!(conv.mode, ConvertMode::Transcode);
        assert!(!conv.force);
    }

    #[test]
    fn test_validate() {
        let ok = MbtilesConverter::new("a.mbtiles", "b.sqlitedb");
        assert!(ok.validate().is_ok());

        for invalid in [
            MbtilesConverter {
                jpeg_quality: 101,
                ..ok.clone()
            },
            MbtilesConverter {
                workers: 0,
                ..ok.clone()
            },
            MbtilesConverter {
                queue_size: 0,
                ..ok.clone()
            },
            MbtilesConverter {
                mode: ConvertMode::Rewrite,
                jpeg_quality: 50,
                ..ok.clone()
            },
        ] {
            assert!(matches!(
                invalid.validate(),
                Err(ConvError::InvalidOption(_))
            ));
        }

        let same = MbtilesConverter::new("a.mbtiles", "a.mbtiles");
        assert!(matches!(
            same.validate(),
            Err(ConvError::SameSourceAndDestination(_))
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(ConvertMode::Rewrite.to_string(), "rewrite");
        assert_eq!(ConvertState::SchemaReady.to_string(), "schema-ready");

        let summary = ConvertSummary {
            tiles_read: 3,
            tiles_written: 2,
            tiles_skipped: 1,
            collisions: 0,
            min_zoom: Some(7),
            max_zoom: Some(7),
            file_size: 4096,
        };
        let text = summary.to_string();
        assert!(text.starts_with(
            "Converted 2 of 3 tiles (1 skipped, 0 duplicate addresses), OSMAnd zoom range 7..=7, "
        ));
        assert!(text.ends_with("B written"));
    }

    #[tokio::test]
    async fn test_destination_exists() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("exists.sqlitedb");
        std::fs::write(&dst, b"").unwrap();

        let conv = MbtilesConverter::new(dir.path().join("src.mbtiles"), &dst);
        assert!(matches!(
            conv.prepare_destination().await,
            Err(ConvError::DestinationExists(_))
        ));
        assert!(dst.exists());

        let conv = MbtilesConverter {
            force: true,
            ..conv
        };
        conv.prepare_destination().await.unwrap();
        assert!(!dst.exists());
        // nothing to delete is fine too
        conv.prepare_destination().await.unwrap();
    }
}

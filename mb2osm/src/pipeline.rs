use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;

use flume::{Receiver, Sender, bounded};
use mb2osm_tile_utils::OsmAndCoord;
use sqlx::{Sqlite, Transaction};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{Instrument as _, debug, info_span, warn};

use crate::errors::{ConvResult, TileError};
use crate::mbtiles::TileRecord;
use crate::recode::recode;
use crate::sqlitedb::insert_tile;

/// The destination transaction, shared by all workers. Holding the lock is what serializes
/// inserts into the single-writer `SQLite` file.
pub type SharedTransaction = Arc<Mutex<Transaction<'static, Sqlite>>>;

/// Tile ready to be written to the destination
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranscodedTile {
    pub coord: OsmAndCoord,
    pub image: Vec<u8>,
}

/// Counters updated concurrently by the producer and the workers.
#[derive(Debug, Default)]
pub struct ConvertStats {
    read: AtomicU64,
    written: AtomicU64,
    skipped: AtomicU64,
    collisions: AtomicU64,
}

impl ConvertStats {
    pub fn add_read(&self) {
        self.read.fetch_add(1, Relaxed);
    }

    pub fn add_read_many(&self, count: u64) {
        self.read.fetch_add(count, Relaxed);
    }

    pub fn add_written_many(&self, count: u64) {
        self.written.fetch_add(count, Relaxed);
    }

    pub fn add_skipped(&self) {
        self.skipped.fetch_add(1, Relaxed);
    }

    pub fn add_skipped_many(&self, count: u64) {
        self.skipped.fetch_add(count, Relaxed);
    }

    pub fn read(&self) -> u64 {
        self.read.load(Relaxed)
    }

    pub fn written(&self) -> u64 {
        self.written.load(Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Relaxed)
    }

    pub fn collisions(&self) -> u64 {
        self.collisions.load(Relaxed)
    }

    /// Tiles that reached a final state, written or not
    pub fn processed(&self) -> u64 {
        self.written() + self.skipped() + self.collisions()
    }
}

/// Compute the destination address and the destination image of one source tile.
///
/// The address is checked first, so a tile that cannot be placed is never decoded.
pub fn transcode(tile: TileRecord, quality: u8) -> Result<TranscodedTile, TileError> {
    let coord = tile.coord.to_osmand()?;
    let image = recode(tile.data, quality)?;
    Ok(TranscodedTile { coord, image })
}

/// A fixed set of worker tasks draining one bounded queue of source tiles into the destination.
pub struct TilePipeline {
    queue: Sender<TileRecord>,
    workers: JoinSet<()>,
}

impl TilePipeline {
    /// Spawn `workers` tasks. Must be called from within a tokio runtime.
    ///
    /// The tasks inherit the caller's tracing span.
    pub fn start(
        workers: usize,
        queue_size: usize,
        quality: u8,
        tx: &SharedTransaction,
        stats: &Arc<ConvertStats>,
    ) -> Self {
        let (queue, rx_wrk) = bounded(queue_size);
        let mut set = JoinSet::new();
        for id in 0..workers {
            let worker = Worker {
                id,
                quality,
                rx_wrk: rx_wrk.clone(),
                tx: tx.clone(),
                stats: stats.clone(),
            };
            set.spawn(worker.run().instrument(info_span!("worker", id)));
        }
        debug!("Started {workers} workers with a queue of {queue_size} tiles");
        Self {
            queue,
            workers: set,
        }
    }

    /// Hand a tile to the workers, waiting while the queue is full.
    ///
    /// Returns `false` if no worker is left to receive it.
    pub async fn send(&self, tile: TileRecord) -> bool {
        self.queue.send_async(tile).await.is_ok()
    }

    /// Close the queue and wait until every worker has drained it and exited.
    pub async fn finish(self) -> ConvResult<()> {
        let Self { queue, mut workers } = self;
        drop(queue);
        let mut result = Ok(());
        while let Some(res) = workers.join_next().await {
            if let Err(err) = res {
                result = Err(err.into());
            }
        }
        result
    }
}

struct Worker {
    id: usize,
    quality: u8,
    rx_wrk: Receiver<TileRecord>,
    tx: SharedTransaction,
    stats: Arc<ConvertStats>,
}

impl Worker {
    async fn run(self) {
        // recv fails only once the queue is closed and empty
        while let Ok(tile) = self.rx_wrk.recv_async().await {
            let source = tile.coord;
            match self.process(tile).await {
                Ok(()) => {
                    self.stats.written.fetch_add(1, Relaxed);
                }
                Err(TileError::InsertFailed(e))
                    if e.as_database_error()
                        .is_some_and(|db| db.is_unique_violation()) =>
                {
                    warn!(
                        "Tile {source:#} maps to an OSMAnd address that is already taken, keeping the first tile"
                    );
                    self.stats.collisions.fetch_add(1, Relaxed);
                }
                Err(e) => {
                    warn!("Skipping tile {source:#}: {e}");
                    self.stats.add_skipped();
                }
            }
        }
        debug!("Worker {} finished", self.id);
    }

    async fn process(&self, tile: TileRecord) -> Result<(), TileError> {
        let quality = self.quality;
        let TranscodedTile { coord, image } = if quality == 0 {
            transcode(tile, quality)?
        } else {
            // decoding and encoding are CPU bound
            tokio::task::spawn_blocking(move || transcode(tile, quality)).await??
        };

        let mut tx = self.tx.lock().await;
        insert_tile(&mut **tx, coord, &image)
            .await
            .map_err(TileError::InsertFailed)
    }
}

//! Outbound delta batching and compression.
//!
//! ```text
//! ShardDoc ── DocChange::Local ──► batch ──(size | deadline | flush)──┐
//!          ── DocChange::Remote ─► mirror                             │
//!                                                                     ▼
//!                        mirror ◄── replay batch ── merged delta vs remote SV
//!                                                         │
//!                                          > threshold? ── LZ4 (kept if smaller)
//!                                                         │
//!                                                         ▼
//!                                         SyncMessage::CompressedUpdate
//! ```
//!
//! The mirror is a persistent scratch replica holding exactly what the room
//! has already seen: flushed local changes plus every remote update. Its
//! state vector is the "last known remote state", so each flush emits only
//! the batch's own changes as one merged delta.
//!
//! Performance targets:
//! - Merge 100 small updates: <1ms
//! - LZ4 pass on a 64KB delta: <100μs

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;
use yrs::{Doc, ReadTxn, StateVector, Transact};

use crate::config::CompressorConfig;
use crate::document::{DocChange, ShardDoc};
use crate::error::{Result, SyncError};
use crate::protocol::SyncMessage;

/// Statistics for one emitted frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompressionStats {
    /// Total bytes of the raw updates in the batch
    pub original_size: usize,
    /// Bytes actually put on the wire
    pub compressed_size: usize,
    /// original / compressed
    pub ratio: f64,
    pub secondary_compression: bool,
    /// Raw updates merged into this frame
    pub operation_count: usize,
}

/// One flushed batch, ready for the transport.
#[derive(Debug, Clone)]
pub struct CompressedUpdate {
    pub payload: Vec<u8>,
    pub secondary_compressed: bool,
    pub stats: CompressionStats,
}

/// Cumulative counters across all flushes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompressorStats {
    pub frames: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Updates dropped because they failed to decode or apply
    pub skipped_updates: u64,
}

impl CompressorStats {
    pub fn compression_ratio(&self) -> f64 {
        if self.bytes_out == 0 {
            return 0.0;
        }
        self.bytes_in as f64 / self.bytes_out as f64
    }
}

/// Batches raw local updates into merged, optionally LZ4-compressed deltas.
pub struct DeltaCompressor {
    config: CompressorConfig,
    mirror: Doc,
    remote_sv: Option<StateVector>,
    batch: Vec<Vec<u8>>,
    batch_bytes: usize,
    batch_started: Option<Instant>,
    totals: CompressorStats,
}

impl DeltaCompressor {
    pub fn new(config: CompressorConfig) -> Self {
        Self {
            config,
            mirror: Doc::new(),
            remote_sv: None,
            batch: Vec::new(),
            batch_bytes: 0,
            batch_started: None,
            totals: CompressorStats::default(),
        }
    }

    /// Seed the mirror with the document's current state.
    ///
    /// Everything already in `doc` is treated as known to the room.
    pub fn initialize(&mut self, doc: &ShardDoc) -> Result<()> {
        self.mirror = Doc::new();
        crate::document::apply_update_v1(&self.mirror, &doc.encode_state())?;
        self.remote_sv = Some(self.mirror.transact().state_vector());
        self.batch.clear();
        self.batch_bytes = 0;
        self.batch_started = None;
        Ok(())
    }

    /// Queue a raw local update. Returns true once the batch reached its
    /// size limit and should be flushed now.
    pub fn queue_update(&mut self, raw: Vec<u8>) -> bool {
        if self.batch.is_empty() {
            self.batch_started = Some(Instant::now());
        }
        self.batch_bytes += raw.len();
        self.batch.push(raw);
        self.batch_bytes >= self.config.max_batch_size_bytes
    }

    /// Feed an update the room already has into the mirror.
    pub fn observe_remote(&mut self, update: &[u8]) {
        match crate::document::apply_update_v1(&self.mirror, update) {
            Ok(()) => {
                // Batched local updates are not in the mirror yet, so its
                // vector is exactly what the room knows.
                self.remote_sv = Some(self.mirror.transact().state_vector());
            }
            Err(e) => log::warn!("Mirror rejected remote update: {e}"),
        }
    }

    /// When the current batch must be flushed, if one is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.batch_started
            .map(|started| started + self.config.max_batch_delay())
    }

    pub fn pending_len(&self) -> usize {
        self.batch.len()
    }

    pub fn pending_bytes(&self) -> usize {
        self.batch_bytes
    }

    pub fn stats(&self) -> &CompressorStats {
        &self.totals
    }

    /// Merge the pending batch into one frame.
    ///
    /// Returns `None` when nothing (decodable) was queued.
    pub fn flush_updates(&mut self) -> Option<CompressedUpdate> {
        if self.batch.is_empty() {
            return None;
        }
        let batch = std::mem::take(&mut self.batch);
        let original_size = std::mem::take(&mut self.batch_bytes);
        self.batch_started = None;

        let mut applied = 0;
        for raw in &batch {
            match crate::document::apply_update_v1(&self.mirror, raw) {
                Ok(()) => applied += 1,
                Err(e) => {
                    log::warn!("Skipping undecodable update ({} bytes): {e}", raw.len());
                    self.totals.skipped_updates += 1;
                }
            }
        }
        if applied == 0 {
            return None;
        }

        let delta = {
            let txn = self.mirror.transact();
            let delta = match &self.remote_sv {
                Some(sv) => txn.encode_state_as_update_v1(sv),
                None => txn.encode_state_as_update_v1(&StateVector::default()),
            };
            self.remote_sv = Some(txn.state_vector());
            delta
        };

        let (payload, secondary_compressed) = self.secondary_pass(delta);
        let compressed_size = payload.len();
        let stats = CompressionStats {
            original_size,
            compressed_size,
            ratio: if compressed_size == 0 {
                0.0
            } else {
                original_size as f64 / compressed_size as f64
            },
            secondary_compression: secondary_compressed,
            operation_count: applied,
        };

        self.totals.frames += 1;
        self.totals.bytes_in += original_size as u64;
        self.totals.bytes_out += compressed_size as u64;

        log::debug!(
            "Flushed {applied} updates: {original_size} → {compressed_size} bytes (lz4: {secondary_compressed})"
        );

        Some(CompressedUpdate {
            payload,
            secondary_compressed,
            stats,
        })
    }

    fn secondary_pass(&self, delta: Vec<u8>) -> (Vec<u8>, bool) {
        if delta.len() <= self.config.compression_threshold_bytes {
            return (delta, false);
        }
        let compressed = lz4_flex::compress_prepend_size(&delta);
        if compressed.len() < delta.len() {
            (compressed, true)
        } else {
            (delta, false)
        }
    }
}

/// Undo the secondary pass of a frame body, yielding a yrs v1 update.
pub fn decode_frame_body(body: &[u8], was_secondary_compressed: bool) -> Result<Vec<u8>> {
    if was_secondary_compressed {
        lz4_flex::decompress_size_prepended(body)
            .map_err(|e| SyncError::Encoding(format!("LZ4 decompression failed: {e}")))
    } else {
        Ok(body.to_vec())
    }
}

/// Apply a compressed frame to a shard document.
pub fn apply_compressed_update(doc: &ShardDoc, payload: &[u8], was_secondary_compressed: bool) -> Result<()> {
    let update = decode_frame_body(payload, was_secondary_compressed)?;
    doc.apply_update(&update)
}

// ───────────────────────────────────────────────────────────────────
// Batcher task
// ───────────────────────────────────────────────────────────────────

enum BatchCommand {
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Handle to a running batcher task.
pub struct BatcherHandle {
    commands: mpsc::Sender<BatchCommand>,
    stats: Arc<Mutex<CompressorStats>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BatcherHandle {
    /// Flush everything queued so far. Resolves once the frame has been
    /// handed to the transport.
    pub async fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(BatchCommand::Flush(ack_tx))
            .await
            .map_err(|_| SyncError::Transport("batcher stopped".into()))?;
        ack_rx
            .await
            .map_err(|_| SyncError::Transport("batcher stopped".into()))
    }

    pub fn stats(&self) -> CompressorStats {
        self.stats.lock().clone()
    }

    /// Flush whatever is pending and stop the task.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(BatchCommand::Shutdown).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("Batcher task failed: {e}");
            }
        }
    }
}

/// Spawn the task that turns a shard's change stream into frames.
pub fn spawn_batcher(
    compressor: DeltaCompressor,
    changes: mpsc::UnboundedReceiver<DocChange>,
    outgoing: mpsc::Sender<SyncMessage>,
    peer_id: Uuid,
    room: String,
) -> BatcherHandle {
    let (commands, command_rx) = mpsc::channel(16);
    let stats = Arc::new(Mutex::new(CompressorStats::default()));

    let batcher = Batcher {
        compressor,
        changes,
        outgoing,
        peer_id,
        room,
        clock: 0,
        stats: stats.clone(),
    };
    let task = tokio::spawn(batcher.run(command_rx));

    BatcherHandle {
        commands,
        stats,
        task: Mutex::new(Some(task)),
    }
}

struct Batcher {
    compressor: DeltaCompressor,
    changes: mpsc::UnboundedReceiver<DocChange>,
    outgoing: mpsc::Sender<SyncMessage>,
    peer_id: Uuid,
    room: String,
    clock: u64,
    stats: Arc<Mutex<CompressorStats>>,
}

impl Batcher {
    async fn run(mut self, mut commands: mpsc::Receiver<BatchCommand>) {
        loop {
            let deadline = self.compressor.deadline();
            tokio::select! {
                change = self.changes.recv() => match change {
                    Some(change) => {
                        if self.apply(change) {
                            self.flush().await;
                        }
                    }
                    None => {
                        self.flush().await;
                        break;
                    }
                },

                cmd = commands.recv() => match cmd {
                    Some(BatchCommand::Flush(ack)) => {
                        self.drain();
                        self.flush().await;
                        let _ = ack.send(());
                    }
                    Some(BatchCommand::Shutdown) | None => {
                        self.drain();
                        self.flush().await;
                        break;
                    }
                },

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush().await;
                }
            }
        }
        log::debug!("Batcher for {} stopped", self.room);
    }

    /// Returns true if the batch reached its size limit.
    fn apply(&mut self, change: DocChange) -> bool {
        match change {
            DocChange::Local(update) => self.compressor.queue_update(update),
            DocChange::Remote(update) => {
                self.compressor.observe_remote(&update);
                false
            }
        }
    }

    /// Pull every change already committed so an explicit flush covers it.
    fn drain(&mut self) {
        while let Ok(change) = self.changes.try_recv() {
            self.apply(change);
        }
    }

    async fn flush(&mut self) {
        let frame = self.compressor.flush_updates();
        *self.stats.lock() = self.compressor.stats().clone();

        if let Some(frame) = frame {
            self.clock += 1;
            let msg = SyncMessage::compressed_update(
                self.peer_id,
                &self.room,
                self.clock,
                &frame.payload,
                frame.secondary_compressed,
            );
            if self.outgoing.send(msg).await.is_err() {
                log::error!("Transport for {} closed; dropping outbound frame", self.room);
            }
        }
    }
}

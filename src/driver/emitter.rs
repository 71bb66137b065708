//! Timer task that turns a [`BlockSource`] into a block stream.
//!
//! Each tick produces one block and publishes it. Ticks missed under load are
//! skipped, not replayed. Publishing happens while holding the emitter's gate,
//! and `halt()` closes the gate under the same lock, so once `halt()` returns
//! no further block reaches the subscribers.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, trace};

use crate::block::{BlockPublisher, SampleBlock};
use crate::error::AppResult;

/// Produces the next block of a run.
pub trait BlockSource: Send + 'static {
    /// Produces block number `sequence` of the run.
    fn next_block(&mut self, sequence: u64) -> AppResult<SampleBlock>;
}

/// Handle to a running emission task.
pub struct Emitter {
    gate: Arc<Mutex<bool>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<u64>,
}

impl Emitter {
    /// Spawns the emission loop on `runtime`.
    ///
    /// The first block is published one `period` after spawning. With
    /// `limit = Some(n)` the loop ends on its own after `n` blocks.
    pub fn spawn<S: BlockSource>(
        runtime: &Handle,
        source: S,
        blocks: Arc<BlockPublisher>,
        period: Duration,
        limit: Option<u64>,
    ) -> Self {
        let gate = Arc::new(Mutex::new(true));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = runtime.spawn(emit_blocks(
            source,
            blocks,
            Arc::clone(&gate),
            period,
            limit,
            shutdown_rx,
        ));
        Self {
            gate,
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    /// Stops publishing. A tick already past the gate completes first.
    pub fn halt(mut self) {
        *self.gate.lock() = false;
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }

    /// True once the loop has exited (halted, limit reached or source failed).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn emit_blocks<S: BlockSource>(
    mut source: S,
    blocks: Arc<BlockPublisher>,
    gate: Arc<Mutex<bool>>,
    period: Duration,
    limit: Option<u64>,
    mut shutdown: oneshot::Receiver<()>,
) -> u64 {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // the first tick completes immediately
    ticker.tick().await;

    let mut emitted = 0u64;
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let block = match source.next_block(emitted) {
                    Ok(block) => block,
                    Err(e) => {
                        error!(error = %e, "block source failed, emission stopped");
                        break;
                    }
                };
                let open = gate.lock();
                if !*open {
                    break;
                }
                let delivered = blocks.publish(block);
                drop(open);
                trace!(sequence = emitted, delivered, "block emitted");
                emitted += 1;
                if limit.is_some_and(|max| emitted >= max) {
                    debug!(emitted, "block limit reached");
                    break;
                }
            }
        }
    }
    emitted
}

//! Sample blocks and their fan-out to consumers.
//!
//! A driver publishes every block it produces through a [`BlockPublisher`].
//! Delivery never waits on a consumer. A subscriber either owns a bounded
//! queue, where a full queue drops the block for that subscriber only (counted
//! and logged), or a lossless queue that grows until the consumer catches up.
//! Subscribers whose receiver is gone are removed on the next publish.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{AppResult, DaqError};

/// One chunk of samples, `rows x cols`, row-major, raw device units.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
    sequence: u64,
    acquired_at: DateTime<Utc>,
}

impl SampleBlock {
    /// Wraps row-major `data`. Fails if `data.len() != rows * cols`.
    pub fn new(rows: usize, cols: usize, data: Vec<f64>, sequence: u64) -> AppResult<Self> {
        if data.len() != rows * cols {
            return Err(DaqError::Driver(format!(
                "block of {} values cannot have shape ({rows}, {cols})",
                data.len()
            )));
        }
        Ok(Self {
            rows,
            cols,
            data,
            sequence,
            acquired_at: Utc::now(),
        })
    }

    /// Samples per channel.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Active channels.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Position of this block in the run, starting at 0.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// When the driver produced the block.
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// All samples, row-major.
    pub fn values(&self) -> &[f64] {
        &self.data
    }

    /// One sample per active channel.
    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    /// Samples of column `col`, top to bottom.
    pub fn column(&self, col: usize) -> impl Iterator<Item = f64> + '_ {
        self.data.iter().skip(col).step_by(self.cols.max(1)).copied()
    }
}

/// Handle returned by [`BlockPublisher::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

enum Queue {
    Bounded(mpsc::Sender<Arc<SampleBlock>>),
    Lossless(mpsc::UnboundedSender<Arc<SampleBlock>>),
}

enum Delivery {
    Sent,
    Full,
    Closed,
}

impl Queue {
    fn deliver(&self, block: &Arc<SampleBlock>) -> Delivery {
        match self {
            Queue::Bounded(tx) => match tx.try_send(Arc::clone(block)) {
                Ok(()) => Delivery::Sent,
                Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
                Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
            },
            Queue::Lossless(tx) => match tx.send(Arc::clone(block)) {
                Ok(()) => Delivery::Sent,
                Err(_) => Delivery::Closed,
            },
        }
    }
}

struct Subscriber {
    id: SubscriptionId,
    name: String,
    queue: Queue,
    dropped: u64,
}

#[derive(Default)]
struct PublisherInner {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

/// Multi-subscriber block stream.
#[derive(Default)]
pub struct BlockPublisher {
    inner: Mutex<PublisherInner>,
}

impl std::fmt::Debug for BlockPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockPublisher")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl BlockPublisher {
    /// Publisher without subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a consumer with room for `capacity` pending blocks. Blocks
    /// arriving while the queue is full are dropped for this consumer.
    pub fn subscribe(
        &self,
        name: &str,
        capacity: usize,
    ) -> (SubscriptionId, mpsc::Receiver<Arc<SampleBlock>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        debug!(subscriber = name, capacity, "block subscriber added");
        (self.register(name, Queue::Bounded(tx)), rx)
    }

    /// Registers a consumer that receives every block. Its queue is unbounded.
    pub fn subscribe_lossless(
        &self,
        name: &str,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<Arc<SampleBlock>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        debug!(subscriber = name, "lossless block subscriber added");
        (self.register(name, Queue::Lossless(tx)), rx)
    }

    fn register(&self, name: &str, queue: Queue) -> SubscriptionId {
        let mut inner = self.inner.lock();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.subscribers.push(Subscriber {
            id,
            name: name.to_string(),
            queue,
            dropped: 0,
        });
        id
    }

    /// Removes a subscription. Its receiver drains what is already queued and
    /// then yields `None`.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| s.id != id);
        before != inner.subscribers.len()
    }

    /// Delivers `block` to every subscriber and returns how many accepted it.
    pub fn publish(&self, block: SampleBlock) -> usize {
        let block = Arc::new(block);
        let mut inner = self.inner.lock();
        let mut delivered = 0;
        inner.subscribers.retain_mut(|sub| {
            match sub.queue.deliver(&block) {
                Delivery::Sent => {
                    delivered += 1;
                    true
                }
                Delivery::Full => {
                    sub.dropped += 1;
                    warn!(
                        subscriber = %sub.name,
                        sequence = block.sequence(),
                        dropped = sub.dropped,
                        "subscriber queue full, block dropped"
                    );
                    true
                }
                Delivery::Closed => {
                    debug!(subscriber = %sub.name, "subscriber gone");
                    false
                }
            }
        });
        delivered
    }

    /// Live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Blocks dropped so far for a subscription.
    pub fn dropped(&self, id: SubscriptionId) -> Option<u64> {
        self.inner
            .lock()
            .subscribers
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.dropped)
    }
}

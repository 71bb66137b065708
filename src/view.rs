//! Live view of the running acquisition.
//!
//! The view keeps the last `plot_width_seconds` of every active channel in a
//! fixed-length buffer. Each block shifts the buffers left by its row count,
//! writes the scaled samples into the freed tail and moves the time axis
//! forward. Every `redraw_chunk` blocks a snapshot is published on a watch
//! channel; whatever renders the traces reads the latest snapshot at its own
//! pace, so a slow renderer never holds up the producer.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

use crate::block::{BlockPublisher, SampleBlock, SubscriptionId};
use crate::config::ViewSettings;
use crate::error::AppResult;
use crate::manager::{AcquisitionObserver, RunInfo};
use crate::rendezvous::{Rendezvous, SetOnDrop};

/// Rolling buffer of one channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trace {
    /// Channel name.
    pub name: String,
    /// Display name.
    pub label: String,
    /// Physical unit.
    pub unit: String,
    /// Scaled samples, oldest first.
    pub samples: Vec<f64>,
}

/// Snapshot of the live view.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TraceFrame {
    /// Time of each sample slot in seconds; the newest slot is last.
    pub time: Vec<f64>,
    /// One trace per active channel, in block column order.
    pub traces: Vec<Trace>,
    /// Blocks shifted into the window this run.
    pub blocks_received: u64,
    /// Frames published this run.
    pub redraws: u64,
    /// Shape of the most recent block.
    pub last_block_shape: Option<(usize, usize)>,
    #[serde(skip)]
    dt: f64,
    #[serde(skip)]
    scales: Vec<f64>,
}

impl TraceFrame {
    /// Zeroed window for `run`. Time runs from `-plot_width` up to just below 0.
    pub fn for_run(run: &RunInfo, plot_width_seconds: f64) -> Self {
        if run.n_active() == 0 {
            return Self::default();
        }
        let dt = run.dt();
        let window = (plot_width_seconds * run.sampling.rate_hz as f64).round() as usize;
        let time = (0..window)
            .map(|i| i as f64 * dt - plot_width_seconds)
            .collect();
        let traces = run
            .channels
            .iter()
            .map(|channel| Trace {
                name: channel.name().to_string(),
                label: channel.display_name().to_string(),
                unit: channel.unit().to_string(),
                samples: vec![0.0; window],
            })
            .collect();
        Self {
            time,
            traces,
            dt,
            scales: run.scales(),
            ..Self::default()
        }
    }

    /// Samples per trace.
    pub fn window(&self) -> usize {
        self.time.len()
    }

    /// Oldest and newest time on the axis.
    pub fn time_range(&self) -> Option<(f64, f64)> {
        Some((*self.time.first()?, *self.time.last()?))
    }

    /// Shifts `block` into the window.
    pub fn push_block(&mut self, block: &SampleBlock) {
        self.blocks_received += 1;
        self.last_block_shape = Some(block.shape());
        let rows = block.rows();
        let advance = rows as f64 * self.dt;
        for t in &mut self.time {
            *t += advance;
        }

        let window = self.window();
        // a block longer than the window only leaves its newest rows visible
        let kept = rows.min(window);
        let skipped = rows - kept;
        for (col, (trace, scale)) in self.traces.iter_mut().zip(&self.scales).enumerate() {
            if col >= block.cols() {
                break;
            }
            trace.samples.rotate_left(kept);
            for (slot, row) in (window - kept..window).zip(skipped..rows) {
                trace.samples[slot] = block.row(row)[col] * scale;
            }
        }
    }
}

struct Session {
    subscription: SubscriptionId,
    blocks: Arc<BlockPublisher>,
}

/// Keeps the latest [`TraceFrame`] for the running acquisition.
pub struct ViewManager {
    settings: ViewSettings,
    done: Arc<Rendezvous>,
    runtime: Handle,
    capacity: usize,
    frames: Arc<watch::Sender<Arc<TraceFrame>>>,
    session: Mutex<Option<Session>>,
}

impl ViewManager {
    /// View of `plot_width_seconds`; `capacity` bounds its block queue.
    pub fn new(settings: ViewSettings, done: Arc<Rendezvous>, runtime: Handle, capacity: usize) -> Self {
        let (frames, _) = watch::channel(Arc::new(TraceFrame::default()));
        Self {
            settings,
            done,
            runtime,
            capacity,
            frames: Arc::new(frames),
            session: Mutex::new(None),
        }
    }

    /// Settings the context was built from.
    pub fn settings(&self) -> &ViewSettings {
        &self.settings
    }

    /// Receiver that is notified on every redraw.
    pub fn subscribe_frames(&self) -> watch::Receiver<Arc<TraceFrame>> {
        self.frames.subscribe()
    }

    /// Most recently published frame.
    pub fn latest(&self) -> Arc<TraceFrame> {
        Arc::clone(&self.frames.borrow())
    }

    fn clear(&self) {
        self.frames.send_replace(Arc::new(TraceFrame::default()));
    }
}

impl AcquisitionObserver for ViewManager {
    fn name(&self) -> &str {
        "view"
    }

    fn on_starting(&self, run: &RunInfo) -> AppResult<()> {
        let frame = TraceFrame::for_run(run, self.settings.plot_width_seconds);
        let window = frame.window();
        self.frames.send_replace(Arc::new(frame.clone()));
        if run.n_active() == 0 {
            debug!("no active channels, view only acknowledges");
            return Ok(());
        }
        let (subscription, rx) = run.blocks.subscribe("view", self.capacity);
        self.runtime.spawn(render(
            frame,
            rx,
            Arc::clone(&self.frames),
            self.settings.redraw_chunk.max(1),
            Arc::clone(&self.done),
        ));
        *self.session.lock() = Some(Session {
            subscription,
            blocks: Arc::clone(&run.blocks),
        });
        info!(window, channels = run.n_active(), "live view started");
        Ok(())
    }

    fn on_finishing(&self) {
        match self.session.lock().take() {
            Some(session) => {
                session.blocks.unsubscribe(session.subscription);
            }
            None => self.done.set(),
        }
    }

    fn on_driver_changed(&self, _driver: &str) {
        self.clear();
    }
}

async fn render(
    mut frame: TraceFrame,
    mut rx: mpsc::Receiver<Arc<SampleBlock>>,
    frames: Arc<watch::Sender<Arc<TraceFrame>>>,
    chunk: usize,
    done: Arc<Rendezvous>,
) {
    let _done = SetOnDrop::new(done);
    let mut pending = 0;
    while let Some(block) = rx.recv().await {
        frame.push_block(&block);
        pending += 1;
        if pending >= chunk {
            redraw(&mut frame, &frames);
            pending = 0;
        }
    }
    if pending > 0 {
        redraw(&mut frame, &frames);
    }
    debug!(
        blocks = frame.blocks_received,
        redraws = frame.redraws,
        "live view finished"
    );
}

fn redraw(frame: &mut TraceFrame, frames: &watch::Sender<Arc<TraceFrame>>) {
    frame.redraws += 1;
    trace!(redraws = frame.redraws, "redraw");
    frames.send_replace(Arc::new(frame.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::driver::SamplingConfig;
    use std::time::Duration;

    fn run(rate_hz: u64, channels: Vec<Channel>) -> RunInfo {
        RunInfo {
            save: false,
            driver: "Test".into(),
            sampling: SamplingConfig {
                rate_hz,
                interval: 2,
            },
            channels,
            blocks: Arc::new(BlockPublisher::new()),
            started_at: chrono::Utc::now(),
        }
    }

    fn scaled(name: &str, scale: &str) -> Channel {
        let mut channel = Channel::new(name).enabled(true);
        channel.set_scale(scale).unwrap();
        channel
    }

    #[test]
    fn test_initial_time_axis() {
        let frame = TraceFrame::for_run(&run(4, vec![scaled("AI0", "1")]), 2.0);
        assert_eq!(frame.window(), 8);
        assert_eq!(frame.time_range(), Some((-2.0, -0.25)));
        assert_eq!(frame.traces[0].samples, vec![0.0; 8]);
    }

    #[test]
    fn test_block_shifts_window() {
        let mut frame = TraceFrame::for_run(
            &run(4, vec![scaled("AI0", "1"), scaled("AI1", "10")]),
            1.0,
        );
        let block = SampleBlock::new(2, 2, vec![1.0, 2.0, 3.0, 4.0], 0).unwrap();
        frame.push_block(&block);
        assert_eq!(frame.traces[0].samples, vec![0.0, 0.0, 1.0, 3.0]);
        assert_eq!(frame.traces[1].samples, vec![0.0, 0.0, 20.0, 40.0]);
        assert_eq!(frame.time_range(), Some((-0.5, 0.25)));

        frame.push_block(&SampleBlock::new(1, 2, vec![5.0, 6.0], 1).unwrap());
        assert_eq!(frame.traces[0].samples, vec![0.0, 1.0, 3.0, 5.0]);
        assert_eq!(frame.blocks_received, 2);
        assert_eq!(frame.last_block_shape, Some((1, 2)));
    }

    #[test]
    fn test_block_longer_than_window() {
        let mut frame = TraceFrame::for_run(&run(2, vec![scaled("AI0", "1")]), 1.0);
        let block = SampleBlock::new(3, 1, vec![1.0, 2.0, 3.0], 0).unwrap();
        frame.push_block(&block);
        assert_eq!(frame.traces[0].samples, vec![2.0, 3.0]);
        assert_eq!(frame.time_range(), Some((0.5, 1.0)));
    }

    #[test]
    fn test_zero_channels_allocates_nothing() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let done = Arc::new(Rendezvous::new("view"));
        let view = ViewManager::new(ViewSettings::default(), Arc::clone(&done), rt.handle().clone(), 4);
        let run = run(10_000, Vec::new());
        view.on_starting(&run).unwrap();
        assert_eq!(view.latest().window(), 0);
        assert_eq!(run.blocks.subscriber_count(), 0);
        view.on_finishing();
        assert!(done.is_set());
    }

    #[test]
    fn test_redraws_are_chunked_and_flushed() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let done = Arc::new(Rendezvous::new("view"));
        let settings = ViewSettings {
            plot_width_seconds: 1.0,
            redraw_chunk: 2,
        };
        let view = ViewManager::new(settings, Arc::clone(&done), rt.handle().clone(), 16);
        let run = run(4, vec![scaled("AI0", "1")]);
        view.on_starting(&run).unwrap();
        for seq in 0..3 {
            run.blocks
                .publish(SampleBlock::new(1, 1, vec![seq as f64], seq).unwrap());
        }
        view.on_finishing();
        assert!(done.wait(Duration::from_secs(5)));

        let frame = view.latest();
        assert_eq!(frame.blocks_received, 3);
        assert_eq!(frame.redraws, 2);
        assert_eq!(frame.traces[0].samples, vec![0.0, 0.0, 1.0, 2.0]);

        view.on_driver_changed("Other");
        assert_eq!(view.latest().blocks_received, 0);
    }
}

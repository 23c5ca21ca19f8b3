//! Progress sampling and rendering.
//!
//! Every transfer phase gets its own `ProgressSink`. Adapters report into it as
//! often as they like; the sink publishes at most one sample per interval into a
//! `watch` channel, which coalesces anything the reporter has not rendered yet.

use crate::{status::StatusSlot, utils};

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use teloxide::utils::html;
use tokio::{select, sync::watch, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

/// Marker for "nothing published yet".
const NEVER: u64 = u64::MAX;

/// Width of the rendered progress bar.
const BAR_WIDTH: u64 = 12;

/// A snapshot of a running transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSample {
    /// Bytes transferred so far.
    pub transferred: u64,
    /// Expected size, `None` when unknown.
    pub total: Option<u64>,
    /// Time since the phase started.
    pub elapsed: Duration,
}

impl ProgressSample {
    /// Completion ratio in percent, if the total is known.
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> Option<f64> {
        self.total
            .filter(|&total| total > 0)
            .map(|total| (self.transferred as f64 / total as f64 * 100.0).min(100.0))
    }
}

/// Which half of the pipeline is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Source adapter fetching to local disk.
    Download,
    /// Storage relay uploading from local disk.
    Upload,
}

impl Phase {
    /// Present-tense label used in status messages.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Download => "Downloading",
            Self::Upload => "Uploading",
        }
    }
}

/// State shared by all clones of a `ProgressSink`.
#[derive(Debug)]
struct SinkInner {
    started: Instant,
    interval: Duration,
    transferred: AtomicU64,
    /// Milliseconds since `started` of the last published sample.
    last_emit_ms: AtomicU64,
    /// Milliseconds since `started` of the last byte-count increase.
    last_progress_ms: AtomicU64,
    /// Live `StallHold`s; the stall clock is stopped while any exist.
    holds: AtomicUsize,
    tx: watch::Sender<Option<ProgressSample>>,
}

/// Throttled, monotonic progress channel for one phase of one task.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    inner: Arc<SinkInner>,
}

/// Milliseconds of a duration, saturating.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX - 1)
}

impl ProgressSink {
    /// Create a sink publishing at most once per `interval`.
    pub fn new(interval: Duration) -> (Self, watch::Receiver<Option<ProgressSample>>) {
        let (tx, rx) = watch::channel(None);
        let sink = Self {
            inner: Arc::new(SinkInner {
                started: Instant::now(),
                interval,
                transferred: AtomicU64::new(0),
                last_emit_ms: AtomicU64::new(NEVER),
                last_progress_ms: AtomicU64::new(0),
                holds: AtomicUsize::new(0),
                tx,
            }),
        };
        (sink, rx)
    }

    /// Record progress; published only if the interval has passed since the last sample.
    pub fn report(&self, transferred: u64, total: Option<u64>) {
        let inner = &*self.inner;
        let now_ms = millis(inner.started.elapsed());

        self.advance(transferred, now_ms);

        let last = inner.last_emit_ms.load(Ordering::Acquire);
        if last != NEVER && now_ms.saturating_sub(last) < millis(inner.interval) {
            return;
        }
        // somebody else published in the meantime
        if inner
            .last_emit_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.publish(total);
    }

    /// Record the final state of the phase, bypassing the throttle.
    pub fn finish(&self, transferred: u64, total: Option<u64>) {
        let now_ms = millis(self.inner.started.elapsed());
        self.advance(transferred, now_ms);
        self.inner.last_emit_ms.store(now_ms, Ordering::Release);
        self.publish(total);
    }

    /// Highest byte count reported so far.
    pub fn transferred(&self) -> u64 {
        self.inner.transferred.load(Ordering::Acquire)
    }

    /// Time since the sink was created.
    pub fn elapsed(&self) -> Duration {
        self.inner.started.elapsed()
    }

    /// Most recently published sample.
    #[cfg(test)]
    pub fn latest(&self) -> Option<ProgressSample> {
        *self.inner.tx.borrow()
    }

    /// Stop the stall clock until the returned guard is dropped.
    ///
    /// For waits that are expected to show no byte progress, like a pool slot.
    pub fn hold(&self) -> StallHold {
        self.inner.holds.fetch_add(1, Ordering::AcqRel);
        StallHold { sink: self.clone() }
    }

    /// Resolves once no byte progress has been seen for `timeout` outside of holds.
    pub async fn stalled(&self, timeout: Duration) {
        loop {
            if self.inner.holds.load(Ordering::Acquire) > 0 {
                tokio::time::sleep(timeout).await;
                continue;
            }
            let last_progress =
                Duration::from_millis(self.inner.last_progress_ms.load(Ordering::Acquire));
            let idle = self.inner.started.elapsed().saturating_sub(last_progress);
            if idle >= timeout {
                return;
            }
            tokio::time::sleep(timeout - idle).await;
        }
    }

    /// Raise the byte counter, never lowering it.
    fn advance(&self, transferred: u64, now_ms: u64) {
        let previous = self
            .inner
            .transferred
            .fetch_max(transferred, Ordering::AcqRel);
        if transferred > previous {
            self.inner.last_progress_ms.store(now_ms, Ordering::Release);
        }
    }

    /// Push the current counter into the channel unless a larger one is already there.
    fn publish(&self, total: Option<u64>) {
        let transferred = self.transferred();
        let sample = ProgressSample {
            transferred,
            total: total.map(|t| t.max(transferred)),
            elapsed: self.elapsed(),
        };

        self.inner.tx.send_if_modified(|slot| match slot {
            Some(previous) if previous.transferred > sample.transferred => false,
            _ => {
                *slot = Some(sample);
                true
            }
        });
    }
}

/// Keeps the stall clock of a `ProgressSink` stopped; restarts it when dropped.
#[derive(Debug)]
pub struct StallHold {
    sink: ProgressSink,
}

impl Drop for StallHold {
    fn drop(&mut self) {
        let inner = &*self.sink.inner;
        inner
            .last_progress_ms
            .store(millis(inner.started.elapsed()), Ordering::Release);
        inner.holds.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Renders samples of one task into its status slot.
#[derive(Clone)]
pub struct ProgressReporter {
    slot: Arc<dyn StatusSlot>,
    interval: Duration,
}

/// A running render loop for one phase.
pub struct ReporterHandle {
    stop: CancellationToken,
    join: JoinHandle<()>,
}

impl ReporterHandle {
    /// Stop rendering; returns once no further edit can happen.
    pub async fn finish(self) {
        self.stop.cancel();
        if let Err(e) = self.join.await {
            tracing::error!("progress reporter crashed: {e}");
        }
    }
}

impl ProgressReporter {
    /// Create a reporter writing into `slot`.
    pub fn new(slot: Arc<dyn StatusSlot>, interval: Duration) -> Self {
        Self { slot, interval }
    }

    /// Start rendering a phase; samples go through the returned sink.
    pub fn start(&self, phase: Phase, name: &str) -> (ProgressSink, ReporterHandle) {
        let (sink, mut rx) = ProgressSink::new(self.interval);
        let stop = CancellationToken::new();

        let slot = Arc::clone(&self.slot);
        let name = name.to_string();
        let stop_inner = stop.clone();

        let join = tokio::spawn(async move {
            loop {
                select! {
                    biased;
                    () = stop_inner.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let sample = *rx.borrow_and_update();
                        let Some(sample) = sample else { continue };
                        if let Err(e) = slot.edit(render_progress(phase, &name, &sample)).await {
                            tracing::warn!("{e}");
                        }
                    }
                }
            }
        });

        (sink, ReporterHandle { stop, join })
    }
}

/// Render a live progress message.
pub fn render_progress(phase: Phase, name: &str, sample: &ProgressSample) -> String {
    let rate = utils::bytes_per_second(sample.transferred, sample.elapsed);
    let mut text = format!(
        "<b>{}</b> <code>{}</code>\n",
        phase.label(),
        html::escape(name)
    );

    match (sample.percent(), sample.total) {
        (Some(percent), Some(total)) => {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let filled = ((percent / 100.0) * BAR_WIDTH as f64) as u64;
            let bar = "■".repeat(usize::try_from(filled).unwrap_or(0))
                + &"□".repeat(usize::try_from(BAR_WIDTH - filled.min(BAR_WIDTH)).unwrap_or(0));
            text += &format!("[{bar}] {percent:.1}%\n");
            text += &format!(
                "{} of {} at {}/s",
                utils::human_bytes(sample.transferred),
                utils::human_bytes(total),
                utils::human_bytes(rate)
            );
            if rate > 0 {
                let eta = Duration::from_secs(total.saturating_sub(sample.transferred) / rate);
                text += &format!(", ETA {}", utils::human_duration(eta));
            }
        }
        _ => {
            text += &format!(
                "{} of unknown size at {}/s",
                utils::human_bytes(sample.transferred),
                utils::human_bytes(rate)
            );
        }
    }

    text
}

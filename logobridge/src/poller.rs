use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::error::{HardwareError, ResponseError};
use crate::session::HardwareSession;
use crate::types::{ChangeEvent, MemoryRange, RangeId, Span};

/// Receives the changes detected by a poller
///
/// Called on the poller's task once per cycle with every changed span of that
/// cycle. Implementations must not block.
pub trait ChangeHandler: Send + Sync + 'static {
    /// `events` are disjoint and ordered by address
    fn on_change(&self, events: &[ChangeEvent]);
}

/// Maximal runs of differing bytes between two equally sized buffers
///
/// `start` is the absolute address of the first byte of both buffers. The
/// returned spans are disjoint, ordered by address and separated by at least
/// one equal byte.
pub fn diff_spans(old: &[u8], new: &[u8], start: u16) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut current: Option<Span> = None;

    for (index, (a, b)) in old.iter().zip(new.iter()).enumerate() {
        let address = start + index as u16;
        if a != b {
            match current.as_mut() {
                Some(span) => span.end = address,
                None => current = Some(Span::new(address, address)),
            }
        } else if let Some(span) = current.take() {
            spans.push(span);
        }
    }

    if let Some(span) = current {
        spans.push(span);
    }

    spans
}

/// first tick after `now` on the grid `previous + n * period`
///
/// ticks missed while a cycle overran are skipped rather than run back to back
pub(crate) fn next_tick(previous: Instant, period: Duration, now: Instant) -> Instant {
    let mut next = previous + period;
    if period.is_zero() {
        return next.max(now);
    }
    while next <= now {
        next += period;
    }
    next
}

/// Keeps a shadow copy of one memory range up to date
pub struct MemoryRangePoller {
    id: RangeId,
    range: MemoryRange,
    session: HardwareSession,
    handler: Arc<dyn ChangeHandler>,
    snapshot: Option<Vec<u8>>,
}

impl MemoryRangePoller {
    /// create a poller that reports the changes of `range` to `handler`
    pub fn new(
        id: RangeId,
        range: MemoryRange,
        session: HardwareSession,
        handler: Arc<dyn ChangeHandler>,
    ) -> Self {
        Self {
            id,
            range,
            session,
            handler,
            snapshot: None,
        }
    }

    /// Run a single cycle: read the range, diff it and report the changes
    ///
    /// On failure the previous snapshot is retained, so the changes are
    /// reported by the next successful cycle.
    pub async fn poll_once(&mut self) -> Result<(), HardwareError> {
        let bytes = self
            .session
            .read_block(self.range.start(), self.range.size())
            .await?;

        if bytes.len() != self.range.size() {
            return Err(ResponseError::LengthMismatch(self.range.size(), bytes.len()).into());
        }

        let events: Vec<ChangeEvent> = match &self.snapshot {
            None => vec![ChangeEvent {
                range: self.id,
                span: Span::new(self.range.start(), self.range.end()),
                bytes: bytes.clone(),
            }],
            Some(previous) => diff_spans(previous, &bytes, self.range.start())
                .into_iter()
                .map(|span| {
                    let begin = (span.start - self.range.start()) as usize;
                    let end = (span.end - self.range.start()) as usize;
                    ChangeEvent {
                        range: self.id,
                        span,
                        bytes: bytes[begin..=end].to_vec(),
                    }
                })
                .collect(),
        };

        self.snapshot = Some(bytes);

        if !events.is_empty() {
            tracing::debug!("{} changed span(s)", events.len());
            self.handler.on_change(&events);
        }

        Ok(())
    }

    /// Poll on a fixed cycle until `shutdown` fires or its sender is dropped
    ///
    /// Shutdown is only observed while sleeping between cycles.
    pub async fn run(mut self, mut shutdown: mpsc::Receiver<()>) {
        let period = self.range.poll_interval();
        let mut tick = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep_until(tick) => {}
            }

            if let Err(err) = self.poll_once().await {
                tracing::warn!("unable to read {}: {}", self.range, err);
            }

            let now = Instant::now();
            let next = next_tick(tick, period, now);
            if next > tick + period {
                tracing::debug!("cycle overran, skipping missed ticks");
            }
            tick = next;
        }

        tracing::info!("poller stopped");
    }

    /// spawn the polling loop on its own task
    pub fn spawn(self) -> PollerHandle {
        let (tx, rx) = mpsc::channel(1);
        let span = tracing::info_span!("Poller", range = %self.range);
        let task = tokio::spawn(self.run(rx).instrument(span));
        PollerHandle { shutdown: tx, task }
    }
}

/// Controls a spawned poller
pub struct PollerHandle {
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// stop the poller at its next sleep boundary and wait for it to finish
    pub async fn stop(self) {
        drop(self.shutdown);
        if let Err(err) = self.task.await {
            tracing::warn!("poller task failed: {}", err);
        }
    }
}

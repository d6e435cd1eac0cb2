//! Polling loop shared by both modes.
//!
//! A [`DbPoller`] loads its checkpoint, then repeatedly checks whether enough
//! time has passed since the last poll and, if so, lets its [`PollMode`] fetch,
//! publish, and checkpoint pages until the source is drained. Page failures
//! are counted in [`PollStatus`] and never end the loop.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stream_metrics::SharedMetrics;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointStore, PollInfo, STATE_RUNNING, STATE_STOPPED};
use crate::config::PollerConfig;
use crate::error::{PollerError, PollerResult};
use crate::publisher::{JsonRowEncoder, Publisher, RowEncoder};
use crate::source::PolledRow;

const IDLE_SLEEP: Duration = Duration::from_millis(100);

/// Counters for one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStatus {
    pub batches_processed: usize,
    pub batches_errored: usize,
    pub messages_processed: usize,
}

impl PollStatus {
    /// 1-based number of the page being handled.
    pub fn current_batch(&self) -> usize {
        self.batches_processed + self.batches_errored + 1
    }

    pub fn report(&self) -> String {
        format!(
            "{} batches, {} errored batches, {} processed messages",
            self.batches_processed, self.batches_errored, self.messages_processed
        )
    }
}

impl fmt::Display for PollStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.report())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PollerState {
    Idle,
    Fetching,
    Publishing,
    Checkpointing,
    Stopping,
    Stopped,
}

impl PollerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PollerState::Fetching,
            2 => PollerState::Publishing,
            3 => PollerState::Checkpointing,
            4 => PollerState::Stopping,
            5 => PollerState::Stopped,
            _ => PollerState::Idle,
        }
    }
}

impl fmt::Display for PollerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PollerState::Idle => "idle",
            PollerState::Fetching => "fetching",
            PollerState::Publishing => "publishing",
            PollerState::Checkpointing => "checkpointing",
            PollerState::Stopping => "stopping",
            PollerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// How a page ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    Published,
    /// Rejected as oversized and dropped
    Skipped,
    /// Retries exhausted
    Errored,
}

impl PageOutcome {
    pub fn is_success(self) -> bool {
        self == PageOutcome::Published
    }

    fn as_str(self) -> &'static str {
        match self {
            PageOutcome::Published => "published",
            PageOutcome::Skipped => "skipped",
            PageOutcome::Errored => "errored",
        }
    }
}

/// Collaborators and page publishing shared by the modes.
pub struct PollerCore {
    config: PollerConfig,
    checkpoints: Arc<dyn CheckpointStore>,
    publisher: Arc<dyn Publisher>,
    encoder: Arc<dyn RowEncoder>,
    metrics: SharedMetrics,
    state: AtomicU8,
}

impl PollerCore {
    /// Fails if `config` does not validate.
    pub fn new(
        config: PollerConfig,
        checkpoints: Arc<dyn CheckpointStore>,
        publisher: Arc<dyn Publisher>,
        metrics: SharedMetrics,
    ) -> PollerResult<Self> {
        config.validate()?;
        let encoder = Arc::new(JsonRowEncoder::new(config.key_column.clone()));
        Ok(Self {
            config,
            checkpoints,
            publisher,
            encoder,
            metrics,
            state: AtomicU8::new(PollerState::Idle as u8),
        })
    }

    pub fn with_encoder(mut self, encoder: Arc<dyn RowEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    pub fn checkpoints(&self) -> &dyn CheckpointStore {
        self.checkpoints.as_ref()
    }

    pub fn state(&self) -> PollerState {
        PollerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: PollerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    async fn try_publish(&self, rows: &[PolledRow]) -> PollerResult<()> {
        let messages = rows
            .iter()
            .map(|row| self.encoder.encode(row))
            .collect::<PollerResult<Vec<_>>>()?;
        self.publisher.publish(&messages).await?;
        Ok(())
    }

    /// Publish a page, retrying per the configured policy, and count the
    /// outcome into `status`.
    ///
    /// Oversized pages are skipped when `skip_too_large_messages` is set and
    /// retried until they go through otherwise. Other failures are retried
    /// `retries` times before the page is given up as errored.
    pub async fn publish_page(&self, rows: &[PolledRow], status: &mut PollStatus) -> PageOutcome {
        self.set_state(PollerState::Publishing);
        let producer = self.config.producer.as_str();
        let started = Instant::now();
        let mut retries = 0;

        let outcome = loop {
            let err = match self.try_publish(rows).await {
                Ok(()) => break PageOutcome::Published,
                Err(err) => err,
            };

            if err.is_oversized() {
                if self.config.skip_too_large_messages {
                    warn!(
                        producer,
                        batch = status.current_batch(),
                        rows = rows.len(),
                        error = %err,
                        "Skipping page rejected as too large"
                    );
                    break PageOutcome::Skipped;
                }
                retries += 1;
                info!(producer, attempt = retries, "Message too large, waiting and retrying");
                tokio::time::sleep(self.config.retry_delay()).await;
                continue;
            }

            error!(producer, batch = status.current_batch(), error = ?err, "Error publishing through DB poller");
            if retries < self.config.retries {
                retries += 1;
                tokio::time::sleep(self.config.retry_delay()).await;
                continue;
            }
            info!(producer, retries, "Retries exceeded, moving on");
            break PageOutcome::Errored;
        };

        match outcome {
            PageOutcome::Published => {
                status.batches_processed += 1;
                status.messages_processed += rows.len();
            }
            PageOutcome::Skipped | PageOutcome::Errored => status.batches_errored += 1,
        }

        self.metrics.increment(
            "db_poller",
            &[("status", outcome.as_str()), ("producer", producer)],
            rows.len() as u64,
        );
        self.metrics.histogram(
            "db_poller",
            started.elapsed().as_secs_f64(),
            &[("time", "publish_page"), ("producer", producer)],
        );
        outcome
    }
}

/// Strategy for one poll cycle.
#[async_trait]
pub trait PollMode: Send + Sync {
    fn name(&self) -> &'static str;

    /// Drain the source page by page, advancing `info` as pages complete.
    async fn process_updates(&self, core: &PollerCore, info: &mut PollInfo)
        -> PollerResult<PollStatus>;
}

/// Cooperative stop flag, checked once per loop iteration.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub struct DbPoller<M> {
    core: PollerCore,
    mode: M,
    stop: StopHandle,
}

impl<M: PollMode> DbPoller<M> {
    pub fn new(core: PollerCore, mode: M) -> Self {
        Self {
            core,
            mode,
            stop: StopHandle::default(),
        }
    }

    pub fn core(&self) -> &PollerCore {
        &self.core
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Whether `run_every` has passed since the checkpoint, allowing for `delay_time`.
    pub fn should_run(&self, info: &PollInfo, now: DateTime<Utc>) -> bool {
        now - info.last_sent - self.core.config.delay_time() >= self.core.config.run_every()
    }

    /// Load or create this producer's checkpoint and mark it running.
    pub async fn retrieve_poll_info(&self) -> PollerResult<PollInfo> {
        let initial = if self.core.config.start_from_beginning {
            DateTime::<Utc>::UNIX_EPOCH
        } else {
            Utc::now()
        };
        let mut info = self
            .core
            .checkpoints
            .load_or_create(&self.core.config.producer, initial)
            .await?;
        info.state = Some(STATE_RUNNING.to_string());
        self.core.checkpoints.save(&info).await?;
        Ok(info)
    }

    /// Run one poll cycle regardless of `should_run`.
    pub async fn run_cycle(&self, info: &mut PollInfo) -> PollerResult<PollStatus> {
        let producer = self.core.config.producer.as_str();
        debug!(producer, mode = self.mode.name(), "Starting poll cycle");

        let result = self.mode.process_updates(&self.core, info).await;
        self.core.set_state(PollerState::Idle);

        let status = result?;
        info!(
            producer,
            mode = self.mode.name(),
            batches = status.batches_processed,
            errored = status.batches_errored,
            messages = status.messages_processed,
            "Poll complete ({})",
            status.report()
        );
        Ok(status)
    }

    /// Poll until stopped. Cycle failures are logged and retried.
    pub async fn start(&self) -> PollerResult<()> {
        let producer = self.core.config.producer.as_str();
        let mut info = self.retrieve_poll_info().await?;
        info!(
            producer,
            mode = self.mode.name(),
            last_sent = %info.last_sent,
            last_sent_id = info.last_sent_id,
            "DB poller starting"
        );

        while !self.stop.is_stopped() {
            if self.should_run(&info, Utc::now()) {
                if let Err(e) = self.run_cycle(&mut info).await {
                    error!(producer, error = ?e, "DB poller cycle failed");
                    tokio::time::sleep(self.core.config.retry_delay()).await;
                }
            }
            tokio::time::sleep(IDLE_SLEEP).await;
        }

        self.core.set_state(PollerState::Stopping);
        info.state = Some(STATE_STOPPED.to_string());
        let saved = self.core.checkpoints.save(&info).await;
        self.core.set_state(PollerState::Stopped);
        info!(producer, "DB poller stopped");
        saved
    }
}

impl<M: PollMode + 'static> DbPoller<M> {
    /// Run the poller as a background task.
    pub fn spawn(self) -> PollerHandle {
        let stop = self.stop_handle();
        let join = tokio::spawn(async move { self.start().await });
        PollerHandle { stop, join }
    }
}

pub struct PollerHandle {
    stop: StopHandle,
    join: JoinHandle<PollerResult<()>>,
}

impl PollerHandle {
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop the poller and wait for the current page to finish.
    pub async fn shutdown(self) -> PollerResult<()> {
        self.stop.stop();
        self.join
            .await
            .map_err(|e| PollerError::Other(anyhow::anyhow!("DB poller task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PublishError, PublishFailure};
    use crate::memory::MemoryCheckpointStore;
    use crate::publisher::MockPublisher;
    use stream_metrics::RecordingMetricsSink;

    fn config() -> PollerConfig {
        let mut config = PollerConfig::new("widgets-poller", "widgets", "widgets.changes");
        config.retry_delay_ms = 0;
        config
    }

    fn rows(count: i64) -> Vec<PolledRow> {
        (1..=count)
            .map(|id| PolledRow {
                id,
                timestamp: Utc::now(),
                data: serde_json::json!({"id": id}),
            })
            .collect()
    }

    fn oversized() -> PublishError {
        PublishError::Partial {
            failures: vec![PublishFailure {
                index: 0,
                code: "msg_size_too_large".into(),
                reason: "too big".into(),
            }],
        }
    }

    fn core(
        config: PollerConfig,
        publisher: MockPublisher,
        sink: &Arc<RecordingMetricsSink>,
    ) -> PollerCore {
        PollerCore::new(
            config,
            Arc::new(MemoryCheckpointStore::new()),
            Arc::new(publisher),
            sink.clone(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_publish_page_success() {
        let sink = Arc::new(RecordingMetricsSink::default());
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .withf(|messages| messages.len() == 3 && messages[0].key.as_deref() == Some("1"))
            .times(1)
            .returning(|_| Ok(()));

        let core = core(config(), publisher, &sink);
        let mut status = PollStatus::default();
        let outcome = core.publish_page(&rows(3), &mut status).await;

        assert_eq!(outcome, PageOutcome::Published);
        assert_eq!(status.batches_processed, 1);
        assert_eq!(status.messages_processed, 3);
        assert_eq!(sink.counter_total("db_poller", &[("status", "published")]), 3);
    }

    #[tokio::test]
    async fn test_generic_error_retried_then_errored() {
        let sink = Arc::new(RecordingMetricsSink::default());
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .times(3)
            .returning(|_| Err(PublishError::Transport("broker down".into())));

        let mut config = config();
        config.retries = 2;
        let core = core(config, publisher, &sink);
        let mut status = PollStatus::default();
        let outcome = core.publish_page(&rows(2), &mut status).await;

        assert_eq!(outcome, PageOutcome::Errored);
        assert_eq!(status.batches_errored, 1);
        assert_eq!(status.batches_processed, 0);
        assert_eq!(status.messages_processed, 0);
    }

    #[tokio::test]
    async fn test_generic_error_recovers_within_retries() {
        let sink = Arc::new(RecordingMetricsSink::default());
        let mut publisher = MockPublisher::new();
        let mut seq = mockall::Sequence::new();
        publisher
            .expect_publish()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(PublishError::Transport("blip".into())));
        publisher
            .expect_publish()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let core = core(config(), publisher, &sink);
        let mut status = PollStatus::default();
        assert_eq!(core.publish_page(&rows(1), &mut status).await, PageOutcome::Published);
        assert_eq!(status.batches_processed, 1);
    }

    #[tokio::test]
    async fn test_oversized_skipped_when_configured() {
        let sink = Arc::new(RecordingMetricsSink::default());
        let mut publisher = MockPublisher::new();
        publisher.expect_publish().times(1).returning(|_| Err(oversized()));

        let mut config = config();
        config.skip_too_large_messages = true;
        let core = core(config, publisher, &sink);
        let mut status = PollStatus::default();

        assert_eq!(core.publish_page(&rows(1), &mut status).await, PageOutcome::Skipped);
        assert_eq!(status.batches_errored, 1);
        assert_eq!(status.messages_processed, 0);
        assert_eq!(sink.counter_total("db_poller", &[("status", "skipped")]), 1);
    }

    #[tokio::test]
    async fn test_oversized_retried_beyond_retry_budget() {
        let sink = Arc::new(RecordingMetricsSink::default());
        let mut publisher = MockPublisher::new();
        let mut seq = mockall::Sequence::new();
        publisher
            .expect_publish()
            .times(4)
            .in_sequence(&mut seq)
            .returning(|_| Err(oversized()));
        publisher
            .expect_publish()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let core = core(config(), publisher, &sink);
        let mut status = PollStatus::default();
        assert_eq!(core.publish_page(&rows(1), &mut status).await, PageOutcome::Published);
    }

    #[test]
    fn test_status_report() {
        let status = PollStatus {
            batches_processed: 3,
            batches_errored: 1,
            messages_processed: 2500,
        };
        assert_eq!(
            status.to_string(),
            "3 batches, 1 errored batches, 2500 processed messages"
        );
        assert_eq!(status.current_batch(), 5);
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            PollerState::Idle,
            PollerState::Fetching,
            PollerState::Publishing,
            PollerState::Checkpointing,
            PollerState::Stopping,
            PollerState::Stopped,
        ] {
            assert_eq!(PollerState::from_u8(state as u8), state);
        }
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::checkpoint::PollInfo;
use crate::error::PollerResult;
use crate::poller::{PollMode, PollStatus, PollerCore, PollerState};
use crate::source::{TimeBasedSource, TimeWindow};

/// Follows a `(timestamp, id)` cursor through the source table.
///
/// The checkpoint moves past every page once it has been handled, whether or
/// not publishing succeeded, so rows in an errored page are not polled again.
pub struct TimeBased<S> {
    source: S,
}

impl<S: TimeBasedSource> TimeBased<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

#[async_trait]
impl<S: TimeBasedSource> PollMode for TimeBased<S> {
    fn name(&self) -> &'static str {
        "time_based"
    }

    async fn process_updates(
        &self,
        core: &PollerCore,
        info: &mut PollInfo,
    ) -> PollerResult<PollStatus> {
        let config = core.config();
        let producer = config.producer.as_str();
        let to = Utc::now() - config.delay_time();
        let mut window = if config.full_table {
            TimeWindow {
                from: DateTime::<Utc>::UNIX_EPOCH,
                last_id: 0,
                to,
            }
        } else {
            TimeWindow {
                from: info.last_sent,
                last_id: info.last_sent_id,
                to,
            }
        };
        info!(producer, from = %window.from, to = %window.to, "Polling");

        let mut status = PollStatus::default();
        let mut pages = 0;
        loop {
            core.set_state(PollerState::Fetching);
            debug!(producer, batch = status.current_batch(), "Fetching page");
            let rows = self.source.fetch_page(&window, config.batch_size).await?;
            let Some(last) = rows.last() else {
                break;
            };
            let (last_sent, last_sent_id) = (last.timestamp, last.id);
            pages += 1;

            core.publish_page(&rows, &mut status).await;

            core.set_state(PollerState::Checkpointing);
            info.last_sent = last_sent;
            info.last_sent_id = last_sent_id;
            core.checkpoints().save(info).await?;

            window.from = last_sent;
            window.last_id = last_sent_id;
        }

        // Nothing new: move the timestamp so the next poll still waits `run_every`.
        if pages == 0 {
            core.set_state(PollerState::Checkpointing);
            info.last_sent = info.last_sent.max(to);
            core.checkpoints().save(info).await?;
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PollerConfig;
    use crate::error::PublishError;
    use crate::memory::{MemoryCheckpointStore, MemorySourceTable};
    use crate::poller::DbPoller;
    use crate::publisher::MockPublisher;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn poller(
        table: &MemorySourceTable,
        checkpoints: &MemoryCheckpointStore,
        publisher: MockPublisher,
        config: PollerConfig,
    ) -> DbPoller<TimeBased<MemorySourceTable>> {
        let core = PollerCore::new(
            config,
            Arc::new(checkpoints.clone()),
            Arc::new(publisher),
            stream_metrics::noop(),
        )
        .unwrap();
        DbPoller::new(core, TimeBased::new(table.clone()))
    }

    fn config() -> PollerConfig {
        let mut config = PollerConfig::new("widgets-poller", "widgets", "widgets.changes");
        config.retry_delay_ms = 0;
        config.delay_time_ms = 0;
        config
    }

    #[tokio::test]
    async fn test_checkpoint_advances_to_last_row() {
        let table = MemorySourceTable::new();
        table.insert(3, at(10), serde_json::json!({"id": 3}));
        table.insert(1, at(10), serde_json::json!({"id": 1}));
        table.insert(2, at(20), serde_json::json!({"id": 2}));
        let checkpoints = MemoryCheckpointStore::new();
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .withf(|m| {
                m.iter().map(|m| m.key.clone().unwrap_or_default()).collect::<Vec<_>>()
                    == vec!["1", "3", "2"]
            })
            .times(1)
            .returning(|_| Ok(()));

        let poller = poller(&table, &checkpoints, publisher, config());
        let mut info = poller.retrieve_poll_info().await.unwrap();
        let status = poller.run_cycle(&mut info).await.unwrap();

        assert_eq!(status.batches_processed, 1);
        assert_eq!(status.messages_processed, 3);
        let saved = checkpoints.get("widgets-poller").unwrap();
        assert_eq!((saved.last_sent, saved.last_sent_id), (at(20), 2));
    }

    #[tokio::test]
    async fn test_empty_poll_touches_timestamp_only() {
        let table = MemorySourceTable::new();
        let checkpoints = MemoryCheckpointStore::new();
        checkpoints.put(PollInfo {
            producer: "widgets-poller".into(),
            last_sent: at(0),
            last_sent_id: 42,
            state: None,
        });
        let mut publisher = MockPublisher::new();
        publisher.expect_publish().never();

        let poller = poller(&table, &checkpoints, publisher, config());
        let mut info = poller.retrieve_poll_info().await.unwrap();
        let status = poller.run_cycle(&mut info).await.unwrap();

        assert_eq!(status, PollStatus::default());
        let saved = checkpoints.get("widgets-poller").unwrap();
        assert!(saved.last_sent > at(0));
        assert_eq!(saved.last_sent_id, 42);
    }

    #[tokio::test]
    async fn test_errored_page_still_advances_checkpoint() {
        let table = MemorySourceTable::new();
        table.insert(1, at(5), serde_json::json!({"id": 1}));
        let checkpoints = MemoryCheckpointStore::new();
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .times(2)
            .returning(|_| Err(PublishError::Transport("down".into())));

        let poller = poller(&table, &checkpoints, publisher, config());
        let mut info = poller.retrieve_poll_info().await.unwrap();
        let status = poller.run_cycle(&mut info).await.unwrap();

        assert_eq!(status.batches_errored, 1);
        assert_eq!(checkpoints.get("widgets-poller").unwrap().last_sent_id, 1);
    }

    #[tokio::test]
    async fn test_rows_inside_delay_are_left_for_later() {
        let table = MemorySourceTable::new();
        table.insert(1, Utc::now() - Duration::hours(1), serde_json::json!({"id": 1}));
        table.insert(2, Utc::now() + Duration::hours(1), serde_json::json!({"id": 2}));
        let checkpoints = MemoryCheckpointStore::new();
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .withf(|m| m.len() == 1)
            .times(1)
            .returning(|_| Ok(()));

        let mut config = config();
        config.delay_time_ms = 60_000;
        let poller = poller(&table, &checkpoints, publisher, config);
        let mut info = poller.retrieve_poll_info().await.unwrap();
        poller.run_cycle(&mut info).await.unwrap();

        assert_eq!(info.last_sent_id, 1);
    }

    #[tokio::test]
    async fn test_should_run_waits_for_interval_and_delay() {
        let table = MemorySourceTable::new();
        let mut config = config();
        config.run_every_ms = 60_000;
        config.delay_time_ms = 2_000;
        let poller = poller(&table, &MemoryCheckpointStore::new(), MockPublisher::new(), config);

        let info = PollInfo::new("widgets-poller", at(0));
        assert!(!poller.should_run(&info, at(61)));
        assert!(poller.should_run(&info, at(62)));
    }
}

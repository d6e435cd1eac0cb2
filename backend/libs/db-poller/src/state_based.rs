use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::checkpoint::PollInfo;
use crate::config::StateBasedConfig;
use crate::error::PollerResult;
use crate::poller::{PollMode, PollStatus, PollerCore, PollerState};
use crate::source::StateBasedSource;

/// Publishes pending rows and marks each page published or failed.
pub struct StateBased<S> {
    source: S,
    state: StateBasedConfig,
}

impl<S: StateBasedSource> StateBased<S> {
    pub fn new(source: S, state: StateBasedConfig) -> Self {
        Self { source, state }
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

#[async_trait]
impl<S: StateBasedSource> PollMode for StateBased<S> {
    fn name(&self) -> &'static str {
        "state_based"
    }

    async fn process_updates(
        &self,
        core: &PollerCore,
        info: &mut PollInfo,
    ) -> PollerResult<PollStatus> {
        let config = core.config();
        let producer = config.producer.as_str();
        info!(producer, "Polling");

        let mut status = PollStatus::default();
        let mut pages = 0;
        loop {
            core.set_state(PollerState::Fetching);
            debug!(producer, batch = status.current_batch(), "Fetching page");
            let rows = self.source.fetch_pending(config.batch_size).await?;
            if rows.is_empty() {
                break;
            }
            pages += 1;

            let outcome = core.publish_page(&rows, &mut status).await;

            core.set_state(PollerState::Checkpointing);
            let state = if outcome.is_success() {
                Some(self.state.published_state.as_str())
            } else {
                self.state.failed_state.as_deref()
            };
            let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
            let now = Utc::now();
            let updated = self.source.finalize(&ids, state, now).await?;
            debug!(producer, updated, state = ?state, "Finalized page");

            info.last_sent = now;
            core.checkpoints().save(info).await?;

            if state.is_none() {
                // The page is still pending and would be fetched again at once.
                warn!(
                    producer,
                    rows = rows.len(),
                    "Page failed with no failed_state configured, ending poll cycle"
                );
                break;
            }
        }

        if pages == 0 {
            info.last_sent = Utc::now();
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
    use std::sync::Arc;

    fn state_config(failed_state: Option<&str>) -> StateBasedConfig {
        StateBasedConfig {
            state_column: "publish_state".into(),
            published_state: "published".into(),
            failed_state: failed_state.map(String::from),
            publish_timestamp_column: Some("published_at".into()),
            pending_state: None,
        }
    }

    fn poller(
        table: &MemorySourceTable,
        checkpoints: &MemoryCheckpointStore,
        publisher: MockPublisher,
        failed_state: Option<&str>,
    ) -> DbPoller<StateBased<MemorySourceTable>> {
        let mut config = PollerConfig::new("widgets-poller", "widgets", "widgets.changes")
            .state_based(state_config(failed_state));
        config.retry_delay_ms = 0;
        config.batch_size = 2;
        let core = PollerCore::new(
            config,
            Arc::new(checkpoints.clone()),
            Arc::new(publisher),
            stream_metrics::noop(),
        )
        .unwrap();
        DbPoller::new(core, StateBased::new(table.clone(), state_config(failed_state)))
    }

    fn seed(table: &MemorySourceTable, count: i64) {
        for id in 1..=count {
            table.insert(id, Utc::now(), serde_json::json!({"id": id}));
        }
    }

    #[tokio::test]
    async fn test_pages_marked_published() {
        let table = MemorySourceTable::new();
        seed(&table, 3);
        let checkpoints = MemoryCheckpointStore::new();
        let mut publisher = MockPublisher::new();
        publisher.expect_publish().times(2).returning(|_| Ok(()));

        let poller = poller(&table, &checkpoints, publisher, Some("failed"));
        let mut info = poller.retrieve_poll_info().await.unwrap();
        let status = poller.run_cycle(&mut info).await.unwrap();

        assert_eq!(status.batches_processed, 2);
        assert_eq!(status.messages_processed, 3);
        assert!(table
            .rows()
            .iter()
            .all(|r| r.state.as_deref() == Some("published") && r.published_at.is_some()));
        assert_eq!(table.fetches(), 3);
    }

    #[tokio::test]
    async fn test_failed_page_marked_failed_and_loop_continues() {
        let table = MemorySourceTable::new();
        seed(&table, 4);
        let checkpoints = MemoryCheckpointStore::new();
        let mut publisher = MockPublisher::new();
        let mut seq = mockall::Sequence::new();
        publisher
            .expect_publish()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(PublishError::Transport("down".into())));
        publisher
            .expect_publish()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let poller = poller(&table, &checkpoints, publisher, Some("failed"));
        let mut info = poller.retrieve_poll_info().await.unwrap();
        let status = poller.run_cycle(&mut info).await.unwrap();

        assert_eq!(status.batches_errored, 1);
        assert_eq!(status.batches_processed, 1);
        // Only the published page counts towards processed messages.
        assert_eq!(status.messages_processed, 2);
        let states: Vec<Option<String>> = table.rows().into_iter().map(|r| r.state).collect();
        assert_eq!(
            states,
            vec![
                Some("failed".to_string()),
                Some("failed".to_string()),
                Some("published".to_string()),
                Some("published".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_without_failed_state_ends_cycle() {
        let table = MemorySourceTable::new();
        seed(&table, 4);
        let checkpoints = MemoryCheckpointStore::new();
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .times(2)
            .returning(|_| Err(PublishError::Transport("down".into())));

        let poller = poller(&table, &checkpoints, publisher, None);
        let mut info = poller.retrieve_poll_info().await.unwrap();
        let status = poller.run_cycle(&mut info).await.unwrap();

        assert_eq!(status.batches_errored, 1);
        assert_eq!(table.fetches(), 1);
        assert!(table.rows().iter().all(|r| r.state.is_none()));
    }
}

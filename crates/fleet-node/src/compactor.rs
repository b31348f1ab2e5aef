//! Background tombstone compaction.
//!
//! Runs once right after startup, to clear stale state left by a previous
//! run, and then on a fixed interval.

use crate::config::CrdtConfig;
use crate::crdt::CrdtStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_BATCH: usize = 512;

/// Effective compaction schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactorSettings {
    pub retention: Duration,
    pub interval: Duration,
    pub batch: usize,
}

impl CompactorSettings {
    /// Schedule for `config`, or `None` when compaction is disabled.
    #[must_use]
    pub fn from_config(config: &CrdtConfig) -> Option<Self> {
        if config.tombstone_retention.is_zero() {
            return None;
        }
        Some(Self {
            retention: config.tombstone_retention,
            interval: if config.tombstone_compaction_interval.is_zero() {
                DEFAULT_INTERVAL
            } else {
                config.tombstone_compaction_interval
            },
            batch: if config.tombstone_compaction_batch == 0 {
                DEFAULT_BATCH
            } else {
                config.tombstone_compaction_batch
            },
        })
    }
}

/// Spawn the compaction loop; `None` when retention disables it.
pub fn spawn(
    store: Arc<CrdtStore>,
    config: &CrdtConfig,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    let Some(settings) = CompactorSettings::from_config(config) else {
        info!("tombstone compaction disabled (retention is zero)");
        return None;
    };
    Some(tokio::spawn(run(store, settings, cancel)))
}

async fn run(store: Arc<CrdtStore>, settings: CompactorSettings, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(settings.interval);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        run_once(&store, settings, &cancel).await;
    }
}

async fn run_once(store: &Arc<CrdtStore>, settings: CompactorSettings, cancel: &CancellationToken) {
    let store = store.clone();
    let token = cancel.clone();
    let result = tokio::task::spawn_blocking(move || {
        store.compact_tombstones(settings.retention, settings.batch, &token)
    })
    .await;

    match result {
        Ok(Ok(0)) => {}
        Ok(Ok(removed)) => info!(
            removed,
            retention = ?settings.retention,
            "compacted tombstone entries"
        ),
        Ok(Err(e)) if e.is_cancelled() || cancel.is_cancelled() => {}
        Ok(Err(e)) => warn!(error = %e, "tombstone compaction failed"),
        Err(e) => warn!(error = %e, "tombstone compaction task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::tests::memory_store;

    #[test]
    fn test_settings_defaults_and_disable() {
        let config = CrdtConfig::default();
        let settings = CompactorSettings::from_config(&config).unwrap();
        assert_eq!(settings.retention, Duration::from_secs(86_400));
        assert_eq!(settings.interval, Duration::from_secs(3600));
        assert_eq!(settings.batch, 512);

        let disabled = CrdtConfig {
            tombstone_retention: Duration::ZERO,
            ..Default::default()
        };
        assert!(CompactorSettings::from_config(&disabled).is_none());

        let zeroes = CrdtConfig {
            tombstone_compaction_interval: Duration::ZERO,
            tombstone_compaction_batch: 0,
            ..Default::default()
        };
        let settings = CompactorSettings::from_config(&zeroes).unwrap();
        assert_eq!(settings.interval, DEFAULT_INTERVAL);
        assert_eq!(settings.batch, DEFAULT_BATCH);
    }

    #[tokio::test]
    async fn test_disabled_spawns_nothing() {
        let (store, _) = memory_store("a");
        let config = CrdtConfig {
            tombstone_retention: Duration::ZERO,
            ..Default::default()
        };
        assert!(spawn(store, &config, CancellationToken::new()).is_none());
    }

    #[tokio::test]
    async fn test_loop_stops_on_cancel() {
        let (store, _) = memory_store("a");
        let cancel = CancellationToken::new();
        let handle = spawn(store, &CrdtConfig::default(), cancel.clone()).unwrap();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

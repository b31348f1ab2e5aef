//! Tombstone compaction.

use super::{CrdtStore, StoreError, decode_timestamp, split_entry_key};
use crate::peer::now_unix;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Compaction stopped early; `removed` entries were already pruned.
#[derive(Debug, Error)]
#[error("tombstone compaction stopped after {removed} removals: {source}")]
pub struct CompactionError {
    pub removed: usize,
    #[source]
    pub source: StoreError,
}

impl CompactionError {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.source, StoreError::Cancelled)
    }
}

impl CrdtStore {
    /// Prune tombstones older than `retention`, with their elements.
    ///
    /// At most `limit` tombstones are removed (`0` = unlimited). Returns the
    /// number removed.
    pub fn compact_tombstones(
        &self,
        retention: Duration,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<usize, CompactionError> {
        self.compact_tombstones_at(now_unix(), retention, limit, cancel)
    }

    pub(crate) fn compact_tombstones_at(
        &self,
        now: i64,
        retention: Duration,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<usize, CompactionError> {
        let fail = |removed, source| CompactionError { removed, source };
        if retention.is_zero() {
            return Err(fail(0, StoreError::InvalidRetention));
        }

        let _gate = self.lock();
        let prefix = self.tombs_prefix();
        let entries = self
            .datastore()
            .query(&format!("{prefix}/"))
            .map_err(|e| fail(0, e))?;
        let deadline = now.saturating_sub(i64::try_from(retention.as_secs()).unwrap_or(i64::MAX));
        let limit_reached = |removed: usize| limit > 0 && removed >= limit;

        let mut batch = self.datastore().batch();
        let mut removed = 0;
        let mut stopped = None;

        for (tomb_key, value) in entries {
            if limit_reached(removed) {
                break;
            }
            if cancel.is_cancelled() {
                stopped = Some(StoreError::Cancelled);
                break;
            }

            let timestamp = decode_timestamp(&value);
            if timestamp == 0 || i64::try_from(timestamp).map_or(true, |t| t >= deadline) {
                continue;
            }
            let Some((key, block)) = split_entry_key(&tomb_key, &prefix) else {
                continue;
            };
            let elem_key = self.elem_key(&key, &block);

            match batch.as_mut() {
                Some(batch) => {
                    batch.delete(&tomb_key);
                    batch.delete(&elem_key);
                }
                None => {
                    if let Err(e) = delete_tolerant(self, &tomb_key)
                        .and_then(|()| delete_tolerant(self, &elem_key))
                    {
                        stopped = Some(e);
                        break;
                    }
                }
            }
            removed += 1;
        }

        if let Some(batch) = batch {
            if let Err(e) = batch.commit() {
                return Err(fail(0, e));
            }
        }
        match stopped {
            Some(source) => Err(fail(removed, source)),
            None => Ok(removed),
        }
    }
}

fn delete_tolerant(store: &CrdtStore, key: &str) -> Result<(), StoreError> {
    match store.datastore().delete(key) {
        Ok(()) | Err(StoreError::NotFound) => Ok(()),
        Err(e) => Err(e),
    }
}

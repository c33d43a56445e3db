use std::collections::HashMap;

use reflection_sync_core::{
    classify, Classification, ContentHash, DateRange, ExternalRecord, RecordFailure,
    RecordOutcome, RecordSource, SyncError, SyncResult,
};
use tracing::{debug, info, warn};

use crate::SqliteRecordStore;

pub(crate) const ACTION_RECONCILE: &str = "reconcile";
pub(crate) const ACTION_RESTORE: &str = "restore";

impl SqliteRecordStore {
    /// Pulls `range` from `source` and reconciles the result. A source that
    /// cannot be queried fails the call before the store is touched.
    pub fn sync(
        &mut self,
        source: &dyn RecordSource,
        range: DateRange,
    ) -> Result<SyncResult, SyncError> {
        let incoming = source.fetch(range).map_err(|err| match err {
            SyncError::SourceUnavailable(_) => err,
            other => SyncError::SourceUnavailable(format!("{}: {other}", source.name())),
        })?;
        debug!(source = source.name(), %range, fetched = incoming.len(), "fetched external records");
        self.reconcile(source.name(), ACTION_RECONCILE, &incoming)
    }

    /// Classifies each incoming record against local state and writes only
    /// new or changed ones. Per-record failures are collected in the result;
    /// failing to read the index or to append the log entry is fatal.
    pub fn reconcile(
        &mut self,
        source: &str,
        action: &str,
        incoming: &[ExternalRecord],
    ) -> Result<SyncResult, SyncError> {
        let mut index: HashMap<_, ContentHash> = HashMap::new();
        if let Some(span) = DateRange::spanning(incoming.iter().map(|record| record.date)) {
            for record in self.get_range(span)? {
                index.insert(record.key(), record.content_hash);
            }
        }

        let mut outcomes = Vec::with_capacity(incoming.len());
        let mut failures = Vec::new();

        for external in incoming {
            let key = external.key();
            let addressed = self
                .addresser()
                .normalize_json(&external.fields)
                .and_then(|fields| {
                    let hash = self.addresser().hash(&fields)?;
                    Ok((fields, hash))
                });
            let (fields, hash) = match addressed {
                Ok(value) => value,
                Err(err) => {
                    warn!(source, %key, source_id = %external.source_id, error = %err, "rejected incoming record");
                    failures.push(RecordFailure::new(&external.source_id, key, &err));
                    continue;
                }
            };

            let mut classification = classify(index.get(&key), &hash);
            if classification.needs_write() {
                match self.upsert(key, fields) {
                    Ok(result) => {
                        classification = Classification::from(result.change);
                        index.insert(key, result.record.content_hash);
                    }
                    Err(err) => {
                        warn!(source, %key, error = %err, "failed to write incoming record");
                        failures.push(RecordFailure::new(&external.source_id, key, &err));
                        continue;
                    }
                }
            }

            debug!(%key, classification = classification.as_str(), "reconciled record");
            outcomes.push(RecordOutcome {
                source_id: external.source_id.clone(),
                key,
                classification,
                content_hash: hash,
            });
        }

        let mut result = SyncResult::tally(source, action, incoming.len(), outcomes, failures);
        let entry = self.append_sync_log(
            source,
            action,
            result.received,
            result.status,
            result.error_summary().as_deref(),
        )?;
        result.log_entry_seq = entry.entry_seq;

        info!(
            source,
            action,
            status = result.status.as_str(),
            received = result.received,
            new = result.new,
            changed = result.changed,
            unchanged = result.unchanged,
            failed = result.failed,
            "reconciliation finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use reflection_sync_core::{StaticSource, SyncStatus, TimeSegment};
    use serde_json::json;

    use super::*;
    use crate::test_support::*;

    #[test]
    fn example_scenario_new_then_unchanged_then_changed() {
        let clock = fixture_clock();
        let mut store = fixture_store(&clock);

        let first = must(store.reconcile(
            "static",
            ACTION_RECONCILE,
            &[focus_entry("2025-07-05", TimeSegment::Morning, 7)],
        ));
        assert_eq!((first.new, first.changed, first.unchanged), (1, 0, 0));
        assert_eq!(first.status, SyncStatus::Success);

        let second = must(store.reconcile(
            "static",
            ACTION_RECONCILE,
            &[focus_entry("2025-07-05", TimeSegment::Morning, 7)],
        ));
        assert_eq!((second.new, second.changed, second.unchanged), (0, 0, 1));

        let third = must(store.reconcile(
            "static",
            ACTION_RECONCILE,
            &[focus_entry("2025-07-05", TimeSegment::Morning, 8)],
        ));
        assert_eq!((third.new, third.changed, third.unchanged), (0, 1, 0));

        let log = must(store.list_sync_log(10));
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].entry_seq, third.log_entry_seq);
        assert!(log.iter().all(|entry| entry.status == SyncStatus::Success));
    }

    #[test]
    fn bad_records_fail_individually_without_aborting_the_batch() {
        let clock = fixture_clock();
        let mut store = fixture_store(&clock);
        let batch = vec![
            focus_entry("2025-07-05", TimeSegment::Morning, 6),
            external("2025-07-05", TimeSegment::Afternoon, json!({"mood": "great"})),
            external("2025-07-05", TimeSegment::Evening, json!({"focus_level": true})),
            focus_entry("2025-07-06", TimeSegment::Morning, 4),
        ];

        let result = must(store.reconcile("static", ACTION_RECONCILE, &batch));
        assert_eq!(result.new, 2);
        assert_eq!(result.failed, 2);
        assert_eq!(result.status, SyncStatus::PartialSuccess);
        let codes: Vec<&str> = result.failures.iter().map(|f| f.code.as_str()).collect();
        assert_eq!(codes, vec!["validation", "serialization"]);
        assert_eq!(must(store.count_records()), 2);

        let log = must(store.list_sync_log(1));
        assert_eq!(log[0].status, SyncStatus::PartialSuccess);
        assert!(log[0]
            .error_message
            .as_deref()
            .unwrap_or_default()
            .starts_with("2 of 4 records failed"));
    }

    #[test]
    fn batch_where_every_record_fails_is_reported_failed() {
        let clock = fixture_clock();
        let mut store = fixture_store(&clock);
        let batch = vec![external(
            "2025-07-05",
            TimeSegment::Morning,
            json!({"focus_level": [1]}),
        )];

        let result = must(store.reconcile("static", ACTION_RECONCILE, &batch));
        assert_eq!(result.status, SyncStatus::Failed);
        assert_eq!(must(store.list_sync_log(1))[0].status, SyncStatus::Failed);
    }

    #[test]
    fn duplicate_keys_in_one_batch_apply_in_order() {
        let clock = fixture_clock();
        let mut store = fixture_store(&clock);
        let batch = vec![
            focus_entry("2025-07-05", TimeSegment::Morning, 3),
            focus_entry("2025-07-05", TimeSegment::Morning, 3),
            focus_entry("2025-07-05", TimeSegment::Morning, 9),
        ];

        let result = must(store.reconcile("static", ACTION_RECONCILE, &batch));
        let classes: Vec<Classification> =
            result.outcomes.iter().map(|o| o.classification).collect();
        assert_eq!(
            classes,
            vec![
                Classification::New,
                Classification::Unchanged,
                Classification::Changed
            ]
        );
        assert_eq!(must(store.count_records()), 1);
    }

    #[test]
    fn unreachable_source_mutates_nothing_and_logs_nothing() {
        let clock = fixture_clock();
        let mut store = fixture_store(&clock);
        let source = StaticSource::failing("remote", "connection refused");

        let result = store.sync(&source, DateRange::single(date("2025-07-05")));
        assert!(matches!(result, Err(SyncError::SourceUnavailable(_))));
        assert_eq!(must(store.count_records()), 0);
        assert!(must(store.list_sync_log(10)).is_empty());
    }

    #[test]
    fn sync_only_reconciles_records_inside_the_range() {
        let clock = fixture_clock();
        let mut store = fixture_store(&clock);
        let source = StaticSource::new(
            "static",
            vec![
                focus_entry("2025-07-01", TimeSegment::Morning, 1),
                focus_entry("2025-07-05", TimeSegment::Morning, 5),
            ],
        );

        let result = must(store.sync(&source, DateRange::single(date("2025-07-05"))));
        assert_eq!(result.received, 1);
        assert_eq!(result.source, "static");
        assert_eq!(must(store.count_records()), 1);
    }

    #[test]
    fn empty_batch_is_a_logged_success() {
        let clock = fixture_clock();
        let mut store = fixture_store(&clock);
        let result = must(store.reconcile("static", ACTION_RECONCILE, &[]));
        assert_eq!(result.status, SyncStatus::Success);
        assert_eq!(must(store.list_sync_log(5)).len(), 1);
    }

    fn segment_from(code: u8) -> TimeSegment {
        match code % 3 {
            0 => TimeSegment::Morning,
            1 => TimeSegment::Afternoon,
            _ => TimeSegment::Evening,
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn reconciling_the_same_batch_twice_is_idempotent(
            entries in prop::collection::btree_map((1u8..=9, 0u8..3), (0i64..=10, 0i64..=5), 0..24)
        ) {
            let clock = fixture_clock();
            let mut store = fixture_store(&clock);
            let batch: Vec<ExternalRecord> = entries
                .iter()
                .map(|((day, segment), (focus, commits))| {
                    external(
                        &format!("2025-07-0{day}"),
                        segment_from(*segment),
                        json!({"focus_level": focus, "github_commits": commits}),
                    )
                })
                .collect();

            let range = must(DateRange::new(date("2025-07-01"), date("2025-07-09")));
            let first = must(store.reconcile("prop", ACTION_RECONCILE, &batch));
            prop_assert_eq!(first.new, batch.len());
            let before = must(store.get_range(range));

            clock.advance(time::Duration::minutes(5));
            let second = must(store.reconcile("prop", ACTION_RECONCILE, &batch));
            prop_assert_eq!(second.new + second.changed, 0);
            prop_assert_eq!(second.unchanged, batch.len());
            prop_assert_eq!(must(store.get_range(range)), before.clone());

            let mut keys: Vec<_> = before.iter().map(|record| record.key()).collect();
            let total = keys.len();
            keys.dedup();
            prop_assert_eq!(keys.len(), total);
            prop_assert_eq!(total, batch.len());
        }
    }
}

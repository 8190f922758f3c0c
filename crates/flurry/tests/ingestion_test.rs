//! End-to-end ingestion runs over in-memory source, catalog and manifest.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use common::{Harness, Options, TABLE, marker, trips_csv};
use flurry::schema::{ColumnType, Value};
use flurry::sink::InjectedFailure;
use flurry::{ManifestStatus, ManifestStore, MemoryCatalog, RunError, RunState, RunStatus};

mod idempotence_tests {
    use super::*;

    #[tokio::test]
    async fn test_second_run_is_a_no_op() {
        let h = Harness::new(Options::default());
        h.put("2024/01/a.csv", marker(1), &trips_csv(0, 25));
        h.put("2024/01/b.csv", marker(2), &trips_csv(100, 10));

        let first = h.orchestrator.run().await.unwrap();
        assert_eq!(first.status(), RunStatus::Success);
        assert_eq!(first.objects_scanned, 2);
        assert_eq!(first.objects_committed, 2);
        assert_eq!(first.rows_written, 35);
        assert_eq!(h.rows(), 35);

        let second = h.orchestrator.run().await.unwrap();
        assert_eq!(second.objects_scanned, 0);
        assert_eq!(second.rows_written, 0);
        assert_eq!(h.rows(), 35);
        assert_eq!(h.orchestrator.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_every_row_is_written_once() {
        let h = Harness::new(Options {
            chunk_size: 7,
            ..Default::default()
        });
        h.put("a.csv", marker(1), &trips_csv(0, 50));

        h.orchestrator.run().await.unwrap();

        let rows = h.catalog.rows(TABLE);
        assert_eq!(rows.len(), 50);
        let offsets: HashSet<u64> = rows.iter().map(|row| row.key.offset).collect();
        assert_eq!(offsets, (0..50).collect());
        assert_eq!(rows[0].value("trip_id"), Value::Integer(0));
    }

    #[tokio::test]
    async fn test_restart_does_not_reingest_committed_objects() {
        let mut h = Harness::new(Options::default());
        h.put("a.csv", marker(1), &trips_csv(0, 5));
        h.orchestrator.run().await.unwrap();

        h.restart(Options::default());
        let summary = h.orchestrator.run().await.unwrap();

        assert_eq!(summary.objects_scanned, 0);
        assert_eq!(h.rows(), 5);
    }

    #[tokio::test]
    async fn test_modified_object_is_ingested_as_new_version() {
        let h = Harness::new(Options::default());
        h.put("a.csv", marker(1), &trips_csv(0, 5));
        h.orchestrator.run().await.unwrap();

        h.put("a.csv", marker(2), &trips_csv(0, 8));
        let summary = h.orchestrator.run().await.unwrap();

        assert_eq!(summary.objects_committed, 1);
        assert_eq!(summary.rows_written, 8);
        assert_eq!(h.rows(), 13);

        let entry = h.manifest.get("a.csv").await.unwrap().unwrap();
        assert_eq!(entry.modification_marker, marker(2));
        assert_eq!(entry.status, ManifestStatus::Committed);
    }
}

mod detection_tests {
    use super::*;

    #[tokio::test]
    async fn test_detect_only_returns_new_and_modified_objects() {
        let h = Harness::new(Options::default());
        h.put("a.csv", marker(1), &trips_csv(0, 3));
        h.put("b.csv", marker(1), &trips_csv(10, 3));
        h.orchestrator.run().await.unwrap();

        h.put("b.csv", marker(2), &trips_csv(10, 4));
        h.put("c.csv", marker(1), &trips_csv(20, 3));
        h.put("notes.txt", marker(3), "not a csv");

        let pending = h.orchestrator.detect_only().await.unwrap();
        let found: Vec<_> = pending
            .iter()
            .map(|o| (o.key.as_str(), o.modification_marker))
            .collect();

        assert_eq!(found, vec![("c.csv", marker(1)), ("b.csv", marker(2))]);
        assert_eq!(h.rows(), 6);
    }

    #[tokio::test]
    async fn test_removed_object_is_not_detected() {
        let h = Harness::new(Options::default());
        h.put("a.csv", marker(1), &trips_csv(0, 3));
        h.source.remove("a.csv");

        assert!(h.orchestrator.detect_only().await.unwrap().is_empty());
    }
}

mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_bad_object_does_not_stop_the_run() {
        let h = Harness::new(Options {
            max_parallel: 1,
            ..Default::default()
        });
        h.put("a.csv", marker(1), &trips_csv(0, 5));
        h.put(
            "b.csv",
            marker(2),
            "trip_id,passenger_count,fare_amount,pickup_at\n9,many,5.50,2024-01-01T00:00:00Z\n",
        );
        h.put("c.csv", marker(3), &trips_csv(20, 5));

        let summary = h.orchestrator.run().await.unwrap();

        assert_eq!(summary.status(), RunStatus::PartialFailure);
        assert_eq!(summary.objects_committed, 2);
        assert_eq!(summary.objects_failed, 1);
        assert_eq!(summary.failures[0].key, "b.csv");
        assert_eq!(h.rows(), 10);

        let entry = h.manifest.get("b.csv").await.unwrap().unwrap();
        assert_eq!(entry.status, ManifestStatus::Failed);
        assert_eq!(entry.attempt_count, 1);
        assert!(entry.last_error.is_some());
    }

    #[tokio::test]
    async fn test_failed_object_is_retried_next_run() {
        let h = Harness::new(Options {
            retry_ceiling: 1,
            ..Default::default()
        });
        h.put("a.csv", marker(1), &trips_csv(0, 5));
        h.catalog.fail_append(1, InjectedFailure::Permanent);

        let first = h.orchestrator.run().await.unwrap();
        assert_eq!(first.objects_failed, 1);
        assert_eq!(h.rows(), 0);

        let second = h.orchestrator.run().await.unwrap();
        assert_eq!(second.status(), RunStatus::Success);
        assert_eq!(second.rows_written, 5);

        let entry = h.manifest.get("a.csv").await.unwrap().unwrap();
        assert_eq!(entry.status, ManifestStatus::Committed);
        assert_eq!(entry.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_unreachable_catalog_aborts_the_run() {
        let h = Harness::new(Options::default());
        h.put("a.csv", marker(1), &trips_csv(0, 5));
        h.catalog.reject_credentials(true);

        let err = h.orchestrator.run().await.unwrap_err();

        assert!(matches!(err, RunError::CatalogUnavailable { .. }));
        assert!(h.manifest.get("a.csv").await.unwrap().is_none());
        assert_eq!(h.orchestrator.state(), RunState::Idle);
    }
}

mod recovery_tests {
    use super::*;

    #[tokio::test]
    async fn test_crash_before_manifest_commit_replays_without_duplicates() {
        let h = Harness::new(Options {
            chunk_size: 4,
            ..Default::default()
        });
        h.put("a.csv", marker(1), &trips_csv(0, 10));
        h.manifest.fail_next(ManifestStatus::Committed, 3).await;

        let first = h.orchestrator.run().await.unwrap();
        assert_eq!(first.objects_failed, 1);
        assert_eq!(h.rows(), 10);

        let second = h.orchestrator.run().await.unwrap();
        assert_eq!(second.objects_committed, 1);
        assert_eq!(second.rows_written, 0);
        assert_eq!(second.rows_deduplicated, 10);
        assert_eq!(h.rows(), 10);
    }

    #[tokio::test]
    async fn test_partial_append_resumes_without_duplicates() {
        let h = Harness::new(Options {
            chunk_size: 3,
            retry_ceiling: 1,
            ..Default::default()
        });
        h.put("a.csv", marker(1), &trips_csv(0, 9));
        h.catalog.fail_append(2, InjectedFailure::Permanent);

        let first = h.orchestrator.run().await.unwrap();
        assert_eq!(first.objects_failed, 1);
        assert_eq!(h.rows(), 3);

        let second = h.orchestrator.run().await.unwrap();
        assert_eq!(second.rows_written, 6);
        assert_eq!(second.rows_deduplicated, 3);
        assert_eq!(h.rows(), 9);
    }

    #[tokio::test]
    async fn test_transient_append_failure_is_retried() {
        let h = Harness::new(Options::default());
        h.put("a.csv", marker(1), &trips_csv(0, 5));
        h.catalog.fail_append(1, InjectedFailure::Transient);

        let summary = h.orchestrator.run().await.unwrap();

        assert_eq!(summary.status(), RunStatus::Success);
        assert_eq!(h.rows(), 5);
        assert_eq!(h.catalog.append_calls(), 2);
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed() {
        let h = Harness::new(Options::default());
        h.put("a.csv", marker(1), &trips_csv(0, 5));
        h.orchestrator.run().await.unwrap();
        let auth_calls = h.catalog.auth_calls();

        h.catalog.expire_tokens();
        h.put("b.csv", marker(2), &trips_csv(10, 5));
        let summary = h.orchestrator.run().await.unwrap();

        assert_eq!(summary.status(), RunStatus::Success);
        assert_eq!(h.rows(), 10);
        assert!(h.catalog.auth_calls() > auth_calls);
    }

    #[tokio::test]
    async fn test_interrupted_read_restarts_without_duplicates() {
        let h = Harness::new(Options {
            chunk_size: 2,
            ..Default::default()
        });
        h.put("a.csv", marker(1), &trips_csv(0, 12));
        h.source.interrupt_reads("a.csv", 1);

        let summary = h.orchestrator.run().await.unwrap();

        assert_eq!(summary.status(), RunStatus::Success);
        assert_eq!(h.rows(), 12);
        let offsets: HashSet<u64> = h.catalog.rows(TABLE).iter().map(|r| r.key.offset).collect();
        assert_eq!(offsets.len(), 12);
    }

    #[tokio::test]
    async fn test_stalled_read_times_out_and_restarts() {
        let h = Harness::new(Options {
            chunk_size: 2,
            request_timeout: Duration::from_millis(200),
            ..Default::default()
        });
        h.put("a.csv", marker(1), &trips_csv(0, 12));
        h.source.stall_reads("a.csv", 1);

        let summary = tokio::time::timeout(Duration::from_secs(10), h.orchestrator.run())
            .await
            .expect("a stalled read must not hang the run")
            .unwrap();

        assert_eq!(summary.status(), RunStatus::Success);
        assert_eq!(h.rows(), 12);
        let offsets: HashSet<u64> = h.catalog.rows(TABLE).iter().map(|r| r.key.offset).collect();
        assert_eq!(offsets.len(), 12);
    }

    #[tokio::test]
    async fn test_read_that_never_answers_fails_the_object() {
        let h = Harness::new(Options {
            retry_ceiling: 2,
            request_timeout: Duration::from_millis(100),
            ..Default::default()
        });
        h.put("a.csv", marker(1), &trips_csv(0, 4));
        h.put("b.csv", marker(2), &trips_csv(4, 4));
        h.source.stall_reads("a.csv", 10);

        let summary = tokio::time::timeout(Duration::from_secs(10), h.orchestrator.run())
            .await
            .expect("a stalled read must not hang the run")
            .unwrap();

        assert_eq!(summary.status(), RunStatus::PartialFailure);
        assert_eq!(summary.failures[0].key, "a.csv");
        assert_eq!(h.rows(), 4);
        let entry = h.manifest.get("a.csv").await.unwrap().unwrap();
        assert_eq!(entry.status, ManifestStatus::Failed);
        assert!(entry.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_stalled_listing_is_retried() {
        let h = Harness::new(Options {
            request_timeout: Duration::from_millis(100),
            ..Default::default()
        });
        h.put("a.csv", marker(1), &trips_csv(0, 3));
        h.source.stall_listings(1);

        let summary = tokio::time::timeout(Duration::from_secs(10), h.orchestrator.run())
            .await
            .expect("a stalled listing must not hang the run")
            .unwrap();

        assert_eq!(summary.objects_committed, 1);
        assert_eq!(h.rows(), 3);
    }
}

mod schema_tests {
    use super::*;

    #[tokio::test]
    async fn test_new_column_widens_table() {
        let h = Harness::new(Options {
            max_parallel: 1,
            ..Default::default()
        });
        h.put("a.csv", marker(1), "trip_id,fare_amount\n1,5.50\n2,7.25\n");
        h.put(
            "b.csv",
            marker(2),
            "trip_id,fare_amount,tip_amount\n3,9.00,1.50\n",
        );

        let summary = h.orchestrator.run().await.unwrap();
        assert_eq!(summary.status(), RunStatus::Success);

        let schema = h.catalog.schema(TABLE).unwrap();
        let names: Vec<_> = schema.columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["trip_id", "fare_amount", "tip_amount"]);
        assert_eq!(
            schema.get("tip_amount").unwrap().column_type,
            ColumnType::Float
        );

        let rows = h.catalog.rows(TABLE);
        let tips: Vec<_> = rows.iter().map(|row| row.value("tip_amount")).collect();
        assert_eq!(tips, vec![Value::Null, Value::Null, Value::Float(1.5)]);
    }

    #[tokio::test]
    async fn test_strict_mode_rejects_new_columns() {
        let h = Harness::new(Options {
            max_parallel: 1,
            schema_evolution: flurry::SchemaEvolutionMode::Strict,
            ..Default::default()
        });
        h.put("a.csv", marker(1), "trip_id\n1\n");
        h.put("b.csv", marker(2), "trip_id,tip_amount\n2,1.50\n");

        let summary = h.orchestrator.run().await.unwrap();

        assert_eq!(summary.objects_committed, 1);
        assert_eq!(summary.failures[0].key, "b.csv");
        assert_eq!(h.catalog.schema(TABLE).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_text_column_keeps_values_as_written() {
        let h = Harness::new(Options {
            max_parallel: 1,
            ..Default::default()
        });
        h.put("a.csv", marker(1), "zip,fare\nabc,x\n");
        h.put("b.csv", marker(2), "zip,fare\n02134,1.50\n00501,2\n");

        let summary = h.orchestrator.run().await.unwrap();
        assert_eq!(summary.status(), RunStatus::Success);

        let rows = h.catalog.rows(TABLE);
        let zips: Vec<_> = rows.iter().map(|row| row.value("zip")).collect();
        let fares: Vec<_> = rows.iter().map(|row| row.value("fare")).collect();
        assert_eq!(
            zips,
            vec![
                Value::Text("abc".to_string()),
                Value::Text("02134".to_string()),
                Value::Text("00501".to_string())
            ]
        );
        assert_eq!(
            fares,
            vec![
                Value::Text("x".to_string()),
                Value::Text("1.50".to_string()),
                Value::Text("2".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_integer_values_fit_float_column() {
        let h = Harness::new(Options {
            max_parallel: 1,
            ..Default::default()
        });
        h.put("a.csv", marker(1), "trip_id,fare_amount\n1,5.50\n");
        h.put("b.csv", marker(2), "trip_id,fare_amount\n2,6\n");

        let summary = h.orchestrator.run().await.unwrap();

        assert_eq!(summary.status(), RunStatus::Success);
        assert_eq!(h.rows(), 2);
    }
}

mod parsing_tests {
    use super::*;

    const RAGGED: &str = "trip_id,fare_amount\n1,5.50\n2\n3,7.00\n";

    #[tokio::test]
    async fn test_strict_parsing_fails_object_on_malformed_row() {
        let h = Harness::new(Options::default());
        h.put("a.csv", marker(1), RAGGED);

        let summary = h.orchestrator.run().await.unwrap();

        assert_eq!(summary.objects_failed, 1);
        assert_eq!(h.rows(), 0);
    }

    #[tokio::test]
    async fn test_lenient_parsing_skips_malformed_rows() {
        let h = Harness::new(Options {
            strict_parsing: false,
            ..Default::default()
        });
        h.put("a.csv", marker(1), RAGGED);

        let summary = h.orchestrator.run().await.unwrap();

        assert_eq!(summary.status(), RunStatus::Success);
        let offsets: Vec<u64> = h.catalog.rows(TABLE).iter().map(|r| r.key.offset).collect();
        assert_eq!(offsets, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_header_only_object_commits_without_rows() {
        let h = Harness::new(Options::default());
        h.put("a.csv", marker(1), "trip_id,fare_amount\n");

        let summary = h.orchestrator.run().await.unwrap();

        assert_eq!(summary.objects_committed, 1);
        assert_eq!(h.rows(), 0);
        assert!(h.manifest.get("a.csv").await.unwrap().unwrap().is_committed());
    }
}

mod concurrency_tests {
    use super::*;

    #[tokio::test]
    async fn test_second_run_is_rejected_while_first_is_active() {
        let gate = Arc::new(Semaphore::new(0));
        let h = Harness::with_catalog(
            MemoryCatalog::new().with_append_gate(gate.clone()),
            Options::default(),
        );
        h.put("a.csv", marker(1), &trips_csv(0, 5));

        let orchestrator = h.orchestrator.clone();
        let first = tokio::spawn(async move { orchestrator.run().await });

        let mut waited = Duration::ZERO;
        while h.orchestrator.state() != RunState::Ingesting {
            assert!(waited < Duration::from_secs(5), "run never started ingesting");
            tokio::time::sleep(Duration::from_millis(5)).await;
            waited += Duration::from_millis(5);
        }

        let err = h.orchestrator.run().await.unwrap_err();
        assert!(matches!(err, RunError::RunInProgress));
        assert!(matches!(
            h.orchestrator.detect_only().await,
            Err(RunError::RunInProgress)
        ));

        gate.add_permits(100);
        let summary = first.await.unwrap().unwrap();

        assert_eq!(summary.status(), RunStatus::Success);
        assert_eq!(h.rows(), 5);
        assert_eq!(h.orchestrator.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_parallel_objects_all_commit() {
        let h = Harness::new(Options {
            max_parallel: 4,
            chunk_size: 3,
            ..Default::default()
        });
        for i in 0..8u32 {
            h.put(&format!("part-{i}.csv"), marker(i), &trips_csv(u64::from(i) * 100, 10));
        }

        let summary = h.orchestrator.run().await.unwrap();

        assert_eq!(summary.objects_committed, 8);
        assert_eq!(h.rows(), 80);
        assert_eq!(
            h.manifest
                .list_committed()
                .await
                .unwrap()
                .len(),
            8
        );
    }
}

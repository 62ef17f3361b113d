use std::path::PathBuf;

use chrono::{Duration, TimeZone, Utc};

use genloop_core::job::{GenerationParams, LoraSnapshot, RunOutcome, RunRecord};
use genloop_db::models::run_record::{CheckpointUsage, OutcomeCount, StoredRunRecord};
use genloop_db::repositories::RunRecordRepo;
use genloop_db::store::{RunStore, SqliteRunStore};
use genloop_db::DbPool;

async fn pool() -> DbPool {
    let pool = genloop_db::create_pool("sqlite::memory:").await.unwrap();
    genloop_db::run_migrations(&pool).await.unwrap();
    pool
}

fn record(seq: u64, checkpoint_type: &str, checkpoint: &str, outcome: RunOutcome) -> RunRecord {
    let submitted_at = Utc.with_ymd_and_hms(2026, 10, 14, 10, 0, 0).unwrap();
    RunRecord {
        run_tag: "run-a".into(),
        seq,
        prompt_id: Some(format!("p-{seq}")),
        checkpoint_type: checkpoint_type.into(),
        checkpoint: checkpoint.into(),
        loras: vec![LoraSnapshot {
            name: "IL/etc/style.safetensors".into(),
            strength_model: 0.8,
            strength_clip: 1.0,
        }],
        params: GenerationParams {
            seed: u64::MAX,
            steps: 24,
            cfg: 6.5,
            sampler_name: "euler".into(),
            scheduler: "karras".into(),
            denoise: 1.0,
            width: 832,
            height: 1216,
            positive_prompt: Some("a castle".into()),
            negative_prompt: None,
        },
        outcome,
        error: (outcome != RunOutcome::Completed).then(|| "boom".to_string()),
        artifacts: if outcome == RunOutcome::Completed {
            vec![PathBuf::from("/out/IL/a/a-run-a-job000001_00001_.png")]
        } else {
            vec![]
        },
        submitted_at,
        finished_at: submitted_at + Duration::seconds(12),
        duration_ms: 12_000,
    }
}

#[tokio::test]
async fn health_check_after_migrations() {
    let pool = pool().await;
    genloop_db::health_check(&pool).await.unwrap();
}

#[tokio::test]
async fn inserted_record_reads_back_unchanged() {
    let pool = pool().await;
    let original = record(1, "IL", "IL/a.safetensors", RunOutcome::Completed);
    let recorded_at = Utc.with_ymd_and_hms(2026, 10, 14, 10, 0, 30).unwrap();

    let id = RunRecordRepo::insert(&pool, &original, recorded_at).await.unwrap();

    let rows = RunRecordRepo::list_by_run(&pool, "run-a").await.unwrap();
    assert_eq!(rows.len(), 1);
    let stored = StoredRunRecord::try_from(rows.into_iter().next().unwrap()).unwrap();
    assert_eq!(stored.id, id);
    assert_eq!(stored.recorded_at, recorded_at);
    assert_eq!(stored.record, original);
}

#[tokio::test]
async fn ids_are_assigned_in_insert_order() {
    let pool = pool().await;
    let now = Utc::now();
    let a = RunRecordRepo::insert(&pool, &record(1, "IL", "a", RunOutcome::Completed), now)
        .await
        .unwrap();
    let b = RunRecordRepo::insert(&pool, &record(2, "IL", "a", RunOutcome::Failed), now)
        .await
        .unwrap();
    assert!(b > a);
}

#[tokio::test]
async fn duplicate_run_seq_is_rejected() {
    let pool = pool().await;
    let r = record(1, "IL", "a", RunOutcome::Completed);
    RunRecordRepo::insert(&pool, &r, Utc::now()).await.unwrap();
    assert!(RunRecordRepo::insert(&pool, &r, Utc::now()).await.is_err());
}

#[tokio::test]
async fn queries_by_time_range_and_type() {
    let pool = pool().await;
    let base = Utc.with_ymd_and_hms(2026, 10, 14, 9, 0, 0).unwrap();
    for (seq, kind, offset) in [(1, "IL", 0), (2, "Pony", 10), (3, "IL", 20)] {
        RunRecordRepo::insert(
            &pool,
            &record(seq, kind, "x", RunOutcome::Completed),
            base + Duration::minutes(offset),
        )
        .await
        .unwrap();
    }

    let window = RunRecordRepo::list_between(&pool, base + Duration::minutes(5), base + Duration::minutes(20))
        .await
        .unwrap();
    assert_eq!(window.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![2]);

    let il = RunRecordRepo::list_by_checkpoint_type(&pool, "IL").await.unwrap();
    assert_eq!(il.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![1, 3]);
}

#[tokio::test]
async fn summary_counts() {
    let pool = pool().await;
    let store = SqliteRunStore::new(pool.clone());
    store.append(&record(1, "IL", "IL/a", RunOutcome::Completed)).await.unwrap();
    store.append(&record(2, "IL", "IL/a", RunOutcome::TimedOut)).await.unwrap();
    store.append(&record(3, "Pony", "Pony/b", RunOutcome::Completed)).await.unwrap();

    let outcomes = RunRecordRepo::outcome_counts(&pool, "run-a").await.unwrap();
    assert_eq!(
        outcomes,
        vec![
            OutcomeCount { outcome: "completed".into(), count: 2 },
            OutcomeCount { outcome: "timed_out".into(), count: 1 },
        ]
    );

    let usage = RunRecordRepo::checkpoint_usage(&pool).await.unwrap();
    assert_eq!(
        usage[0],
        CheckpointUsage { checkpoint_type: "IL".into(), checkpoint: "IL/a".into(), count: 2 }
    );
    assert_eq!(usage.len(), 2);
}

#[tokio::test]
async fn open_creates_database_file() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    let pool = genloop_db::open(&data_dir).await.unwrap();
    genloop_db::health_check(&pool).await.unwrap();
    assert!(data_dir.join(genloop_db::DATABASE_FILE).exists());
}

#[tokio::test]
async fn file_and_url_pools_share_settings() {
    let dir = tempfile::tempdir().unwrap();
    let opened = genloop_db::open(dir.path()).await.unwrap();
    let url = format!("sqlite://{}", dir.path().join("other.db").display());
    let created = genloop_db::create_pool(&url).await.unwrap();
    for pool in [&opened, &created] {
        assert_eq!(pool.options().get_max_connections(), 4);
        assert_eq!(pool.options().get_idle_timeout(), None);
        assert_eq!(pool.options().get_max_lifetime(), None);
    }

    let memory = genloop_db::create_pool("sqlite::memory:").await.unwrap();
    assert_eq!(memory.options().get_max_connections(), 1);
}

use spawn_quota::config::QuotaConfig;
use spawn_quota::event::ActorContext;
use spawn_quota::key::{ActorId, CellKey, WorldPos};
use spawn_quota::permission::PermissionSet;
use spawn_quota::{HostBindings, QuotaEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

fn engine(max_per_cell: i32, max_per_actor: i32) -> Arc<QuotaEngine> {
    let mut config = QuotaConfig::development();
    config.cell.max_per_cell = max_per_cell;
    config.cell.verify_on_check = false;
    config.actor.max_per_actor = max_per_actor;
    Arc::new(QuotaEngine::start(config, HostBindings::default()).expect("start"))
}

async fn settled_units(engine: &QuotaEngine, expected: i64) -> i64 {
    let mut seen = 0;
    for _ in 0..500 {
        seen = engine.cell_statistics().await.total_units;
        if seen == expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    seen
}

/// Region threads place concurrently into their own cells while sharing one
/// actor. No increment may be lost.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_regions_lose_no_placements() {
    let engine = engine(1_000, 100_000);
    let actor = ActorContext::new(
        ActorId::random(),
        PermissionSet::new(),
        WorldPos::new("world", 0, 64, 0),
    );
    let threads: Vec<_> = (0..8)
        .map(|region| {
            let engine = Arc::clone(&engine);
            let actor = actor.clone();
            std::thread::spawn(move || {
                let at = WorldPos::new("world", region * 512, 64, 0);
                (0..50)
                    .filter(|_| engine.object_placed(&actor, &at, 1).is_allowed())
                    .count()
            })
        })
        .collect();
    let admitted: usize = threads
        .into_iter()
        .map(|t| t.join().expect("region thread panicked"))
        .sum();
    assert_eq!(admitted, 400);

    assert_eq!(settled_units(&engine, 400).await, 400);
    for region in 0..8 {
        let cell = WorldPos::new("world", region * 512, 64, 0).cell();
        assert_eq!(engine.cell_count(&cell), 50, "{cell}");
    }
    let mut actor_total = 0;
    for _ in 0..500 {
        engine.clear_cache();
        actor_total = engine.actor_count(actor.id);
        if actor_total == 400 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(actor_total, 400);
    engine.shutdown().await;
}

/// Awaited deltas from many tasks converge on the exact sum.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deltas_converge_on_the_sum() {
    let engine = engine(1_000_000, 1_000_000);
    let cell = CellKey::new("world", 9, 9);
    let mut tasks = JoinSet::new();
    for _ in 0..200 {
        let engine = Arc::clone(&engine);
        let cell = cell.clone();
        tasks.spawn(async move { engine.cells().apply_delta(cell, 3).await });
    }
    while let Some(result) = tasks.join_next().await {
        assert!(result.expect("task panicked").is_some());
    }
    for _ in 0..50 {
        let engine = Arc::clone(&engine);
        let cell = cell.clone();
        tasks.spawn(async move { engine.cells().apply_delta(cell, -1).await });
    }
    while tasks.join_next().await.is_some() {}

    assert_eq!(engine.cell_count(&cell), 550);
    engine.clear_cache();
    assert_eq!(engine.cell_count(&cell), 550);
    engine.shutdown().await;
}

/// A net-negative sequence never drives a count below zero.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn net_negative_sequence_settles_at_zero() {
    let engine = engine(100, 100);
    let cell = CellKey::new("world", 0, 0);
    for delta in [4, -1, -10, 2, -3] {
        engine.cells().apply_delta(cell.clone(), delta).await;
    }
    assert_eq!(engine.cell_count(&cell), 0);
    engine.shutdown().await;
}

/// Admission checks racing with background writes never see a count that
/// exceeds what was actually stored.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn checks_race_safely_with_writes() {
    let engine = engine(1_000_000, 1_000_000);
    let cell = CellKey::new("world", 1, 1);
    let writers: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let cell = cell.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    engine.cells().apply_delta(cell.clone(), 1).await;
                }
            })
        })
        .collect();
    let reader = {
        let engine = Arc::clone(&engine);
        let cell = cell.clone();
        std::thread::spawn(move || {
            let mut last = 0;
            for _ in 0..2_000 {
                let seen = engine.cell_count(&cell);
                assert!((0..=400).contains(&seen), "{seen}");
                last = last.max(seen);
            }
            last
        })
    };
    for writer in writers {
        writer.await.expect("writer panicked");
    }
    let max_seen = reader.join().expect("reader panicked");
    assert!(max_seen <= 400);
    assert_eq!(engine.cell_count(&cell), 400);
    engine.shutdown().await;
}

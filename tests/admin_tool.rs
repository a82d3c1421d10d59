use spawn_quota::config::StoreConfig;
use spawn_quota::key::{ActorId, CellKey};
use spawn_quota::store::CounterStore;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::tempdir;

fn spawn_quota(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_spawn_quota"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("run spawn_quota")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn seed(path: &Path, actor: ActorId) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let store = CounterStore::open(&StoreConfig {
        path: path.to_path_buf(),
        ..StoreConfig::default()
    })
    .expect("open");
    runtime.block_on(async {
        store.set(CellKey::new("world", 0, 0), 5).await;
        store.set(CellKey::new("world", -1, 3), 2).await;
        store.set(actor, 7).await;
        store.close().await;
    });
}

#[test]
fn stats_count_set_and_reset_against_a_store_file() {
    let dir = tempdir().expect("temp dir");
    let db = dir.path().join("spawner_limits.db");
    let actor = ActorId::random();
    seed(&db, actor);
    let db = db.to_str().expect("utf-8 path");

    let out = spawn_quota(&["stats", "--db", db]);
    assert!(out.status.success(), "{out:?}");
    assert_eq!(stdout(&out), "cells\t2\t7\nactors\t1\t7\n");

    let out = spawn_quota(&["count", "cell", "world:0,0", "--db", db]);
    assert!(out.status.success(), "{out:?}");
    assert_eq!(stdout(&out), "cell world:0,0\t5\tstored\n");

    let actor_id = actor.to_string();
    let out = spawn_quota(&["set", "actor", &actor_id, "12", "--db", db]);
    assert!(out.status.success(), "{out:?}");
    let out = spawn_quota(&["count", "actor", &actor_id, "--db", db]);
    assert_eq!(stdout(&out), format!("actor {actor_id}\t12\tstored\n"));

    let out = spawn_quota(&["reset", "cell", "world:0,0", "--db", db]);
    assert!(out.status.success(), "{out:?}");
    let out = spawn_quota(&["count", "cell", "world:0,0", "--db", db]);
    assert_eq!(stdout(&out), "cell world:0,0\t0\tabsent\n");
}

#[test]
fn bad_invocations_fail() {
    let dir = tempdir().expect("temp dir");
    let missing = dir.path().join("missing.db");
    let missing = missing.to_str().expect("utf-8 path");

    assert!(!spawn_quota(&[]).status.success());
    assert!(!spawn_quota(&["frobnicate"]).status.success());
    assert!(!spawn_quota(&["stats"]).status.success());
    assert!(!spawn_quota(&["stats", "--db", missing]).status.success());
    assert!(
        !spawn_quota(&["count", "cell", "no-coordinates", "--db", missing])
            .status
            .success()
    );
    assert!(
        !spawn_quota(&["set", "cell", "world:0,0", "-3", "--db", missing])
            .status
            .success()
    );
}

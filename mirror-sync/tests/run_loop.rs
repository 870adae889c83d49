mod common;

use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;

use common::World;
use mirror_core::{fields, EntityKind, RemoteAdapter, Side};
use mirror_sync::HandlerKind;

/// Poll `check` every 10 ms for up to two seconds.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mirrored_note_does_not_bounce_back() {
    let world = World::new();
    let pbv_task = world.seed_task(Side::Pbv, "comp");
    world.seed_task(Side::Undark, "comp");

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let run = tokio::spawn(world.dispatcher.clone().run(shutdown_rx));
    tokio::time::sleep(Duration::from_millis(50)).await;

    world
        .pbv
        .create(
            EntityKind::Note,
            fields([
                ("content", json!("Please check lighting")),
                ("parent_id", json!(pbv_task.id.0)),
                ("parent_type", json!("Task")),
            ]),
        )
        .await
        .expect("create note");

    let stats = world.engine.stats().clone();
    assert!(
        eventually(|| stats.get(HandlerKind::Note).suppressed == 1).await,
        "the mirrored note's own event should be suppressed"
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(world.undark.entities(EntityKind::Note).len(), 1);
    assert_eq!(world.pbv.entities(EntityKind::Note).len(), 1);
    let counters = stats.get(HandlerKind::Note);
    assert_eq!(counters.applied, 1);
    assert_eq!(counters.failed, 0);

    shutdown_tx.send(()).expect("shutdown");
    run.await.expect("join").expect("run");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shot_creation_runs_template_through_the_loop() {
    let world = World::new();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let run = tokio::spawn(world.dispatcher.clone().run(shutdown_rx));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let shot = world
        .undark
        .create(
            EntityKind::Shot,
            fields([
                ("name", json!("sh050")),
                ("parent_id", json!(world.undark_layout.sequence.id.0)),
                ("project_id", json!(world.undark_layout.project.id.0)),
            ]),
        )
        .await
        .expect("create shot");

    let undark = world.undark.clone();
    assert!(eventually(|| undark.create_count(EntityKind::Task) == 3).await);

    let stats = world.engine.stats().clone();
    assert!(eventually(|| stats.get(HandlerKind::Task).skipped == 3).await);
    assert!(world
        .pbv
        .entities(EntityKind::Task)
        .iter()
        .all(|t| t.id_field("parent_id") != Some(shot.id.clone())));
    assert_eq!(world.pbv.create_count(EntityKind::Task), 0);

    shutdown_tx.send(()).expect("shutdown");
    run.await.expect("join").expect("run");
}

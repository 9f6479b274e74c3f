//! End-to-end: a producer seeds a zoom level, workers render and acknowledge.

use std::collections::BTreeSet;
use std::time::Duration;
use tilequeue_rs::backend::memory::{Fault, Op};
use tilequeue_rs::{MemoryBackend, QueueStore, TileCoord, WorkItem};

fn zoom_level(z: u32) -> impl Iterator<Item = WorkItem> {
    let side = 1u32 << z;
    (0..side).flat_map(move |x| (0..side).map(move |y| WorkItem::for_tile(TileCoord::new(z, x, y))))
}

async fn render_worker(store: &QueueStore<MemoryBackend>) -> Vec<TileCoord> {
    let mut rendered = Vec::new();
    let mut listing = store.list();
    while let Some(item) = listing.next().await.unwrap() {
        let coord = item.tile_coord().unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.delete_one(item).await.unwrap();
        rendered.push(coord);
    }
    rendered
}

#[tokio::test(start_paused = true)]
async fn workers_render_every_tile_once() {
    let queue = MemoryBackend::new("render").with_visibility_timeout(Duration::from_secs(60));
    let producer = QueueStore::new(queue.clone());
    let sent = producer.put(zoom_level(3)).collect().await;
    assert_eq!(sent.len(), 64);
    assert!(sent.iter().all(|item| !item.is_failed()));

    let workers: Vec<_> = (0..3)
        .map(|_| {
            let store = QueueStore::new(queue.clone()).with_batch_size(5);
            tokio::spawn(async move { render_worker(&store).await })
        })
        .collect();

    let mut rendered = Vec::new();
    for worker in workers {
        rendered.extend(worker.await.unwrap());
    }

    let unique: BTreeSet<_> = rendered.iter().copied().collect();
    assert_eq!(rendered.len(), 64, "no tile rendered twice");
    assert_eq!(unique.len(), 64);
    assert!(producer.get_status().await.unwrap().is_drained());
}

#[tokio::test]
async fn producer_reports_failed_tiles_for_retry() {
    let queue = MemoryBackend::new("render");
    queue.fail(Op::SendBatch, Fault::Next(1)).await;
    let producer = QueueStore::new(queue.clone());

    let sent = producer.put(zoom_level(2)).collect().await;
    let failed: Vec<_> = sent.into_iter().filter(WorkItem::is_failed).collect();
    assert_eq!(failed.len(), 10);

    let retried: Vec<_> = producer
        .put(failed.into_iter().map(|item| WorkItem::new(item.payload)))
        .collect()
        .await;
    assert!(retried.iter().all(|item| !item.is_failed()));
    assert_eq!(queue.bodies().await.len(), 16);
}

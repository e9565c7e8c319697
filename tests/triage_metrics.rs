use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use cache_triage::cache::{CacheConfig, CacheEntry, MemoryCache};
use cache_triage::dispatch::{CacheDispatcher, cache_queue};
use cache_triage::pipeline::{ChannelNetworkQueue, TaskDelivery};
use cache_triage::request::{TrackedRequest, utf8_parser};
use metrics_util::debugging::DebuggingRecorder;

#[tokio::test]
async fn triage_emits_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let config = CacheConfig { capacity: 1 };
    let cache = Arc::new(MemoryCache::with_entries(
        &config,
        [
            (
                "evicted",
                CacheEntry::new("a", Duration::from_secs(60), Duration::from_secs(60)),
            ),
            (
                "hit",
                CacheEntry::new("b", Duration::from_secs(60), Duration::from_secs(60)),
            ),
        ],
    ));
    let (queue, inbox) = cache_queue();
    let (network, _network_inbox) = ChannelNetworkQueue::<TrackedRequest<String>>::channel();
    let delivery = TaskDelivery::try_current().expect("inside runtime");
    let dispatcher: CacheDispatcher<TrackedRequest<String>> =
        CacheDispatcher::new(inbox, Arc::new(network), cache, Arc::new(delivery));
    dispatcher.start().expect("start");

    for key in ["hit", "miss"] {
        queue
            .enqueue(TrackedRequest::new(key, utf8_parser()))
            .expect("queue open");
    }
    let mut triaged = dispatcher.triaged();
    tokio::time::timeout(Duration::from_secs(5), triaged.wait_for(|n| *n >= 2))
        .await
        .expect("triaged in time")
        .expect("dispatcher alive");
    dispatcher.quit();
    dispatcher.join().await.expect("join");

    let snapshot = snapshotter.snapshot().into_vec();
    let names: HashSet<String> = snapshot
        .iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "cache_triage_outcome_total",
        "cache_triage_triage_ms",
        "cache_triage_memory_hit_total",
        "cache_triage_memory_miss_total",
        "cache_triage_memory_evict_total",
    ];
    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }

    let outcomes: HashSet<String> = snapshot
        .iter()
        .filter(|(composite_key, _, _, _)| {
            composite_key.key().name() == "cache_triage_outcome_total"
        })
        .flat_map(|(composite_key, _, _, _)| {
            composite_key
                .key()
                .labels()
                .filter(|label| label.key() == "outcome")
                .map(|label| label.value().to_string())
                .collect::<Vec<_>>()
        })
        .collect();
    assert!(outcomes.contains("deliver"), "outcomes: {outcomes:?}");
    assert!(outcomes.contains("forward"), "outcomes: {outcomes:?}");
}

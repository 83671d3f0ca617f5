#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use kwatch_core::{Action, EventType, RawEvent, ResourceObject, StateSnapshot, Store, ThrottleConfig, ThrottleRule};
use kwatch_store::{spawn_aggregator, DispatchBridge, EventThrottle};
use tokio::time::{sleep, Instant};

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(u64, String)>>,
    t0: Mutex<Option<Instant>>,
}

impl Recorder {
    fn names(&self) -> Vec<String> { self.seen.lock().unwrap().iter().map(|(_, n)| n.clone()).collect() }
    fn at(&self) -> Vec<u64> { self.seen.lock().unwrap().iter().map(|(t, _)| *t).collect() }
}

impl Store for Recorder {
    fn dispatch(&self, action: Action) {
        let t0 = (*self.t0.lock().unwrap()).expect("t0 set");
        let ms = t0.elapsed().as_millis() as u64;
        let name = match action {
            Action::PutResource { object, .. } | Action::RemoveResource { object } => object.name,
            Action::ReceiveEvents { envelope, .. } => envelope.object.name,
            Action::ReportError { message, .. } => message,
        };
        self.seen.lock().unwrap().push((ms, name));
    }
    fn get_state(&self) -> Arc<StateSnapshot> { Arc::new(StateSnapshot::default()) }
}

fn ev(t: &str, kind: &str, name: &str) -> RawEvent {
    let raw = serde_json::json!({ "kind": kind, "metadata": { "name": name, "namespace": "default" } });
    RawEvent { event_type: EventType::from(t), object: ResourceObject::from_raw(raw).unwrap() }
}

fn setup(throttle: ThrottleConfig) -> (Arc<Recorder>, kwatch_store::AggregatorHandle) {
    let rec = Arc::new(Recorder::default());
    *rec.t0.lock().unwrap() = Some(Instant::now());
    let bridge = DispatchBridge::new(rec.clone(), "Event");
    let handle = spawn_aggregator(bridge, EventThrottle::new(&throttle, Instant::now()), Duration::from_millis(1000), 64);
    (rec, handle)
}

fn no_throttles() -> ThrottleConfig { ThrottleConfig { rules: vec![], purge_interval_secs: 120 } }

async fn sleep_until_ms(t0: Instant, ms: u64) { tokio::time::sleep_until(t0 + Duration::from_millis(ms)).await; }

#[tokio::test(start_paused = true)]
async fn burst_dispatches_together_in_arrival_order() {
    let t0 = Instant::now();
    let (rec, agg) = setup(no_throttles());
    let tx = agg.sender();
    sleep_until_ms(t0, 100).await;
    tx.send(ev("ADDED", "A", "a")).await.unwrap();
    sleep_until_ms(t0, 200).await;
    tx.send(ev("ADDED", "B", "b")).await.unwrap();
    sleep_until_ms(t0, 300).await;
    tx.send(ev("ADDED", "C", "c")).await.unwrap();
    sleep_until_ms(t0, 999).await;
    assert!(rec.names().is_empty(), "nothing dispatches before the first tick");
    sleep_until_ms(t0, 1001).await;
    assert_eq!(rec.names(), ["a", "b", "c"]);
    assert_eq!(rec.at(), [1000, 1000, 1000]);
}

#[tokio::test(start_paused = true)]
async fn events_between_ticks_dispatch_exactly_once_at_next_tick() {
    let t0 = Instant::now();
    let (rec, agg) = setup(no_throttles());
    let tx = agg.sender();
    tx.send(ev("ADDED", "Pod", "first")).await.unwrap();
    sleep_until_ms(t0, 1500).await;
    tx.send(ev("MODIFIED", "Pod", "second")).await.unwrap();
    sleep_until_ms(t0, 3500).await;
    assert_eq!(rec.names(), ["first", "second"]);
    assert_eq!(rec.at(), [1000, 2000]);
}

#[tokio::test(start_paused = true)]
async fn throttled_class_scenario() {
    let t0 = Instant::now();
    let (rec, agg) = setup(ThrottleConfig {
        rules: vec![ThrottleRule { kind: "Endpoints".into(), event_type: EventType::Modified, window_ms: 10_000 }],
        purge_interval_secs: 120,
    });
    let tx = agg.sender();
    tx.send(ev("MODIFIED", "Endpoints", "svc-a")).await.unwrap();
    sleep_until_ms(t0, 5000).await;
    tx.send(ev("MODIFIED", "Endpoints", "svc-a")).await.unwrap();
    sleep_until_ms(t0, 11_000).await;
    tx.send(ev("MODIFIED", "Endpoints", "svc-a")).await.unwrap();
    sleep_until_ms(t0, 12_500).await;
    assert_eq!(rec.at(), [1000, 12_000]);
}

#[tokio::test(start_paused = true)]
async fn unthrottled_class_passes_every_frame() {
    let (rec, agg) = setup(ThrottleConfig::default());
    let tx = agg.sender();
    for _ in 0..5 {
        tx.send(ev("MODIFIED", "Pod", "same")).await.unwrap();
    }
    sleep(Duration::from_millis(1100)).await;
    assert_eq!(rec.names().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn stop_discards_pending_and_halts_ticks() {
    let (rec, mut agg) = setup(no_throttles());
    let tx = agg.sender();
    tx.send(ev("ADDED", "Pod", "late")).await.unwrap();
    sleep(Duration::from_millis(500)).await;
    agg.stop();
    agg.stop();
    assert!(!agg.is_running());
    sleep(Duration::from_millis(5000)).await;
    assert!(rec.names().is_empty());
    assert!(tx.send(ev("ADDED", "Pod", "after")).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn outlives_its_producers_until_stopped() {
    let t0 = Instant::now();
    let (rec, mut agg) = setup(no_throttles());
    {
        let producer = agg.sender();
        producer.send(ev("ADDED", "Pod", "early")).await.unwrap();
    }
    sleep_until_ms(t0, 500).await;
    assert!(rec.names().is_empty(), "dropping producers does not flush early");
    sleep_until_ms(t0, 1001).await;
    assert_eq!(rec.at(), [1000]);
    assert!(agg.is_running());
    agg.sender().send(ev("ADDED", "Pod", "later")).await.unwrap();
    sleep_until_ms(t0, 2001).await;
    assert_eq!(rec.names(), ["early", "later"]);
    agg.stop();
    assert!(!agg.is_running());
}

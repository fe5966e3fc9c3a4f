//! Test suite for the flow coordinator

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use topic_flow::{Flow, FlowError, FlowSnapshot};

fn channel() -> (mpsc::UnboundedSender<Value>, mpsc::UnboundedReceiver<Value>) {
    topic_flow::init_tracing();
    mpsc::unbounded_channel()
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for a value")
        .expect("channel closed")
}

#[tokio::test]
async fn test_define_then_consume() {
    let flow = Flow::new();
    flow.define("foo", "bar");
    assert_eq!(flow.consume("foo").await.unwrap(), json!("bar"));
}

#[tokio::test]
async fn test_consume_before_define() {
    let flow = Flow::new();
    let pending = flow.consume("foo");
    flow.define("foo", "bar");
    assert_eq!(pending.await.unwrap(), json!("bar"));
}

#[tokio::test]
async fn test_sequential_consumes_dequeue_in_order() {
    let flow = Flow::new();
    for value in ["v1", "v2", "v3"] {
        flow.define("foo", value);
    }
    assert_eq!(flow.consume("foo").await.unwrap(), json!("v1"));
    assert_eq!(flow.consume("foo").await.unwrap(), json!("v2"));
    assert_eq!(flow.consume("foo").await.unwrap(), json!("v3"));
    assert!(flow.state().queue.is_empty());
}

#[tokio::test]
async fn test_publisher_emits_later() {
    let flow = Flow::new();
    let publisher = flow.publisher("foo");
    let pending = flow.consume("foo");
    publisher.publish("bar");
    assert_eq!(pending.await.unwrap(), json!("bar"));
}

#[tokio::test]
async fn test_define_future() {
    let flow = Flow::new();
    flow.define_future("foo", async { Ok(json!("bar")) });
    assert_eq!(flow.consume("foo").await.unwrap(), json!("bar"));
}

#[tokio::test]
async fn test_rejected_future_fails_consumer() {
    let flow = Flow::new();
    flow.define_future("foo", async { Err(anyhow::anyhow!("BOOM")) });
    let err = flow.consume("foo").await.unwrap_err();
    assert_eq!(err.to_string(), "BOOM");
}

#[tokio::test]
async fn test_rejected_future_reaches_catch() {
    let (tx, mut rx) = channel();
    let flow = Flow::new();
    flow.define_future("foo", async { Err(anyhow::anyhow!("BOOM")) })
        .consume_each("foo", |_, _| {})
        .catch(move |err| {
            let _ = tx.send(json!(err.to_string()));
        });
    assert_eq!(recv(&mut rx).await, json!("BOOM"));
}

#[tokio::test]
async fn test_define_with_producer() {
    let flow = Flow::new();
    flow.define_with("foo", |_| "bar");
    assert_eq!(flow.consume("foo").await.unwrap(), json!("bar"));
}

#[tokio::test]
async fn test_async_producer_rejection() {
    let flow = Flow::new();
    flow.define_async("greeting", |_| async { Err(anyhow::anyhow!("BOOM")) });
    let err = flow.consume("greeting").await.unwrap_err();
    assert_eq!(err, FlowError::defined("BOOM"));
}

#[tokio::test]
async fn test_publisher_producer_emits_from_task() {
    let flow = Flow::new();
    flow.define_publisher("foo", |publisher, _| {
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            publisher.publish("bar");
        });
    });
    assert_eq!(flow.consume("foo").await.unwrap(), json!("bar"));
}

#[tokio::test]
async fn test_callback_receives_every_event() {
    let (tx, mut rx) = channel();
    let flow = Flow::new();
    flow.define_publisher("foo", |publisher, _| {
        publisher.publish("bar").publish("qaz");
    });
    flow.consume_each("foo", move |value, _| {
        let _ = tx.send(value);
    });
    assert_eq!(recv(&mut rx).await, json!("bar"));
    assert_eq!(recv(&mut rx).await, json!("qaz"));
}

#[tokio::test]
async fn test_different_topics_chain() {
    let (tx, mut rx) = channel();
    let other = tx.clone();
    Flow::new()
        .define("foo", "bar")
        .define("qaz", "wsx")
        .consume_each("foo", move |value, _| {
            let _ = tx.send(json!({"foo": value}));
        })
        .consume_each("qaz", move |value, _| {
            let _ = other.send(json!({"qaz": value}));
        });
    assert_eq!(recv(&mut rx).await, json!({"foo": "bar"}));
    assert_eq!(recv(&mut rx).await, json!({"qaz": "wsx"}));
}

#[tokio::test]
async fn test_wildcard_sees_every_entry() {
    let (tx, mut rx) = channel();
    let flow = Flow::new();
    flow.define_async("foo", |_| async { Ok(json!("bar")) })
        .define_async("qaz", |_| async { Ok(json!("wsx")) })
        .consume_each("*", move |event, _| {
            let _ = tx.send(event);
        });
    let mut events = vec![recv(&mut rx).await, recv(&mut rx).await];
    events.sort_by_key(|e| e["name"].as_str().map(str::to_string));
    assert_eq!(
        events,
        vec![
            json!({"name": "foo", "data": "bar"}),
            json!({"name": "qaz", "data": "wsx"}),
        ]
    );
}

#[tokio::test]
async fn test_wildcard_late_join_replays_history() {
    let (tx, mut rx) = channel();
    let flow = Flow::new();
    flow.define("foo", "bar");
    tokio::task::yield_now().await;
    flow.consume_each("*", move |event, _| {
        let _ = tx.send(event);
    });
    assert_eq!(recv(&mut rx).await, json!({"name": "foo", "data": "bar"}));
}

#[tokio::test]
async fn test_multi_topic_consume() {
    let flow = Flow::new();
    flow.define(["foo", "qaz"], "bar");
    let data = flow.consume(["foo", "qaz"]).await.unwrap();
    assert_eq!(data, json!({"foo": "bar", "qaz": "bar"}));
}

#[tokio::test]
async fn test_multi_topic_waits_for_all() {
    let flow = Flow::new();
    let mut pending = Box::pin(flow.consume(["foo", "bar"]));
    flow.define("foo", 1);
    let early = tokio::time::timeout(Duration::from_millis(10), &mut pending).await;
    assert!(early.is_err());
    flow.define("bar", 2);
    assert_eq!(pending.await.unwrap(), json!({"foo": 1, "bar": 2}));
}

#[tokio::test]
async fn test_import_static_data() {
    let source = Flow::new();
    source.define("foo", "bar");
    let flow = Flow::with_imports([&source]);
    assert_eq!(flow.consume("foo").await.unwrap(), json!("bar"));
}

#[tokio::test]
async fn test_import_dynamic_data() {
    let source = Flow::new();
    let flow = Flow::with_imports([&source]);
    let pending = flow.consume("foo");
    source.define("foo", "bar");
    assert_eq!(pending.await.unwrap(), json!("bar"));
}

#[tokio::test]
async fn test_import_is_bidirectional() {
    let source = Flow::new();
    let flow = Flow::with_imports([&source]);
    flow.define("qaz", "wsx");
    assert_eq!(source.consume("qaz").await.unwrap(), json!("wsx"));
}

#[tokio::test]
async fn test_import_multiple_sources() {
    let first = Flow::new();
    first.define("foo", "bar");
    let second = Flow::new();
    second.define("qaz", "wsx");
    let flow = Flow::with_imports([&first, &second]);
    let data = flow.consume(["foo", "qaz"]).await.unwrap();
    assert_eq!(data, json!({"foo": "bar", "qaz": "wsx"}));
}

#[tokio::test]
async fn test_import_error() {
    let (tx, mut rx) = channel();
    let source = Flow::new();
    source.define("error", FlowError::defined("Boom"));
    let flow = Flow::with_imports([&source]);
    flow.catch(move |err| {
        let _ = tx.send(json!(err.to_string()));
    });
    assert_eq!(recv(&mut rx).await, json!("Boom"));
}

#[tokio::test]
async fn test_imported_rejection_reaches_runtime_consumer() {
    let (tx, mut rx) = channel();
    let source = Flow::new();
    source.define_async("name", |_| async { Err(anyhow::anyhow!("BOOM")) });

    let greeting = Flow::with_imports([&source]);
    greeting
        .define_async("greeting", |runtime| async move {
            let name = runtime.consume("name").await?;
            Ok(json!(format!("Hello {}", name)))
        })
        .consume_each("greeting", |_, _| {})
        .catch(move |err| {
            let _ = tx.send(json!(err.to_string()));
        });
    assert_eq!(recv(&mut rx).await, json!("BOOM"));
}

#[tokio::test]
async fn test_stops_after_error_sync() {
    let (tx, mut rx) = channel();
    let (foo, boo, too, catch) = (tx.clone(), tx.clone(), tx.clone(), tx);
    Flow::new()
        .define("foo", "faa")
        .define("boo", "baa")
        .define("error", FlowError::defined("Boom"))
        .define("too", "taa")
        .consume_each("foo", move |value, _| {
            let _ = foo.send(value);
        })
        .consume_each("boo", move |value, _| {
            let _ = boo.send(value);
        })
        .consume_each("too", move |_, _| {
            let _ = too.send(json!("should never happen"));
        })
        .catch(move |err| {
            let _ = catch.send(json!(err.to_string()));
        });

    assert_eq!(recv(&mut rx).await, json!("faa"));
    assert_eq!(recv(&mut rx).await, json!("baa"));
    assert_eq!(recv(&mut rx).await, json!("Boom"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_stops_after_error_async() {
    let (tx, mut rx) = channel();
    let too = tx.clone();
    let flow = Flow::new();
    flow.define("foo", "faa")
        .define("error", "Boom")
        .consume_each("foo", move |value, runtime| {
            let flow = runtime.flow().clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                flow.define("too", "taa");
            });
            let _ = tx.send(value);
        })
        .consume_each("too", move |_, _| {
            let _ = too.send(json!("should never happen"));
        })
        .catch(|_| {});

    assert_eq!(recv(&mut rx).await, json!("faa"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(flow.failure(), Some(FlowError::defined("Boom")));
}

#[tokio::test]
async fn test_consume_on_failed_flow_rejects() {
    let flow = Flow::new();
    flow.define("foo", "bar").define("error", "Boom");
    let err = flow.consume("foo").await.unwrap_err();
    assert_eq!(err.to_string(), "Boom");
}

#[tokio::test]
async fn test_error_valued_define_goes_to_error_channel() {
    let flow = Flow::new();
    let pending = flow.consume("error");
    flow.define("data", FlowError::defined("Boom"));
    assert_eq!(pending.await.unwrap(), json!("Boom"));
}

#[tokio::test]
async fn test_unhandled_failure_is_recorded() {
    let flow = Flow::new();
    flow.define("error", "Boom");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(flow.unhandled_failure(), Some(FlowError::defined("Boom")));

    let handled = Flow::new();
    handled.catch(|_| {}).define("error", "Boom");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(handled.unhandled_failure(), None);
}

#[tokio::test]
async fn test_chain_events() {
    let flow = Flow::new();
    flow.consume_each("foo", |value, runtime| {
        runtime.define("bar", json!(format!("{}-bar", value.as_str().unwrap_or_default())));
    })
    .consume_each("bar", |value, runtime| {
        runtime.define("qaz", json!(format!("{}-qaz", value.as_str().unwrap_or_default())));
    })
    .define("foo", "foo");
    assert_eq!(flow.consume("qaz").await.unwrap(), json!("foo-bar-qaz"));
}

#[tokio::test]
async fn test_chain_multi_topic_rounds() {
    let (tx, mut rx) = channel();
    let flow = Flow::new();
    flow.consume_each(["foo", "bar"], move |value, _| {
        let _ = tx.send(value);
    });
    flow.define("foo", 1).define("foo", 2).define("bar", "a");
    assert_eq!(recv(&mut rx).await, json!({"foo": 1, "bar": "a"}));
    flow.define("bar", "b");
    assert_eq!(recv(&mut rx).await, json!({"foo": 2, "bar": "b"}));
}

#[test]
fn test_state_pending_topics() {
    let flow = Flow::new();
    flow.consume_each("foo", |_, _| {}).catch(|_| {});
    assert_eq!(
        flow.state(),
        FlowSnapshot {
            pending: vec!["foo".to_string()],
            queue: Default::default(),
        }
    );
}

#[test]
fn test_state_pending_deduplicated() {
    let flow = Flow::new();
    flow.consume_each(vec!["foo", "bar", "bar"], |_, _| {})
        .consume_each(["foo", "qaz"], |_, _| {});
    assert_eq!(flow.state().pending, vec!["foo", "bar", "qaz"]);

    flow.define("foo", "");
    let state = flow.state();
    assert_eq!(state.pending, vec!["bar", "qaz"]);
    assert_eq!(state.queue.get("foo"), Some(&1));
}

#[test]
fn test_state_queue_counts() {
    let flow = Flow::new();
    flow.define("qaz", "")
        .define("wsx", "")
        .define("foo", "")
        .define("foo", "")
        .define("foo", "")
        .define("foo", "");
    let queue = serde_json::to_value(flow.state().queue).unwrap();
    assert_eq!(queue, json!({"foo": 4, "qaz": 1, "wsx": 1}));
}

#[test]
fn test_listener_ceiling_is_diagnostic_only() {
    let flow = Flow::new();
    let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    for _ in 0..15 {
        let hits = hits.clone();
        flow.consume_each("topic", move |_, _| {
            hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
    }
    flow.define("topic", true);
    assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 15);
}

#[test]
fn test_runtime_carries_caller_location() {
    let config = topic_flow::FlowConfig::default().with_caller_location("pkg/actions/greet");
    let flow = Flow::with_config(config).unwrap();
    let seen = Arc::new(parking_lot::Mutex::new(None));
    let slot = seen.clone();
    flow.consume_each("foo", move |_, runtime| {
        *slot.lock() = runtime.caller_location().map(|l| l.to_string());
    })
    .define("foo", 1);
    assert_eq!(seen.lock().as_deref(), Some("pkg/actions/greet"));
}

#[tokio::test]
async fn test_cancelled_consume_leaves_value_queued() {
    let flow = Flow::new();
    let cancelled = tokio::time::timeout(Duration::from_millis(5), flow.consume("foo")).await;
    assert!(cancelled.is_err());

    flow.define("foo", "bar");
    assert_eq!(flow.state().queue.get("foo"), Some(&1));
    assert!(flow.state().pending.is_empty());
    assert_eq!(flow.consume("foo").await.unwrap(), json!("bar"));
}

#[test]
fn test_dropped_consume_is_not_pending() {
    let flow = Flow::new();
    drop(flow.consume(["foo", "bar"]));
    assert!(flow.state().pending.is_empty());
}

#[test]
fn test_import_without_runtime_leaves_flows_unlinked() {
    let (left, right) = (Flow::new(), Flow::new());
    left.import(&right);
    right.define("foo", "bar");
    assert_eq!(right.state().queue.get("foo"), Some(&1));
    assert_eq!(left.state().queue.get("foo"), None);
}

#[test]
fn test_define_future_without_runtime_fails_flow() {
    let flow = Flow::new();
    flow.catch(|_| {});
    flow.define_future("foo", async { Ok(json!("never")) });
    let failure = flow.failure().unwrap();
    assert_eq!(failure.category(), "configuration");
}

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use wirecall::service::publish::{subscribe, PublisherParams};
use wirecall::{Endpoint, Runtime, RuntimeConfig, Server};

const TICKER: &str = "I_Ticker";
const TICK: u32 = 0;

fn collecting_dispatcher(runtime: &Runtime) -> (Server, Arc<Mutex<Vec<u64>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let dispatcher = Server::new(runtime);
    dispatcher.bind(TICKER).method_fn(TICK, 1, move |(seq,): (u64,)| {
        sink.lock().expect("collector lock").push(seq);
        Ok(())
    });
    (dispatcher, seen)
}

async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Every live subscriber sees published messages in publish order.
#[tokio::test]
async fn subscribers_receive_in_publish_order() -> Result<()> {
    let runtime = Runtime::default();
    let server = Server::new(&runtime);
    let publisher = server.create_publisher(PublisherParams::topic(TICKER))?;
    let handle = server.serve(&Endpoint::tcp("127.0.0.1", 0)).await?;

    let (dispatcher_a, seen_a) = collecting_dispatcher(&runtime);
    let (dispatcher_b, seen_b) = collecting_dispatcher(&runtime);
    let _sub_a = subscribe(
        &runtime,
        handle.endpoint().clone(),
        TICKER,
        &dispatcher_a,
        Duration::from_secs(1),
    )
    .await?;
    let _sub_b = subscribe(
        &runtime,
        handle.endpoint().clone(),
        TICKER,
        &dispatcher_b,
        Duration::from_secs(1),
    )
    .await?;
    assert_eq!(publisher.subscriber_count().await, 2);

    for seq in 1..=5u64 {
        let delivered = publisher.publish(TICK, 1, &(seq,)).await?;
        assert_eq!(delivered, 2);
    }

    wait_for(|| seen_a.lock().expect("lock").len() == 5, "subscriber a").await;
    wait_for(|| seen_b.lock().expect("lock").len() == 5, "subscriber b").await;
    assert_eq!(*seen_a.lock().expect("lock"), vec![1, 2, 3, 4, 5]);
    assert_eq!(*seen_b.lock().expect("lock"), vec![1, 2, 3, 4, 5]);

    server.shutdown();
    Ok(())
}

/// A dropped subscriber disappears from the fan-out set as soon as a
/// publish fails against it.
#[tokio::test]
async fn dropped_subscriber_is_removed() -> Result<()> {
    let runtime = Runtime::default();
    let server = Server::new(&runtime);
    let publisher = server.create_publisher(PublisherParams::topic(TICKER))?;
    let handle = server.serve(&Endpoint::tcp("127.0.0.1", 0)).await?;

    let (dispatcher_a, seen_a) = collecting_dispatcher(&runtime);
    let (dispatcher_b, _seen_b) = collecting_dispatcher(&runtime);
    let sub_a = subscribe(
        &runtime,
        handle.endpoint().clone(),
        TICKER,
        &dispatcher_a,
        Duration::from_secs(1),
    )
    .await?;
    let sub_b = subscribe(
        &runtime,
        handle.endpoint().clone(),
        TICKER,
        &dispatcher_b,
        Duration::from_secs(1),
    )
    .await?;
    assert_eq!(publisher.subscriber_count().await, 2);

    sub_b.close();
    // Publishing flushes the dead connection out of the set.
    for seq in 0..10u64 {
        let _ = publisher.publish(TICK, 1, &(seq,)).await?;
        if publisher.subscriber_count().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(publisher.subscriber_count().await, 1);

    wait_for(|| !seen_a.lock().expect("lock").is_empty(), "live subscriber").await;
    drop(sub_a);
    server.shutdown();
    Ok(())
}

/// Subscribing to a topic without a publisher is an error the caller
/// sees, not a hang.
#[tokio::test]
async fn subscription_to_unknown_topic_fails() -> Result<()> {
    let mut cfg = RuntimeConfig::default();
    cfg.call_timeout = Duration::from_secs(2);
    let runtime = Runtime::new(cfg);
    let server = Server::new(&runtime);
    let handle = server.serve(&Endpoint::tcp("127.0.0.1", 0)).await?;

    let (dispatcher, _) = collecting_dispatcher(&runtime);
    let err = subscribe(
        &runtime,
        handle.endpoint().clone(),
        "I_Nothing",
        &dispatcher,
        Duration::from_secs(1),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), wirecall::ErrorKind::Resource);

    server.shutdown();
    Ok(())
}

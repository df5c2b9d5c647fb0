use std::time::{Duration, Instant};

use anyhow::Result;
use wirecall::{Client, Endpoint, ErrorKind, Runtime, Server};

const SLOW: &str = "I_Slow";
const WORK: u32 = 0;

fn slow_server(runtime: &Runtime, work: Duration) -> Server {
    let server = Server::new(runtime);
    server.bind(SLOW).method_async(WORK, 1, move |(tag,): (String,)| async move {
        tokio::time::sleep(work).await;
        Ok(format!("done:{tag}"))
    });
    server
}

/// A handler that runs past the call timeout survives when the server
/// emits ping-back keepalives: every ping frame re-arms the client's
/// receive deadline.
#[tokio::test]
async fn ping_backs_keep_a_long_call_alive() -> Result<()> {
    let runtime = Runtime::default();
    let server = slow_server(&runtime, Duration::from_secs(3));
    let handle = server.serve(&Endpoint::tcp("127.0.0.1", 0)).await?;

    let mut client = Client::new(&runtime, handle.endpoint().clone());
    client.set_call_timeout(Duration::from_secs(2));
    client.set_ping_back_interval(Duration::from_secs(1));

    let started = Instant::now();
    let result: String = client.call(SLOW, WORK, 1, &("job".to_string(),)).await?;
    assert_eq!(result, "done:job");
    assert!(
        started.elapsed() >= Duration::from_secs(3),
        "the handler's full run time elapsed"
    );

    server.shutdown();
    Ok(())
}

/// Without ping-backs the same call hits the timeout.
#[tokio::test]
async fn long_call_without_ping_backs_times_out() -> Result<()> {
    let runtime = Runtime::default();
    let server = slow_server(&runtime, Duration::from_secs(5));
    let handle = server.serve(&Endpoint::tcp("127.0.0.1", 0)).await?;

    let mut client = Client::new(&runtime, handle.endpoint().clone());
    client.set_call_timeout(Duration::from_millis(500));

    let started = Instant::now();
    let err = client
        .call::<_, String>(SLOW, WORK, 1, &("job".to_string(),))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(3));

    server.shutdown();
    Ok(())
}

/// Cancellation aborts the in-flight receive; after a reset the stub
/// reconnects and works again.
#[tokio::test]
async fn cancel_aborts_an_in_flight_call() -> Result<()> {
    let runtime = Runtime::default();
    let server = slow_server(&runtime, Duration::from_secs(10));
    let handle = server.serve(&Endpoint::tcp("127.0.0.1", 0)).await?;

    let mut client = Client::new(&runtime, handle.endpoint().clone());
    client.set_call_timeout(Duration::from_secs(30));

    let cancel = client.cancel_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let err = client
        .call::<_, String>(SLOW, WORK, 1, &("job".to_string(),))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));

    // The sticky cancel must be re-armed before reuse.
    client.cancel_handle().reset();
    let quick_server = Server::new(&runtime);
    quick_server.bind(SLOW).method_fn(WORK, 1, |(tag,): (String,)| Ok(tag));
    let quick = quick_server.serve(&Endpoint::tcp("127.0.0.1", 0)).await?;
    let mut client = Client::new(&runtime, quick.endpoint().clone());
    let result: String = client.call(SLOW, WORK, 1, &("fast".to_string(),)).await?;
    assert_eq!(result, "fast");

    server.shutdown();
    quick_server.shutdown();
    Ok(())
}

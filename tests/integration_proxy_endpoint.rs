use std::time::Duration;

use anyhow::Result;
use wirecall::{Client, Endpoint, ErrorKind, ProxyEndpointAgent, Runtime, Server};

const DEMO: &str = "I_Demo";
const REVERSE: u32 = 0;

/// The full reverse-tunnel flow: a back-end registers an endpoint name on
/// the broker, a client targets `proxy://broker/name`, the broker pairs
/// the client with a fresh back-connection, and the call lands on the
/// back-end's dispatcher.
#[tokio::test]
async fn call_through_proxy_endpoint_reaches_the_back_end() -> Result<()> {
    let runtime = Runtime::default();

    // Broker: no user bindings, just the proxy built-ins.
    let broker = Server::new(&runtime);
    let broker_handle = broker.serve(&Endpoint::tcp("127.0.0.1", 0)).await?;
    let broker_endpoint = broker_handle.endpoint().clone();

    // Back-end: owns the demo interface, reachable only via the broker.
    let backend = Server::new(&runtime);
    backend
        .bind(DEMO)
        .method_fn(REVERSE, 1, |(mut items,): (Vec<String>,)| {
            items.reverse();
            Ok(items)
        });
    let agent = ProxyEndpointAgent::start(
        runtime.clone(),
        broker_endpoint.clone(),
        "svc",
        "",
        backend.clone(),
    );
    // Let the agent register and park its long poll.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut client = Client::new(&runtime, Endpoint::proxy(broker_endpoint.clone(), "svc"));
    client.set_connect_timeout(Duration::from_secs(5));
    let result: Vec<String> = client
        .call(DEMO, REVERSE, 1, &(vec!["one".to_string(), "two".to_string()],))
        .await?;
    assert_eq!(result, vec!["two", "one"]);

    // The spliced connection keeps serving subsequent calls.
    let result: Vec<String> = client
        .call(DEMO, REVERSE, 1, &(vec!["a".to_string(), "b".to_string(), "c".to_string()],))
        .await?;
    assert_eq!(result, vec!["c", "b", "a"]);

    agent.stop();
    broker.shutdown();
    backend.shutdown();
    Ok(())
}

/// An unregistered endpoint name fails fast with a resource error.
#[tokio::test]
async fn unknown_endpoint_name_is_unavailable() -> Result<()> {
    let runtime = Runtime::default();
    let broker = Server::new(&runtime);
    let broker_handle = broker.serve(&Endpoint::tcp("127.0.0.1", 0)).await?;

    let mut client = Client::new(
        &runtime,
        Endpoint::proxy(broker_handle.endpoint().clone(), "ghost"),
    );
    client.set_connect_timeout(Duration::from_secs(5));
    let err = client.ping().await.unwrap_err();
    assert!(matches!(
        err.kind(),
        ErrorKind::Resource | ErrorKind::Timeout | ErrorKind::Transport
    ));

    broker.shutdown();
    Ok(())
}

/// The broker rejects back-ends that present the wrong password.
#[tokio::test]
async fn wrong_endpoint_password_is_rejected() -> Result<()> {
    let mut cfg = wirecall::RuntimeConfig::default();
    cfg.proxy_endpoint_password = Some("sesame".to_string());
    let runtime = Runtime::new(cfg);

    let broker = Server::new(&runtime);
    let broker_handle = broker.serve(&Endpoint::tcp("127.0.0.1", 0)).await?;

    let mut control = Client::new(&runtime, broker_handle.endpoint().clone());
    let err = control
        .call::<_, ()>(
            wirecall::protocol::method_ids::BUILTIN_INTERFACE,
            wirecall::protocol::method_ids::SETUP_PROXY_ENDPOINT,
            2,
            &("svc".to_string(), "wrong".to_string()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);

    control
        .call::<_, ()>(
            wirecall::protocol::method_ids::BUILTIN_INTERFACE,
            wirecall::protocol::method_ids::SETUP_PROXY_ENDPOINT,
            2,
            &("svc".to_string(), "sesame".to_string()),
        )
        .await?;

    broker.shutdown();
    Ok(())
}

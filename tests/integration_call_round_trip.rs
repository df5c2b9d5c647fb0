use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use wirecall::{Client, Endpoint, ErrorKind, ProtocolFault, Runtime, Server};

const DEMO: &str = "I_Demo";
const REVERSE: u32 = 0;
const SHOUT: u32 = 1;

fn demo_server(runtime: &Runtime) -> Server {
    let server = Server::new(runtime);
    server
        .bind(DEMO)
        .method_fn(REVERSE, 1, |(mut items,): (Vec<String>,)| {
            items.reverse();
            Ok(items)
        })
        .method_fn(SHOUT, 2, |(text, times): (String, u32)| {
            Ok(text.repeat(times as usize))
        });
    server
}

/// The reverse-vector demo: in-out parameters travel as the reply value.
#[tokio::test]
async fn reverse_vector_round_trip() -> Result<()> {
    let runtime = Runtime::default();
    let server = demo_server(&runtime);
    let handle = server.serve(&Endpoint::tcp("127.0.0.1", 0)).await?;

    let mut client = Client::new(&runtime, handle.endpoint().clone());
    let args = (vec!["one".to_string(), "two".to_string(), "three".to_string()],);
    let result: Vec<String> = client.call(DEMO, REVERSE, 1, &args).await?;
    assert_eq!(result, vec!["three", "two", "one"]);

    // The transport is reused across calls on the same stub.
    let shout: String = client.call(DEMO, SHOUT, 2, &("ha".to_string(), 3u32)).await?;
    assert_eq!(shout, "hahaha");
    assert!(client.is_connected());

    let stats = server.stats();
    assert_eq!(stats.sessions_opened, 1);
    assert_eq!(stats.requests_dispatched, 2);

    server.shutdown();
    Ok(())
}

#[tokio::test]
async fn dispatch_failures_keep_the_session_open() -> Result<()> {
    let runtime = Runtime::default();
    let server = demo_server(&runtime);
    let handle = server.serve(&Endpoint::tcp("127.0.0.1", 0)).await?;
    let mut client = Client::new(&runtime, handle.endpoint().clone());

    let err = client
        .call::<_, Vec<String>>("I_Nowhere", 0, 1, &(vec!["x".to_string()],))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol(ProtocolFault::UnknownInterface));

    let err = client
        .call::<_, Vec<String>>(DEMO, 99, 1, &(vec!["x".to_string()],))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol(ProtocolFault::UnknownMethod));

    let err = client
        .call::<_, String>(DEMO, SHOUT, 1, &("only-one".to_string(),))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol(ProtocolFault::ArityMismatch));

    // The same connection still serves a correct call afterwards.
    let result: Vec<String> = client
        .call(DEMO, REVERSE, 1, &(vec!["a".to_string(), "b".to_string()],))
        .await?;
    assert_eq!(result, vec!["b", "a"]);
    assert_eq!(server.stats().sessions_opened, 1);

    server.shutdown();
    Ok(())
}

#[tokio::test]
async fn oneway_calls_complete_after_send() -> Result<()> {
    let runtime = Runtime::default();
    let server = Server::new(&runtime);
    let hits = Arc::new(AtomicU32::new(0));
    let handler_hits = hits.clone();
    server.bind("I_Counter").method_fn(0, 1, move |(n,): (u32,)| {
        handler_hits.fetch_add(n, Ordering::SeqCst);
        Ok(())
    });
    let handle = server.serve(&Endpoint::tcp("127.0.0.1", 0)).await?;

    let mut client = Client::new(&runtime, handle.endpoint().clone());
    client.call_oneway("I_Counter", 0, 1, &(5u32,)).await?;
    client.call_oneway("I_Counter", 0, 1, &(7u32,)).await?;

    // One-way: no reply to wait on, so poll the side effect.
    for _ in 0..50 {
        if hits.load(Ordering::SeqCst) == 12 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(hits.load(Ordering::SeqCst), 12);

    server.shutdown();
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn local_socket_round_trip() -> Result<()> {
    let runtime = Runtime::default();
    let server = demo_server(&runtime);
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("demo.sock").to_string_lossy().to_string();
    let handle = server.serve(&Endpoint::local(path)).await?;

    let mut client = Client::new(&runtime, handle.endpoint().clone());
    let result: Vec<String> = client
        .call(DEMO, REVERSE, 1, &(vec!["x".to_string(), "y".to_string()],))
        .await?;
    assert_eq!(result, vec!["y", "x"]);

    server.shutdown();
    Ok(())
}

#[tokio::test]
async fn udp_round_trip_single_datagram() -> Result<()> {
    let runtime = Runtime::default();
    let server = demo_server(&runtime);
    let handle = server.serve(&Endpoint::udp("127.0.0.1", 0)).await?;

    let mut client = Client::new(&runtime, handle.endpoint().clone());
    let result: Vec<String> = client
        .call(DEMO, REVERSE, 1, &(vec!["p".to_string(), "q".to_string()],))
        .await?;
    assert_eq!(result, vec!["q", "p"]);

    server.shutdown();
    Ok(())
}

/// The text archive negotiates per request: the header names the
/// protocol, and the server encodes its reply with the same one.
#[tokio::test]
async fn json_archive_round_trip() -> Result<()> {
    let runtime = Runtime::default();
    let server = demo_server(&runtime);
    let handle = server.serve(&Endpoint::tcp("127.0.0.1", 0)).await?;

    let mut client = Client::new(&runtime, handle.endpoint().clone());
    client.set_archive_protocol(wirecall::ArchiveProtocol::Json);
    let result: Vec<String> = client
        .call(DEMO, REVERSE, 1, &(vec!["json".to_string(), "text".to_string()],))
        .await?;
    assert_eq!(result, vec!["text", "json"]);

    server.shutdown();
    Ok(())
}

#[tokio::test]
async fn endpoint_string_forms_drive_clients() -> Result<()> {
    let runtime = Runtime::default();
    let server = demo_server(&runtime);
    let handle = server.serve(&Endpoint::tcp("127.0.0.1", 0)).await?;
    let endpoint_str = handle.endpoint().to_string();

    let mut client = Client::from_endpoint_str(&runtime, &endpoint_str)?;
    client.ping().await?;

    server.shutdown();
    Ok(())
}

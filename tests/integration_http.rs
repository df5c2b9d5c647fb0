use anyhow::Result;
use wirecall::{Client, Endpoint, Runtime, Server};

const STORE: &str = "I_Store";
const GET_BLOB: u32 = 0;
const PUT_BLOB: u32 = 1;

fn store_server(runtime: &Runtime) -> Server {
    let server = Server::new(runtime);
    server
        .bind(STORE)
        .method_fn(GET_BLOB, 1, |(len,): (u32,)| {
            Ok((0..len).map(|i| (i % 256) as u8).collect::<Vec<u8>>())
        })
        .method_fn(PUT_BLOB, 1, |(data,): (Vec<u8>,)| Ok(data.len() as u64));
    server
}

/// Calls tunnel through HTTP POST requests and responses.
#[tokio::test]
async fn http_round_trip() -> Result<()> {
    let runtime = Runtime::default();
    let server = store_server(&runtime);
    let handle = server
        .serve(&Endpoint::http("127.0.0.1", 0, "/rpc"))
        .await?;

    let mut client = Client::new(&runtime, handle.endpoint().clone());
    let stored: u64 = client.call(STORE, PUT_BLOB, 1, &(vec![9u8; 100],)).await?;
    assert_eq!(stored, 100);

    // Session cookie and index persist across requests on the stub.
    let stored: u64 = client.call(STORE, PUT_BLOB, 1, &(vec![7u8; 50],)).await?;
    assert_eq!(stored, 50);

    server.shutdown();
    Ok(())
}

/// A reply larger than one chunk arrives with chunked transfer encoding
/// and reassembles into a single payload.
#[tokio::test]
async fn http_chunked_response_reassembles() -> Result<()> {
    let runtime = Runtime::default();
    let server = store_server(&runtime);
    let handle = server
        .serve(&Endpoint::http("127.0.0.1", 0, "/rpc"))
        .await?;

    let mut client = Client::new(&runtime, handle.endpoint().clone());
    let blob: Vec<u8> = client.call(STORE, GET_BLOB, 1, &(10_240u32,)).await?;
    assert_eq!(blob.len(), 10_240);
    let expected: Vec<u8> = (0..10_240u32).map(|i| (i % 256) as u8).collect();
    assert_eq!(blob, expected);

    server.shutdown();
    Ok(())
}

/// HTTPS needs a TLS record-layer filter; none ships with the crate, so
/// both serving and connecting report the missing factory.
#[tokio::test]
async fn https_requires_registered_tls_filter() -> Result<()> {
    let runtime = Runtime::default();
    let server = store_server(&runtime);
    let err = server
        .serve(&Endpoint::Https {
            host: "127.0.0.1".to_string(),
            port: 0,
            path: "/rpc".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), wirecall::ErrorKind::Filter);

    let mut client = Client::new(
        &runtime,
        Endpoint::Https {
            host: "127.0.0.1".to_string(),
            port: 1,
            path: "/rpc".to_string(),
        },
    );
    let err = client.ping().await.unwrap_err();
    assert!(matches!(
        err.kind(),
        wirecall::ErrorKind::Filter | wirecall::ErrorKind::Timeout
    ));

    server.shutdown();
    Ok(())
}

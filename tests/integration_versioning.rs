use anyhow::Result;
use wirecall::protocol::{ARCHIVE_VERSION, RUNTIME_VERSION};
use wirecall::{Client, Endpoint, Runtime, Server};

const DEMO: &str = "I_Demo";
const ECHO: u32 = 0;

fn echo_server(runtime: &Runtime) -> Server {
    let server = Server::new(runtime);
    server.bind(DEMO).method_fn(ECHO, 1, |(s,): (String,)| Ok(s));
    server
}

/// A client opening with a newer runtime version than the server speaks
/// gets a versioning error carrying the server's versions, retries once
/// with the advised pair, and the call succeeds.
#[tokio::test]
async fn version_mismatch_retries_with_advised_versions() -> Result<()> {
    let runtime = Runtime::default();
    let server = echo_server(&runtime);
    let handle = server.serve(&Endpoint::tcp("127.0.0.1", 0)).await?;

    let mut client = Client::new(&runtime, handle.endpoint().clone());
    client.set_versions(RUNTIME_VERSION + 2, ARCHIVE_VERSION);

    let echoed: String = client.call(DEMO, ECHO, 1, &("hello".to_string(),)).await?;
    assert_eq!(echoed, "hello");
    // The stub recorded the server-advised pair for subsequent calls.
    assert_eq!(client.versions(), (RUNTIME_VERSION, ARCHIVE_VERSION));

    // The in-band error never tore the connection down.
    assert_eq!(server.stats().sessions_opened, 1);

    server.shutdown();
    Ok(())
}

/// Re-pinning a bad version later triggers the same advise-and-retry on
/// the live connection.
#[tokio::test]
async fn repinned_version_renegotiates_on_a_live_connection() -> Result<()> {
    let runtime = Runtime::default();
    let server = echo_server(&runtime);
    let handle = server.serve(&Endpoint::tcp("127.0.0.1", 0)).await?;

    let mut client = Client::new(&runtime, handle.endpoint().clone());
    let _: String = client.call(DEMO, ECHO, 1, &("warm".to_string(),)).await?;

    client.set_versions(RUNTIME_VERSION + 5, ARCHIVE_VERSION);
    let echoed: String = client.call(DEMO, ECHO, 1, &("again".to_string(),)).await?;
    assert_eq!(echoed, "again");
    assert_eq!(client.versions(), (RUNTIME_VERSION, ARCHIVE_VERSION));
    assert_eq!(server.stats().sessions_opened, 1);

    server.shutdown();
    Ok(())
}

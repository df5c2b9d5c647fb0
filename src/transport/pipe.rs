//! Named pipe transport (Windows).
//!
//! On other platforms the endpoint parses and prints, but connect and
//! accept fail with a transport error naming the platform constraint.

use crate::error::Result;
use crate::transport::conn::BoxedStream;

#[cfg(windows)]
pub async fn connect_client(name: &str) -> Result<BoxedStream> {
    use std::time::Duration;
    use tokio::net::windows::named_pipe::ClientOptions;

    // The server may be between accept cycles; retry briefly on busy.
    const ERROR_PIPE_BUSY: i32 = 231;
    loop {
        match ClientOptions::new().open(name) {
            Ok(client) => return Ok(Box::new(client)),
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(not(windows))]
pub async fn connect_client(name: &str) -> Result<BoxedStream> {
    Err(crate::error::Error::transport(format!(
        "named pipe endpoint {name} is only available on Windows"
    )))
}

/// Accepts one inbound pipe connection, returning the connected stream and
/// a fresh listener instance for the next accept.
#[cfg(windows)]
pub async fn accept(name: &str) -> Result<BoxedStream> {
    use tokio::net::windows::named_pipe::ServerOptions;

    let server = ServerOptions::new().create(name)?;
    server.connect().await?;
    Ok(Box::new(server))
}

#[cfg(not(windows))]
pub async fn accept(name: &str) -> Result<BoxedStream> {
    Err(crate::error::Error::transport(format!(
        "named pipe endpoint {name} is only available on Windows"
    )))
}

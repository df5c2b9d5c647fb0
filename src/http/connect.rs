//! HTTP CONNECT tunnelling.
//!
//! When an outbound HTTP proxy sits between a client and the server, the
//! client opens its connection to the proxy and asks for a tunnel with
//! `CONNECT host:port HTTP/1.1`. On 407 the proxy lists acceptable
//! authentication schemes; they are tried in the order offered. Basic is
//! supported with configured credentials; Digest, NTLM and Negotiate are
//! recognised so the cycle can fall through past them, but require platform
//! security packages this crate does not bind.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::http::HttpMessage;

const MAX_HEAD_LEN: usize = 16 * 1024;
const MAX_HANDSHAKE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthScheme {
    Basic,
    Digest,
    Ntlm,
    Negotiate,
}

impl AuthScheme {
    fn parse(offer: &str) -> Option<AuthScheme> {
        let scheme = offer.split_whitespace().next()?;
        if scheme.eq_ignore_ascii_case("Basic") {
            Some(AuthScheme::Basic)
        } else if scheme.eq_ignore_ascii_case("Digest") {
            Some(AuthScheme::Digest)
        } else if scheme.eq_ignore_ascii_case("NTLM") {
            Some(AuthScheme::Ntlm)
        } else if scheme.eq_ignore_ascii_case("Negotiate") {
            Some(AuthScheme::Negotiate)
        } else {
            None
        }
    }
}

fn connect_request(host: &str, port: u16, auth_header: Option<&str>) -> String {
    let mut req = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Connection: Keep-Alive\r\n"
    );
    if let Some(header) = auth_header {
        req.push_str(header);
    }
    req.push_str("\r\n");
    req
}

async fn read_response<S>(stream: &mut S) -> Result<HttpMessage>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut scratch = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > MAX_HEAD_LEN {
            return Err(Error::framing("proxy response head exceeds size limit"));
        }
        let n = stream.read(&mut scratch).await?;
        if n == 0 {
            return Err(Error::transport("proxy closed connection during handshake"));
        }
        buf.extend_from_slice(&scratch[..n]);
    };

    let msg = HttpMessage::parse(&buf[..head_end])?;

    // Drain any body (407 pages often carry one) so the next request
    // starts on a clean stream.
    let mut remaining = msg
        .content_length
        .saturating_sub(buf.len() - head_end);
    while remaining > 0 {
        let n = stream.read(&mut scratch).await?;
        if n == 0 {
            return Err(Error::transport("proxy closed connection during handshake"));
        }
        remaining = remaining.saturating_sub(n);
    }
    Ok(msg)
}

/// Establishes a CONNECT tunnel to `host:port` over `stream`, which must be
/// freshly connected to the proxy. On return the stream carries raw bytes
/// to the target.
pub async fn establish_tunnel<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    credentials: Option<&(String, String)>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut auth: Option<AuthScheme> = None;
    let mut offered: Vec<AuthScheme> = Vec::new();
    let mut tried = 0usize;

    loop {
        tried += 1;
        if tried > MAX_HANDSHAKE_ATTEMPTS {
            return Err(Error::transport("proxy authentication failed on all schemes"));
        }

        let auth_header = match (auth, credentials) {
            (Some(AuthScheme::Basic), Some((user, pass))) => {
                let token = BASE64.encode(format!("{user}:{pass}"));
                Some(format!("Proxy-Authorization: Basic {token}\r\n"))
            }
            _ => None,
        };
        let request = connect_request(host, port, auth_header.as_deref());
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        let response = read_response(stream).await?;
        match response.status() {
            Some(200) => {
                debug!(host, port, "proxy tunnel established");
                return Ok(());
            }
            Some(407) => {
                if offered.is_empty() {
                    offered = response
                        .header_values("Proxy-Authenticate")
                        .filter_map(AuthScheme::parse)
                        .collect();
                    if offered.is_empty() {
                        return Err(Error::transport(
                            "proxy requires authentication but offered no known scheme",
                        ));
                    }
                }
                // Advance to the next scheme we can actually drive.
                let next = loop {
                    if offered.is_empty() {
                        return Err(Error::transport(
                            "proxy authentication failed on all schemes",
                        ));
                    }
                    let candidate = offered.remove(0);
                    match candidate {
                        AuthScheme::Basic if credentials.is_some() => break candidate,
                        AuthScheme::Basic => {
                            warn!("proxy offered Basic but no credentials are configured");
                        }
                        other => {
                            warn!(scheme = ?other, "proxy auth scheme not supported, trying next");
                        }
                    }
                };
                auth = Some(next);
            }
            other => {
                return Err(Error::transport(format!(
                    "proxy refused CONNECT: {:?} ({})",
                    other, response.response_line
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn tunnel_succeeds_on_200() {
        let (mut client_end, mut proxy_end) = duplex(4096);

        let proxy = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let n = proxy_end.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
            proxy_end
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
        });

        establish_tunnel(&mut client_end, "example.com", 443, None)
            .await
            .unwrap();
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn tunnel_cycles_to_basic_after_407() {
        let (mut client_end, mut proxy_end) = duplex(8192);
        let creds = ("user".to_string(), "secret".to_string());

        let proxy = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let n = proxy_end.read(&mut buf).await.unwrap();
            assert!(!String::from_utf8_lossy(&buf[..n]).contains("Proxy-Authorization"));
            proxy_end
                .write_all(
                    b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                      Proxy-Authenticate: NTLM\r\n\
                      Proxy-Authenticate: Basic realm=\"proxy\"\r\n\
                      Content-Length: 0\r\n\r\n",
                )
                .await
                .unwrap();

            let n = proxy_end.read(&mut buf).await.unwrap();
            let retry = String::from_utf8_lossy(&buf[..n]).to_string();
            // NTLM is unsupported, so the cycle falls through to Basic.
            let token = BASE64.encode("user:secret");
            assert!(retry.contains(&format!("Proxy-Authorization: Basic {token}")));
            proxy_end
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
        });

        establish_tunnel(&mut client_end, "internal", 8080, Some(&creds))
            .await
            .unwrap();
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn refusal_is_a_transport_error() {
        let (mut client_end, mut proxy_end) = duplex(4096);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = proxy_end.read(&mut buf).await.unwrap();
            proxy_end
                .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let err = establish_tunnel(&mut client_end, "blocked", 80, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transport);
    }
}

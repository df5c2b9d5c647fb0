//! # HTTP Framing
//!
//! Wraps framed messages in HTTP requests and responses so calls can pass
//! through web infrastructure. The HTTP envelope is the outermost filter on
//! an HTTP or HTTPS endpoint: a client `write` becomes a `POST` with the
//! frame as its body, a server `write` becomes the matching response.
//!
//! Two body encodings are supported on receive: `Content-Length` and
//! `Transfer-Encoding: chunked`. Responses switch to chunked encoding when
//! the body exceeds one chunk. Each connection carries a server-assigned
//! session id and a monotonically increasing per-session index in custom
//! headers; the first response also sets a session cookie that the client
//! echoes from then on. An application-supplied [`HttpMessageVerifier`] can
//! stamp and check a verification header derived from the body bytes.

pub mod connect;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::buffer::{concat, ByteBuffer};
use crate::error::{Error, Result};
use crate::filter::{filter_ids, Filter, FilterId};

/// Session id header, assigned by the server on first contact.
pub const HEADER_SESSION_ID: &str = "X-RCF-SessionId";
/// Per-session request counter header, strictly increasing.
pub const HEADER_SESSION_INDEX: &str = "X-RCF-SessionIndex";
/// Optional message verification header.
pub const HEADER_VERIFY: &str = "X-RCF-Verify";
/// Session cookie set by the first response.
pub const SESSION_COOKIE: &str = "RCFSESSION";

/// Responses larger than one chunk are sent with chunked encoding, split at
/// this size.
pub const RESPONSE_CHUNK_LEN: usize = 8192;

const MAX_HEAD_LEN: usize = 16 * 1024;

/// Verifies HTTP message payloads through custom headers.
///
/// `apply` computes the outgoing header for a payload; `verify` checks the
/// inbound header against the received payload. A verification failure
/// disconnects the session.
pub trait HttpMessageVerifier: Send + Sync {
    fn apply(&self, body: &[u8]) -> (String, String);

    fn verify(&self, message: &HttpMessage, body: &[u8]) -> Result<()>;
}

/// A parsed HTTP message head (request or response).
#[derive(Debug, Default, Clone)]
pub struct HttpMessage {
    /// `POST /x HTTP/1.1` or empty for responses.
    pub request_line: String,
    /// `HTTP/1.1 200 OK` or empty for requests.
    pub response_line: String,
    /// Ordered header list; lookup is case-insensitive.
    pub headers: Vec<(String, String)>,
    /// Bytes occupied by the head including the blank line.
    pub head_len: usize,
    /// Parsed `Content-Length`, zero if absent.
    pub content_length: usize,
    /// True when `Transfer-Encoding: chunked`.
    pub chunked: bool,
}

impl HttpMessage {
    /// Parses a complete head (`data` must end at the blank line).
    pub fn parse(data: &[u8]) -> Result<HttpMessage> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::framing("http head is not valid utf-8"))?;
        let mut lines = text.split("\r\n");
        let first = lines
            .next()
            .ok_or_else(|| Error::framing("empty http head"))?;

        let mut msg = HttpMessage {
            head_len: data.len(),
            ..Default::default()
        };
        if first.starts_with("HTTP/") {
            msg.response_line = first.to_string();
        } else {
            msg.request_line = first.to_string();
        }

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(Error::framing(format!("malformed http header line: {line}")));
            };
            msg.headers
                .push((name.trim().to_string(), value.trim().to_string()));
        }

        if let Some(te) = msg.header_value("Transfer-Encoding") {
            msg.chunked = te.eq_ignore_ascii_case("chunked");
        }
        if let Some(cl) = msg.header_value("Content-Length") {
            msg.content_length = cl
                .parse()
                .map_err(|_| Error::framing(format!("bad Content-Length: {cl}")))?;
        }
        Ok(msg)
    }

    /// First matching header value, name compared case-insensitively.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All matching header values, in order of appearance.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Numeric status of a response line.
    pub fn status(&self) -> Option<u16> {
        self.response_line.split_whitespace().nth(1)?.parse().ok()
    }
}

/// Locates the end of the head. `None` until the blank line arrives.
fn find_head_end(data: &[u8]) -> Result<Option<usize>> {
    if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
        return Ok(Some(pos + 4));
    }
    if data.len() > MAX_HEAD_LEN {
        return Err(Error::framing("http head exceeds size limit"));
    }
    Ok(None)
}

/// Scans a chunked body. Returns the assembled body and the number of
/// consumed bytes once the terminal chunk is present, `None` otherwise.
fn scan_chunked_body(data: &[u8]) -> Result<Option<(Vec<u8>, usize)>> {
    let mut body = Vec::new();
    let mut pos = 0;
    loop {
        let Some(line_end) = data[pos..].windows(2).position(|w| w == b"\r\n") else {
            return Ok(None);
        };
        let size_line = std::str::from_utf8(&data[pos..pos + line_end])
            .map_err(|_| Error::framing("chunk size line not utf-8"))?;
        let size_field = size_line.split(';').next().unwrap_or("").trim();
        let chunk_len = usize::from_str_radix(size_field, 16)
            .map_err(|_| Error::framing(format!("bad chunk size: {size_field}")))?;
        pos += line_end + 2;

        if chunk_len == 0 {
            // Terminal chunk ends with one more CRLF (no trailers sent).
            if data.len() < pos + 2 {
                return Ok(None);
            }
            return Ok(Some((body, pos + 2)));
        }
        if data.len() < pos + chunk_len + 2 {
            return Ok(None);
        }
        body.extend_from_slice(&data[pos..pos + chunk_len]);
        pos += chunk_len;
        if &data[pos..pos + 2] != b"\r\n" {
            return Err(Error::framing("chunk data not terminated by CRLF"));
        }
        pos += 2;
    }
}

/// Encodes a body with chunked transfer encoding.
fn encode_chunked(body: &[u8], out: &mut Vec<u8>) {
    for chunk in body.chunks(RESPONSE_CHUNK_LEN) {
        out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
}

enum Side {
    Client {
        host: String,
        port: u16,
        url_path: String,
        cookies: HashMap<String, String>,
    },
    Server {
        session_id: Option<String>,
        last_index: u32,
        cookie_sent: bool,
    },
}

/// The HTTP envelope filter. One instance per connection, client or server
/// side.
pub struct HttpFrameFilter {
    side: Side,
    session_id: String,
    session_index: u32,
    verifier: Option<Arc<dyn HttpMessageVerifier>>,
    rx: Vec<u8>,
}

impl HttpFrameFilter {
    pub fn new_client(
        host: impl Into<String>,
        port: u16,
        url_path: impl Into<String>,
        verifier: Option<Arc<dyn HttpMessageVerifier>>,
    ) -> Self {
        HttpFrameFilter {
            side: Side::Client {
                host: host.into(),
                port,
                url_path: url_path.into(),
                cookies: HashMap::new(),
            },
            session_id: Uuid::new_v4().to_string(),
            session_index: 0,
            verifier,
            rx: Vec::new(),
        }
    }

    pub fn new_server(verifier: Option<Arc<dyn HttpMessageVerifier>>) -> Self {
        HttpFrameFilter {
            side: Side::Server {
                session_id: None,
                last_index: 0,
                cookie_sent: false,
            },
            session_id: String::new(),
            session_index: 0,
            verifier,
            rx: Vec::new(),
        }
    }

    /// The session id in use on this connection.
    pub fn http_session_id(&self) -> &str {
        match &self.side {
            Side::Client { .. } => &self.session_id,
            Side::Server { session_id, .. } => session_id.as_deref().unwrap_or(""),
        }
    }

    fn write_client_request(&mut self, body: &[u8], out: &mut Vec<ByteBuffer>) {
        let Side::Client {
            host,
            port,
            url_path,
            cookies,
        } = &self.side
        else {
            unreachable!("client write on server filter");
        };
        self.session_index += 1;

        let mut head = String::with_capacity(256);
        head.push_str(&format!("POST {url_path} HTTP/1.1\r\n"));
        head.push_str(&format!("Host: {host}:{port}\r\n"));
        head.push_str("Accept: */*\r\n");
        head.push_str("Connection: Keep-Alive\r\n");
        head.push_str(&format!("Content-Length: {}\r\n", body.len()));
        head.push_str(&format!("{HEADER_SESSION_ID}: {}\r\n", self.session_id));
        head.push_str(&format!("{HEADER_SESSION_INDEX}: {}\r\n", self.session_index));
        if !cookies.is_empty() {
            let mut pairs: Vec<String> =
                cookies.iter().map(|(k, v)| format!("{k}={v}")).collect();
            pairs.sort();
            head.push_str(&format!("Cookie: {}\r\n", pairs.join("; ")));
        }
        if let Some(verifier) = &self.verifier {
            let (name, value) = verifier.apply(body);
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str("\r\n");

        let mut wire = head.into_bytes();
        wire.extend_from_slice(body);
        out.push(ByteBuffer::from_vec(wire));
    }

    fn write_server_response(&mut self, body: &[u8], out: &mut Vec<ByteBuffer>) {
        let chunked = body.len() > RESPONSE_CHUNK_LEN;
        let mut head = String::with_capacity(256);
        head.push_str("HTTP/1.1 200 OK\r\n");
        head.push_str("Connection: Keep-Alive\r\n");
        head.push_str(&format!("{HEADER_SESSION_ID}: {}\r\n", self.session_id));
        head.push_str(&format!("{HEADER_SESSION_INDEX}: {}\r\n", self.session_index));
        if let Some(verifier) = &self.verifier {
            let (name, value) = verifier.apply(body);
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        if let Side::Server { cookie_sent, .. } = &mut self.side {
            if !*cookie_sent {
                head.push_str(&format!(
                    "Set-Cookie: {SESSION_COOKIE}={}; Path=/\r\n",
                    self.session_id
                ));
                *cookie_sent = true;
            }
        }
        let mut wire;
        if chunked {
            head.push_str("Transfer-Encoding: chunked\r\n\r\n");
            wire = head.into_bytes();
            encode_chunked(body, &mut wire);
        } else {
            head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
            wire = head.into_bytes();
            wire.extend_from_slice(body);
        }
        out.push(ByteBuffer::from_vec(wire));
    }

    /// Consumes one complete HTTP message from the receive buffer, if
    /// present, returning its body.
    fn try_consume_message(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(head_end) = find_head_end(&self.rx)? else {
            return Ok(None);
        };
        let msg = HttpMessage::parse(&self.rx[..head_end])?;

        let (body, consumed) = if msg.chunked {
            match scan_chunked_body(&self.rx[head_end..])? {
                Some((body, body_consumed)) => (body, head_end + body_consumed),
                None => return Ok(None),
            }
        } else {
            let total = head_end + msg.content_length;
            if self.rx.len() < total {
                return Ok(None);
            }
            (self.rx[head_end..total].to_vec(), total)
        };

        self.rx.drain(..consumed);
        self.process_head(&msg, &body)?;
        Ok(Some(body))
    }

    fn process_head(&mut self, msg: &HttpMessage, body: &[u8]) -> Result<()> {
        if let Some(verifier) = &self.verifier {
            verifier.verify(msg, body)?;
        }
        match &mut self.side {
            Side::Client { cookies, .. } => {
                let status = msg
                    .status()
                    .ok_or_else(|| Error::framing("missing http status line"))?;
                if status != 200 {
                    return Err(Error::framing(format!(
                        "http error response: {}",
                        msg.response_line
                    )));
                }
                for set_cookie in msg.header_values("Set-Cookie") {
                    if let Some((name, value)) =
                        set_cookie.split(';').next().and_then(|p| p.split_once('='))
                    {
                        debug!(cookie = name.trim(), "storing http cookie");
                        cookies.insert(name.trim().to_string(), value.trim().to_string());
                    }
                }
            }
            Side::Server {
                session_id,
                last_index,
                ..
            } => {
                if !msg.request_line.starts_with("POST ") {
                    return Err(Error::framing(format!(
                        "unexpected http request: {}",
                        msg.request_line
                    )));
                }
                let peer_session = msg
                    .header_value(HEADER_SESSION_ID)
                    .unwrap_or_default()
                    .to_string();
                match session_id {
                    None => {
                        let assigned = if peer_session.is_empty() {
                            Uuid::new_v4().to_string()
                        } else {
                            peer_session
                        };
                        *session_id = Some(assigned.clone());
                        self.session_id = assigned;
                    }
                    Some(existing) => {
                        if !peer_session.is_empty() && peer_session != *existing {
                            return Err(Error::framing("http session id changed mid-connection"));
                        }
                    }
                }
                if let Some(index) = msg.header_value(HEADER_SESSION_INDEX) {
                    let index: u32 = index
                        .parse()
                        .map_err(|_| Error::framing("bad http session index"))?;
                    if index <= *last_index {
                        return Err(Error::framing(format!(
                            "http session index went backwards: {index} after {last_index}",
                        )));
                    }
                    *last_index = index;
                    self.session_index = index;
                }
            }
        }
        Ok(())
    }
}

impl Filter for HttpFrameFilter {
    fn filter_id(&self) -> FilterId {
        filter_ids::HTTP_FRAME
    }

    fn write(&mut self, input: &[ByteBuffer], out: &mut Vec<ByteBuffer>) -> Result<()> {
        let body = concat(input);
        if matches!(self.side, Side::Client { .. }) {
            self.write_client_request(body.as_slice(), out);
        } else {
            self.write_server_response(body.as_slice(), out);
        }
        Ok(())
    }

    fn read(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.rx.extend_from_slice(input);
        while let Some(body) = self.try_consume_message()? {
            out.extend_from_slice(&body);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.rx.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pump(filter: &mut HttpFrameFilter, wire: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        filter.read(wire, &mut out).unwrap();
        out
    }

    #[test]
    fn request_response_round_trip() {
        let mut client = HttpFrameFilter::new_client("127.0.0.1", 80, "/", None);
        let mut server = HttpFrameFilter::new_server(None);

        let payload = vec![1u8, 2, 3, 4];
        let mut wire = Vec::new();
        client
            .write(&[ByteBuffer::from_vec(payload.clone())], &mut wire)
            .unwrap();
        let request = concat(&wire);
        assert!(request.as_slice().starts_with(b"POST / HTTP/1.1\r\n"));

        let seen = pump(&mut server, request.as_slice());
        assert_eq!(seen, payload);

        let reply_payload = vec![9u8, 8, 7];
        let mut reply_wire = Vec::new();
        server
            .write(&[ByteBuffer::from_vec(reply_payload.clone())], &mut reply_wire)
            .unwrap();
        let response = concat(&reply_wire);
        let text = String::from_utf8_lossy(response.as_slice()).to_string();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains(&format!("Set-Cookie: {SESSION_COOKIE}=")));

        let got = pump(&mut client, response.as_slice());
        assert_eq!(got, reply_payload);
    }

    #[test]
    fn client_echoes_cookie_on_subsequent_requests() {
        let mut client = HttpFrameFilter::new_client("h", 80, "/", None);
        let mut server = HttpFrameFilter::new_server(None);

        let mut wire = Vec::new();
        client.write(&[ByteBuffer::from_vec(vec![1])], &mut wire).unwrap();
        pump(&mut server, concat(&wire).as_slice());

        let mut reply = Vec::new();
        server.write(&[ByteBuffer::from_vec(vec![2])], &mut reply).unwrap();
        pump(&mut client, concat(&reply).as_slice());

        let mut second = Vec::new();
        client.write(&[ByteBuffer::from_vec(vec![3])], &mut second).unwrap();
        let text = String::from_utf8_lossy(concat(&second).as_slice()).to_string();
        assert!(text.contains(&format!("Cookie: {SESSION_COOKIE}=")));
    }

    #[test]
    fn large_response_uses_chunked_encoding_and_reassembles() {
        // 10 KiB body: two chunks of 0x2000 and 0x800 bytes.
        let mut client = HttpFrameFilter::new_client("h", 80, "/", None);
        let mut server = HttpFrameFilter::new_server(None);

        let mut wire = Vec::new();
        client.write(&[ByteBuffer::from_vec(vec![0])], &mut wire).unwrap();
        pump(&mut server, concat(&wire).as_slice());

        let body: Vec<u8> = (0..10_240).map(|i| (i % 256) as u8).collect();
        let mut reply = Vec::new();
        server.write(&[ByteBuffer::from_vec(body.clone())], &mut reply).unwrap();
        let response = concat(&reply);
        let text = String::from_utf8_lossy(response.as_slice()).to_string();
        assert!(text.contains("Transfer-Encoding: chunked"));
        assert!(text.contains("\r\n2000\r\n"));
        assert!(text.contains("\r\n800\r\n"));

        // Deliver in fragments; the body must reassemble to one payload.
        let mut got = Vec::new();
        for piece in response.as_slice().chunks(1000) {
            client.read(piece, &mut got).unwrap();
        }
        assert_eq!(got, body);
    }

    #[test]
    fn session_index_must_increase() {
        let mut server = HttpFrameFilter::new_server(None);
        let request = |index: u32| {
            format!(
                "POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 1\r\n\
                 {HEADER_SESSION_ID}: abc\r\n{HEADER_SESSION_INDEX}: {index}\r\n\r\nx"
            )
        };
        assert!(pump(&mut server, request(1).as_bytes()) == b"x");
        let mut out = Vec::new();
        assert!(server.read(request(1).as_bytes(), &mut out).is_err());
    }

    struct LengthVerifier;

    impl HttpMessageVerifier for LengthVerifier {
        fn apply(&self, body: &[u8]) -> (String, String) {
            (HEADER_VERIFY.to_string(), format!("{:x}", body.len()))
        }

        fn verify(&self, message: &HttpMessage, body: &[u8]) -> Result<()> {
            let expect = format!("{:x}", body.len());
            match message.header_value(HEADER_VERIFY) {
                Some(v) if v == expect => Ok(()),
                other => Err(Error::filter(format!(
                    "message verification failed: {other:?}"
                ))),
            }
        }
    }

    #[test]
    fn verifier_failure_rejects_message() {
        let verifier: Arc<dyn HttpMessageVerifier> = Arc::new(LengthVerifier);
        let mut client = HttpFrameFilter::new_client("h", 80, "/", Some(verifier.clone()));
        let mut server = HttpFrameFilter::new_server(Some(verifier));

        let mut wire = Vec::new();
        client.write(&[ByteBuffer::from_vec(vec![1, 2])], &mut wire).unwrap();
        let request = concat(&wire).to_vec();
        assert_eq!(pump(&mut server, &request), vec![1, 2]);

        // Tamper with the verification header of a second request.
        let mut wire = Vec::new();
        client.write(&[ByteBuffer::from_vec(vec![3, 4])], &mut wire).unwrap();
        let text = String::from_utf8(concat(&wire).to_vec()).unwrap();
        let tampered = text.replace(
            &format!("{HEADER_VERIFY}: 2"),
            &format!("{HEADER_VERIFY}: 3"),
        );
        let mut out = Vec::new();
        assert!(server.read(tampered.as_bytes(), &mut out).is_err());
    }
}

//! Async Rserve client over a plain TCP stream.
//!
//! [`RserveConnection`] owns the socket and speaks QAP1 request/response
//! pairs; all byte handling is delegated to [`crate::qap`].

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::ServerAddress;
use crate::qap::{self, Param, ResponseHeader, CMD_EVAL, CMD_SET_SEXP, HEADER_LEN, ID_LEN};
use crate::remote::{Connector, Evaluated, Interpreter, RemoteError};
use crate::value::RValue;

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Quote `s` as an R string literal.
pub fn r_string_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Wrap an expression so that interpreter errors come back as a value of
/// class `try-error` instead of failing the request.
fn guarded(expr: &str) -> String {
    format!("try({{{expr}}}, silent=TRUE)")
}

fn eof_as_closed(e: io::Error) -> RemoteError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        RemoteError::Closed
    } else {
        RemoteError::Io(e)
    }
}

// ── RserveConnection ──────────────────────────────────────────────────────────

/// A single Rserve session.
pub struct RserveConnection {
    stream: Option<TcpStream>,
}

impl RserveConnection {
    /// Connect and validate the server identification block.
    pub async fn connect(host: &str, port: u16) -> Result<Self, RemoteError> {
        let mut stream = TcpStream::connect((host, port)).await?;
        let mut id = [0u8; ID_LEN];
        stream.read_exact(&mut id).await.map_err(eof_as_closed)?;
        qap::check_server_id(&id)?;
        debug!(host, port, "rserve handshake complete");
        Ok(Self { stream: Some(stream) })
    }

    /// Send one command and return the response body.
    async fn request(&mut self, cmd: u32, params: &[Param<'_>]) -> Result<Vec<u8>, RemoteError> {
        let stream = self.stream.as_mut().ok_or(RemoteError::Closed)?;
        stream.write_all(&qap::encode_command(cmd, params)).await?;

        let mut header = [0u8; HEADER_LEN];
        stream.read_exact(&mut header).await.map_err(eof_as_closed)?;
        let header = ResponseHeader::decode(&header)?;
        let mut body = vec![0u8; header.len];
        stream.read_exact(&mut body).await.map_err(eof_as_closed)?;

        if header.is_error() || !header.is_ok() {
            let code = header.status();
            return Err(RemoteError::Server { code, text: qap::status_text(code).to_owned() });
        }
        Ok(body)
    }
}

#[async_trait]
impl Interpreter for RserveConnection {
    async fn assign(&mut self, name: &str, value: &RValue) -> Result<(), RemoteError> {
        self.request(CMD_SET_SEXP, &[Param::Str(name), Param::Sexp(value)]).await?;
        Ok(())
    }

    async fn eval(&mut self, expr: &str) -> Result<Evaluated, RemoteError> {
        let body = self.request(CMD_EVAL, &[Param::Str(&guarded(expr))]).await?;
        let value = qap::decode_sexp_param(&body)?.unwrap_or_else(RValue::null);
        if value.inherits("try-error") {
            let text = value.as_string().unwrap_or("unknown error").trim().to_owned();
            return Ok(Evaluated::Failed(text));
        }
        Ok(Evaluated::Value(value))
    }

    async fn fetch(&mut self, name: &str) -> Result<Option<RValue>, RemoteError> {
        let expr = format!("get({})", r_string_literal(name));
        match self.eval(&expr).await? {
            Evaluated::Value(v) => Ok(Some(v)),
            Evaluated::Failed(_) => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<(), RemoteError> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }
}

// ── RserveConnector ───────────────────────────────────────────────────────────

/// Opens [`RserveConnection`]s to a fixed address.
#[derive(Debug, Clone)]
pub struct RserveConnector {
    address: ServerAddress,
}

impl RserveConnector {
    pub fn new(address: ServerAddress) -> Self {
        Self { address }
    }
}

#[async_trait]
impl Connector for RserveConnector {
    async fn connect(&self) -> Result<Box<dyn Interpreter>, RemoteError> {
        let conn = RserveConnection::connect(&self.address.host, self.address.port).await?;
        Ok(Box::new(conn))
    }

    fn address(&self) -> String {
        self.address.to_string()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qap::{RESP_ERR, RESP_OK};
    use tokio::net::TcpListener;

    const SERVER_ID: &[u8; 32] = b"Rsrv0103QAP1\r\n\r\n--------------\r\n";

    async fn read_request(sock: &mut TcpStream) -> (u32, Vec<u8>) {
        let mut header = [0u8; HEADER_LEN];
        sock.read_exact(&mut header).await.unwrap();
        let h = ResponseHeader::decode(&header).unwrap();
        let mut body = vec![0u8; h.len];
        sock.read_exact(&mut body).await.unwrap();
        (h.cmd, body)
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn string_literal_escapes() {
        assert_eq!(r_string_literal(r#"a"b\c"#), r#""a\"b\\c""#);
        assert_eq!(r_string_literal("x\ny"), r#""x\ny""#);
    }

    #[tokio::test]
    async fn eval_round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(SERVER_ID).await.unwrap();

            let (cmd, body) = read_request(&mut sock).await;
            assert_eq!(cmd, CMD_EVAL);
            assert!(contains(&body, b"try({1 + 1}, silent=TRUE)"));
            let reply = RValue::double(vec![Some(2.0)]);
            sock.write_all(&qap::encode_command(RESP_OK, &[Param::Sexp(&reply)]))
                .await
                .unwrap();

            let (cmd, _) = read_request(&mut sock).await;
            assert_eq!(cmd, CMD_EVAL);
            let failure = RValue::strings(["Error in stop(\"boom\") : boom\n"])
                .with_attr("class", RValue::strings(["try-error"]));
            sock.write_all(&qap::encode_command(RESP_OK, &[Param::Sexp(&failure)]))
                .await
                .unwrap();
        });

        let mut conn = RserveConnection::connect("127.0.0.1", addr.port()).await.unwrap();
        assert_eq!(
            conn.eval("1 + 1").await.unwrap(),
            Evaluated::Value(RValue::double(vec![Some(2.0)]))
        );
        assert_eq!(
            conn.eval("stop(\"boom\")").await.unwrap(),
            Evaluated::Failed("Error in stop(\"boom\") : boom".into())
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn assign_sends_name_and_value() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(SERVER_ID).await.unwrap();
            let (cmd, body) = read_request(&mut sock).await;
            assert_eq!(cmd, CMD_SET_SEXP);
            assert!(contains(&body, b"count\0"));
            sock.write_all(&qap::encode_command(RESP_OK, &[])).await.unwrap();
        });

        let mut conn = RserveConnection::connect("127.0.0.1", addr.port()).await.unwrap();
        conn.assign("count", &RValue::integer(vec![Some(3)])).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn error_response_surfaces_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(SERVER_ID).await.unwrap();
            read_request(&mut sock).await;
            sock.write_all(&qap::encode_command(RESP_ERR | (0x44 << 24), &[]))
                .await
                .unwrap();
        });

        let mut conn = RserveConnection::connect("127.0.0.1", addr.port()).await.unwrap();
        let err = conn.assign("x", &RValue::null()).await.unwrap_err();
        assert!(matches!(err, RemoteError::Server { code: 0x44, .. }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_non_rserve_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(&[b'x'; 32]).await.unwrap();
        });

        let err = RserveConnection::connect("127.0.0.1", addr.port()).await.err().unwrap();
        assert!(matches!(err, RemoteError::Codec(qap::CodecError::BadId(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn closed_connection_refuses_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(SERVER_ID).await.unwrap();
        });

        let mut conn = RserveConnection::connect("127.0.0.1", addr.port()).await.unwrap();
        conn.close().await.unwrap();
        assert!(matches!(conn.eval("1").await, Err(RemoteError::Closed)));
        server.await.unwrap();
    }
}

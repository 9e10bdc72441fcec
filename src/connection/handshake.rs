//! Connection handshake.
//!
//! Runs on a fresh stream before it is attached to a bridge. The handshake
//! commands are pipelined in a single write and their replies read back in
//! order:
//!
//! ```text
//! PING                   -> +PONG            (required)
//! CLIENT SETNAME <name>  -> +OK              (optional, errors ignored)
//! ROLE                   -> *[master, ...]   (optional, interactive only)
//! ```

use crate::connection::stream::ConnectionPurpose;
use crate::endpoint::{EndpointAddr, Role};
use crate::error::{MuxError, MuxResult};
use crate::protocol::{Command, RespParser, RespValue};
use bytes::{Buf, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const INITIAL_BUFFER_SIZE: usize = 1024;

/// What the handshake should ask the server.
#[derive(Debug, Clone)]
pub struct HandshakeOptions {
    pub client_name: Option<String>,
    pub detect_role: bool,
    pub timeout: Duration,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self {
            client_name: None,
            detect_role: true,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Capabilities learned during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub role: Role,
    pub role_detected: bool,
    pub client_name_set: bool,
}

impl Default for Negotiated {
    fn default() -> Self {
        Self {
            role: Role::Unknown,
            role_detected: false,
            client_name_set: false,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Step {
    Ping,
    SetName,
    Role,
}

/// Performs the handshake on `stream`.
///
/// Returns the negotiated capabilities and any bytes read past the last
/// handshake reply, which belong to the connection's reader.
pub async fn perform<S>(
    stream: &mut S,
    endpoint: &EndpointAddr,
    purpose: ConnectionPurpose,
    options: &HandshakeOptions,
) -> MuxResult<(Negotiated, BytesMut)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let failed = |reason: String| MuxError::ConnectFailed {
        endpoint: endpoint.to_string(),
        reason,
    };

    tokio::time::timeout(options.timeout, exchange(stream, endpoint, purpose, options))
        .await
        .map_err(|_| failed(format!("handshake timed out after {:?}", options.timeout)))?
}

async fn exchange<S>(
    stream: &mut S,
    endpoint: &EndpointAddr,
    purpose: ConnectionPurpose,
    options: &HandshakeOptions,
) -> MuxResult<(Negotiated, BytesMut)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let failed = |reason: String| MuxError::ConnectFailed {
        endpoint: endpoint.to_string(),
        reason,
    };

    let mut steps = vec![Step::Ping];
    let mut out = BytesMut::new();
    Command::new("PING").encode_into(&mut out);

    if let Some(name) = &options.client_name {
        steps.push(Step::SetName);
        Command::new("CLIENT")
            .arg("SETNAME")
            .arg(name.clone())
            .encode_into(&mut out);
    }
    if options.detect_role && purpose == ConnectionPurpose::Interactive {
        steps.push(Step::Role);
        Command::new("ROLE").encode_into(&mut out);
    }

    stream
        .write_all(&out)
        .await
        .map_err(|e| failed(e.to_string()))?;
    stream.flush().await.map_err(|e| failed(e.to_string()))?;

    let mut parser = RespParser::new();
    let mut buffer = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);
    let mut negotiated = Negotiated::default();

    for step in steps {
        let reply = loop {
            if let Some((value, consumed)) = parser
                .parse(&buffer)
                .map_err(|e| failed(format!("malformed handshake reply: {}", e)))?
            {
                buffer.advance(consumed);
                break value;
            }
            let n = stream
                .read_buf(&mut buffer)
                .await
                .map_err(|e| failed(e.to_string()))?;
            if n == 0 {
                return Err(failed("stream closed during handshake".to_string()));
            }
        };

        match step {
            Step::Ping => match reply {
                RespValue::SimpleString(ref s) if s.eq_ignore_ascii_case("PONG") => {}
                RespValue::Error(e) => return Err(failed(e)),
                other => {
                    return Err(failed(format!(
                        "unexpected PING reply: {}",
                        other.type_name()
                    )))
                }
            },
            Step::SetName => {
                negotiated.client_name_set = !matches!(reply, RespValue::Error(_));
            }
            Step::Role => {
                if let Some(role) = parse_role(&reply) {
                    negotiated.role = role;
                    negotiated.role_detected = true;
                }
            }
        }
    }

    debug!(
        endpoint = %endpoint,
        purpose = %purpose,
        role = ?negotiated.role,
        client_name_set = negotiated.client_name_set,
        "Handshake complete"
    );

    Ok((negotiated, buffer))
}

/// Interprets a `ROLE` reply. `None` when the server refused the command.
pub fn parse_role(reply: &RespValue) -> Option<Role> {
    let items = match reply {
        RespValue::Array(items) => items,
        _ => return None,
    };
    let first = items.first()?;
    let name = match first {
        RespValue::BulkString(b) => String::from_utf8_lossy(b).to_ascii_lowercase(),
        RespValue::SimpleString(s) => s.to_ascii_lowercase(),
        _ => return Some(Role::Unknown),
    };
    Some(match name.as_str() {
        "master" => Role::Primary,
        "slave" | "replica" => Role::Replica,
        _ => Role::Unknown,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn addr() -> EndpointAddr {
        EndpointAddr::new("127.0.0.1:6379")
    }

    #[tokio::test]
    async fn test_handshake_detects_primary() {
        let mut mock = Builder::new()
            .write(b"*1\r\n$4\r\nPING\r\n*3\r\n$6\r\nCLIENT\r\n$7\r\nSETNAME\r\n$3\r\napp\r\n*1\r\n$4\r\nROLE\r\n")
            .read(b"+PONG\r\n+OK\r\n*3\r\n$6\r\nmaster\r\n:0\r\n*0\r\n")
            .build();

        let options = HandshakeOptions {
            client_name: Some("app".to_string()),
            ..Default::default()
        };
        let (negotiated, leftover) = perform(&mut mock, &addr(), ConnectionPurpose::Interactive, &options)
            .await
            .unwrap();

        assert_eq!(negotiated.role, Role::Primary);
        assert!(negotiated.role_detected);
        assert!(negotiated.client_name_set);
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn test_handshake_tolerates_missing_role_command() {
        let mut mock = Builder::new()
            .write(b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nROLE\r\n")
            .read(b"+PONG\r\n-ERR unknown command 'ROLE'\r\n")
            .build();

        let (negotiated, _) = perform(
            &mut mock,
            &addr(),
            ConnectionPurpose::Interactive,
            &HandshakeOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(negotiated.role, Role::Unknown);
        assert!(!negotiated.role_detected);
    }

    #[tokio::test]
    async fn test_subscription_handshake_skips_role() {
        let mut mock = Builder::new()
            .write(b"*1\r\n$4\r\nPING\r\n")
            .read(b"+PONG\r\n")
            .build();

        let (negotiated, _) = perform(
            &mut mock,
            &addr(),
            ConnectionPurpose::Subscription,
            &HandshakeOptions::default(),
        )
        .await
        .unwrap();
        assert!(!negotiated.role_detected);
    }

    #[tokio::test]
    async fn test_ping_error_fails_handshake() {
        let mut mock = Builder::new()
            .write(b"*1\r\n$4\r\nPING\r\n")
            .read(b"-NOAUTH Authentication required.\r\n")
            .build();

        let options = HandshakeOptions {
            detect_role: false,
            ..Default::default()
        };
        let err = perform(&mut mock, &addr(), ConnectionPurpose::Interactive, &options)
            .await
            .unwrap_err();
        assert!(matches!(err, MuxError::ConnectFailed { ref reason, .. } if reason.contains("NOAUTH")));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let (mut client, _server) = tokio::io::duplex(1024);
        let options = HandshakeOptions {
            timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let err = perform(&mut client, &addr(), ConnectionPurpose::Interactive, &options)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_parse_role_variants() {
        let role = |name: &str| {
            RespValue::array(vec![RespValue::bulk_string(name.to_string()), RespValue::integer(0)])
        };
        assert_eq!(parse_role(&role("master")), Some(Role::Primary));
        assert_eq!(parse_role(&role("slave")), Some(Role::Replica));
        assert_eq!(parse_role(&role("sentinel")), Some(Role::Unknown));
        assert_eq!(parse_role(&RespValue::error("ERR")), None);
    }
}

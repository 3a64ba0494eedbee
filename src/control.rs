use async_trait::async_trait;
use std::net::{Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time;
use tracing::debug;

const STATUS_OK: u16 = 250;
const STATUS_AUTH_FAILED: u16 = 515;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("не удалось подключиться к {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },
    #[error("ошибка ввода-вывода: {0}")]
    Io(#[from] std::io::Error),
    #[error("превышено время ожидания ({0:?})")]
    Timeout(Duration),
    #[error("ошибка аутентификации: {0}")]
    Auth(String),
    #[error("команда отклонена ({code}): {message}")]
    Rejected { code: u16, message: String },
    #[error("ошибка протокола: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCircuit {
    pub id: String,
    pub status: String,
    pub purpose: String,
    pub path: Vec<(String, String)>,
}

impl RawCircuit {
    pub fn is_built(&self) -> bool {
        self.status == "BUILT"
    }
}

#[async_trait]
pub trait ControlConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Box<dyn ControlSession>, ControlError>;
}

#[async_trait]
pub trait ControlSession: Send {
    async fn authenticate(&mut self) -> Result<(), ControlError>;
    async fn list_circuits(&mut self) -> Result<Vec<RawCircuit>, ControlError>;
    async fn resolve_descriptor(&mut self, fingerprint: &str)
        -> Result<Option<String>, ControlError>;
    async fn close_circuit(&mut self, circuit_id: &str) -> Result<(), ControlError>;
    async fn signal_new_identity(&mut self) -> Result<(), ControlError>;
    async fn quit(self: Box<Self>);
}

#[derive(Debug, Clone)]
pub struct TcpControlConnector {
    port: u16,
    password: Option<String>,
    connect_timeout: Duration,
}

impl TcpControlConnector {
    pub fn new(port: u16, password: Option<String>, connect_timeout: Duration) -> Self {
        Self {
            port,
            password,
            connect_timeout,
        }
    }
}

#[async_trait]
impl ControlConnector for TcpControlConnector {
    async fn connect(&self, address: &str) -> Result<Box<dyn ControlSession>, ControlError> {
        let target = if address.parse::<SocketAddr>().is_ok() {
            address.to_string()
        } else if address.parse::<Ipv6Addr>().is_ok() {
            format!("[{address}]:{}", self.port)
        } else {
            format!("{address}:{}", self.port)
        };

        let stream = match time::timeout(self.connect_timeout, TcpStream::connect(&target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ControlError::Connect {
                    address: target,
                    source,
                })
            }
            Err(_elapsed) => return Err(ControlError::Timeout(self.connect_timeout)),
        };

        let (read, write) = stream.into_split();
        Ok(Box::new(TcpControlSession {
            reader: BufReader::new(read),
            writer: write,
            password: self.password.clone(),
            quit_timeout: self.connect_timeout,
        }))
    }
}

pub struct TcpControlSession {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    password: Option<String>,
    quit_timeout: Duration,
}

#[derive(Debug, Default)]
struct Reply {
    code: u16,
    lines: Vec<String>,
}

impl Reply {
    fn message(&self) -> String {
        self.lines.join(" ")
    }
}

impl TcpControlSession {
    async fn command(&mut self, line: &str) -> Result<Reply, ControlError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        self.read_reply().await
    }

    async fn read_line(&mut self) -> Result<String, ControlError> {
        let mut buf = String::new();
        let n = self.reader.read_line(&mut buf).await?;
        if n == 0 {
            return Err(ControlError::Protocol(
                "соединение закрыто во время ответа".to_string(),
            ));
        }
        Ok(buf.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn read_reply(&mut self) -> Result<Reply, ControlError> {
        let mut reply = Reply::default();
        loop {
            let line = self.read_line().await?;
            let (Some(code), Some(sep), Some(rest)) = (line.get(..3), line.get(3..4), line.get(4..))
            else {
                return Err(ControlError::Protocol(format!("короткая строка ответа: {line:?}")));
            };
            reply.code = code
                .parse()
                .map_err(|_| ControlError::Protocol(format!("нет кода статуса: {line:?}")))?;
            match sep {
                " " => {
                    reply.lines.push(rest.to_string());
                    return Ok(reply);
                }
                "-" => reply.lines.push(rest.to_string()),
                "+" => {
                    reply.lines.push(rest.to_string());
                    loop {
                        let data = self.read_line().await?;
                        if data == "." {
                            break;
                        }
                        let data = data.strip_prefix('.').unwrap_or(&data).to_string();
                        reply.lines.push(data);
                    }
                }
                other => {
                    return Err(ControlError::Protocol(format!(
                        "неизвестный разделитель {other:?} в {line:?}"
                    )))
                }
            }
        }
    }

    async fn expect_ok(&mut self, line: &str) -> Result<Reply, ControlError> {
        let reply = self.command(line).await?;
        if reply.code != STATUS_OK {
            return Err(ControlError::Rejected {
                code: reply.code,
                message: reply.message(),
            });
        }
        Ok(reply)
    }
}

#[async_trait]
impl ControlSession for TcpControlSession {
    async fn authenticate(&mut self) -> Result<(), ControlError> {
        let line = match &self.password {
            Some(password) => format!("AUTHENTICATE {}", quote(password)),
            None => "AUTHENTICATE".to_string(),
        };
        let reply = self.command(&line).await?;
        match reply.code {
            STATUS_OK => Ok(()),
            STATUS_AUTH_FAILED => Err(ControlError::Auth(reply.message())),
            code => Err(ControlError::Rejected {
                code,
                message: reply.message(),
            }),
        }
    }

    async fn list_circuits(&mut self) -> Result<Vec<RawCircuit>, ControlError> {
        let reply = self.expect_ok("GETINFO circuit-status").await?;
        Ok(parse_circuit_status(&reply.lines))
    }

    async fn resolve_descriptor(
        &mut self,
        fingerprint: &str,
    ) -> Result<Option<String>, ControlError> {
        match self.expect_ok(&format!("GETINFO ns/id/{fingerprint}")).await {
            Ok(reply) => Ok(parse_router_address(&reply.lines)),
            Err(ControlError::Rejected { code, message }) => {
                debug!(fingerprint, code, message = %message, "дескриптор узла не найден");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn close_circuit(&mut self, circuit_id: &str) -> Result<(), ControlError> {
        self.expect_ok(&format!("CLOSECIRCUIT {circuit_id}")).await?;
        Ok(())
    }

    async fn signal_new_identity(&mut self) -> Result<(), ControlError> {
        self.expect_ok("SIGNAL NEWNYM").await?;
        Ok(())
    }

    async fn quit(self: Box<Self>) {
        let mut this = self;
        let limit = this.quit_timeout;
        match time::timeout(limit, this.command("QUIT")).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => debug!(error = %err, "QUIT завершился с ошибкой"),
            Err(_elapsed) => debug!(timeout_ms = limit.as_millis() as u64, "нет ответа на QUIT"),
        }
        let _ = time::timeout(limit, this.writer.shutdown()).await;
    }
}

fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// Parses the body of `GETINFO circuit-status`:
/// `ID STATUS [PATH] [KEY=VALUE ...]`, one circuit per line.
pub fn parse_circuit_status(lines: &[String]) -> Vec<RawCircuit> {
    let mut out = Vec::new();
    for line in lines {
        let body = line.strip_prefix("circuit-status=").unwrap_or(line);
        let mut tokens = body.split_whitespace();
        let (Some(id), Some(status)) = (tokens.next(), tokens.next()) else {
            continue;
        };
        if id == "OK" || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
            continue;
        }

        let mut path = Vec::new();
        let mut purpose = "GENERAL".to_string();
        for token in tokens {
            if let Some(value) = token.strip_prefix("PURPOSE=") {
                purpose = value.to_string();
            } else if token.starts_with('$') && path.is_empty() {
                path = token.split(',').map(parse_path_entry).collect();
            }
        }

        out.push(RawCircuit {
            id: id.to_string(),
            status: status.to_string(),
            purpose,
            path,
        });
    }
    out
}

fn parse_path_entry(entry: &str) -> (String, String) {
    let entry = entry.trim_start_matches('$');
    match entry.split_once(['~', '=']) {
        Some((fingerprint, nickname)) => (fingerprint.to_string(), nickname.to_string()),
        None => (entry.to_string(), String::new()),
    }
}

/// Picks the address out of the `r` line of a router status entry:
/// `r nickname identity digest date time IP ORPort DirPort`.
fn parse_router_address(lines: &[String]) -> Option<String> {
    lines.iter().find_map(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["r", _nick, _identity, _digest, _date, _time, ip, ..] => Some(ip.to_string()),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[test]
    fn circuit_status_parsing() {
        let lines = vec![
            "circuit-status=".to_string(),
            "7 BUILT $AAAA~alpha,$BBBB~beta,$CCCC=gamma BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL TIME_CREATED=2024-01-01T00:00:00.000000".to_string(),
            "8 LAUNCHED BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL".to_string(),
            "9 BUILT $DDDD PURPOSE=HS_CLIENT_INTRO".to_string(),
            "OK".to_string(),
        ];

        let circuits = parse_circuit_status(&lines);
        assert_eq!(circuits.len(), 3);
        assert_eq!(circuits[0].id, "7");
        assert!(circuits[0].is_built());
        assert_eq!(
            circuits[0].path,
            vec![
                ("AAAA".to_string(), "alpha".to_string()),
                ("BBBB".to_string(), "beta".to_string()),
                ("CCCC".to_string(), "gamma".to_string()),
            ]
        );
        assert!(!circuits[1].is_built());
        assert!(circuits[1].path.is_empty());
        assert_eq!(circuits[2].purpose, "HS_CLIENT_INTRO");
        assert_eq!(circuits[2].path, vec![("DDDD".to_string(), String::new())]);
    }

    #[test]
    fn router_address_from_ns_entry() {
        let lines = vec![
            "ns/id/AAAA=".to_string(),
            "r alpha ABCDEF 123456 2024-01-01 12:00:00 185.1.2.3 9001 0".to_string(),
            "s Fast Guard Running Stable Valid".to_string(),
        ];
        assert_eq!(parse_router_address(&lines).as_deref(), Some("185.1.2.3"));
        assert_eq!(parse_router_address(&["s Fast".to_string()]), None);
    }

    #[test]
    fn password_is_quoted() {
        assert_eq!(quote(r#"pa"ss\w"#), r#""pa\"ss\\w""#);
    }

    async fn scripted_server(script: Vec<(&'static str, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);
            for (expected, reply) in script {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                assert!(
                    line.starts_with(expected),
                    "expected {expected:?}, got {line:?}"
                );
                write.write_all(reply.as_bytes()).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn session_speaks_control_protocol() {
        let addr = scripted_server(vec![
            ("AUTHENTICATE \"secret\"", "250 OK\r\n"),
            (
                "GETINFO circuit-status",
                "250+circuit-status=\r\n3 BUILT $AAAA~alpha,$BBBB~beta PURPOSE=GENERAL\r\n.\r\n250 OK\r\n",
            ),
            (
                "GETINFO ns/id/AAAA",
                "250+ns/id/AAAA=\r\nr alpha x y 2024-01-01 00:00:00 10.1.1.1 9001 0\r\n.\r\n250 OK\r\n",
            ),
            ("GETINFO ns/id/BBBB", "552 Unrecognized key \"ns/id/BBBB\"\r\n"),
            ("CLOSECIRCUIT 3", "250 OK\r\n"),
            ("SIGNAL NEWNYM", "250 OK\r\n"),
            ("QUIT", "250 closing connection\r\n"),
        ])
        .await;

        let connector =
            TcpControlConnector::new(9051, Some("secret".to_string()), Duration::from_secs(2));
        let mut session = connector.connect(&addr).await.unwrap();
        session.authenticate().await.unwrap();
        let circuits = session.list_circuits().await.unwrap();
        assert_eq!(circuits.len(), 1);
        assert_eq!(circuits[0].path.len(), 2);
        assert_eq!(
            session.resolve_descriptor("AAAA").await.unwrap().as_deref(),
            Some("10.1.1.1")
        );
        assert_eq!(session.resolve_descriptor("BBBB").await.unwrap(), None);
        session.close_circuit("3").await.unwrap();
        session.signal_new_identity().await.unwrap();
        session.quit().await;
    }

    #[tokio::test]
    async fn wrong_password_is_auth_error() {
        let addr = scripted_server(vec![(
            "AUTHENTICATE",
            "515 Authentication failed: Password did not match HashedControlPassword value\r\n",
        )])
        .await;

        let connector =
            TcpControlConnector::new(9051, Some("nope".to_string()), Duration::from_secs(2));
        let mut session = connector.connect(&addr).await.unwrap();
        assert!(matches!(
            session.authenticate().await,
            Err(ControlError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn unknown_circuit_close_is_rejected() {
        let addr = scripted_server(vec![
            ("AUTHENTICATE", "250 OK\r\n"),
            ("CLOSECIRCUIT 99", "552 Unknown circuit \"99\"\r\n"),
        ])
        .await;

        let connector = TcpControlConnector::new(9051, None, Duration::from_secs(2));
        let mut session = connector.connect(&addr).await.unwrap();
        session.authenticate().await.unwrap();
        assert!(matches!(
            session.close_circuit("99").await,
            Err(ControlError::Rejected { code: 552, .. })
        ));
    }

    #[tokio::test]
    async fn quit_gives_up_on_silent_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let held = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
            drop(stream);
        });

        let connector = TcpControlConnector::new(9051, None, Duration::from_millis(100));
        let session = connector.connect(&addr).await.unwrap();
        time::timeout(Duration::from_secs(2), session.quit())
            .await
            .expect("QUIT must not wait for a silent peer");
        held.abort();
    }
}

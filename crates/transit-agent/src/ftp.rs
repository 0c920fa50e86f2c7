//! Minimal RFC 959 FTP client, active-mode-free (PASV only), covering just
//! enough of the protocol to RETR/STOR a file over a single data
//! connection. No crate in the example pack speaks FTP, so this is
//! hand-rolled rather than fabricated.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{AgentEvent, AgentOutcome, AgentRequest, Error, Result, SessionId, TransferAgent};

struct Session {
    cancel: CancellationToken,
    request: AgentRequest,
}

pub struct FtpAgent {
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl FtpAgent {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for FtpAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferAgent for FtpAgent {
    fn start(
        &self,
        session: SessionId,
        request: AgentRequest,
        events: UnboundedSender<AgentEvent>,
    ) -> Result<()> {
        let cancel = CancellationToken::new();
        self.sessions.lock().unwrap().insert(
            session,
            Session {
                cancel: cancel.clone(),
                request: request.clone(),
            },
        );
        tokio::spawn(run_session(session, request, events, cancel));
        Ok(())
    }

    fn cancel(&self, session: SessionId) {
        if let Some(s) = self.sessions.lock().unwrap().remove(&session) {
            s.cancel.cancel();
        }
    }

    fn swap_interface(
        &self,
        session: SessionId,
        _interface: Option<String>,
        resume_from: u64,
        events: UnboundedSender<AgentEvent>,
    ) -> Result<()> {
        // This client has no per-request interface binding; swapping means
        // reconnecting fresh and resuming with REST at the new offset.
        let mut request = {
            let mut sessions = self.sessions.lock().unwrap();
            let existing = sessions.remove(&session).ok_or(Error::NoSuchSession)?;
            existing.cancel.cancel();
            existing.request
        };
        request.resume_from = resume_from;
        self.start(session, request, events)
    }
}

async fn run_session(
    session: SessionId,
    request: AgentRequest,
    events: UnboundedSender<AgentEvent>,
    cancel: CancellationToken,
) {
    let outcome = tokio::select! {
        _ = cancel.cancelled() => AgentOutcome::Cancelled,
        result = fetch(session, &request, &events, &cancel) => match result {
            Ok(()) => AgentOutcome::Ok { http_status: 0 },
            Err(FtpError::Transport(msg)) => AgentOutcome::Transport(msg),
            Err(FtpError::ConnectTimeout) => AgentOutcome::ConnectTimeout,
        },
    };
    let _ = events.send(AgentEvent::Done { session, outcome });
}

enum FtpError {
    Transport(String),
    ConnectTimeout,
}

impl From<std::io::Error> for FtpError {
    fn from(e: std::io::Error) -> Self {
        FtpError::Transport(e.to_string())
    }
}

async fn fetch(
    session: SessionId,
    request: &AgentRequest,
    events: &UnboundedSender<AgentEvent>,
    cancel: &CancellationToken,
) -> std::result::Result<(), FtpError> {
    let url = Url::parse(&request.url)
        .map_err(|e| FtpError::Transport(format!("invalid FTP URL: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| FtpError::Transport("missing host".to_string()))?;
    let port = url.port().unwrap_or(21);
    let user = if url.username().is_empty() {
        "anonymous"
    } else {
        url.username()
    };
    let password = url.password().unwrap_or("anonymous@");
    let path = url.path();

    let control = tokio::time::timeout(
        std::time::Duration::from_secs(request.connect_timeout_secs),
        TcpStream::connect((host, port)),
    )
    .await
    .map_err(|_| FtpError::ConnectTimeout)??;

    let mut control = BufReader::new(control);
    read_reply(&mut control).await?; // 220 greeting

    send_cmd(&mut control, &format!("USER {user}")).await?;
    read_reply(&mut control).await?; // 331
    send_cmd(&mut control, &format!("PASS {password}")).await?;
    read_reply(&mut control).await?; // 230

    send_cmd(&mut control, "TYPE I").await?;
    read_reply(&mut control).await?;

    if request.resume_from > 0 {
        send_cmd(&mut control, &format!("REST {}", request.resume_from)).await?;
        read_reply(&mut control).await?;
    }

    send_cmd(&mut control, "PASV").await?;
    let pasv_reply = read_reply(&mut control).await?;
    let data_addr = parse_pasv(&pasv_reply)
        .ok_or_else(|| FtpError::Transport("unparsable PASV reply".to_string()))?;

    let data = TcpStream::connect(data_addr).await?;

    if let Some(upload) = &request.upload {
        send_cmd(&mut control, &format!("STOR {path}")).await?;
        let _ = read_reply(&mut control).await?; // 150
        stream_upload(session, data, upload, cancel, events).await?;
    } else {
        send_cmd(&mut control, &format!("RETR {path}")).await?;
        let _ = read_reply(&mut control).await?; // 150
        stream_download(session, data, cancel, events).await?;
    }

    read_reply(&mut control).await?; // 226 transfer complete
    send_cmd(&mut control, "QUIT").await?;
    Ok(())
}

async fn stream_download(
    session: SessionId,
    mut data: TcpStream,
    cancel: &CancellationToken,
    events: &UnboundedSender<AgentEvent>,
) -> std::result::Result<(), FtpError> {
    let mut buf = [0u8; 64 * 1024];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            n = data.read(&mut buf) => {
                let n = n?;
                if n == 0 {
                    return Ok(());
                }
                if events
                    .send(AgentEvent::Write { session, bytes: bytes::Bytes::copy_from_slice(&buf[..n]) })
                    .is_err()
                {
                    return Ok(());
                }
            }
        }
    }
}

async fn stream_upload(
    session: SessionId,
    mut data: TcpStream,
    upload: &crate::UploadBody,
    cancel: &CancellationToken,
    events: &UnboundedSender<AgentEvent>,
) -> std::result::Result<(), FtpError> {
    let mut file = tokio::fs::File::open(&upload.path).await?;
    tokio::io::AsyncSeekExt::seek(&mut file, std::io::SeekFrom::Start(upload.offset)).await?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            n = tokio::io::AsyncReadExt::read(&mut file, &mut buf) => {
                let n = n?;
                if n == 0 {
                    break;
                }
                data.write_all(&buf[..n]).await?;
                let _ = events.send(AgentEvent::Write {
                    session,
                    bytes: bytes::Bytes::copy_from_slice(&buf[..n]),
                });
            }
        }
    }
    data.shutdown().await?;
    Ok(())
}

async fn send_cmd(control: &mut BufReader<TcpStream>, cmd: &str) -> std::io::Result<()> {
    control.get_mut().write_all(cmd.as_bytes()).await?;
    control.get_mut().write_all(b"\r\n").await
}

/// Read one control-connection reply line and require a 1xx/2xx/3xx
/// status code; a 4xx/5xx reply (e.g. `550 File not found`) is a
/// transfer failure, not a success to be treated identically. 1xx
/// ("preliminary positive", e.g. `150` before a data transfer) is
/// accepted, not just the final 2xx/3xx reply.
async fn read_reply(control: &mut BufReader<TcpStream>) -> std::result::Result<String, FtpError> {
    let mut line = String::new();
    control.read_line(&mut line).await?;
    match line.get(..3).and_then(|c| c.parse::<u16>().ok()) {
        Some(code) if (100..400).contains(&code) => Ok(line),
        Some(code) => Err(FtpError::Transport(format!("FTP error reply: {code} {}", line.trim()))),
        None => Err(FtpError::Transport(format!("unparsable FTP reply: {}", line.trim()))),
    }
}

fn parse_pasv(reply: &str) -> Option<(std::net::Ipv4Addr, u16)> {
    let start = reply.find('(')?;
    let end = reply.find(')')?;
    let parts: Vec<u16> = reply[start + 1..end]
        .split(',')
        .filter_map(|p| p.trim().parse::<u16>().ok())
        .collect();
    if parts.len() != 6 {
        return None;
    }
    let ip = std::net::Ipv4Addr::new(
        parts[0] as u8,
        parts[1] as u8,
        parts[2] as u8,
        parts[3] as u8,
    );
    let port = (parts[4] << 8) | parts[5];
    Some((ip, port))
}

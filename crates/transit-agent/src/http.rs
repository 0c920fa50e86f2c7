//! HTTP/HTTPS transfer engine built on `reqwest`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use futures_util::{Stream, StreamExt};
use reqwest::Client;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{AgentEvent, AgentOutcome, AgentRequest, Error, Result, SessionId, TransferAgent, UploadBody};

/// One in-flight session's cancellation handle and the request that started
/// it, so `swap_interface` can re-issue the same request against a new
/// local interface without the orchestrator resending headers/cookies.
struct Session {
    cancel: CancellationToken,
    request: AgentRequest,
}

pub struct ReqwestAgent {
    client: Client,
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl ReqwestAgent {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .redirect(reqwest::redirect::Policy::none()) // the controller follows redirects itself (spec.md §4.6)
                .tcp_keepalive(std::time::Duration::from_secs(60))
                .build()
                .expect("reqwest client builds with default TLS backend"),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn build_client(request: &AgentRequest) -> Client {
        let mut builder = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .tcp_keepalive(std::time::Duration::from_secs(60))
            .connect_timeout(std::time::Duration::from_secs(request.connect_timeout_secs));

        #[cfg(target_os = "linux")]
        if let Some(iface) = request.interface.as_deref() {
            builder = builder.interface(iface);
        }

        builder.build().unwrap_or_else(|e| {
            warn!("falling back to default reqwest client: {e}");
            Client::new()
        })
    }
}

impl Default for ReqwestAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferAgent for ReqwestAgent {
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

        let client = Self::build_client(&request);
        tokio::spawn(run_session(client, session, request, events, cancel));
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
        interface: Option<String>,
        resume_from: u64,
        events: UnboundedSender<AgentEvent>,
    ) -> Result<()> {
        let mut request = {
            let mut sessions = self.sessions.lock().unwrap();
            let existing = sessions.remove(&session).ok_or(Error::NoSuchSession)?;
            existing.cancel.cancel();
            existing.request
        };
        request.interface = interface;
        request.resume_from = resume_from;
        self.start(session, request, events)
    }
}

async fn run_session(
    client: Client,
    session: SessionId,
    request: AgentRequest,
    events: UnboundedSender<AgentEvent>,
    cancel: CancellationToken,
) {
    if let Some(upload) = request.upload.clone() {
        run_upload_session(client, session, request, upload, events, cancel).await;
        return;
    }

    let mut req = client.get(&request.url);
    if request.resume_from > 0 {
        req = req.header("Range", format!("bytes={}-", request.resume_from));
    }
    if let Some(cookie) = &request.cookie_header {
        req = req.header("Cookie", cookie.clone());
    }
    for (name, value) in &request.headers {
        req = req.header(name.as_str(), value.as_str());
    }

    let response = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = events.send(AgentEvent::Done { session, outcome: AgentOutcome::Cancelled });
            return;
        }
        result = req.send() => result,
    };

    let response = match response {
        Ok(r) => r,
        Err(e) if e.is_timeout() => {
            let _ = events.send(AgentEvent::Done {
                session,
                outcome: AgentOutcome::ConnectTimeout,
            });
            return;
        }
        Err(e) => {
            let _ = events.send(AgentEvent::Done {
                session,
                outcome: AgentOutcome::Transport(e.to_string()),
            });
            return;
        }
    };

    let status = response.status();
    for (name, value) in response.headers().iter() {
        if let Ok(v) = value.to_str() {
            let _ = events.send(AgentEvent::Header {
                session,
                name: name.as_str().to_string(),
                value: v.to_string(),
            });
        }
    }

    if status.as_u16() >= 400 {
        let _ = events.send(AgentEvent::Done {
            session,
            outcome: AgentOutcome::HttpError {
                http_status: status.as_u16(),
            },
        });
        return;
    }

    if (300..400).contains(&status.as_u16()) {
        // The controller owns redirect-following; report the status and
        // let it read the Location header from the events already sent.
        let _ = events.send(AgentEvent::Done {
            session,
            outcome: AgentOutcome::Ok {
                http_status: status.as_u16(),
            },
        });
        return;
    }

    let mut stream = response.bytes_stream();
    let mut window_start = Instant::now();
    let mut bytes_this_window: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = events.send(AgentEvent::Done { session, outcome: AgentOutcome::Cancelled });
                return;
            }
            chunk = stream.next() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        bytes_this_window += bytes.len() as u64;
                        if events.send(AgentEvent::Write { session, bytes }).is_err() {
                            debug!("controller dropped session {session}, stopping stream");
                            return;
                        }
                        if window_start.elapsed().as_secs() >= request.low_speed_window_secs {
                            let floor = request.low_speed_floor_bytes_per_sec * request.low_speed_window_secs;
                            if bytes_this_window < floor {
                                let _ = events.send(AgentEvent::Done { session, outcome: AgentOutcome::LowSpeed });
                                return;
                            }
                            window_start = Instant::now();
                            bytes_this_window = 0;
                        }
                    }
                    Some(Err(e)) => {
                        let _ = events.send(AgentEvent::Done { session, outcome: AgentOutcome::Transport(e.to_string()) });
                        return;
                    }
                    None => {
                        let _ = events.send(AgentEvent::Done { session, outcome: AgentOutcome::Ok { http_status: status.as_u16() } });
                        return;
                    }
                }
            }
        }
    }
}

/// Streams the file at `upload.path` (from `upload.offset`) as the request
/// body of a `PUT`, the same byte-offset resume model downloads use via
/// `Range` (spec.md §4.3 upload). `postParameters`/`fileLabel` describe a
/// multipart form in the original client API; multipart bodies are not
/// meaningfully resumable mid-upload, so this engine sticks to a single
/// streamed part and leaves those two fields untranslated (DESIGN.md).
async fn run_upload_session(
    client: Client,
    session: SessionId,
    request: AgentRequest,
    upload: UploadBody,
    events: UnboundedSender<AgentEvent>,
    cancel: CancellationToken,
) {
    let mut file = match tokio::fs::File::open(&upload.path).await {
        Ok(f) => f,
        Err(e) => {
            let _ = events.send(AgentEvent::Done { session, outcome: AgentOutcome::Transport(e.to_string()) });
            return;
        }
    };
    if upload.offset > 0 {
        if let Err(e) = file.seek(std::io::SeekFrom::Start(upload.offset)).await {
            let _ = events.send(AgentEvent::Done { session, outcome: AgentOutcome::Transport(e.to_string()) });
            return;
        }
    }

    let body = reqwest::Body::wrap_stream(upload_byte_stream(file, session, events.clone()));
    let mut req = client.put(&request.url).body(body);
    if let Some(content_type) = &upload.content_type {
        req = req.header("Content-Type", content_type.clone());
    }
    if let Some(cookie) = &request.cookie_header {
        req = req.header("Cookie", cookie.clone());
    }
    for (name, value) in &request.headers {
        req = req.header(name.as_str(), value.as_str());
    }

    let response = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = events.send(AgentEvent::Done { session, outcome: AgentOutcome::Cancelled });
            return;
        }
        result = req.send() => result,
    };

    let response = match response {
        Ok(r) => r,
        Err(e) if e.is_timeout() => {
            let _ = events.send(AgentEvent::Done { session, outcome: AgentOutcome::ConnectTimeout });
            return;
        }
        Err(e) => {
            let _ = events.send(AgentEvent::Done { session, outcome: AgentOutcome::Transport(e.to_string()) });
            return;
        }
    };

    let status = response.status();
    for (name, value) in response.headers().iter() {
        if let Ok(v) = value.to_str() {
            let _ = events.send(AgentEvent::Header { session, name: name.as_str().to_string(), value: v.to_string() });
        }
    }

    let outcome = if status.as_u16() >= 400 {
        AgentOutcome::HttpError { http_status: status.as_u16() }
    } else {
        AgentOutcome::Ok { http_status: status.as_u16() }
    };
    let _ = events.send(AgentEvent::Done { session, outcome });
}

/// Reads `file` in 64 KiB chunks, reporting each as a `Write` event so the
/// controller's existing progress accounting (`on_write`) tracks bytes sent
/// the same way it tracks bytes received for downloads.
fn upload_byte_stream(
    file: tokio::fs::File,
    session: SessionId,
    events: UnboundedSender<AgentEvent>,
) -> impl Stream<Item = std::result::Result<bytes::Bytes, std::io::Error>> {
    futures_util::stream::unfold((file, events, session), |(mut file, events, session)| async move {
        let mut buf = vec![0u8; 64 * 1024];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                let chunk = bytes::Bytes::copy_from_slice(&buf[..n]);
                let _ = events.send(AgentEvent::Write { session, bytes: chunk.clone() });
                Some((Ok(chunk), (file, events, session)))
            }
            Err(e) => Some((Err(e), (file, events, session))),
        }
    })
}

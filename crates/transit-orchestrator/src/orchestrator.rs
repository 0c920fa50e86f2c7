//! The transfer orchestrator actor (spec.md §2, §4.5, §4.6).
//!
//! A single task owns every mutable orchestrator structure and is driven by
//! an `mpsc` command channel merged with the shared agent-event channel via
//! `tokio::select!`, so every callback into the controller runs serialized
//! (spec.md §5). `OrchestratorHandle` is a cheap `Clone` wrapper callers use
//! to submit commands and await replies over a `oneshot`.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use transit_agent::{AgentEvent, AgentOutcome, AgentRequest, SessionId, TransferAgent};
use transit_core::{
    AdmitError, ByteRange, CompletionCode, ConnectivityStatus, InterfaceId, OrchestratorConfig,
    PauseError, ResumeError, SwapError, Ticket, TransferBody, TransferFlags, TransferHeader,
    TransferRecord, TransferState, UploadDetails,
};
use transit_history::{HistoryRow, HistoryStore};

use crate::controller::TransferController;
use crate::event::{EventPublisher, TransferEvent};
use crate::interface_monitor::{Edge, InterfaceMonitor};
use crate::resource_guard::ResourceGuard;
use crate::scheduler::Scheduler;
use crate::security;

/// Client-supplied admission request (spec.md §6 "Client request fields").
#[derive(Debug, Clone)]
pub struct AdmitRequest {
    pub owner: String,
    pub url: String,
    pub mime: Option<String>,
    pub auth_token: Option<String>,
    pub cookie_header: Option<String>,
    pub device_id: Option<String>,
    pub target_dir: Option<PathBuf>,
    pub target_filename: Option<String>,
    pub keep_filename_on_redirect: bool,
    pub can_handle_pause: bool,
    pub auto_resume: bool,
    pub append_target_file: bool,
    pub byte_range: Option<ByteRange>,
    pub interface: InterfaceId,
    pub body: TransferBody,
    /// Whether the caller is privileged (spec.md §6): non-privileged
    /// callers are confined to `target_dir` beneath `download_path`.
    pub privileged: bool,
}

enum PendingReason {
    None,
    Pausing {
        allow_start_queued: bool,
        reply: oneshot::Sender<Result<(), PauseError>>,
    },
    Cancelling {
        reply: oneshot::Sender<Result<(), PauseError>>,
    },
    Swapping {
        target: InterfaceId,
        iface_name: Option<String>,
        reply: oneshot::Sender<Result<(), SwapError>>,
    },
    /// A local disk write failed; the agent session was cancelled to stop
    /// it, but the terminal outcome must still be `write_error`, not a
    /// plain cancellation (spec.md §5 write-error code -6).
    WriteFailed,
}

struct TransferEntry {
    session: Option<SessionId>,
    record: TransferRecord,
    file: Option<tokio::fs::File>,
    pending_location: Option<String>,
    pending_reason: PendingReason,
    /// Wall-clock time of the last byte write or session (re)start, used by
    /// the watchdog sweep to detect a session that has gone silent without
    /// tripping the agent's own low-speed floor (SPEC_FULL.md §11).
    last_progress_at: std::time::Instant,
}

enum Command {
    Admit {
        req: AdmitRequest,
        reply: oneshot::Sender<Result<Ticket, AdmitError>>,
    },
    Pause {
        ticket: Ticket,
        allow_start_queued: bool,
        reply: oneshot::Sender<Result<(), PauseError>>,
    },
    PauseAll {
        reply: oneshot::Sender<()>,
    },
    Resume {
        ticket: Ticket,
        reply: oneshot::Sender<Result<(), ResumeError>>,
    },
    Cancel {
        ticket: Ticket,
        reply: oneshot::Sender<Result<(), PauseError>>,
    },
    SwapInterface {
        ticket: Ticket,
        target: InterfaceId,
        reply: oneshot::Sender<Result<(), SwapError>>,
    },
    InterfaceEdge {
        iface: InterfaceId,
        status: ConnectivityStatus,
    },
    Sweep,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap-to-clone handle; every call sends a `Command` and awaits a
/// `oneshot` reply. Dropping every handle (and the background task ending)
/// is the only way the actor stops outside an explicit `shutdown()`.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl OrchestratorHandle {
    pub async fn admit(&self, req: AdmitRequest) -> Result<Ticket, AdmitError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Admit { req, reply });
        rx.await.unwrap_or(Err(AdmitError::GeneralError))
    }

    pub async fn pause(&self, ticket: Ticket, allow_start_queued: bool) -> Result<(), PauseError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Pause { ticket, allow_start_queued, reply });
        rx.await.unwrap_or(Err(PauseError::NoSuchDownloadTask))
    }

    pub async fn pause_all(&self) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::PauseAll { reply });
        let _ = rx.await;
    }

    pub async fn resume(&self, ticket: Ticket) -> Result<(), ResumeError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Resume { ticket, reply });
        rx.await.unwrap_or(Err(ResumeError::NotInHistory))
    }

    pub async fn cancel(&self, ticket: Ticket) -> Result<(), PauseError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Cancel { ticket, reply });
        rx.await.unwrap_or(Err(PauseError::NoSuchDownloadTask))
    }

    pub async fn swap_interface(&self, ticket: Ticket, target: InterfaceId) -> Result<(), SwapError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::SwapInterface { ticket, target, reply });
        rx.await.unwrap_or(Err(SwapError::NoSuchDownloadTask))
    }

    /// Feed a raw interface-reachability observation in from the platform's
    /// connectivity watcher (out of scope; spec.md §1).
    pub fn interface_edge(&self, iface: InterfaceId, status: ConnectivityStatus) {
        let _ = self.tx.send(Command::InterfaceEdge { iface, status });
    }

    /// Ask the actor to scan for stalled sessions (watchdog tick).
    pub fn sweep(&self) {
        let _ = self.tx.send(Command::Sweep);
    }

    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Shutdown { reply });
        let _ = rx.await;
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    agent: Arc<dyn TransferAgent>,
    history: HistoryStore,
    publisher: Arc<dyn EventPublisher>,
    controller: TransferController,
    scheduler: Scheduler,
    interfaces: InterfaceMonitor,
    resources: ResourceGuard,
    ticket_gen: crate::ticket::TicketGenerator,

    transfers: HashMap<Ticket, TransferEntry>,
    session_to_ticket: HashMap<SessionId, Ticket>,

    agent_tx: mpsc::UnboundedSender<AgentEvent>,
    agent_rx: mpsc::UnboundedReceiver<AgentEvent>,
}

impl Orchestrator {
    /// Start the actor task and return a handle to it. `max_existing_ticket`
    /// seeds the ticket generator past history recovered at startup.
    pub fn spawn(
        config: OrchestratorConfig,
        agent: Arc<dyn TransferAgent>,
        history: HistoryStore,
        publisher: Arc<dyn EventPublisher>,
        resources: ResourceGuard,
        max_existing_ticket: Ticket,
    ) -> OrchestratorHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (agent_tx, agent_rx) = mpsc::unbounded_channel();

        let max_redirects = transit_core::config::MAX_REDIRECTS;
        let scheduler = Scheduler::new(config.max_concurrent, config.max_queue_length);
        let orchestrator = Orchestrator {
            config,
            agent,
            history,
            publisher,
            controller: TransferController::new(max_redirects),
            scheduler,
            interfaces: InterfaceMonitor::new(),
            resources,
            ticket_gen: crate::ticket::TicketGenerator::starting_after(max_existing_ticket),
            transfers: HashMap::new(),
            session_to_ticket: HashMap::new(),
            agent_tx,
            agent_rx,
        };

        tokio::spawn(orchestrator.run(cmd_rx));
        OrchestratorHandle { tx: cmd_tx }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown { reply }) => {
                            let _ = reply.send(());
                            info!("orchestrator actor shutting down");
                            return;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => return,
                    }
                }
                event = self.agent_rx.recv() => {
                    match event {
                        Some(event) => self.handle_agent_event(event).await,
                        None => return,
                    }
                }
            }
        }
    }

    fn iface_name(&self, iface: InterfaceId) -> Option<String> {
        match iface {
            InterfaceId::Wired => Some(self.config.wired_iface.clone()),
            InterfaceId::Wifi => Some(self.config.wifi_iface.clone()),
            InterfaceId::Wan => Some(self.config.wan_iface.clone()),
            InterfaceId::Btpan => Some(self.config.btpan_iface.clone()),
            InterfaceId::Any => None,
        }
    }

    fn resolve_interface(&self, requested: InterfaceId) -> Result<InterfaceId, AdmitError> {
        let candidate = if requested == InterfaceId::Any {
            self.interfaces.best_connected().ok_or(AdmitError::NoSuitableInterface)?
        } else {
            if self.interfaces.effective_status(requested) != ConnectivityStatus::Connected {
                return Err(AdmitError::NoSuitableInterface);
            }
            requested
        };
        if candidate == InterfaceId::Wan
            && self.interfaces.wan_subtype() == transit_core::WanSubType::OneX
            && !self.config.allow_1x
        {
            return Err(AdmitError::NoSuitableInterface);
        }
        Ok(candidate)
    }

    fn temp_path(&self, record: &TransferRecord) -> PathBuf {
        let name = record.header.dest_filename.as_deref().unwrap_or("");
        record.header.dest_dir.join(format!("{}{name}", record.header.temp_prefix))
    }

    fn final_path(&self, record: &TransferRecord) -> PathBuf {
        let name = record.header.dest_filename.as_deref().unwrap_or("");
        record.header.dest_dir.join(name)
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Admit { req, reply } => {
                let result = self.admit(req).await;
                let _ = reply.send(result);
            }
            Command::Pause { ticket, allow_start_queued, reply } => {
                self.pause(ticket, allow_start_queued, reply).await;
            }
            Command::PauseAll { reply } => {
                self.pause_all().await;
                let _ = reply.send(());
            }
            Command::Resume { ticket, reply } => {
                let result = self.resume(ticket).await;
                let _ = reply.send(result);
            }
            Command::Cancel { ticket, reply } => {
                self.cancel(ticket, reply).await;
            }
            Command::SwapInterface { ticket, target, reply } => {
                self.swap_interface(ticket, target, reply).await;
            }
            Command::InterfaceEdge { iface, status } => {
                self.interface_edge(iface, status).await;
            }
            Command::Sweep => self.sweep().await,
            Command::Shutdown { .. } => unreachable!("handled in run()"),
        }
    }

    async fn admit(&mut self, req: AdmitRequest) -> Result<Ticket, AdmitError> {
        security::validate_scheme(&req.url)?;
        if let TransferBody::Upload(upload) = &req.body {
            if let Some(content_type) = &upload.content_type {
                security::validate_content_type(content_type)?;
            }
        }
        let dest_dir = req.target_dir.clone().unwrap_or_else(|| self.config.download_path.clone());
        let media_root = (!req.privileged).then_some(self.config.download_path.as_path());
        security::validate_target_dir(&dest_dir, media_root)?;

        // spec.md §4.5: QueueFull is checked before interface resolution.
        if !self.scheduler.has_admission_room() {
            return Err(AdmitError::QueueFull);
        }

        let interface = self.resolve_interface(req.interface)?;

        if self.config.preemptive_free_space_check && !self.resources.admit(&dest_dir) {
            return Err(AdmitError::FilesystemFull);
        }

        let explicit_filename = req.target_filename.is_some();
        let candidate = req
            .target_filename
            .clone()
            .or_else(|| security::filename_from_url(&req.url))
            .unwrap_or_else(|| security::mint_unique_name(|n| dest_dir.join(n).exists()));
        security::validate_filename(&candidate)?;
        let filename = if explicit_filename {
            candidate
        } else {
            security::resolve_collision(&candidate, |n| {
                dest_dir.join(n).exists() || dest_dir.join(format!(".transit-tmp{n}")).exists()
            })
        };

        let ticket = self.ticket_gen.next();
        let (initial_offset, byte_range) = match req.byte_range {
            Some(r) => (r.low, Some(r)),
            None => (0, None),
        };

        let header = TransferHeader {
            ticket,
            owner: req.owner,
            source_url: req.url,
            mime: req.mime,
            dest_dir,
            dest_filename: Some(filename),
            temp_prefix: ".transit-tmp".to_string(),
            auth_token: req.auth_token,
            device_id: req.device_id,
            cookie_header: req.cookie_header,
            initial_offset,
            bytes_completed: initial_offset,
            bytes_total: 0,
            byte_range,
            flags: TransferFlags {
                keep_filename_on_redirect: req.keep_filename_on_redirect,
                can_handle_pause: req.can_handle_pause,
                auto_resume: req.auto_resume,
                append: req.append_target_file,
            },
            interface,
            wan_subtype: self.interfaces.wan_subtype(),
            redirect_budget: self.controller.max_redirects,
            last_update: initial_offset,
            update_interval: crate::controller::DEFAULT_UPDATE_INTERVAL_BYTES,
            error_count: 0,
            queued: !self.scheduler.has_active_capacity(),
            state: if self.scheduler.has_active_capacity() {
                TransferState::Running
            } else {
                TransferState::Queued
            },
        };

        let record = TransferRecord { header, body: req.body };
        let running = self.scheduler.has_active_capacity();

        let mut entry = TransferEntry {
            session: None,
            record,
            file: None,
            pending_location: None,
            pending_reason: PendingReason::None,
            last_progress_at: std::time::Instant::now(),
        };

        self.persist(&entry.record).await;

        if running {
            self.scheduler.admit_running(ticket);
            if let Err(e) = self.start_session(&mut entry, initial_offset).await {
                warn!("ticket {ticket} failed to start: {e}");
                self.scheduler.vacate_active(ticket);
                entry.record.header.state = TransferState::Cancelled;
                self.persist(&entry.record).await;
                self.publisher.publish(
                    ticket,
                    TransferEvent::Terminal { code: CompletionCode::GeneralError, http_status: None, target: None },
                );
                return Ok(ticket);
            }
        } else {
            self.scheduler.admit_queued(ticket);
        }

        self.resources.wake_lock(!self.is_idle());
        self.transfers.insert(ticket, entry);
        Ok(ticket)
    }

    fn is_idle(&self) -> bool {
        self.scheduler.is_idle()
    }

    async fn persist(&self, record: &TransferRecord) {
        let blob = match transit_core::record::to_blob(record) {
            Ok(b) => b,
            Err(e) => {
                warn!("ticket {} failed to serialize for history: {e}", record.header.ticket);
                return;
            }
        };
        let row = HistoryRow {
            ticket: record.header.ticket,
            owner: record.header.owner.clone(),
            interface: record.header.interface.as_str().to_string(),
            state: record.header.state,
            record_blob: blob,
        };
        if let Err(e) = self.history.upsert(&row).await {
            warn!("ticket {} history upsert failed: {e}", record.header.ticket);
        }
    }

    /// Open the temp file (fresh or resumed) and hand the session to the
    /// agent. `resume_from` is the byte offset to request from the remote.
    async fn start_session(&mut self, entry: &mut TransferEntry, resume_from: u64) -> std::io::Result<()> {
        let temp_path = self.temp_path(&entry.record);
        let is_upload = entry.record.body.is_upload();

        let file = if is_upload {
            None
        } else if resume_from > 0 {
            let mut f = OpenOptions::new().write(true).open(&temp_path).await?;
            f.seek(SeekFrom::Start(resume_from - entry.record.header.initial_offset)).await?;
            Some(f)
        } else {
            let mut opts = OpenOptions::new();
            opts.write(true).create(true);
            if entry.record.header.flags.append {
                opts.append(true);
            } else {
                opts.truncate(true);
            }
            Some(opts.open(&temp_path).await?)
        };

        let session = SessionId::new();
        let upload = match &entry.record.body {
            TransferBody::Upload(UploadDetails { content_type, .. }) => Some(transit_agent::UploadBody {
                path: self.final_path(&entry.record),
                offset: resume_from,
                content_type: content_type.clone(),
            }),
            TransferBody::Download => None,
        };

        let header = &entry.record.header;
        let mut headers = Vec::new();
        if let Some(token) = &header.auth_token {
            headers.push(("Authorization".to_string(), token.clone()));
        }
        if let Some(device_id) = &header.device_id {
            headers.push(("X-Device-Id".to_string(), device_id.clone()));
        }
        if let TransferBody::Upload(UploadDetails { custom_http_headers, .. }) = &entry.record.body {
            for raw in custom_http_headers {
                if let Some((name, value)) = raw.split_once(':') {
                    headers.push((name.trim().to_string(), value.trim().to_string()));
                }
            }
        }

        let request = AgentRequest {
            url: header.source_url.clone(),
            resume_from,
            interface: self.iface_name(header.interface),
            headers,
            cookie_header: header.cookie_header.clone(),
            low_speed_floor_bytes_per_sec: transit_core::config::LOW_SPEED_FLOOR_BYTES_PER_SEC,
            low_speed_window_secs: transit_core::config::LOW_SPEED_WINDOW_SECS,
            connect_timeout_secs: transit_core::config::CONNECT_TIMEOUT_SECS,
            upload,
        };

        if let Err(e) = self.agent.start(session, request, self.agent_tx.clone()) {
            return Err(std::io::Error::other(e.to_string()));
        }

        entry.file = file;
        entry.session = Some(session);
        entry.pending_location = None;
        entry.last_progress_at = std::time::Instant::now();
        self.session_to_ticket.insert(session, entry.record.header.ticket);
        Ok(())
    }

    async fn pause(
        &mut self,
        ticket: Ticket,
        allow_start_queued: bool,
        reply: oneshot::Sender<Result<(), PauseError>>,
    ) {
        let Some(entry) = self.transfers.get_mut(&ticket) else {
            let _ = reply.send(Err(PauseError::NoSuchDownloadTask));
            return;
        };

        if !entry.record.header.flags.can_handle_pause {
            drop(entry);
            self.cancel(ticket, reply).await;
            return;
        }

        match entry.session {
            Some(session) => {
                entry.pending_reason = PendingReason::Pausing { allow_start_queued, reply };
                self.agent.cancel(session);
            }
            None => {
                self.scheduler.remove_from_queue(ticket);
                entry.record.header.state = TransferState::Interrupted;
                let record = entry.record.clone();
                self.persist(&record).await;
                self.publisher.publish(ticket, TransferEvent::Paused);
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn pause_all(&mut self) {
        let tickets: Vec<Ticket> = self.transfers.keys().copied().collect();
        for ticket in tickets {
            let (reply, _rx) = oneshot::channel();
            self.pause(ticket, false, reply).await;
        }
    }

    async fn resume(&mut self, ticket: Ticket) -> Result<(), ResumeError> {
        let entry = self.transfers.get(&ticket).ok_or(ResumeError::NotInHistory)?;
        if entry.record.header.state != TransferState::Interrupted {
            return Err(ResumeError::NotInterrupted);
        }

        let dest_dir = entry.record.header.dest_dir.clone();
        if !self.resources.admit(&dest_dir) {
            return Err(ResumeError::FilesystemFull);
        }

        let requested_iface = entry.record.header.interface;
        if requested_iface != InterfaceId::Any
            && self.interfaces.effective_status(requested_iface) != ConnectivityStatus::Connected
        {
            return Err(ResumeError::InterfaceDown);
        }

        if !self.scheduler.has_admission_room() {
            return Err(ResumeError::QueueFull);
        }

        let temp_path = self.temp_path(&entry.record);
        let file_exists = tokio::fs::try_exists(&temp_path).await.unwrap_or(false);

        let entry = self.transfers.get_mut(&ticket).expect("checked above");
        let resume_from = if file_exists {
            entry.record.header.bytes_completed
        } else {
            entry.record.header.bytes_completed = entry.record.header.initial_offset;
            entry.record.header.last_update = entry.record.header.initial_offset;
            entry.record.header.initial_offset
        };

        let running = self.scheduler.has_active_capacity();
        if running {
            self.scheduler.admit_running(ticket);
            entry.record.header.state = TransferState::Running;
            entry.record.header.queued = false;
            if let Err(e) = self.start_session(entry, resume_from).await {
                warn!("ticket {ticket} resume failed to start: {e}");
                self.scheduler.vacate_active(ticket);
                return Err(ResumeError::CannotAccessTemp);
            }
        } else {
            self.scheduler.admit_queued(ticket);
            entry.record.header.state = TransferState::Queued;
            entry.record.header.queued = true;
        }

        let record = entry.record.clone();
        self.persist(&record).await;
        self.resources.wake_lock(!self.is_idle());
        Ok(())
    }

    async fn cancel(&mut self, ticket: Ticket, reply: oneshot::Sender<Result<(), PauseError>>) {
        let Some(entry) = self.transfers.get_mut(&ticket) else {
            // Already terminal (removed from the live map) is a no-op success;
            // truly unknown tickets report NoSuchDownloadTask.
            let known = matches!(self.history.get(ticket).await, Ok(Some(_)));
            let _ = reply.send(if known { Ok(()) } else { Err(PauseError::NoSuchDownloadTask) });
            return;
        };

        match entry.session {
            Some(session) => {
                entry.pending_reason = PendingReason::Cancelling { reply };
                self.agent.cancel(session);
            }
            None => {
                self.scheduler.remove_from_queue(ticket);
                self.finalize_cancelled(ticket).await;
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn swap_interface(
        &mut self,
        ticket: Ticket,
        target: InterfaceId,
        reply: oneshot::Sender<Result<(), SwapError>>,
    ) {
        if target == InterfaceId::Any {
            let _ = reply.send(Err(SwapError::InvalidTarget));
            return;
        }
        let Some(entry) = self.transfers.get_mut(&ticket) else {
            let _ = reply.send(Err(SwapError::NoSuchDownloadTask));
            return;
        };
        if entry.record.header.interface == target {
            let _ = reply.send(Ok(()));
            return;
        }

        let iface_name = self.iface_name(target);
        match entry.session {
            Some(session) => {
                entry.pending_reason = PendingReason::Swapping { target, iface_name, reply };
                self.agent.cancel(session);
            }
            None => {
                entry.record.header.interface = target;
                let record = entry.record.clone();
                self.persist(&record).await;
                let _ = reply.send(Ok(()));
            }
        }
    }

    /// Delete the temp file, mark the ticket cancelled, publish the terminal
    /// event, and drop it from the live map.
    async fn finalize_cancelled(&mut self, ticket: Ticket) {
        if let Some(entry) = self.transfers.get_mut(&ticket) {
            entry.file = None;
            let temp_path = self.temp_path(&entry.record);
            let _ = tokio::fs::remove_file(&temp_path).await;
            entry.record.header.state = TransferState::Cancelled;
            let record = entry.record.clone();
            self.persist(&record).await;
            self.publisher.publish(
                ticket,
                TransferEvent::Terminal { code: CompletionCode::Cancelled, http_status: None, target: None },
            );
        }
        self.transfers.remove(&ticket);
        self.resources.wake_lock(!self.is_idle());
    }

    async fn interface_edge(&mut self, iface: InterfaceId, status: ConnectivityStatus) {
        let edges = self.interfaces.update(iface, status);
        if edges.is_empty() {
            return;
        }

        for edge in edges {
            match edge {
                Edge::Down(down_iface) => self.handle_interface_down(down_iface).await,
                Edge::Up(up_iface) => self.handle_interface_up(up_iface).await,
            }
        }

        if self.interfaces.all_disconnected() {
            self.pause_all().await;
        }
    }

    async fn handle_interface_down(&mut self, down_iface: InterfaceId) {
        let affected: Vec<Ticket> = self
            .transfers
            .iter()
            .filter(|(_, e)| e.record.header.interface == down_iface && e.session.is_some())
            .map(|(t, _)| *t)
            .collect();
        for ticket in affected {
            // Bulk interface-down pause never promotes a queued ticket.
            let (reply, _rx) = oneshot::channel();
            self.pause(ticket, false, reply).await;
        }
    }

    async fn handle_interface_up(&mut self, up_iface: InterfaceId) {
        let candidates: Vec<Ticket> = self
            .transfers
            .iter()
            .filter(|(_, e)| {
                e.record.header.state == TransferState::Interrupted
                    && e.record.header.flags.auto_resume
                    && (e.record.header.interface == up_iface || e.record.header.interface == InterfaceId::Any)
            })
            .map(|(t, _)| *t)
            .collect();
        for ticket in candidates {
            if let Err(e) = self.resume(ticket).await {
                debug!("ticket {ticket} auto-resume on {up_iface} up-edge failed: {e}");
            }
        }

        if self.config.resume_aggression {
            self.resume_aggressively(up_iface).await;
        }
    }

    /// With `resume_aggression`, move transfers off disconnected interfaces
    /// onto the interface that just came up, and swap every active transfer
    /// onto wired (or wifi, if wired isn't connected) on its up-edge.
    async fn resume_aggressively(&mut self, up_iface: InterfaceId) {
        if !matches!(up_iface, InterfaceId::Wired | InterfaceId::Wifi) {
            return;
        }
        if up_iface == InterfaceId::Wifi && self.interfaces.effective_status(InterfaceId::Wired) == ConnectivityStatus::Connected {
            return;
        }

        let active: Vec<Ticket> = self
            .transfers
            .iter()
            .filter(|(_, e)| e.session.is_some() && e.record.header.interface != up_iface)
            .map(|(t, _)| *t)
            .collect();

        for ticket in active {
            let (reply, _rx) = oneshot::channel();
            self.swap_interface(ticket, up_iface, reply).await;
        }
    }

    /// Watchdog tick (SPEC_FULL.md §11, grounded in the original
    /// `Watchdog` activity check). Agents enforce their own low-speed
    /// floor on a trickling transfer, but a session that has gone
    /// completely silent — no header, no write, no `Done` — never trips
    /// that floor on its own. Declare any running session whose
    /// `last_progress_at` exceeds `stall_window_secs` dead, and classify
    /// it exactly as a transport failure (spec.md §5 "Timeout semantics").
    async fn sweep(&mut self) {
        let window = std::time::Duration::from_secs(self.config.stall_window_secs);
        let stalled: Vec<(Ticket, SessionId, bool)> = self
            .transfers
            .iter()
            .filter_map(|(ticket, entry)| {
                let session = entry.session?;
                if entry.last_progress_at.elapsed() < window {
                    return None;
                }
                Some((*ticket, session, entry.record.header.flags.can_handle_pause))
            })
            .collect();

        for (ticket, session, can_handle_pause) in stalled {
            warn!("ticket {ticket} stalled past {}s, declaring dead", self.config.stall_window_secs);
            self.session_to_ticket.remove(&session);
            self.agent.cancel(session);
            if let Some(entry) = self.transfers.get_mut(&ticket) {
                entry.session = None;
                entry.pending_reason = PendingReason::None;
            }
            let code = self.controller.classify_transport_failure(can_handle_pause);
            self.settle(ticket, code, None).await;
        }

        debug!(
            "sweep: {} active, {} queued, {} tracked",
            self.scheduler.active_len(),
            self.scheduler.queue_len(),
            self.transfers.len()
        );
    }

    async fn handle_agent_event(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::Header { session, name, value } => self.on_header(session, name, value).await,
            AgentEvent::Write { session, bytes } => self.on_write(session, bytes).await,
            // Neither concrete agent uses this: both read the upload file
            // straight off disk via `AgentRequest.upload`. Kept for an
            // agent with no filesystem access of its own; any such caller
            // sees immediate EOF today.
            AgentEvent::ReadRequest { reply, .. } => {
                let _ = reply.send(Vec::new());
            }
            AgentEvent::Done { session, outcome } => self.on_done(session, outcome).await,
        }
    }

    async fn on_header(&mut self, session: SessionId, name: String, value: String) {
        let Some(&ticket) = self.session_to_ticket.get(&session) else { return };
        let Some(entry) = self.transfers.get_mut(&ticket) else { return };

        if name.eq_ignore_ascii_case("content-length") {
            if let Ok(len) = value.parse::<u64>() {
                self.controller.apply_content_length(&mut entry.record.header, len);
            }
        } else if name.eq_ignore_ascii_case("location") {
            entry.pending_location = Some(value);
        }
    }

    async fn on_write(&mut self, session: SessionId, bytes: bytes::Bytes) {
        let Some(&ticket) = self.session_to_ticket.get(&session) else { return };
        let Some(entry) = self.transfers.get_mut(&ticket) else { return };

        if let Some(file) = entry.file.as_mut() {
            if let Err(e) = file.write_all(&bytes).await {
                warn!("ticket {ticket} write failed: {e}");
                entry.pending_reason = PendingReason::WriteFailed;
                self.agent.cancel(session);
                return;
            }
        }
        entry.record.header.bytes_completed += bytes.len() as u64;
        entry.last_progress_at = std::time::Instant::now();

        if self.controller.should_emit_progress(&entry.record.header) {
            self.controller.record_progress(&mut entry.record.header);
            let bytes_completed = entry.record.header.bytes_completed;
            let bytes_total = entry.record.header.bytes_total;
            self.publisher.publish(ticket, TransferEvent::Progress { bytes_completed, bytes_total });
            let record = entry.record.clone();
            self.persist(&record).await;
        }
    }

    async fn on_done(&mut self, session: SessionId, outcome: AgentOutcome) {
        let Some(ticket) = self.session_to_ticket.remove(&session) else { return };
        let Some(entry) = self.transfers.get_mut(&ticket) else { return };
        entry.session = None;
        entry.file = None;

        let pending = std::mem::replace(&mut entry.pending_reason, PendingReason::None);
        if let AgentOutcome::Cancelled = outcome {
            match pending {
                PendingReason::Pausing { allow_start_queued, reply } => {
                    self.finish_pause(ticket, allow_start_queued).await;
                    let _ = reply.send(Ok(()));
                    return;
                }
                PendingReason::Cancelling { reply } => {
                    self.finalize_cancelled(ticket).await;
                    let _ = reply.send(Ok(()));
                    return;
                }
                PendingReason::Swapping { target, iface_name, reply } => {
                    self.finish_swap(ticket, target, iface_name).await;
                    let _ = reply.send(Ok(()));
                    return;
                }
                PendingReason::WriteFailed => {
                    let can_handle_pause = self
                        .transfers
                        .get(&ticket)
                        .map(|e| e.record.header.flags.can_handle_pause)
                        .unwrap_or(false);
                    let code = self.controller.classify_transport_failure(can_handle_pause);
                    self.settle(ticket, code, None).await;
                    return;
                }
                PendingReason::None => {
                    warn!("ticket {ticket} session cancelled without a pending reason");
                    self.scheduler.vacate_active(ticket);
                    self.finalize_cancelled(ticket).await;
                    self.dequeue_next().await;
                    return;
                }
            }
        }

        // Not our own cancellation: restore a no-op pending reason and
        // process the real agent outcome.
        match outcome {
            AgentOutcome::Ok { http_status } => self.on_ok(ticket, http_status).await,
            AgentOutcome::HttpError { http_status: _ } => {
                self.settle(ticket, CompletionCode::HttpError, None).await
            }
            AgentOutcome::ConnectTimeout => self.settle_interrupted(ticket, CompletionCode::ConnectTimeout).await,
            AgentOutcome::LowSpeed => {
                let can_handle_pause = self
                    .transfers
                    .get(&ticket)
                    .map(|e| e.record.header.flags.can_handle_pause)
                    .unwrap_or(false);
                let code = self.controller.classify_low_speed(can_handle_pause);
                self.settle(ticket, code, None).await;
            }
            AgentOutcome::WriteError => {
                let can_handle_pause = self
                    .transfers
                    .get(&ticket)
                    .map(|e| e.record.header.flags.can_handle_pause)
                    .unwrap_or(false);
                let code = self.controller.classify_transport_failure(can_handle_pause);
                self.settle(ticket, code, None).await;
            }
            AgentOutcome::Transport(msg) => {
                warn!("ticket {ticket} transport error: {msg}");
                let can_handle_pause = self
                    .transfers
                    .get(&ticket)
                    .map(|e| e.record.header.flags.can_handle_pause)
                    .unwrap_or(false);
                let code = self.controller.classify_transport_failure(can_handle_pause);
                self.settle(ticket, code, None).await;
            }
            AgentOutcome::Cancelled => unreachable!("handled above"),
        }
    }

    async fn on_ok(&mut self, ticket: Ticket, http_status: u16) {
        use crate::controller::HttpStatusClass;
        match crate::controller::classify_http_status(http_status) {
            HttpStatusClass::Success => {
                let (short, can_handle_pause) = {
                    let Some(entry) = self.transfers.get(&ticket) else { return };
                    let h = &entry.record.header;
                    (h.bytes_total > 0 && h.bytes_completed < h.bytes_total, h.flags.can_handle_pause)
                };
                if short {
                    let code = self.controller.classify_short_body(can_handle_pause);
                    self.settle(ticket, code, Some(http_status)).await;
                } else {
                    self.complete_success(ticket, http_status).await;
                }
            }
            HttpStatusClass::Redirect => self.handle_redirect(ticket, http_status).await,
            HttpStatusClass::Error => self.settle(ticket, CompletionCode::HttpError, Some(http_status)).await,
        }
    }

    async fn complete_success(&mut self, ticket: Ticket, http_status: u16) {
        self.scheduler.vacate_active(ticket);
        let Some(entry) = self.transfers.get_mut(&ticket) else { return };

        let temp_path = self.temp_path(&entry.record);
        let final_path = self.final_path(&entry.record);
        if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
            warn!("ticket {ticket} rename to final path failed: {e}");
        } else if let Ok(f) = tokio::fs::File::open(&final_path).await {
            let _ = f.sync_all().await;
        }

        entry.record.header.state = TransferState::Completed;
        let record = entry.record.clone();
        self.persist(&record).await;
        self.publisher.publish(
            ticket,
            TransferEvent::Terminal { code: CompletionCode::Ok, http_status: Some(http_status), target: Some(final_path) },
        );
        self.transfers.remove(&ticket);
        self.resources.wake_lock(!self.is_idle());
        self.dequeue_next().await;
    }

    /// Non-resumable terminal outcome: delete the temp file, persist
    /// `cancelled`, and publish the terminal event carrying `code`.
    async fn settle(&mut self, ticket: Ticket, code: CompletionCode, http_status: Option<u16>) {
        if code == CompletionCode::Interrupted {
            self.settle_interrupted(ticket, code).await;
            return;
        }
        self.scheduler.vacate_active(ticket);
        if let Some(entry) = self.transfers.get_mut(&ticket) {
            entry.file = None;
            let temp_path = self.temp_path(&entry.record);
            let _ = tokio::fs::remove_file(&temp_path).await;
            entry.record.header.state = TransferState::Cancelled;
            entry.record.header.error_count += 1;
            let record = entry.record.clone();
            self.persist(&record).await;
            self.publisher.publish(ticket, TransferEvent::Terminal { code, http_status, target: None });
        }
        self.transfers.remove(&ticket);
        self.resources.wake_lock(!self.is_idle());
        self.dequeue_next().await;
    }

    /// Resumable terminal outcome: retain the temp file, persist
    /// `interrupted`. If the ticket is auto-resumable, publish a
    /// non-terminal `Interrupted` event and leave it live for an explicit
    /// or auto-resume; otherwise this interruption is itself the ticket's
    /// terminal event (spec.md §4.7 "completed, cancelled, or
    /// interrupted-and-not-auto-resumable").
    async fn settle_interrupted(&mut self, ticket: Ticket, code: CompletionCode) {
        self.scheduler.vacate_active(ticket);
        if let Some(entry) = self.transfers.get_mut(&ticket) {
            entry.record.header.state = TransferState::Interrupted;
            entry.record.header.error_count += 1;
            let auto_resume = entry.record.header.flags.auto_resume;
            let record = entry.record.clone();
            self.persist(&record).await;
            if auto_resume {
                self.publisher.publish(ticket, TransferEvent::Interrupted);
            } else {
                self.publisher.publish(ticket, TransferEvent::Terminal { code, http_status: None, target: None });
            }
        }
        self.resources.wake_lock(!self.is_idle());
        self.dequeue_next().await;
    }

    async fn finish_pause(&mut self, ticket: Ticket, allow_start_queued: bool) {
        self.scheduler.vacate_active(ticket);
        if let Some(entry) = self.transfers.get_mut(&ticket) {
            entry.record.header.state = TransferState::Interrupted;
            let record = entry.record.clone();
            self.persist(&record).await;
            self.publisher.publish(ticket, TransferEvent::Paused);
        }
        self.resources.wake_lock(!self.is_idle());
        if allow_start_queued {
            self.dequeue_next().await;
        }
    }

    async fn finish_swap(&mut self, ticket: Ticket, target: InterfaceId, iface_name: Option<String>) {
        let _ = iface_name;
        self.scheduler.vacate_active(ticket);
        let Some(entry) = self.transfers.get_mut(&ticket) else { return };
        entry.record.header.interface = target;
        let resume_from = entry.record.header.bytes_completed;

        if self.scheduler.has_active_capacity() {
            self.scheduler.admit_running(ticket);
            let entry = self.transfers.get_mut(&ticket).expect("checked above");
            if let Err(e) = self.start_session(entry, resume_from).await {
                warn!("ticket {ticket} swap restart failed: {e}");
                self.scheduler.vacate_active(ticket);
                entry.record.header.state = TransferState::Interrupted;
                let record = entry.record.clone();
                self.persist(&record).await;
                self.publisher.publish(ticket, TransferEvent::Interrupted);
            }
        } else {
            self.scheduler.admit_queued(ticket);
            let entry = self.transfers.get_mut(&ticket).expect("checked above");
            entry.record.header.state = TransferState::Queued;
            let record = entry.record.clone();
            self.persist(&record).await;
        }
    }

    /// Promote the queue head, if capacity allows, and launch its session.
    async fn dequeue_next(&mut self) {
        let Some(ticket) = self.scheduler.dequeue_if_capacity() else { return };
        let Some(entry) = self.transfers.get_mut(&ticket) else { return };
        entry.record.header.state = TransferState::Running;
        entry.record.header.queued = false;
        let resume_from = entry.record.header.bytes_completed;
        if let Err(e) = self.start_session(entry, resume_from).await {
            warn!("ticket {ticket} dequeue-start failed: {e}");
            self.scheduler.vacate_active(ticket);
            entry.record.header.state = TransferState::Interrupted;
        }
        let record = entry.record.clone();
        self.persist(&record).await;
        self.resources.wake_lock(!self.is_idle());
    }

    async fn handle_redirect(&mut self, ticket: Ticket, http_status: u16) {
        let Some(entry) = self.transfers.get_mut(&ticket) else { return };
        let location = entry.pending_location.take();

        let Some(location) = location else {
            self.settle(ticket, CompletionCode::HttpError, Some(http_status)).await;
            return;
        };

        if !self.controller.try_follow_redirect(&mut entry.record.header) {
            self.settle(ticket, CompletionCode::Cancelled, Some(http_status)).await;
            return;
        }

        let temp_path = self.temp_path(&entry.record);
        let _ = tokio::fs::remove_file(&temp_path).await;

        self.controller.reset_for_redirect(&mut entry.record.header);
        entry.record.header.source_url = location;
        if entry.record.header.dest_filename.is_none() {
            let candidate = security::filename_from_url(&entry.record.header.source_url)
                .unwrap_or_else(|| security::mint_unique_name(|n| entry.record.header.dest_dir.join(n).exists()));
            entry.record.header.dest_filename = Some(candidate);
        }

        let resume_from = entry.record.header.bytes_completed;
        if let Err(e) = self.start_session(entry, resume_from).await {
            warn!("ticket {ticket} redirect restart failed: {e}");
            self.settle(ticket, CompletionCode::GeneralError, None).await;
            return;
        }
        let record = entry.record.clone();
        self.persist(&record).await;
    }
}

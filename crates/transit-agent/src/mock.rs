//! Deterministic `TransferAgent` for the orchestrator's scenario tests.
//! Every session is scripted up front; no real I/O happens.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;

use crate::{AgentEvent, AgentOutcome, AgentRequest, Error, Result, SessionId, TransferAgent};

/// One scripted step. The mock plays a session's `Vec<Step>` in order,
/// then emits `Done(outcome)`.
#[derive(Debug, Clone)]
pub enum Step {
    Header { name: String, value: String },
    Write(Bytes),
    /// Suspend until the test calls `MockTransferAgent::release`, to model
    /// an interface-down window or a deliberate pause point.
    Hold,
}

#[derive(Debug, Clone)]
pub struct Script {
    pub steps: Vec<Step>,
    pub outcome: AgentOutcome,
}

struct Running {
    session: SessionId,
    script: Script,
    cursor: usize,
    events: UnboundedSender<AgentEvent>,
    cancelled: bool,
}

/// Keyed by request URL so a test can script "download this URL" without
/// knowing the `SessionId` the orchestrator will mint for it.
pub struct MockTransferAgent {
    scripts: Mutex<HashMap<String, Script>>,
    running: Mutex<HashMap<SessionId, Running>>,
}

impl MockTransferAgent {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn script(&self, url: impl Into<String>, script: Script) {
        self.scripts.lock().unwrap().insert(url.into(), script);
    }

    /// Advance a held session past its `Hold` step, e.g. once a test has
    /// simulated the interface coming back.
    pub fn release(&self, session: SessionId) {
        let mut running = self.running.lock().unwrap();
        if let Some(r) = running.get_mut(&session) {
            r.cursor += 1;
            drain(r);
        }
    }
}

impl Default for MockTransferAgent {
    fn default() -> Self {
        Self::new()
    }
}

fn drain(r: &mut Running) {
    while r.cursor < r.script.steps.len() {
        if r.cancelled {
            return;
        }
        match &r.script.steps[r.cursor] {
            Step::Header { name, value } => {
                let _ = r.events.send(AgentEvent::Header {
                    session: r.session,
                    name: name.clone(),
                    value: value.clone(),
                });
            }
            Step::Write(bytes) => {
                let _ = r.events.send(AgentEvent::Write {
                    session: r.session,
                    bytes: bytes.clone(),
                });
            }
            Step::Hold => return,
        }
        r.cursor += 1;
    }
    let _ = r.events.send(AgentEvent::Done {
        session: r.session,
        outcome: r.script.outcome.clone(),
    });
}

impl TransferAgent for MockTransferAgent {
    fn start(
        &self,
        session: SessionId,
        request: AgentRequest,
        events: UnboundedSender<AgentEvent>,
    ) -> Result<()> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&request.url)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("no script for {}", request.url)))?;

        let mut running = Running {
            session,
            script,
            cursor: 0,
            events,
            cancelled: false,
        };
        drain(&mut running);
        if running.cursor < running.script.steps.len() {
            self.running.lock().unwrap().insert(session, running);
        }
        Ok(())
    }

    fn cancel(&self, session: SessionId) {
        if let Some(r) = self.running.lock().unwrap().get_mut(&session) {
            r.cancelled = true;
            let _ = r.events.send(AgentEvent::Done {
                session,
                outcome: AgentOutcome::Cancelled,
            });
        }
    }

    fn swap_interface(
        &self,
        session: SessionId,
        _interface: Option<String>,
        _resume_from: u64,
        events: UnboundedSender<AgentEvent>,
    ) -> Result<()> {
        self.release(session);
        let _ = events;
        Ok(())
    }
}

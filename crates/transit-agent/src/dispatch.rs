//! Scheme-routing `TransferAgent` that hands each session to the http or
//! ftp engine based on the request URL (spec.md §2 scheme support).

use tokio::sync::mpsc::UnboundedSender;

use crate::ftp::FtpAgent;
use crate::http::ReqwestAgent;
use crate::{AgentEvent, AgentRequest, Error, Result, SessionId, TransferAgent};

pub struct CompositeTransferAgent {
    http: ReqwestAgent,
    ftp: FtpAgent,
}

impl CompositeTransferAgent {
    pub fn new() -> Self {
        Self {
            http: ReqwestAgent::new(),
            ftp: FtpAgent::new(),
        }
    }

    fn engine_for(&self, url: &str) -> Option<&dyn TransferAgent> {
        if url.starts_with("http://") || url.starts_with("https://") {
            Some(&self.http)
        } else if url.starts_with("ftp://") {
            Some(&self.ftp)
        } else {
            None
        }
    }
}

impl Default for CompositeTransferAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferAgent for CompositeTransferAgent {
    fn start(
        &self,
        session: SessionId,
        request: AgentRequest,
        events: UnboundedSender<AgentEvent>,
    ) -> Result<()> {
        match self.engine_for(&request.url) {
            Some(engine) => engine.start(session, request, events),
            None => Err(Error::UnsupportedScheme(request.url)),
        }
    }

    fn cancel(&self, session: SessionId) {
        // Both engines no-op a miss, so it's safe to fan the cancel out to
        // whichever one actually owns the session.
        self.http.cancel(session);
        self.ftp.cancel(session);
    }

    fn swap_interface(
        &self,
        session: SessionId,
        interface: Option<String>,
        resume_from: u64,
        events: UnboundedSender<AgentEvent>,
    ) -> Result<()> {
        match self.http.swap_interface(session, interface.clone(), resume_from, events.clone()) {
            Err(Error::NoSuchSession) => {
                self.ftp.swap_interface(session, interface, resume_from, events)
            }
            other => other,
        }
    }
}

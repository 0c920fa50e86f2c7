//! End-to-end scenario tests driving the real `Orchestrator` actor against a
//! `MockTransferAgent` (spec.md §8). Each test opens its own in-memory
//! history store and a fresh temp directory for the download path.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;

use transit_agent::dispatch::CompositeTransferAgent;
use transit_agent::mock::{MockTransferAgent, Script, Step};
use transit_agent::AgentOutcome;
use transit_core::{AdmitError, InterfaceId, OrchestratorConfig, Ticket, TransferBody};
use transit_history::HistoryStore;
use transit_orchestrator::{
    AdmitRequest, BroadcastEventPublisher, NullWakeLock, Orchestrator, ResourceGuard, TransferEvent,
};

fn config(download_path: PathBuf) -> OrchestratorConfig {
    OrchestratorConfig {
        download_path,
        max_concurrent: 2,
        max_queue_length: 128,
        ..OrchestratorConfig::default()
    }
}

fn base_request(url: &str, dest_dir: &PathBuf) -> AdmitRequest {
    AdmitRequest {
        owner: "app".into(),
        url: url.to_string(),
        mime: None,
        auth_token: None,
        cookie_header: None,
        device_id: None,
        target_dir: Some(dest_dir.clone()),
        target_filename: None,
        keep_filename_on_redirect: false,
        can_handle_pause: true,
        auto_resume: true,
        append_target_file: false,
        byte_range: None,
        interface: InterfaceId::Any,
        body: TransferBody::Download,
        privileged: false,
    }
}

/// Wait for the next published event belonging to `ticket` that satisfies
/// `pred`, ignoring any other traffic on the bus. Bounded so a logic bug
/// hangs the test instead of the runner.
async fn wait_for(
    rx: &mut broadcast::Receiver<(Ticket, TransferEvent)>,
    ticket: Ticket,
    pred: impl Fn(&TransferEvent) -> bool,
) -> TransferEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let (t, event) = rx.recv().await.expect("publisher channel closed early");
            if t == ticket && pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for expected event")
}

/// Happy path: an 8 MiB download delivered in twenty 400 KiB chunks (the
/// update-interval clamp's own target event count), completing to the
/// renamed final path (spec.md §4.6, §8 scenario 1).
#[tokio::test]
async fn happy_path_completes_and_renames_into_place() {
    let download_dir = tempfile::tempdir().unwrap();
    let agent = Arc::new(MockTransferAgent::new());

    const TOTAL: u64 = 8_000_000;
    const CHUNK: u64 = 400_000;
    let mut steps = vec![Step::Header { name: "Content-Length".into(), value: TOTAL.to_string() }];
    for _ in 0..(TOTAL / CHUNK) {
        steps.push(Step::Write(Bytes::from(vec![7u8; CHUNK as usize])));
    }
    agent.script(
        "http://example.test/big.bin",
        Script { steps, outcome: AgentOutcome::Ok { http_status: 200 } },
    );

    let history = HistoryStore::open_in_memory().await.unwrap();
    let publisher = Arc::new(BroadcastEventPublisher::default());
    let mut events = publisher.subscribe();
    let resources = ResourceGuard::new(&config(download_dir.path().to_path_buf()), Box::new(NullWakeLock));

    let handle = Orchestrator::spawn(
        config(download_dir.path().to_path_buf()),
        agent,
        history,
        publisher,
        resources,
        0,
    );

    let req = base_request("http://example.test/big.bin", &download_dir.path().to_path_buf());
    let ticket = handle.admit(req).await.unwrap();

    let mut progress_events = 0u32;
    loop {
        let (t, event) = events.recv().await.unwrap();
        if t != ticket {
            continue;
        }
        match event {
            TransferEvent::Progress { .. } => progress_events += 1,
            TransferEvent::Terminal { code, .. } => {
                assert_eq!(code, transit_core::CompletionCode::Ok);
                break;
            }
            _ => {}
        }
    }
    assert_eq!(progress_events, 20);

    let final_path = download_dir.path().join("big.bin");
    let written = tokio::fs::read(&final_path).await.unwrap();
    assert_eq!(written.len() as u64, TOTAL);

    handle.shutdown().await;
}

/// With `max_queue_length = 3` and the active set already full, a fourth
/// admission is rejected with `QueueFull` rather than growing the queue
/// unbounded (spec.md §3, §8 scenario 2).
#[tokio::test]
async fn fourth_admission_is_rejected_once_queue_is_full() {
    let download_dir = tempfile::tempdir().unwrap();
    let agent = Arc::new(MockTransferAgent::new());

    for n in 0..3 {
        agent.script(
            format!("http://example.test/held-{n}"),
            Script { steps: vec![Step::Hold], outcome: AgentOutcome::Ok { http_status: 200 } },
        );
    }

    let mut cfg = config(download_dir.path().to_path_buf());
    cfg.max_concurrent = 1;
    cfg.max_queue_length = 3;

    let history = HistoryStore::open_in_memory().await.unwrap();
    let publisher = Arc::new(BroadcastEventPublisher::default());
    let resources = ResourceGuard::new(&cfg, Box::new(NullWakeLock));
    let handle = Orchestrator::spawn(cfg, agent, history, publisher, resources, 0);

    for n in 0..3 {
        let req = base_request(&format!("http://example.test/held-{n}"), &download_dir.path().to_path_buf());
        handle.admit(req).await.unwrap();
    }

    let fourth = base_request("http://example.test/held-3", &download_dir.path().to_path_buf());
    let result = handle.admit(fourth).await;
    assert_eq!(result, Err(AdmitError::QueueFull));

    handle.shutdown().await;
}

/// Pausing mid-transfer cancels the live session and marks the ticket
/// interrupted with its partial bytes retained; resuming restarts the
/// session from the retained offset and the transfer completes
/// (spec.md §4.5 "pause"/"resume", §8 scenario 3).
#[tokio::test]
async fn pause_then_resume_continues_from_partial_offset() {
    let download_dir = tempfile::tempdir().unwrap();
    let agent = Arc::new(MockTransferAgent::new());
    let url = "http://example.test/resumable.bin";

    const TOTAL: u64 = 10_000_000;
    const FIRST_CHUNK: u64 = 4_000_000;
    agent.script(
        url,
        Script {
            steps: vec![
                Step::Header { name: "Content-Length".into(), value: TOTAL.to_string() },
                Step::Write(Bytes::from(vec![1u8; FIRST_CHUNK as usize])),
                Step::Hold,
            ],
            outcome: AgentOutcome::Ok { http_status: 200 },
        },
    );

    let history = HistoryStore::open_in_memory().await.unwrap();
    let publisher = Arc::new(BroadcastEventPublisher::default());
    let mut events = publisher.subscribe();
    let resources = ResourceGuard::new(&config(download_dir.path().to_path_buf()), Box::new(NullWakeLock));
    let handle = Orchestrator::spawn(
        config(download_dir.path().to_path_buf()),
        agent.clone(),
        history,
        publisher,
        resources,
        0,
    );

    let req = base_request(url, &download_dir.path().to_path_buf());
    let ticket = handle.admit(req).await.unwrap();

    // Let the first chunk land before pausing.
    let _ = wait_for(&mut events, ticket, |e| matches!(e, TransferEvent::Progress { .. })).await;

    handle.pause(ticket, false).await.unwrap();

    // Resuming should fail while the transfer is still at full speed, so
    // rescript the remaining bytes before asking for resume.
    agent.script(
        url,
        Script {
            steps: vec![Step::Write(Bytes::from(vec![2u8; (TOTAL - FIRST_CHUNK) as usize]))],
            outcome: AgentOutcome::Ok { http_status: 200 },
        },
    );
    handle.resume(ticket).await.unwrap();

    wait_for(&mut events, ticket, |e| matches!(e, TransferEvent::Terminal { .. })).await;

    let final_path = download_dir.path().join("resumable.bin");
    let written = tokio::fs::read(&final_path).await.unwrap();
    assert_eq!(written.len() as u64, TOTAL);

    handle.shutdown().await;
}

/// A 302 response with `Location` restarts the session against the new URL,
/// re-deriving the destination filename since `keep_filename_on_redirect`
/// is false (spec.md §4.6 "redirect handling", §8 scenario 4).
#[tokio::test]
async fn redirect_restarts_against_new_url_and_filename() {
    let download_dir = tempfile::tempdir().unwrap();
    let agent = Arc::new(MockTransferAgent::new());

    agent.script(
        "http://example.test/a",
        Script {
            steps: vec![Step::Header { name: "Location".into(), value: "http://example.test/b".into() }],
            outcome: AgentOutcome::Ok { http_status: 302 },
        },
    );
    agent.script(
        "http://example.test/b",
        Script {
            steps: vec![
                Step::Header { name: "Content-Length".into(), value: "1000".into() },
                Step::Write(Bytes::from(vec![9u8; 1000])),
            ],
            outcome: AgentOutcome::Ok { http_status: 200 },
        },
    );

    let history = HistoryStore::open_in_memory().await.unwrap();
    let publisher = Arc::new(BroadcastEventPublisher::default());
    let mut events = publisher.subscribe();
    let resources = ResourceGuard::new(&config(download_dir.path().to_path_buf()), Box::new(NullWakeLock));
    let handle = Orchestrator::spawn(
        config(download_dir.path().to_path_buf()),
        agent,
        history,
        publisher,
        resources,
        0,
    );

    let req = base_request("http://example.test/a", &download_dir.path().to_path_buf());
    let ticket = handle.admit(req).await.unwrap();

    wait_for(&mut events, ticket, |e| matches!(e, TransferEvent::Terminal { .. })).await;

    let final_path = download_dir.path().join("b");
    let written = tokio::fs::read(&final_path).await.unwrap();
    assert_eq!(written.len(), 1000);
    assert!(!download_dir.path().join("a").exists());

    handle.shutdown().await;
}

/// A bound interface going down interrupts the transfer without cancelling
/// it outright; the matching up-edge auto-resumes it from its retained
/// offset (spec.md §4.4, §4.5 "auto-resume", §8 scenario 5).
#[tokio::test]
async fn interface_down_interrupts_and_up_edge_auto_resumes() {
    let download_dir = tempfile::tempdir().unwrap();
    let agent = Arc::new(MockTransferAgent::new());
    let url = "http://example.test/wifi-bound.bin";

    const TOTAL: u64 = 10_000;
    const FIRST_CHUNK: u64 = 4_000;
    agent.script(
        url,
        Script {
            steps: vec![
                Step::Header { name: "Content-Length".into(), value: TOTAL.to_string() },
                Step::Write(Bytes::from(vec![3u8; FIRST_CHUNK as usize])),
                Step::Hold,
            ],
            outcome: AgentOutcome::Ok { http_status: 200 },
        },
    );

    let history = HistoryStore::open_in_memory().await.unwrap();
    let publisher = Arc::new(BroadcastEventPublisher::default());
    let mut events = publisher.subscribe();
    let resources = ResourceGuard::new(&config(download_dir.path().to_path_buf()), Box::new(NullWakeLock));
    let handle = Orchestrator::spawn(
        config(download_dir.path().to_path_buf()),
        agent.clone(),
        history,
        publisher,
        resources,
        0,
    );

    handle.interface_edge(InterfaceId::Wifi, transit_core::ConnectivityStatus::Connected);
    handle.pause_all().await; // barrier: forces the edge above to have been processed

    let mut req = base_request(url, &download_dir.path().to_path_buf());
    req.interface = InterfaceId::Wifi;
    let ticket = handle.admit(req).await.unwrap();

    let _ = wait_for(&mut events, ticket, |e| matches!(e, TransferEvent::Progress { .. })).await;

    // Swap in the rest of the body for the eventual auto-resume before
    // bringing the interface down.
    agent.script(
        url,
        Script {
            steps: vec![Step::Write(Bytes::from(vec![4u8; (TOTAL - FIRST_CHUNK) as usize]))],
            outcome: AgentOutcome::Ok { http_status: 200 },
        },
    );

    handle.interface_edge(InterfaceId::Wifi, transit_core::ConnectivityStatus::Disconnected);
    wait_for(&mut events, ticket, |e| matches!(e, TransferEvent::Interrupted)).await;

    handle.interface_edge(InterfaceId::Wifi, transit_core::ConnectivityStatus::Connected);
    wait_for(&mut events, ticket, |e| matches!(e, TransferEvent::Terminal { .. })).await;

    let final_path = download_dir.path().join("wifi-bound.bin");
    let written = tokio::fs::read(&final_path).await.unwrap();
    assert_eq!(written.len() as u64, TOTAL);

    handle.shutdown().await;
}

/// Cancelling a still-queued ticket removes it without ever promoting it to
/// the active set or touching the agent (spec.md §4.5 "cancel", §8 scenario 6).
#[tokio::test]
async fn cancel_while_queued_never_promotes() {
    let download_dir = tempfile::tempdir().unwrap();
    let agent = Arc::new(MockTransferAgent::new());

    agent.script(
        "http://example.test/running",
        Script { steps: vec![Step::Hold], outcome: AgentOutcome::Ok { http_status: 200 } },
    );
    agent.script(
        "http://example.test/queued-a",
        Script { steps: vec![Step::Hold], outcome: AgentOutcome::Ok { http_status: 200 } },
    );
    agent.script(
        "http://example.test/queued-b",
        Script { steps: vec![Step::Hold], outcome: AgentOutcome::Ok { http_status: 200 } },
    );

    let mut cfg = config(download_dir.path().to_path_buf());
    cfg.max_concurrent = 1;
    cfg.max_queue_length = 10;

    let history = HistoryStore::open_in_memory().await.unwrap();
    let publisher = Arc::new(BroadcastEventPublisher::default());
    let resources = ResourceGuard::new(&cfg, Box::new(NullWakeLock));
    let handle = Orchestrator::spawn(cfg, agent, history, publisher, resources, 0);

    let running = handle
        .admit(base_request("http://example.test/running", &download_dir.path().to_path_buf()))
        .await
        .unwrap();
    let queued_a = handle
        .admit(base_request("http://example.test/queued-a", &download_dir.path().to_path_buf()))
        .await
        .unwrap();
    let queued_b = handle
        .admit(base_request("http://example.test/queued-b", &download_dir.path().to_path_buf()))
        .await
        .unwrap();

    handle.cancel(queued_a).await.unwrap();
    handle.cancel(running).await.unwrap();

    // queued_b should now be the one promoted into the active set, not
    // re-admitted behind a phantom queued_a.
    handle.cancel(queued_b).await.unwrap();

    handle.shutdown().await;
}

/// `CompositeTransferAgent` rejects an unsupported scheme before ever
/// reaching the scheduler (spec.md §6 "Security filters").
#[tokio::test]
async fn unsupported_scheme_is_rejected_at_admission() {
    let download_dir = tempfile::tempdir().unwrap();
    let agent = Arc::new(CompositeTransferAgent::new());
    let history = HistoryStore::open_in_memory().await.unwrap();
    let publisher = Arc::new(BroadcastEventPublisher::default());
    let resources = ResourceGuard::new(&config(download_dir.path().to_path_buf()), Box::new(NullWakeLock));
    let handle = Orchestrator::spawn(
        config(download_dir.path().to_path_buf()),
        agent,
        history,
        publisher,
        resources,
        0,
    );

    let req = base_request("gopher://example.test/x", &download_dir.path().to_path_buf());
    let result = handle.admit(req).await;
    assert_eq!(result, Err(AdmitError::FailedSecurityCheck));

    handle.shutdown().await;
}

/// A non-privileged caller naming a `targetDir` outside the configured
/// media root is rejected at admission, even with no `..` components
/// (spec.md §6 "Security filters applied at the boundary").
#[tokio::test]
async fn non_privileged_caller_outside_media_root_is_rejected() {
    let download_dir = tempfile::tempdir().unwrap();
    let outside_dir = tempfile::tempdir().unwrap();
    let agent = Arc::new(CompositeTransferAgent::new());
    let history = HistoryStore::open_in_memory().await.unwrap();
    let publisher = Arc::new(BroadcastEventPublisher::default());
    let resources = ResourceGuard::new(&config(download_dir.path().to_path_buf()), Box::new(NullWakeLock));
    let handle = Orchestrator::spawn(
        config(download_dir.path().to_path_buf()),
        agent,
        history,
        publisher,
        resources,
        0,
    );

    let mut req = base_request("https://example.test/a.bin", &outside_dir.path().to_path_buf());
    req.privileged = false;
    let result = handle.admit(req).await;
    assert_eq!(result, Err(AdmitError::FailedSecurityCheck));

    // The same request succeeds when marked privileged: no media-root confinement applies.
    let mut privileged_req = base_request("https://example.test/a.bin", &outside_dir.path().to_path_buf());
    privileged_req.privileged = true;
    let result = handle.admit(privileged_req).await;
    assert!(result.is_ok());

    handle.shutdown().await;
}

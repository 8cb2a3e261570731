//! Engine state machine, control requests, tree ownership, and failure
//! propagation, driven from a second task the way an operator UI would.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::time::{sleep, timeout, Duration};

use scan_core::{ScanCommand, ScanError, ScanTree};
use scan_engine::{CommandStatus, ScanEngine, ScanEvent, ScanState};
use scan_hardware::{DeviceConfig, DeviceRegistry, DriverType};

fn sim_registry() -> Arc<DeviceRegistry> {
    let mut registry = DeviceRegistry::new();
    registry
        .register(DeviceConfig {
            id: "xpos".into(),
            name: "Sample stage X".into(),
            driver: DriverType::SimAxis {
                initial: 0.0,
                settle_ms: 0,
            },
        })
        .unwrap();
    registry
        .register(DeviceConfig {
            id: "monitor".into(),
            name: "Beam monitor".into(),
            driver: DriverType::SimReadback { value: 0.5 },
        })
        .unwrap();
    registry
        .register(DeviceConfig {
            id: "relay".into(),
            name: "Flaky relay".into(),
            driver: DriverType::Flaky { fail_after: 2 },
        })
        .unwrap();
    Arc::new(registry)
}

fn delays(count: usize, seconds: f64) -> Vec<ScanCommand> {
    (0..count)
        .map(|_| ScanCommand::Delay { seconds })
        .collect()
}

fn shared(commands: Vec<ScanCommand>) -> Arc<RwLock<ScanTree>> {
    Arc::new(RwLock::new(ScanTree::from_commands(commands).unwrap()))
}

async fn wait_for_state(engine: &ScanEngine, state: ScanState) {
    timeout(Duration::from_secs(5), async {
        while engine.state().await != state {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("engine never reached {state}"));
}

fn drain(events: &mut tokio::sync::broadcast::Receiver<ScanEvent>) -> Vec<ScanEvent> {
    let mut collected = Vec::new();
    while let Ok(event) = events.try_recv() {
        collected.push(event);
    }
    collected
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_while_running_is_rejected() {
    let engine = Arc::new(ScanEngine::new(sim_registry()));
    let tree = shared(delays(20, 0.02));

    let runner = engine.clone();
    let handle = tokio::spawn(async move { runner.start(tree).await });
    wait_for_state(&engine, ScanState::Running).await;

    let err = engine.start(shared(vec![])).await.unwrap_err();
    assert!(matches!(err, ScanError::AlreadyRunning { .. }));

    engine.abort("test done").await.unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tree_locked_during_run() {
    let engine = Arc::new(ScanEngine::new(sim_registry()));
    let tree = shared(delays(20, 0.02));

    let runner = engine.clone();
    let run_tree = tree.clone();
    let handle = tokio::spawn(async move { runner.start(run_tree).await });
    wait_for_state(&engine, ScanState::Running).await;

    {
        let mut guard = tree.write().await;
        let err = guard
            .insert(None, 0, ScanCommand::Delay { seconds: 0.1 })
            .unwrap_err();
        assert!(matches!(err, ScanError::TreeLocked));
        let err = guard
            .remove(&scan_core::CommandAddress::top(0))
            .unwrap_err();
        assert!(matches!(err, ScanError::TreeLocked));
    }

    handle.await.unwrap().unwrap();

    // Ownership returns to the editor once the run ends.
    tree.write()
        .await
        .insert(None, 0, ScanCommand::Delay { seconds: 0.1 })
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pause_resume_executes_every_command_once() {
    let engine = Arc::new(ScanEngine::new(sim_registry()));
    let mut events = engine.subscribe();
    let total = 25;
    let tree = shared(delays(total, 0.02));

    let runner = engine.clone();
    let handle = tokio::spawn(async move { runner.start(tree).await });
    wait_for_state(&engine, ScanState::Running).await;
    sleep(Duration::from_millis(50)).await;

    engine.pause().await.unwrap();
    wait_for_state(&engine, ScanState::Paused).await;
    let done_at_pause = engine.commands_done().await;

    // No progress while paused.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.commands_done().await, done_at_pause);

    engine.resume().await.unwrap();
    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.state, ScanState::Finished);
    assert_eq!(summary.commands_done, total as u64);

    // Every command finished exactly once, none skipped, none repeated.
    let mut finished = HashSet::new();
    for event in drain(&mut events) {
        if let ScanEvent::CommandFinished { address, status } = event {
            assert_eq!(status, CommandStatus::Done);
            assert!(finished.insert(address), "command finished twice");
        }
    }
    assert_eq!(finished.len(), total);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pause_immediately_followed_by_resume() {
    let engine = Arc::new(ScanEngine::new(sim_registry()));
    let total = 10;
    let tree = shared(delays(total, 0.02));

    let runner = engine.clone();
    let handle = tokio::spawn(async move { runner.start(tree).await });
    wait_for_state(&engine, ScanState::Running).await;

    engine.pause().await.unwrap();
    engine.resume().await.unwrap();

    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.state, ScanState::Finished);
    assert_eq!(summary.commands_done, total as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abort_mid_run() {
    let engine = Arc::new(ScanEngine::new(sim_registry()));
    let mut events = engine.subscribe();
    let tree = shared(delays(100, 0.02));

    let runner = engine.clone();
    let handle = tokio::spawn(async move { runner.start(tree).await });
    wait_for_state(&engine, ScanState::Running).await;
    sleep(Duration::from_millis(50)).await;

    engine.abort("operator stop").await.unwrap();
    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.state, ScanState::Aborted);
    assert!(summary.commands_done < 100);
    assert_eq!(engine.state().await, ScanState::Aborted);

    let states: Vec<ScanState> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            ScanEvent::StateChanged { state } => Some(state),
            _ => None,
        })
        .collect();
    assert!(states.contains(&ScanState::Aborting));
    assert_eq!(states.last(), Some(&ScanState::Aborted));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abort_while_paused() {
    let engine = Arc::new(ScanEngine::new(sim_registry()));
    let tree = shared(delays(50, 0.02));

    let runner = engine.clone();
    let handle = tokio::spawn(async move { runner.start(tree).await });
    wait_for_state(&engine, ScanState::Running).await;

    engine.pause().await.unwrap();
    wait_for_state(&engine, ScanState::Paused).await;
    engine.abort("give up").await.unwrap();

    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.state, ScanState::Aborted);
}

#[tokio::test]
async fn test_device_failure_fails_run_with_address() {
    let engine = ScanEngine::new(sim_registry());
    let mut events = engine.subscribe();
    // The relay accepts two writes, so the third loop step fails.
    let tree = shared(vec![ScanCommand::Loop {
        device: "relay".into(),
        start: 1.0,
        end: 5.0,
        step: 1.0,
        body: vec![],
    }]);

    let err = engine.start(tree).await.unwrap_err();
    assert!(matches!(err, ScanError::Device { .. }));
    assert_eq!(engine.state().await, ScanState::Failed);

    let failed: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            ScanEvent::CommandFinished {
                address,
                status: CommandStatus::Failed { message },
            } => Some((address.to_string(), message)),
            _ => None,
        })
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, "0");
    assert!(failed[0].1.contains("relay"));
}

#[tokio::test]
async fn test_wait_condition_met() {
    let engine = ScanEngine::new(sim_registry());
    let tree = shared(vec![
        ScanCommand::Set {
            device: "xpos".into(),
            value: 3.0,
        },
        ScanCommand::Wait {
            device: "xpos".into(),
            value: 3.0,
            tolerance: 0.01,
            timeout_secs: 1.0,
        },
    ]);
    let summary = engine.start(tree).await.unwrap();
    assert_eq!(summary.state, ScanState::Finished);
    assert_eq!(summary.commands_done, 2);
}

#[tokio::test]
async fn test_wait_condition_times_out() {
    let engine = ScanEngine::new(sim_registry());
    let tree = shared(vec![ScanCommand::Wait {
        device: "monitor".into(),
        value: 2.0,
        tolerance: 0.1,
        timeout_secs: 0.1,
    }]);
    let err = engine.start(tree).await.unwrap_err();
    match err {
        ScanError::Device { device, message } => {
            assert_eq!(device, "monitor");
            assert!(message.contains("timed out"));
        }
        other => panic!("expected Device error, got {other}"),
    }
    assert_eq!(engine.state().await, ScanState::Failed);
}

#[tokio::test]
async fn test_log_command_reports_readings() {
    let engine = ScanEngine::new(sim_registry());
    let mut events = engine.subscribe();
    let tree = shared(vec![ScanCommand::Log {
        devices: vec!["monitor".into()],
    }]);
    engine.start(tree).await.unwrap();

    let readings: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            ScanEvent::DeviceReadings { readings, .. } => Some(readings),
            _ => None,
        })
        .collect();
    assert_eq!(readings, vec![vec![("monitor".to_string(), 0.5)]]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_events_bracket_the_run() {
    let engine = ScanEngine::new(sim_registry());
    let mut events = engine.subscribe();
    let tree = shared(delays(2, 0.01));
    let summary = engine.start(tree).await.unwrap();

    let collected = drain(&mut events);
    assert!(matches!(
        collected.first(),
        Some(ScanEvent::RunStarted { run_id }) if *run_id == summary.run_id
    ));
    assert!(matches!(
        collected.last(),
        Some(ScanEvent::RunStopped { run_id, state: ScanState::Finished, commands_done: 2 })
            if *run_id == summary.run_id
    ));
}

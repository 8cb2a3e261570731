//! Run a small simulated scan and print its progress events.
//!
//! ```bash
//! cargo run -p scan-engine --example sim_scan
//! ```

use std::sync::Arc;

use tokio::sync::RwLock;

use scan_core::codec;
use scan_engine::{ScanEngine, ScanEvent};
use scan_hardware::load_registry;

const DEVICES: &str = r#"
    [[device]]
    id = "xpos"
    name = "Sample stage X"

    [device.driver]
    type = "sim_axis"
    initial = 0.0
    settle_ms = 20

    [[device]]
    id = "monitor"
    name = "Beam monitor"

    [device.driver]
    type = "sim_readback"
    value = 0.42
"#;

const SCAN: &str = r#"{
    "scan": [
        {
            "command": "loop",
            "device": "xpos",
            "start": 0.0,
            "end": 4.0,
            "step": 1.0,
            "body": [
                { "command": "delay", "seconds": 0.05 },
                { "command": "log", "devices": ["monitor"] }
            ]
        }
    ]
}"#;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let registry = load_registry(DEVICES)?;
    let tree = Arc::new(RwLock::new(codec::decode(SCAN)?));

    let engine = Arc::new(ScanEngine::new(Arc::new(registry)));
    let mut events = engine.subscribe();

    let runner = engine.clone();
    let handle = tokio::spawn(async move { runner.start(tree).await });

    while let Ok(event) = events.recv().await {
        match event {
            ScanEvent::CommandStarted { address } => println!("  > {address}"),
            ScanEvent::CommandFinished { address, status } => {
                println!("  < {address} {status:?}");
            }
            ScanEvent::DeviceReadings { readings, .. } => {
                for (device, value) in readings {
                    println!("    {device} = {value}");
                }
            }
            ScanEvent::StateChanged { state } => println!("state: {state}"),
            ScanEvent::RunStarted { run_id } => println!("run {run_id}"),
            ScanEvent::RunStopped {
                state,
                commands_done,
                ..
            } => {
                println!("run ended {state} after {commands_done} commands");
                break;
            }
        }
    }

    let summary = handle.await??;
    println!("summary: {summary:?}");
    Ok(())
}

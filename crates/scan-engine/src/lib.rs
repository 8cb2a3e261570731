//! Scan executor: walks a command tree, drives devices, reports progress.
//!
//! ```rust,ignore
//! let engine = Arc::new(ScanEngine::new(registry));
//! let mut events = engine.subscribe();
//!
//! let runner = engine.clone();
//! let handle = tokio::spawn(async move { runner.start(tree).await });
//!
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         ScanEvent::CommandFinished { address, status } => {
//!             println!("{address}: {status:?}");
//!         }
//!         ScanEvent::RunStopped { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

pub mod engine;
pub mod event;

pub use engine::{RunSummary, ScanEngine, ScanState};
pub use event::{CommandStatus, ScanEvent};

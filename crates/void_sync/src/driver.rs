//! Async host for a [`SyncEngine`]
//!
//! Feeds inbound transport messages to the engine and fires the sync loop
//! on its deadline. Both run on one task, so the engine is never touched
//! concurrently.

use std::future::Future;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant as TokioInstant};

use crate::engine::SyncEngine;
use crate::protocol::Envelope;

/// Runs an engine against an inbound message channel
pub struct SyncDriver {
    engine: SyncEngine,
    inbound: mpsc::UnboundedReceiver<Envelope>,
}

impl SyncDriver {
    pub fn new(engine: SyncEngine, inbound: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self { engine, inbound }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut SyncEngine {
        &mut self.engine
    }

    pub fn into_engine(self) -> SyncEngine {
        self.engine
    }

    /// Run until the inbound channel closes
    pub async fn run(&mut self) {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run until `shutdown` resolves or the inbound channel closes
    ///
    /// The sync loop is started on entry and stopped on exit; pending
    /// changes stay queued.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        self.engine.start();

        loop {
            // Without a deadline, the tick branch is disabled
            let deadline = self.engine.next_deadline();
            let tick = async move {
                match deadline {
                    Some(deadline) => sleep_until(TokioInstant::from_std(deadline)).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = &mut shutdown => {
                    log::debug!("Sync driver shutting down");
                    break;
                }
                message = self.inbound.recv() => match message {
                    Some(envelope) => self.engine.handle_envelope(&envelope),
                    None => {
                        log::info!("Inbound channel closed; sync driver exiting");
                        break;
                    }
                },
                _ = tick => {
                    self.engine.tick(std::time::Instant::now());
                }
            }
        }

        self.engine.stop();
    }
}

use crate::engine::{BlockSummary, TxEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Seals a block on a fixed interval until cancelled.
pub struct BlockProducer {
    engine: Arc<TxEngine>,
    interval: Duration,
}

impl BlockProducer {
    pub fn new(engine: Arc<TxEngine>) -> Self {
        let interval = engine.config().block_interval;
        Self { engine, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "block producer started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.produce_once().await {
                        error!(error = %err, "block production failed");
                    }
                }
            }
        }
        info!("block producer stopped");
    }

    /// Produce one block off the async runtime.
    pub async fn produce_once(&self) -> anyhow::Result<Option<BlockSummary>> {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || engine.produce_block()).await?
    }
}

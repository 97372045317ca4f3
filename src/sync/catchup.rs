//! Background catch-up: once IBD has settled, poll the seed periodically
//! and pull any blocks farmed since the last tick.

use std::sync::Arc;
use std::time::Duration;

use crate::chain::BlockSource;
use crate::context::NodeContext;
use crate::error::NodeError;
use crate::sync::SeedClient;

const START_DELAY: Duration = Duration::from_secs(5);
const CHECK_INTERVAL: Duration = Duration::from_secs(30);
const BATCH_SIZE: u64 = 100;
const TIP_PROBE_ATTEMPTS: u32 = 3;
const TIP_PROBE_BACKOFF: Duration = Duration::from_secs(5);

pub async fn run_catchup(ctx: Arc<NodeContext>) {
    let Some(seed) = ctx.config.seed_url() else {
        return;
    };
    let client = SeedClient::new(seed, crate::sync::SEED_REQUEST_TIMEOUT);

    let mut shutdown = ctx.shutdown.clone();
    tokio::select! {
        _ = tokio::time::sleep(START_DELAY) => {}
        _ = shutdown.changed() => return,
    }
    tracing::info!(interval = ?CHECK_INTERVAL, "background block sync monitor started");

    let mut ticker = tokio::time::interval(CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                tracing::info!("background block sync monitor stopped");
                return;
            }
        }
        if let Err(e) = sync_check(&ctx, &client).await {
            // Tick errors are logged, not retried within the tick. Forks
            // are left to IBD, whose restart path owns recovery.
            tracing::warn!(err = %e, "sync check failed");
        }
    }
}

/// One catch-up tick: skip while IBD owns the chain, otherwise compare
/// tips and pull at most one batch through the normal apply path.
pub async fn sync_check(ctx: &Arc<NodeContext>, client: &SeedClient) -> Result<(), NodeError> {
    if ctx.gate.ibd_running() {
        tracing::debug!("sync check: IBD is running, skipping");
        return Ok(());
    }

    let current = {
        let guard = ctx.state.read();
        match guard.as_ref() {
            Some(s) => s.current_height(),
            None => return Err(NodeError::ShuttingDown),
        }
    };
    if current == 0 {
        tracing::debug!("sync check: node not initialized yet (height=0), skipping");
        return Ok(());
    }

    let (network_tip, difficulty) = probe_tip(ctx, client).await?;
    if let Some(d) = difficulty {
        ctx.network.set_difficulty(d);
    }

    if network_tip <= current {
        tracing::debug!(local = current, network = network_tip, "sync check: up to date");
        return Ok(());
    }

    let gap = network_tip - current;
    tracing::info!(local = current, network = network_tip, gap, "network is ahead - fetching missing blocks");

    let from = current + 1;
    let limit = BATCH_SIZE.min(gap) as u32;
    let batch = client.blocks_range(from, limit).await?;

    let mut applied = 0u64;
    for raw in &batch {
        let mut guard = ctx.state.write();
        let state = guard.as_mut().ok_or(NodeError::ShuttingDown)?;
        // Stop on the first failure; the next tick (or IBD) picks it up.
        state.apply_block(raw, BlockSource::Seed)?;
        applied += 1;
    }
    if applied > 0 {
        let height = {
            let guard = ctx.state.read();
            guard.as_ref().map(|s| s.current_height()).unwrap_or(0)
        };
        tracing::info!(applied, height, "applied new blocks");
    }
    Ok(())
}

async fn probe_tip(
    ctx: &Arc<NodeContext>,
    client: &SeedClient,
) -> Result<(u64, Option<u64>), NodeError> {
    let mut last_err = None;
    for attempt in 0..TIP_PROBE_ATTEMPTS {
        if attempt > 0 {
            let backoff = TIP_PROBE_BACKOFF * attempt;
            tracing::debug!(attempt = attempt + 1, max = TIP_PROBE_ATTEMPTS, backoff = ?backoff, "sync check: retrying chainTip fetch");
            let mut shutdown = ctx.shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => return Err(NodeError::ShuttingDown),
            }
        }
        match client.chain_tip().await {
            Ok(tip) => return Ok(tip),
            Err(e) if e.is_transient() => last_err = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        NodeError::transient(crate::error::TransientKind::Connection, "chainTip unreachable")
    }))
}

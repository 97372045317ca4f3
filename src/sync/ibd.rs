//! Initial Block Download: bulk historical sync from the trusted seed.
//!
//! Exactly one engine runs at a time; the `ibd_running` flag on the peer
//! gate is raised for its duration and every other mutating ingress is
//! rejected while it is up. Blocks are fetched in batches, applied
//! strictly in order, and the first prev-hash divergence triggers fork
//! recovery followed by a restart from height 0.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::chain::BlockSource;
use crate::context::NodeContext;
use crate::error::NodeError;
use crate::metrics;
use crate::recovery::recover_from_fork;
use crate::sync::SeedClient;

#[derive(Debug, Clone)]
pub struct IbdConfig {
    /// Delay between node start and the first IBD attempt, giving the
    /// RPC server and peer connections a moment to settle.
    pub start_delay: Duration,
    /// Blocks fetched per `/blocks/range` request.
    pub batch_size: u32,
    /// Run IBD whenever the local chain is behind by at least this much.
    pub ibd_threshold: u64,
    /// Considered synced once within this many blocks of the remote tip.
    pub catch_up_threshold: u64,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// Retry delay after a fork recovery restarted sync from genesis.
    pub post_recovery_delay: Duration,
    pub probe_attempts: u32,
    pub probe_initial_delay: Duration,
    pub progress_interval: Duration,
    /// Warn when no block has applied for this long while behind the tip.
    pub stuck_after: Duration,
}

impl Default for IbdConfig {
    fn default() -> Self {
        IbdConfig {
            start_delay: Duration::from_secs(3),
            batch_size: 512,
            ibd_threshold: 1,
            catch_up_threshold: 10,
            request_timeout: crate::sync::SEED_REQUEST_TIMEOUT,
            max_attempts: 10,
            initial_retry_delay: Duration::from_secs(30),
            max_retry_delay: Duration::from_secs(300),
            post_recovery_delay: Duration::from_secs(10),
            probe_attempts: 5,
            probe_initial_delay: Duration::from_secs(2),
            progress_interval: Duration::from_secs(10),
            stuck_after: Duration::from_secs(30),
        }
    }
}

/// Run IBD to completion. Returns once the local chain is within the
/// catch-up threshold of the remote tip, retries are exhausted, a
/// non-recoverable error surfaced, or the node is shutting down.
pub async fn run_ibd(ctx: Arc<NodeContext>) {
    let Some(seed) = ctx.config.seed_url() else {
        tracing::warn!("no valid peers for IBD (seed.archivas.ai required)");
        return;
    };
    let cfg = ctx.config.ibd.clone();
    let client = SeedClient::new(seed, cfg.request_timeout);

    ctx.gate.set_ibd_running(true);
    metrics::IBD_RUNNING.set(1);

    let result = run_ibd_inner(&ctx, &client, &cfg).await;

    ctx.gate.set_ibd_running(false);
    metrics::IBD_RUNNING.set(0);

    match result {
        Err(NodeError::ShuttingDown) => {}
        Err(e) => {
            tracing::error!(err = %e, "IBD failed after all retry attempts - will retry when the seed recovers or on restart");
        }
        Ok(()) => {}
    }
}

async fn run_ibd_inner(
    ctx: &Arc<NodeContext>,
    client: &SeedClient,
    cfg: &IbdConfig,
) -> Result<(), NodeError> {
    let Some(mut remote_tip) = probe_chain_tip(ctx, client, cfg).await else {
        return Err(NodeError::transient(
            crate::error::TransientKind::Connection,
            "failed to get remote tip height - cannot start IBD",
        ));
    };
    if remote_tip == 0 {
        tracing::error!("remote tip is 0 - cannot start IBD");
        return Ok(());
    }

    let start_height = local_height(ctx)?;
    if start_height + cfg.ibd_threshold > remote_tip {
        tracing::info!(local = start_height, remote = remote_tip, "already within IBD threshold");
        return Ok(());
    }

    tracing::info!(
        current = start_height,
        target = remote_tip,
        progress = %format!("{:.2}%", start_height as f64 * 100.0 / remote_tip as f64),
        "starting IBD"
    );
    ctx.progress.reset(start_height);
    let ibd_start = Instant::now();

    let watcher = tokio::spawn(progress_watcher(ctx.clone(), remote_tip, cfg.clone()));

    let mut attempt: u32 = 1;
    let mut retry_delay = cfg.initial_retry_delay;
    let outcome = loop {
        if ctx.shutting_down() {
            break Ok(());
        }
        match sync_batches(ctx, client, cfg, &mut remote_tip).await {
            Ok(()) => break Ok(()),
            Err(e) if e.is_fork() => {
                let height = local_height(ctx).unwrap_or(0);
                tracing::error!(height, err = %e, "fork detected during IBD");
                tracing::warn!("local chain is on a fork - auto-recovering by clearing database and resyncing from genesis");
                if let Err(re) = recover_from_fork(ctx) {
                    tracing::error!(err = %re, "fork recovery failed");
                    break Err(re);
                }
                // Recovery lowered the flag; raise it again for the restart.
                ctx.gate.set_ibd_running(true);
                attempt = 1;
                retry_delay = cfg.post_recovery_delay;
                tracing::info!("fork recovery complete, restarting IBD from genesis...");
            }
            Err(e) if e.is_transient() => {
                let height = local_height(ctx).unwrap_or(0);
                if attempt >= cfg.max_attempts {
                    tracing::error!(attempts = attempt, err = %e, "IBD failed after max attempts");
                    break Err(e);
                }
                tracing::warn!(
                    height,
                    remote = remote_tip,
                    attempt,
                    max = cfg.max_attempts,
                    err = %e,
                    "IBD attempt failed"
                );
                tracing::info!(delay = ?retry_delay, "retrying IBD (seed may be temporarily unavailable)...");
                if sleep_or_shutdown(ctx, retry_delay).await {
                    break Ok(());
                }
                retry_delay = (retry_delay * 2).min(cfg.max_retry_delay);
                attempt += 1;
            }
            Err(e) => {
                let height = local_height(ctx).unwrap_or(0);
                tracing::error!(height, remote = remote_tip, err = %e, "IBD failed with non-recoverable error");
                break Err(e);
            }
        }
    };

    watcher.abort();

    if outcome.is_ok() {
        let final_height = local_height(ctx).unwrap_or(0);
        let elapsed = ibd_start.elapsed();
        let synced = final_height.saturating_sub(start_height);
        let rate = if elapsed.as_secs_f64() > 0.0 {
            synced as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        tracing::info!(
            height = final_height,
            remote = remote_tip,
            elapsed = ?elapsed,
            rate = %format!("{rate:.1} blocks/sec"),
            "IBD completed successfully"
        );
    }
    outcome
}

/// One pass over the batch cursor. Returns `Ok` when within the catch-up
/// threshold; errors bubble to the retry/fork handling above.
async fn sync_batches(
    ctx: &Arc<NodeContext>,
    client: &SeedClient,
    cfg: &IbdConfig,
    remote_tip: &mut u64,
) -> Result<(), NodeError> {
    // Refresh the target first: the chain may have grown while we backed off.
    if let Ok((tip, difficulty)) = client.chain_tip().await {
        *remote_tip = tip;
        if let Some(d) = difficulty {
            ctx.network.set_difficulty(d);
        }
    }

    loop {
        if ctx.shutting_down() {
            return Ok(());
        }
        let current = local_height(ctx)?;
        if current + cfg.catch_up_threshold >= *remote_tip {
            return Ok(());
        }

        let from = current + 1;
        let batch = client.blocks_range(from, cfg.batch_size).await?;
        if batch.is_empty() {
            return Err(NodeError::transient(
                crate::error::TransientKind::Http,
                format!("seed returned empty batch at height {from}"),
            ));
        }

        for raw in &batch {
            // Write lock per block; never held across a fetch.
            let mut guard = ctx.state.write();
            let state = guard.as_mut().ok_or(NodeError::ShuttingDown)?;
            state.apply_block(raw, BlockSource::Seed)?;
        }
    }
}

/// Probe `/chainTip` with doubling backoff. Caches the network difficulty
/// and immediately adopts it as the consensus target.
async fn probe_chain_tip(
    ctx: &Arc<NodeContext>,
    client: &SeedClient,
    cfg: &IbdConfig,
) -> Option<u64> {
    let mut delay = cfg.probe_initial_delay;
    for attempt in 1..=cfg.probe_attempts {
        match client.chain_tip().await {
            Ok((tip, difficulty)) => {
                tracing::info!(seed = client.base(), remote_tip = tip, "connected to seed");
                if let Some(d) = difficulty {
                    ctx.network.set_difficulty(d);
                    tracing::info!(difficulty = d, "network difficulty");
                    let mut guard = ctx.state.write();
                    if let Some(state) = guard.as_mut() {
                        state.adopt_network_difficulty(d);
                    }
                }
                return Some(tip);
            }
            Err(e) if attempt < cfg.probe_attempts => {
                tracing::warn!(
                    seed = client.base(),
                    attempt,
                    max = cfg.probe_attempts,
                    err = %e,
                    delay = ?delay,
                    "failed to reach seed, retrying..."
                );
                if sleep_or_shutdown(ctx, delay).await {
                    return None;
                }
                delay *= 2;
            }
            Err(e) => {
                tracing::error!(seed = client.base(), attempts = cfg.probe_attempts, err = %e, "failed to reach seed");
            }
        }
    }
    None
}

/// Logs either detailed progress or a heartbeat every tick, plus a stuck
/// warning when nothing has applied for too long.
async fn progress_watcher(ctx: Arc<NodeContext>, remote_tip: u64, cfg: IbdConfig) {
    let started = Instant::now();
    let mut last_reported = ctx.progress.snapshot().last_applied_height;
    let mut last_progress_at = Instant::now();
    let mut ticker = tokio::time::interval(cfg.progress_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick fires immediately

    loop {
        ticker.tick().await;
        if ctx.shutting_down() {
            return;
        }
        let current = {
            let guard = ctx.state.read();
            match guard.as_ref() {
                Some(s) => s.current_height(),
                None => return,
            }
        };
        let snap = ctx.progress.snapshot();

        if current > last_reported {
            let applied = current - last_reported;
            let elapsed = last_progress_at.elapsed();
            let rate = if elapsed.as_secs_f64() > 0.0 {
                applied as f64 / elapsed.as_secs_f64()
            } else {
                0.0
            };
            let remaining = remote_tip.saturating_sub(current);
            let eta_secs = if rate > 0.0 { (remaining as f64 / rate) as u64 } else { 0 };
            tracing::info!(
                "IBD progress: {}/{} ({:.2}%) - applied {} blocks in {:?} ({:.1} blocks/sec, ETA: {}s, total applied: {})",
                current,
                remote_tip,
                current as f64 * 100.0 / remote_tip as f64,
                applied,
                elapsed,
                rate,
                eta_secs,
                snap.applied_blocks
            );
            last_reported = current;
            last_progress_at = Instant::now();
        } else {
            let since_last_block = snap.last_applied_at.elapsed();
            tracing::info!(
                "IBD heartbeat: height={}/{} ({:.2}%), last block: {} ({:?} ago), total applied: {}, elapsed: {:?}",
                current,
                remote_tip,
                current as f64 * 100.0 / remote_tip as f64,
                snap.last_applied_height,
                since_last_block,
                snap.applied_blocks,
                started.elapsed()
            );
            if since_last_block > cfg.stuck_after && current < remote_tip {
                tracing::warn!(
                    height = current,
                    stalled_for = ?since_last_block,
                    "IBD appears stuck - no blocks applied recently"
                );
            }
        }
    }
}

fn local_height(ctx: &NodeContext) -> Result<u64, NodeError> {
    let guard = ctx.state.read();
    guard.as_ref().map(|s| s.current_height()).ok_or(NodeError::ShuttingDown)
}

/// Sleep, returning `true` if shutdown fired first.
async fn sleep_or_shutdown(ctx: &NodeContext, delay: Duration) -> bool {
    let mut shutdown = ctx.shutdown.clone();
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}

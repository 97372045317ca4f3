//! Prometheus metrics, exported on `GET /metrics`.

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static TIP_HEIGHT: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("archivas_tip_height", "Current chain tip height").expect("gauge");
    let _ = REGISTRY.register(Box::new(g.clone()));
    g
});

pub static DIFFICULTY: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("archivas_difficulty_target", "Consensus difficulty target")
        .expect("gauge");
    let _ = REGISTRY.register(Box::new(g.clone()));
    g
});

pub static PEER_COUNT: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("archivas_peer_count", "Connected peer count").expect("gauge");
    let _ = REGISTRY.register(Box::new(g.clone()));
    g
});

pub static IBD_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("archivas_ibd_running", "1 while initial block download is active")
        .expect("gauge");
    let _ = REGISTRY.register(Box::new(g.clone()));
    g
});

pub static BLOCKS_APPLIED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("archivas_blocks_applied_total", "Blocks applied since start")
        .expect("counter");
    let _ = REGISTRY.register(Box::new(c.clone()));
    c
});

pub static FORK_RECOVERIES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("archivas_fork_recoveries_total", "Fork recoveries performed")
        .expect("counter");
    let _ = REGISTRY.register(Box::new(c.clone()));
    c
});

pub fn update_tip_height(height: u64) {
    TIP_HEIGHT.set(height.min(i64::MAX as u64) as i64);
}

pub fn update_difficulty(difficulty: u64) {
    DIFFICULTY.set(difficulty.min(i64::MAX as u64) as i64);
}

pub fn update_peer_count(count: usize) {
    PEER_COUNT.set(count as i64);
}

/// Render the registry in the Prometheus text exposition format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_render() {
        update_tip_height(123);
        update_difficulty(4_000_000);
        let text = gather();
        assert!(text.contains("archivas_tip_height"));
        assert!(text.contains("archivas_difficulty_target"));
    }
}

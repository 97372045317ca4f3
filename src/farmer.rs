//! Farmer bridge: challenge polling and block submission against a
//! node's RPC.
//!
//! Plot scanning is abstracted behind [`ProofSource`]; this module only
//! knows how to ask for the current challenge, pick a winning proof, and
//! submit it. Submission is skipped while the node looks like it is
//! still deep in IBD relative to the network tip.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::block::{parse_hash32, Hash32, Proof, ProofJson};
use crate::error::NodeError;
use crate::gate::TRUSTED_SEED_HOST;

/// Gap between the node's challenge height and the network tip past
/// which the node is assumed to be syncing and submission is pointless.
const IBD_GAP_GUARD: u64 = 100;

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Searches plots for the best proof against a challenge. Implementations
/// own the plot format; `None` means nothing qualified.
pub trait ProofSource: Send + Sync {
    fn best_proof(&self, challenge: Hash32, difficulty: u64) -> Option<Proof>;
    fn plot_count(&self) -> usize;
}

/// A farmer with no plots attached; polls and logs but never submits.
pub struct NoPlots;

impl ProofSource for NoPlots {
    fn best_proof(&self, _challenge: Hash32, _difficulty: u64) -> Option<Proof> {
        None
    }
    fn plot_count(&self) -> usize {
        0
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VdfInfo {
    pub seed: String,
    pub iterations: u64,
    pub output: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChallengeInfo {
    pub challenge: String,
    pub difficulty: u64,
    pub height: u64,
    #[serde(default)]
    pub vdf: Option<VdfInfo>,
}

impl ChallengeInfo {
    pub fn challenge_bytes(&self) -> Result<Hash32, NodeError> {
        parse_hash32(&self.challenge)
    }
}

#[derive(Debug, Clone)]
pub struct FarmerConfig {
    pub node_url: String,
    pub seed_url: String,
    pub farmer_addr: String,
    /// Compressed secp256k1 public key, hex.
    pub farmer_pubkey: String,
    pub poll_interval: Duration,
}

impl FarmerConfig {
    pub fn new(node_url: impl Into<String>, farmer_addr: impl Into<String>, farmer_pubkey: impl Into<String>) -> Self {
        FarmerConfig {
            node_url: node_url.into(),
            seed_url: format!("https://{TRUSTED_SEED_HOST}"),
            farmer_addr: farmer_addr.into(),
            farmer_pubkey: farmer_pubkey.into(),
            poll_interval: POLL_INTERVAL,
        }
    }
}

pub struct FarmerClient {
    node_url: String,
    client: reqwest::Client,
}

impl FarmerClient {
    pub fn new(node_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("build http client");
        FarmerClient { node_url: node_url.into().trim_end_matches('/').to_string(), client }
    }

    pub async fn get_challenge(&self) -> Result<ChallengeInfo, NodeError> {
        let url = format!("{}/challenge", self.node_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| NodeError::transient(crate::error::TransientKind::Connection, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(NodeError::Rejected(format!(
                "challenge request failed: HTTP {}",
                resp.status()
            )));
        }
        let info: ChallengeInfo = resp
            .json()
            .await
            .map_err(|e| NodeError::Rejected(format!("failed to decode challenge: {e}")))?;
        if info.challenge.is_empty() {
            return Err(NodeError::Rejected("challenge is empty after decode".into()));
        }
        Ok(info)
    }

    pub async fn submit_block(
        &self,
        proof: &Proof,
        farmer_addr: &str,
        farmer_pubkey: &str,
        vdf: Option<&VdfInfo>,
    ) -> Result<(), NodeError> {
        let mut body = serde_json::json!({
            "proof": ProofJson::from(proof),
            "farmerAddr": farmer_addr,
            "farmerPubKey": farmer_pubkey,
        });
        if let Some(vdf) = vdf {
            body["vdfSeed"] = serde_json::json!(vdf.seed);
            body["vdfIterations"] = serde_json::json!(vdf.iterations);
            body["vdfOutput"] = serde_json::json!(vdf.output);
        }
        let url = format!("{}/submitBlock", self.node_url);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| NodeError::transient(crate::error::TransientKind::Connection, e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(NodeError::Rejected(format!("submit failed: HTTP {status}: {text}")));
        }
        Ok(())
    }

    /// Network tip from the trusted seed, for the IBD submission guard.
    async fn seed_tip(&self, seed_url: &str) -> Option<u64> {
        #[derive(Deserialize)]
        struct Tip {
            #[serde(deserialize_with = "crate::block::u64_flex")]
            height: u64,
        }
        let url = format!("{}/chainTip", seed_url.trim_end_matches('/'));
        let resp = self.client.get(&url).send().await.ok()?;
        let tip: Tip = resp.json().await.ok()?;
        Some(tip.height)
    }
}

/// Poll for challenges and submit winning proofs until shutdown.
pub async fn run_farmer(
    cfg: FarmerConfig,
    source: Arc<dyn ProofSource>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let client = FarmerClient::new(cfg.node_url.clone());
    tracing::info!(
        node = %cfg.node_url,
        plots = source.plot_count(),
        addr = %cfg.farmer_addr,
        "farmer started"
    );

    let mut last_height = 0u64;
    let mut ticker = tokio::time::interval(cfg.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                tracing::info!("farmer stopped");
                return;
            }
        }

        let info = match client.get_challenge().await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(err = %e, "error getting challenge");
                continue;
            }
        };

        if info.height != last_height {
            tracing::info!(height = info.height, difficulty = info.difficulty, "NEW HEIGHT");
            last_height = info.height;
        }

        let challenge = match info.challenge_bytes() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(err = %e, "bad challenge from node");
                continue;
            }
        };

        let Some(best) = source.best_proof(challenge, info.difficulty) else {
            tracing::debug!(need = info.difficulty, "checking plots... nothing qualified");
            continue;
        };
        if best.quality >= info.difficulty {
            tracing::debug!(best = best.quality, need = info.difficulty, "best proof does not qualify");
            continue;
        }
        tracing::info!(quality = best.quality, target = info.difficulty, "found winning proof!");

        // Don't submit while the node's challenge height trails the
        // network tip badly; it is still syncing and would reject us.
        if let Some(tip) = client.seed_tip(&cfg.seed_url).await {
            if info.height + IBD_GAP_GUARD < tip {
                tracing::warn!(
                    local = info.height,
                    network = tip,
                    "node appears to be in IBD - skipping block submission"
                );
                continue;
            }
        }

        match client
            .submit_block(&best, &cfg.farmer_addr, &cfg.farmer_pubkey, info.vdf.as_ref())
            .await
        {
            Ok(()) => {
                let vdf_iters = info.vdf.as_ref().map(|v| v.iterations).unwrap_or(0);
                tracing::info!(height = info.height, vdf_t = vdf_iters, "block submitted successfully");
            }
            Err(e) => tracing::warn!(err = %e, "block submission failed"),
        }
    }
}

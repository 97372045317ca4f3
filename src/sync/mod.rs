//! Seed HTTP client shared by IBD and background catch-up.
//!
//! All bulk sync flows through the single trusted seed; the client maps
//! transport failures onto the transient error kinds the retry loops key
//! off of.

pub mod catchup;
pub mod ibd;

use std::time::Duration;

use serde::Deserialize;

use crate::block::u64_flex;
use crate::error::{NodeError, TransientKind};

/// Per-request timeout for seed fetches.
pub const SEED_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct ChainTipResponse {
    #[serde(deserialize_with = "u64_flex")]
    height: u64,
    #[serde(default, deserialize_with = "u64_flex_opt")]
    difficulty: Option<u64>,
}

fn u64_flex_opt<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
    u64_flex(d).map(Some)
}

#[derive(Debug, Deserialize)]
struct BlocksRangeResponse {
    #[serde(default)]
    blocks: Vec<serde_json::Value>,
}

pub struct SeedClient {
    base: String,
    client: reqwest::Client,
}

impl SeedClient {
    pub fn new(base: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("build http client");
        SeedClient { base: base.into().trim_end_matches('/').to_string(), client }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// `GET /chainTip` → `(remote_tip_height, network_difficulty)`.
    pub async fn chain_tip(&self) -> Result<(u64, Option<u64>), NodeError> {
        let url = format!("{}/chainTip", self.base);
        let resp = self.client.get(&url).send().await.map_err(classify_reqwest)?;
        let resp = check_status(resp)?;
        let tip: ChainTipResponse = resp.json().await.map_err(classify_reqwest)?;
        Ok((tip.height, tip.difficulty))
    }

    /// `GET /blocks/range?from=H&limit=N` → serialized blocks, in order.
    pub async fn blocks_range(&self, from: u64, limit: u32) -> Result<Vec<Vec<u8>>, NodeError> {
        let url = format!("{}/blocks/range?from={}&limit={}", self.base, from, limit);
        let resp = self.client.get(&url).send().await.map_err(classify_reqwest)?;
        let resp = check_status(resp)?;
        let body: BlocksRangeResponse = resp.json().await.map_err(classify_reqwest)?;
        body.blocks
            .into_iter()
            .map(|v| serde_json::to_vec(&v).map_err(NodeError::from))
            .collect()
    }
}

/// Map a reqwest failure onto the retryable taxonomy. Decode failures are
/// not retryable: the seed answered, the payload is just wrong.
fn classify_reqwest(e: reqwest::Error) -> NodeError {
    if e.is_timeout() {
        NodeError::transient(TransientKind::Timeout, e.to_string())
    } else if e.is_connect() || e.is_request() {
        NodeError::transient(TransientKind::Connection, e.to_string())
    } else if e.is_decode() {
        NodeError::Rejected(format!("failed to decode seed response: {e}"))
    } else {
        NodeError::transient(TransientKind::Http, e.to_string())
    }
}

fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, NodeError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let kind = match status.as_u16() {
        502 | 503 => TransientKind::ServiceUnavailable,
        _ => TransientKind::Http,
    };
    Err(NodeError::transient(kind, format!("seed returned HTTP {status}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_tip_accepts_string_and_number_forms() {
        let as_strings: ChainTipResponse =
            serde_json::from_str(r#"{"height":"480123","difficulty":"7000000"}"#).unwrap();
        assert_eq!(as_strings.height, 480_123);
        assert_eq!(as_strings.difficulty, Some(7_000_000));

        let as_numbers: ChainTipResponse =
            serde_json::from_str(r#"{"height":480123,"difficulty":7000000}"#).unwrap();
        assert_eq!(as_numbers.height, 480_123);
        assert_eq!(as_numbers.difficulty, Some(7_000_000));

        let no_difficulty: ChainTipResponse =
            serde_json::from_str(r#"{"height":12}"#).unwrap();
        assert_eq!(no_difficulty.difficulty, None);
    }
}

// src/layers/reasoner.rs
//
// Layer 5 — external text-completion assessment for borderline cases.
//
// The case context is canonicalized (serde_json maps are ordered, so
// serialization is canonical by construction), hashed to a 128-bit digest,
// and looked up in a bounded LRU before any network call. The model answer
// is parsed defensively: first balanced {...} substring, strict field
// checks, and a fixed human-review fallback on any failure. No retries —
// a borderline case is already the slow path.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::events::{Decision, Transaction};
use crate::features::FeatureMap;
use crate::history::SimilarPattern;

pub const CACHE_CAPACITY: usize = 10_000;
const LLM_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_TOKENS: u32 = 200;

const SYSTEM_PROMPT: &str = "You are a fraud analyst. Respond only in valid JSON.";

#[derive(Debug, Clone, PartialEq)]
pub struct ReasonerVerdict {
    pub recommendation: Decision,
    pub reasoning:      String,
    pub confidence:     f64,
}

impl ReasonerVerdict {
    fn fallback() -> Self {
        Self {
            recommendation: Decision::HumanReview,
            reasoning:      "LLM analysis failed".to_string(),
            confidence:     0.5,
        }
    }
}

pub struct Reasoner {
    client: reqwest::Client,
    cfg:    LlmConfig,
    cache:  Mutex<LruCache<String, ReasonerVerdict>>,
}

impl Reasoner {
    pub fn new(cfg: LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(LLM_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            cfg,
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_CAPACITY).unwrap())),
        }
    }

    pub async fn assess(&self, context: &Value) -> ReasonerVerdict {
        let digest = canonical_digest(context);

        if let Some(cached) = self.cache.lock().get(&digest).cloned() {
            debug!(digest = %digest, "reasoner cache hit");
            return cached;
        }

        match self.complete(context).await {
            Some(verdict) => {
                self.cache.lock().put(digest, verdict.clone());
                verdict
            }
            None => {
                warn!("reasoner call failed, falling back to human review");
                ReasonerVerdict::fallback()
            }
        }
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    async fn complete(&self, context: &Value) -> Option<ReasonerVerdict> {
        let prompt = format!(
            "Assess this fraud investigation context and answer with exactly \
             {{\"recommendation\": \"approve\"|\"block\"|\"human_review\", \
             \"reasoning\": \"<at most 2 sentences>\", \"confidence\": <0..1>}}.\n\n{}",
            serde_json::to_string(context).ok()?
        );
        let body = json!({
            "model": self.cfg.model,
            "temperature": 0.0,
            "max_tokens": MAX_TOKENS,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user",   "content": prompt },
            ],
        });

        let mut request = self.client.post(&self.cfg.url).json(&body);
        if !self.cfg.api_key.is_empty() {
            request = request.bearer_auth(&self.cfg.api_key);
        }

        let response = request.send().await.ok()?;
        if !response.status().is_success() {
            warn!(status = %response.status(), "llm endpoint rejected request");
            return None;
        }
        let payload: Value = response.json().await.ok()?;

        // Chat-completion shape first; raw body text as a fallback.
        let text = payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string());

        parse_verdict(&text)
    }
}

/// Build the canonical context for a borderline case: transaction summary,
/// user summary, per-layer scores, key flags, and any confirmed patterns
/// already tied to the user.
pub fn build_context(
    tx: &Transaction,
    features: &FeatureMap,
    ml_score: f64,
    ring_score: f64,
    anomaly_score: f64,
    similar: &[SimilarPattern],
) -> Value {
    json!({
        "transaction": {
            "id": tx.transaction_id,
            "type": tx.transaction_type.to_string(),
            "amount": tx.amount_f64(),
            "currency": tx.currency,
            "payment_method": tx.payment_method,
            "country": tx.country_code,
        },
        "user": {
            "id": tx.user_id,
            "account_age_days": features.get("account_age_days").round(),
            "income_ratio": features.get("amount_income_ratio"),
            "risk_level": tx.user.risk_level,
            "kyc_unverified": features.flag("kyc_unverified"),
            "lifetime_deposits": tx.user.total_deposits,
            "lifetime_withdrawals": tx.user.total_withdrawals,
        },
        "profile": {
            "doc_status": tx.document.verification_status,
            "ip_flagged_anonymous": tx.ip.is_anonymous,
            "declared_device_users": tx.device.unique_users,
            "declared_device_ips": tx.device.unique_ips,
            "declared_ip_users": tx.ip.unique_users,
            "declared_ip_devices": tx.ip.unique_devices,
        },
        "scores": {
            "ensemble": ml_score,
            "ring": ring_score,
            "anomaly": anomaly_score,
        },
        "flags": {
            "structuring": features.flag("is_structuring"),
            "escalating": features.flag("is_escalating"),
            "anonymous_ip": features.get("ip_anonymity_score") > 0.5,
            "sanctioned": features.flag("ip_is_sanctioned"),
            "shared_infrastructure": features.flag("is_multi_device_ip"),
        },
        "known_patterns": similar.iter().map(|p| json!({
            "id": p.pattern_id,
            "type": p.pattern_type,
            "description": p.description,
            "confidence": p.confidence,
        })).collect::<Vec<_>>(),
    })
}

/// 128-bit digest of the canonical serialization.
pub fn canonical_digest(context: &Value) -> String {
    let canonical = serde_json::to_string(context).unwrap_or_default();
    hex::encode(md5::compute(canonical.as_bytes()).0)
}

/// First balanced `{…}` substring, if any.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_verdict(text: &str) -> Option<ReasonerVerdict> {
    let body = extract_json(text)?;
    let value: Value = serde_json::from_str(body).ok()?;
    let recommendation = match value["recommendation"].as_str()? {
        "approve"      => Decision::AutoApproved,
        "block"        => Decision::AutoBlocked,
        "human_review" => Decision::HumanReview,
        _              => return None,
    };
    let confidence = value["confidence"].as_f64()?.clamp(0.0, 1.0);
    let reasoning = value["reasoning"].as_str().unwrap_or("").to_string();
    Some(ReasonerVerdict { recommendation, reasoning, confidence })
}

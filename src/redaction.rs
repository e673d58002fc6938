//! PII redaction and prompt guarding for LLM-bound payloads.
//!
//! Nothing leaves the process toward a model without passing through this
//! module: card identifiers are masked, raw card history is collapsed to a
//! count, sensitive keys are dropped, strings and nesting are bounded, and
//! a pattern scanner rejects known prompt-injection payloads.

use regex::Regex;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::state::InvestigationState;

/// Field names that must never reach a model or come back from one.
pub const SENSITIVE_KEY_DENYLIST: [&str; 5] =
    ["system", "instruction", "password", "secret", "token"];

/// Maximum string length allowed in an outbound payload.
pub const MAX_STRING_LEN: usize = 50_000;

/// Maximum JSON nesting depth allowed in an outbound payload.
pub const MAX_JSON_DEPTH: usize = 10;

/// Collapse a card identifier to its first and last four characters.
///
/// Identifiers of eight characters or fewer are fully masked.
pub fn redact_card_id(card_id: &str) -> String {
    let chars: Vec<char> = card_id.chars().collect();
    if chars.len() <= 8 {
        return "***".to_owned();
    }
    let head: String = chars.iter().take(4).collect();
    let tail: String = chars.iter().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    format!("{head}***{tail}")
}

/// Whether a key name matches the sensitive denylist.
pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    SENSITIVE_KEY_DENYLIST
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Recursively sanitize a JSON value for model consumption.
///
/// Drops denylisted keys, truncates over-long strings, and replaces
/// anything nested deeper than [`MAX_JSON_DEPTH`] with a marker.
pub fn sanitize_value(value: &Value) -> Value {
    sanitize_at_depth(value, 0)
}

fn sanitize_at_depth(value: &Value, depth: usize) -> Value {
    if depth >= MAX_JSON_DEPTH {
        return Value::String("[depth limit]".to_owned());
    }
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, inner) in map {
                if is_sensitive_key(key) {
                    continue;
                }
                out.insert(
                    key.clone(),
                    sanitize_at_depth(inner, depth.saturating_add(1)),
                );
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| sanitize_at_depth(v, depth.saturating_add(1)))
                .collect(),
        ),
        Value::String(s) => Value::String(truncate_on_boundary(s, MAX_STRING_LEN).to_owned()),
        other => other.clone(),
    }
}

/// Build the redacted state snapshot the planner and reasoning prompts see.
///
/// Raw card history never appears: it is replaced with
/// `card_history_count`. The card identifier is masked.
pub fn redact_state_for_prompt(state: &InvestigationState) -> Value {
    let context = state.context.as_ref().map(|ctx| {
        let mut transaction =
            serde_json::to_value(&ctx.transaction).unwrap_or_else(|_| json!({}));
        if let Some(obj) = transaction.as_object_mut() {
            obj.insert(
                "card_id".to_owned(),
                Value::String(redact_card_id(&ctx.transaction.card_id)),
            );
        }
        json!({
            "transaction": transaction,
            "card_history_count": ctx.card_history.len(),
            "merchant_history_count": ctx.merchant_history.len(),
            "matched_rules": ctx.matched_rules,
            "window_1h": ctx.window_1h,
            "window_6h": ctx.window_6h,
            "window_24h": ctx.window_24h,
            "window_72h": ctx.window_72h,
        })
    });

    let snapshot = json!({
        "transaction_id": state.transaction_id,
        "mode": state.mode,
        "context": context,
        "pattern_results": state.pattern_results,
        "similarity_results": state.similarity_results,
        "hypotheses": state.hypotheses,
        "completed_steps": state.completed_steps,
        "step_count": state.step_count,
        "max_steps": state.max_steps,
        "severity": state.severity,
        "confidence_score": state.confidence_score,
    });
    sanitize_value(&snapshot)
}

/// Truncate a string at a char boundary at or below `max_len` bytes.
pub fn truncate_on_boundary(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    s.get(..end).unwrap_or(s)
}

// ── Prompt guard ────────────────────────────────────────────────

/// A prompt-guard rejection. Treated as an LLM failure by callers.
#[derive(Debug, Error)]
#[error("prompt guard rejected payload: matched '{pattern}'")]
pub struct GuardRejection {
    /// The pattern that matched.
    pub pattern: String,
}

/// Pattern scanner for known prompt-injection payloads.
///
/// Enabled by default; configuration may only disable it outside
/// production (enforced by settings validation).
#[derive(Debug)]
pub struct PromptGuard {
    enabled: bool,
    patterns: Vec<Regex>,
}

impl PromptGuard {
    /// Build a guard. When `enabled` is false, [`PromptGuard::scan`]
    /// always passes.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            patterns: injection_patterns(),
        }
    }

    /// Scan an outbound payload, rejecting known injection markers.
    pub fn scan(&self, payload: &str) -> Result<(), GuardRejection> {
        if !self.enabled {
            return Ok(());
        }
        for pattern in &self.patterns {
            if pattern.is_match(payload) {
                return Err(GuardRejection {
                    pattern: pattern.as_str().to_owned(),
                });
            }
        }
        Ok(())
    }
}

fn injection_patterns() -> Vec<Regex> {
    let patterns = [
        r"(?i)ignore\s+(all\s+|any\s+)?previous\s+instructions",
        r"(?i)disregard\s+(the\s+)?(system\s+)?prompt",
        r"(?i)you\s+are\s+now\s+(a|an|in)\b",
        r"(?i)\bdeveloper\s+mode\b",
        r"(?i)\bdo\s+anything\s+now\b",
        r"(?i)<\s*/?\s*system\s*>",
        r"(?i)\bnew\s+system\s+prompt\b",
    ];

    patterns
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
}

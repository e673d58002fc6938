//! Pattern tool: deterministic fraud scoring over gathered context.
//!
//! Five detectors, each yielding a score in [0, 1] and a fixed weight.
//! The overall score is the weighted mean; detectors scoring above 0.5
//! are reported in `patterns_detected`. Pure computation — no I/O.

use serde_json::json;

use crate::config::ScoringSettings;
use crate::state::{
    EvidenceEnvelope, InvestigationState, PatternResults, PatternScore, Severity, Transaction,
    TransactionContext,
};

use super::{ToolError, PATTERN_TOOL};

/// Detector name for amount anomalies.
pub const AMOUNT_ANOMALY: &str = "amount_anomaly";
/// Detector name for velocity bursts.
pub const VELOCITY: &str = "velocity";
/// Detector name for unusual-hour activity.
pub const TIME_ANOMALY: &str = "time_anomaly";
/// Detector name for cross-merchant spread.
pub const CROSS_MERCHANT: &str = "cross_merchant";
/// Detector name for card testing.
pub const CARD_TESTING: &str = "card_testing";

const WEIGHT_AMOUNT: f64 = 0.15;
const WEIGHT_VELOCITY: f64 = 0.30;
const WEIGHT_TIME: f64 = 0.10;
const WEIGHT_CROSS_MERCHANT: f64 = 0.30;
const WEIGHT_CARD_TESTING: f64 = 0.15;

/// Detection threshold: a detector above this lands in
/// `patterns_detected`.
const DETECTED_THRESHOLD: f64 = 0.5;

/// Deterministic pattern scorer.
#[derive(Debug, Clone)]
pub struct PatternTool {
    settings: ScoringSettings,
}

impl PatternTool {
    /// Create the tool with scoring thresholds.
    pub fn new(settings: ScoringSettings) -> Self {
        Self { settings }
    }

    /// Score patterns into a new state. No-op when context is absent.
    pub fn execute(&self, state: &InvestigationState) -> Result<InvestigationState, ToolError> {
        let mut next = state.clone();
        let Some(ctx) = &state.context else {
            return Ok(next);
        };

        let scores = vec![
            score_amount(&ctx.transaction, &ctx.card_history, &self.settings),
            score_velocity(ctx, &self.settings),
            score_time(&ctx.transaction, &self.settings),
            score_cross_merchant(ctx, &self.settings),
            score_card_testing(&ctx.card_history, &ctx.transaction, &self.settings),
        ];

        let weight_sum: f64 = scores.iter().map(|s| s.weight).sum();
        let weighted_sum: f64 = scores.iter().map(|s| s.score * s.weight).sum();
        let overall_score = if weight_sum > 0.0 {
            (weighted_sum / weight_sum).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let patterns_detected: Vec<String> = scores
            .iter()
            .filter(|s| s.score > DETECTED_THRESHOLD)
            .map(|s| s.name.clone())
            .collect();

        next.evidence.push(EvidenceEnvelope {
            category: "pattern_analysis".to_owned(),
            tool: PATTERN_TOOL.to_owned(),
            description: format!(
                "{} patterns detected, overall {overall_score:.2}",
                patterns_detected.len()
            ),
            data: serde_json::to_value(&scores).unwrap_or_else(|_| json!([])),
        });

        next.pattern_results = Some(PatternResults {
            scores,
            overall_score,
            patterns_detected,
        });

        // A pure pattern severity estimate; reasoning and completion may
        // raise it further but never below this.
        let derived = severity_from_score(overall_score, &self.settings);
        if derived > next.severity {
            next.severity = derived;
        }

        Ok(next)
    }
}

/// Map a pattern overall score onto a severity level.
pub fn severity_from_score(score: f64, settings: &ScoringSettings) -> Severity {
    if score >= settings.severity_critical {
        Severity::Critical
    } else if score >= settings.severity_high {
        Severity::High
    } else if score >= settings.severity_medium {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Sub-threshold activity still contributes a weak signal.
fn ratio_score(ratio: f64) -> f64 {
    if ratio >= 1.0 {
        ratio.min(1.0)
    } else {
        ratio * 0.4
    }
}

fn score_amount(
    target: &Transaction,
    card_history: &[Transaction],
    settings: &ScoringSettings,
) -> PatternScore {
    let amount = target.amount;

    let absolute: f64 = if amount >= settings.amount_high {
        1.0
    } else if amount >= settings.amount_elevated {
        0.6
    } else {
        0.0
    };

    // Baseline excludes the target itself.
    let baseline: Vec<f64> = card_history
        .iter()
        .filter(|t| t.transaction_id != target.transaction_id)
        .map(|t| t.amount)
        .collect();
    let (mean, std_dev) = mean_and_std(&baseline);
    let z_score = if std_dev > f64::EPSILON {
        (amount - mean) / std_dev
    } else {
        0.0
    };
    let statistical = if z_score >= settings.zscore_outlier {
        1.0
    } else if z_score >= settings.zscore_warning {
        0.7
    } else {
        0.0
    };

    let round_number = settings
        .round_amounts
        .iter()
        .any(|r| (amount - r).abs() < 0.005);
    let round_bump = if round_number && amount >= settings.amount_elevated {
        0.3
    } else {
        0.0
    };

    let score = absolute.max(statistical).max(round_bump);

    PatternScore {
        name: AMOUNT_ANOMALY.to_owned(),
        score,
        weight: WEIGHT_AMOUNT,
        details: json!({
            "amount": amount,
            "baseline_mean": mean,
            "baseline_std": std_dev,
            "z_score": z_score,
            "round_number": round_number,
            "threshold_high": settings.amount_high,
            "threshold_elevated": settings.amount_elevated,
        }),
    }
}

fn score_velocity(ctx: &TransactionContext, settings: &ScoringSettings) -> PatternScore {
    let count_1h = f64::from(ctx.window_1h.transaction_count);
    let count_6h = f64::from(ctx.window_6h.transaction_count);
    let ratio_1h = count_1h / f64::from(settings.velocity_1h_threshold.max(1));
    let ratio_6h = count_6h / f64::from(settings.velocity_6h_threshold.max(1));
    let score = ratio_score(ratio_1h.max(ratio_6h));

    PatternScore {
        name: VELOCITY.to_owned(),
        score,
        weight: WEIGHT_VELOCITY,
        details: json!({
            "count_1h": ctx.window_1h.transaction_count,
            "count_6h": ctx.window_6h.transaction_count,
            "threshold_1h": settings.velocity_1h_threshold,
            "threshold_6h": settings.velocity_6h_threshold,
        }),
    }
}

fn score_time(target: &Transaction, settings: &ScoringSettings) -> PatternScore {
    use chrono::Timelike;
    let hour = target.occurred_at.hour();
    let unusual = settings.unusual_hours.contains(&hour);
    PatternScore {
        name: TIME_ANOMALY.to_owned(),
        score: if unusual { 1.0 } else { 0.0 },
        weight: WEIGHT_TIME,
        details: json!({
            "hour": hour,
            "unusual_hours": settings.unusual_hours,
        }),
    }
}

fn score_cross_merchant(ctx: &TransactionContext, settings: &ScoringSettings) -> PatternScore {
    let distinct = f64::from(ctx.window_24h.unique_merchants);
    let ratio = distinct / f64::from(settings.cross_merchant_threshold.max(1));
    let score = ratio_score(ratio);

    PatternScore {
        name: CROSS_MERCHANT.to_owned(),
        score,
        weight: WEIGHT_CROSS_MERCHANT,
        details: json!({
            "unique_merchants_24h": ctx.window_24h.unique_merchants,
            "threshold": settings.cross_merchant_threshold,
        }),
    }
}

fn score_card_testing(
    card_history: &[Transaction],
    target: &Transaction,
    settings: &ScoringSettings,
) -> PatternScore {
    // History arrives time-sorted from the context tool; sort defensively
    // for direct callers.
    let mut sorted: Vec<&Transaction> = card_history.iter().collect();
    sorted.sort_by_key(|t| t.occurred_at);

    let mut longest_run: u32 = 0;
    let mut current_run: u32 = 0;
    for txn in &sorted {
        if txn.is_declined() && txn.amount <= settings.card_testing_max_amount {
            current_run = current_run.saturating_add(1);
            longest_run = longest_run.max(current_run);
        } else {
            current_run = 0;
        }
    }

    let ratio = f64::from(longest_run) / f64::from(settings.card_testing_run.max(1));
    let score = if longest_run >= settings.card_testing_run {
        1.0
    } else {
        ratio * 0.4
    };

    PatternScore {
        name: CARD_TESTING.to_owned(),
        score,
        weight: WEIGHT_CARD_TESTING,
        details: json!({
            "longest_small_decline_run": longest_run,
            "run_threshold": settings.card_testing_run,
            "small_amount_max": settings.card_testing_max_amount,
            "card_id_suffix": crate::redaction::redact_card_id(&target.card_id),
        }),
    }
}

fn mean_and_std(values: &[f64]) -> (f64, f64) {
    if values.len() < 2 {
        return (values.first().copied().unwrap_or(0.0), 0.0);
    }
    let n = u32::try_from(values.len()).unwrap_or(u32::MAX);
    let n = f64::from(n);
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{FeatureFlagsSnapshot, InvestigationMode, SafeguardsSnapshot};
    use chrono::{Duration, TimeZone, Utc};
    use uuid::Uuid;

    fn txn(id: &str, merchant: &str, minutes_before: i64, amount: f64, declined: bool) -> Transaction {
        let anchor = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("ts");
        Transaction {
            transaction_id: id.to_owned(),
            card_id: "tok_burst_cardxyz".to_owned(),
            merchant_id: merchant.to_owned(),
            merchant_name: None,
            mcc: Some("5999".to_owned()),
            amount,
            currency: "USD".to_owned(),
            outcome: if declined { "declined" } else { "approved" }.to_owned(),
            three_ds_verified: false,
            device_trusted: false,
            occurred_at: anchor - Duration::minutes(minutes_before),
        }
    }

    fn base_state() -> InvestigationState {
        InvestigationState::new(
            Uuid::new_v4(),
            "t0".to_owned(),
            InvestigationMode::Full,
            FeatureFlagsSnapshot {
                planner_llm_enabled: false,
                vector_enabled: false,
                prompt_guard_enabled: true,
                rule_draft_export_enabled: false,
            },
            SafeguardsSnapshot {
                investigation_timeout_seconds: 120,
                tool_timeout_seconds: 30,
                planner_timeout_seconds: 10,
                max_steps: 20,
            },
            "model".to_owned(),
            Utc::now(),
        )
    }

    fn state_with_context(target: Transaction, history: Vec<Transaction>) -> InvestigationState {
        let mut state = base_state();
        let window_1h = crate::tools::context::window_stats(&target, &history, 1);
        let window_6h = crate::tools::context::window_stats(&target, &history, 6);
        let window_24h = crate::tools::context::window_stats(&target, &history, 24);
        let window_72h = crate::tools::context::window_stats(&target, &history, 72);
        state.context = Some(TransactionContext {
            transaction: target,
            card_history: history,
            merchant_history: vec![],
            matched_rules: vec![],
            review: None,
            notes: vec![],
            case: None,
            window_1h,
            window_6h,
            window_24h,
            window_72h,
        });
        state
    }

    #[test]
    fn test_velocity_burst_detected_and_at_least_medium() {
        // 12 transactions at one merchant inside an hour.
        let target = txn("t0", "m1", 0, 25.0, false);
        let mut history = vec![target.clone()];
        for i in 1i64..12 {
            history.push(txn(&format!("t{i}"), "m1", i.saturating_mul(5), 25.0, false));
        }
        let state = state_with_context(target, history);

        let tool = PatternTool::new(ScoringSettings::default());
        let next = tool.execute(&state).expect("execute");
        let results = next.pattern_results.expect("results");

        assert!(results
            .patterns_detected
            .iter()
            .any(|p| p == VELOCITY));
        assert!(results.overall_score >= 0.3, "got {}", results.overall_score);
        assert!(next.severity >= Severity::Medium);
        assert_eq!(
            next.context.as_ref().expect("ctx").window_1h.transaction_count,
            12
        );
    }

    #[test]
    fn test_cross_merchant_spread_detected() {
        // 11 distinct merchants over 20 hours.
        let target = txn("t0", "m0", 0, 30.0, false);
        let mut history = vec![target.clone()];
        for i in 1i64..11 {
            history.push(txn(&format!("t{i}"), &format!("m{i}"), i.saturating_mul(120), 30.0, false));
        }
        let state = state_with_context(target, history);

        let tool = PatternTool::new(ScoringSettings::default());
        let next = tool.execute(&state).expect("execute");
        let results = next.pattern_results.expect("results");

        assert!(results
            .patterns_detected
            .iter()
            .any(|p| p == CROSS_MERCHANT));
        assert_eq!(
            next.context.as_ref().expect("ctx").window_24h.unique_merchants,
            11
        );
        assert!(next.severity >= Severity::Medium);
    }

    #[test]
    fn test_quiet_card_scores_low() {
        // One $50 purchase and five earlier approvals at the same merchant.
        let target = txn("t0", "m1", 0, 50.0, false);
        let mut history = vec![target.clone()];
        for i in 1i64..6 {
            history.push(txn(&format!("t{i}"), "m1", i.saturating_mul(600), 48.0, false));
        }
        let state = state_with_context(target, history);

        let tool = PatternTool::new(ScoringSettings::default());
        let next = tool.execute(&state).expect("execute");
        let results = next.pattern_results.expect("results");

        assert!(results.patterns_detected.is_empty());
        assert!(results.overall_score < 0.3);
        assert_eq!(next.severity, Severity::Low);
    }

    #[test]
    fn test_card_testing_run_detected() {
        let target = txn("t0", "m1", 0, 2.0, true);
        let history = vec![
            txn("t3", "m1", 15, 1.0, true),
            txn("t2", "m1", 10, 1.5, true),
            txn("t1", "m1", 5, 2.0, true),
            target.clone(),
        ];
        let state = state_with_context(target, history);

        let tool = PatternTool::new(ScoringSettings::default());
        let next = tool.execute(&state).expect("execute");
        let results = next.pattern_results.expect("results");
        assert!(results
            .patterns_detected
            .iter()
            .any(|p| p == CARD_TESTING));
    }

    #[test]
    fn test_amount_outlier_scores_high() {
        let target = txn("t0", "m1", 0, 1500.0, false);
        let mut history = vec![target.clone()];
        for i in 1i32..10 {
            history.push(txn(
                &format!("t{i}"),
                "m1",
                i64::from(i.saturating_mul(60)),
                20.0 + f64::from(i),
                false,
            ));
        }
        let state = state_with_context(target, history);

        let tool = PatternTool::new(ScoringSettings::default());
        let next = tool.execute(&state).expect("execute");
        let results = next.pattern_results.expect("results");
        let amount = results
            .scores
            .iter()
            .find(|s| s.name == AMOUNT_ANOMALY)
            .expect("amount score");
        assert!((amount.score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_missing_context_is_a_noop() {
        let state = base_state();
        let tool = PatternTool::new(ScoringSettings::default());
        let next = tool.execute(&state).expect("execute");
        assert!(next.pattern_results.is_none());
        assert!(next.evidence.is_empty());
    }

    #[test]
    fn test_overall_score_is_weighted_mean() {
        let target = txn("t0", "m1", 0, 10.0, false);
        let state = state_with_context(target, vec![]);
        let tool = PatternTool::new(ScoringSettings::default());
        let next = tool.execute(&state).expect("execute");
        let results = next.pattern_results.expect("results");

        let weight_sum: f64 = results.scores.iter().map(|s| s.weight).sum();
        let weighted: f64 = results.scores.iter().map(|s| s.score * s.weight).sum();
        assert!((results.overall_score - weighted / weight_sum).abs() < 1e-9);
        assert!((weight_sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_severity_thresholds() {
        let settings = ScoringSettings::default();
        assert_eq!(severity_from_score(0.75, &settings), Severity::Critical);
        assert_eq!(severity_from_score(0.55, &settings), Severity::High);
        assert_eq!(severity_from_score(0.35, &settings), Severity::Medium);
        assert_eq!(severity_from_score(0.1, &settings), Severity::Low);
    }

    #[test]
    fn test_mean_and_std() {
        let (mean, std) = mean_and_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((mean - 5.0).abs() < 1e-9);
        assert!((std - 2.0).abs() < 1e-9);
        let (single_mean, single_std) = mean_and_std(&[3.0]);
        assert!((single_mean - 3.0).abs() < 1e-9);
        assert!((single_std - 0.0).abs() < f64::EPSILON);
    }
}

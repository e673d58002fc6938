//! Configuration loading and startup validation.
//!
//! All options are read once at startup into an immutable [`Settings`]
//! value; a restart is required to change any of them. Precedence:
//! environment variables > optional TOML file (`$OPS_AGENT_CONFIG_PATH` or
//! `./config.toml`) > defaults.
//!
//! Validation runs eagerly: in production, an unsafe combination (JWT
//! bypass, disabled human approval, disabled prompt guard) aborts startup.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::state::{FeatureFlagsSnapshot, SafeguardsSnapshot};

// ── Sections ────────────────────────────────────────────────────

/// Runtime budgets and caps for the agent graph.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Outer deadline for one investigation, seconds.
    pub investigation_timeout_seconds: u64,
    /// Per-tool deadline, seconds.
    pub tool_timeout_seconds: u64,
    /// Per-planner-call deadline, seconds.
    pub planner_timeout_seconds: u64,
    /// Planner step cap.
    pub max_steps: u32,
    /// Global cap on concurrently running investigations.
    pub max_concurrent_investigations: u32,
    /// Days to keep state snapshots before the retention sweep removes them.
    pub state_retention_days: u32,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            investigation_timeout_seconds: 120,
            tool_timeout_seconds: 30,
            planner_timeout_seconds: 10,
            max_steps: 20,
            max_concurrent_investigations: 10,
            state_retention_days: 90,
        }
    }
}

/// Planner model selection and behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerSettings {
    /// Model identifier used for planning calls.
    pub model: String,
    /// Sampling temperature; must stay at or below 0.3.
    pub temperature: f64,
    /// Whether the planner consults the LLM at all.
    pub llm_enabled: bool,
    /// Max completion tokens for a planning call.
    pub max_completion_tokens: u32,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_owned(),
            temperature: 0.2,
            llm_enabled: true,
            max_completion_tokens: 256,
        }
    }
}

/// LLM collaborator endpoint and guard settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    /// Base URL of the OpenAI-compatible endpoint.
    pub base_url: String,
    /// API key; never logged.
    pub api_key: String,
    /// Prompt-side token budget.
    pub max_prompt_tokens: u32,
    /// Completion-side token budget for reasoning calls.
    pub max_completion_tokens: u32,
    /// Whether the prompt guard scans payloads before they leave.
    pub prompt_guard_enabled: bool,
    /// Embedding model identifier.
    pub embedding_model: String,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_owned(),
            api_key: String::new(),
            max_prompt_tokens: 4000,
            max_completion_tokens: 384,
            prompt_guard_enabled: true,
            embedding_model: "text-embedding-3-large".to_owned(),
        }
    }
}

/// Vector similarity search settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VectorSettings {
    /// Whether similarity search runs at all.
    pub enabled: bool,
    /// Embedding dimensionality; must match the vector column.
    pub dimension: u32,
    /// Nearest-neighbor limit per query.
    pub search_limit: u32,
    /// Neighbors older than this are excluded.
    pub time_window_days: u32,
    /// Matches below this cosine similarity are dropped.
    pub min_similarity: f64,
}

impl Default for VectorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dimension: 1024,
            search_limit: 20,
            time_window_days: 90,
            min_similarity: 0.3,
        }
    }
}

/// Transaction Management collaborator settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TmSettings {
    /// TM service base URL.
    pub base_url: String,
    /// M2M client id for token exchange.
    pub m2m_client_id: String,
    /// M2M client secret; never logged.
    pub m2m_client_secret: String,
    /// M2M token audience.
    pub m2m_audience: String,
    /// Per-request timeout, seconds.
    pub timeout_seconds: u64,
    /// Consecutive failures before the breaker opens.
    pub circuit_breaker_threshold: u32,
    /// Breaker cooldown, seconds.
    pub circuit_breaker_cooldown_seconds: u64,
    /// History look-back window, hours.
    pub history_hours: u32,
    /// Pagination cap for history fetches.
    pub history_max_pages: u32,
    /// Page size for history fetches.
    pub history_page_size: u32,
}

impl Default for TmSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_owned(),
            m2m_client_id: String::new(),
            m2m_client_secret: String::new(),
            m2m_audience: "tm-api".to_owned(),
            timeout_seconds: 10,
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown_seconds: 60,
            history_hours: 72,
            history_max_pages: 3,
            history_page_size: 500,
        }
    }
}

/// Deterministic scoring thresholds used by the pattern tool and the
/// severity derivation at completion.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringSettings {
    /// Transactions per hour that count as a velocity burst.
    pub velocity_1h_threshold: u32,
    /// Transactions per six hours that count as a velocity burst.
    pub velocity_6h_threshold: u32,
    /// Decline ratio considered high.
    pub decline_ratio_high: f64,
    /// Decline ratio considered elevated.
    pub decline_ratio_medium: f64,
    /// Absolute amount considered high.
    pub amount_high: f64,
    /// Absolute amount considered elevated.
    pub amount_elevated: f64,
    /// Z-score flagged as an outlier.
    pub zscore_outlier: f64,
    /// Z-score flagged as a warning.
    pub zscore_warning: f64,
    /// Hours of day (0-23) considered unusual.
    pub unusual_hours: Vec<u32>,
    /// Round amounts that raise the card-testing signal.
    pub round_amounts: Vec<f64>,
    /// Distinct merchants in 24 h that count as cross-merchant spread.
    pub cross_merchant_threshold: u32,
    /// Consecutive small declines that count as card testing.
    pub card_testing_run: u32,
    /// Maximum amount considered "small" for card testing.
    pub card_testing_max_amount: f64,
    /// Pattern overall score at or above which severity is CRITICAL.
    pub severity_critical: f64,
    /// Pattern overall score at or above which severity is HIGH.
    pub severity_high: f64,
    /// Pattern overall score at or above which severity is MEDIUM.
    pub severity_medium: f64,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            velocity_1h_threshold: 10,
            velocity_6h_threshold: 25,
            decline_ratio_high: 0.5,
            decline_ratio_medium: 0.3,
            amount_high: 1000.0,
            amount_elevated: 500.0,
            zscore_outlier: 3.0,
            zscore_warning: 2.0,
            unusual_hours: vec![0, 1, 2, 3, 4, 5],
            round_amounts: vec![100.0, 200.0, 500.0, 1000.0],
            cross_merchant_threshold: 5,
            card_testing_run: 3,
            card_testing_max_amount: 5.0,
            severity_critical: 0.7,
            severity_high: 0.5,
            severity_medium: 0.3,
        }
    }
}

/// Safety switches validated at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SafetySettings {
    /// Rule export requires an explicit human approval. Must be true in
    /// production.
    pub enforce_human_approval: bool,
    /// Whether rule draft export to rule management is available at all.
    pub enable_rule_draft_export: bool,
    /// Skip JWT validation. Local development only.
    pub skip_jwt_validation: bool,
    /// Token required by the metrics scrape endpoint.
    pub metrics_token: Option<String>,
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            enforce_human_approval: true,
            enable_rule_draft_export: false,
            skip_jwt_validation: false,
            metrics_token: None,
        }
    }
}

/// Database connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Postgres connection URL.
    pub url: String,
    /// Pool size.
    pub max_connections: u32,
    /// Server-side statement timeout, seconds.
    pub statement_timeout_seconds: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/ops_agent".to_owned(),
            max_connections: 10,
            statement_timeout_seconds: 30,
        }
    }
}

// ── Settings ────────────────────────────────────────────────────

/// Immutable process-wide settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Deployment environment ("local", "staging", "production").
    pub environment: String,
    /// Agent runtime budgets.
    pub agent: AgentSettings,
    /// Planner model configuration.
    pub planner: PlannerSettings,
    /// LLM collaborator configuration.
    pub llm: LlmSettings,
    /// Vector search configuration.
    pub vector: VectorSettings,
    /// TM collaborator configuration.
    pub tm: TmSettings,
    /// Scoring thresholds.
    pub scoring: ScoringSettings,
    /// Safety switches.
    pub safety: SafetySettings,
    /// Database configuration.
    pub database: DatabaseSettings,
}

impl Settings {
    /// Load settings with precedence: env vars > TOML file > defaults,
    /// then validate.
    pub fn load() -> Result<Self> {
        let mut settings = Self::load_from_file()?;
        settings.apply_overrides(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML string (no env overrides, no validation).
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Whether this process runs in production configuration.
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Feature flags frozen into a new investigation state.
    pub fn feature_flags(&self) -> FeatureFlagsSnapshot {
        FeatureFlagsSnapshot {
            planner_llm_enabled: self.planner.llm_enabled,
            vector_enabled: self.vector.enabled,
            prompt_guard_enabled: self.llm.prompt_guard_enabled,
            rule_draft_export_enabled: self.safety.enable_rule_draft_export,
        }
    }

    /// Safeguard budgets frozen into a new investigation state.
    pub fn safeguards(&self) -> SafeguardsSnapshot {
        SafeguardsSnapshot {
            investigation_timeout_seconds: self.agent.investigation_timeout_seconds,
            tool_timeout_seconds: self.agent.tool_timeout_seconds,
            planner_timeout_seconds: self.agent.planner_timeout_seconds,
            max_steps: self.agent.max_steps,
        }
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(Settings::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env("OPS_AGENT_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver function for testability.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("OPS_AGENT_ENV") {
            self.environment = v;
        }

        // Agent budgets.
        if let Some(n) = parsed(&env, "INVESTIGATION_TIMEOUT_SECONDS") {
            self.agent.investigation_timeout_seconds = n;
        }
        if let Some(n) = parsed(&env, "TOOL_TIMEOUT_SECONDS") {
            self.agent.tool_timeout_seconds = n;
        }
        if let Some(n) = parsed(&env, "PLANNER_TIMEOUT_SECONDS") {
            self.agent.planner_timeout_seconds = n;
        }
        if let Some(n) = parsed(&env, "MAX_STEPS") {
            self.agent.max_steps = n;
        }

        // Planner.
        if let Some(v) = env("PLANNER_MODEL") {
            self.planner.model = v;
        }
        if let Some(n) = parsed(&env, "PLANNER_TEMPERATURE") {
            self.planner.temperature = n;
        }
        if let Some(b) = parsed(&env, "PLANNER_LLM_ENABLED") {
            self.planner.llm_enabled = b;
        }

        // LLM.
        if let Some(v) = env("LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = env("LLM_API_KEY") {
            self.llm.api_key = v;
        }
        if let Some(n) = parsed(&env, "LLM_MAX_PROMPT_TOKENS") {
            self.llm.max_prompt_tokens = n;
        }
        if let Some(n) = parsed(&env, "LLM_MAX_COMPLETION_TOKENS") {
            self.llm.max_completion_tokens = n;
        }
        if let Some(b) = parsed(&env, "LLM_PROMPT_GUARD_ENABLED") {
            self.llm.prompt_guard_enabled = b;
        }

        // Vector.
        if let Some(b) = parsed(&env, "VECTOR_ENABLED") {
            self.vector.enabled = b;
        }
        if let Some(n) = parsed(&env, "VECTOR_DIMENSION") {
            self.vector.dimension = n;
        }
        if let Some(n) = parsed(&env, "VECTOR_SEARCH_LIMIT") {
            self.vector.search_limit = n;
        }
        if let Some(n) = parsed(&env, "VECTOR_TIME_WINDOW_DAYS") {
            self.vector.time_window_days = n;
        }
        if let Some(n) = parsed(&env, "VECTOR_MIN_SIMILARITY") {
            self.vector.min_similarity = n;
        }

        // TM.
        if let Some(v) = env("TM_BASE_URL") {
            self.tm.base_url = v;
        }
        if let Some(v) = env("TM_M2M_CLIENT_ID") {
            self.tm.m2m_client_id = v;
        }
        if let Some(v) = env("TM_M2M_CLIENT_SECRET") {
            self.tm.m2m_client_secret = v;
        }
        if let Some(v) = env("TM_M2M_AUDIENCE") {
            self.tm.m2m_audience = v;
        }
        if let Some(n) = parsed(&env, "TM_TIMEOUT_SECONDS") {
            self.tm.timeout_seconds = n;
        }
        if let Some(n) = parsed(&env, "TM_CIRCUIT_BREAKER_THRESHOLD") {
            self.tm.circuit_breaker_threshold = n;
        }
        if let Some(n) = parsed(&env, "TM_CIRCUIT_BREAKER_COOLDOWN") {
            self.tm.circuit_breaker_cooldown_seconds = n;
        }

        // Safety.
        if let Some(b) = parsed(&env, "ENFORCE_HUMAN_APPROVAL") {
            self.safety.enforce_human_approval = b;
        }
        if let Some(b) = parsed(&env, "ENABLE_RULE_DRAFT_EXPORT") {
            self.safety.enable_rule_draft_export = b;
        }
        if let Some(b) = parsed(&env, "SKIP_JWT_VALIDATION") {
            self.safety.skip_jwt_validation = b;
        }
        if let Some(v) = env("METRICS_TOKEN") {
            self.safety.metrics_token = Some(v);
        }

        // Database.
        if let Some(v) = env("DATABASE_URL") {
            self.database.url = v;
        }
    }

    /// Validate the loaded settings, refusing unsafe combinations.
    pub fn validate(&self) -> Result<()> {
        if self.planner.temperature > 0.3 {
            anyhow::bail!(
                "PLANNER_TEMPERATURE must be <= 0.3, got {}",
                self.planner.temperature
            );
        }
        if self.agent.max_steps == 0 {
            anyhow::bail!("MAX_STEPS must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.vector.min_similarity) {
            anyhow::bail!(
                "VECTOR_MIN_SIMILARITY must be in [0, 1], got {}",
                self.vector.min_similarity
            );
        }
        if self.safety.enable_rule_draft_export && !self.safety.enforce_human_approval {
            anyhow::bail!(
                "ENABLE_RULE_DRAFT_EXPORT requires ENFORCE_HUMAN_APPROVAL; refusing to start"
            );
        }
        if self.is_production() {
            if self.safety.skip_jwt_validation {
                anyhow::bail!("SKIP_JWT_VALIDATION is not permitted in production");
            }
            if !self.safety.enforce_human_approval {
                anyhow::bail!("ENFORCE_HUMAN_APPROVAL must be true in production");
            }
            if !self.llm.prompt_guard_enabled {
                anyhow::bail!("LLM_PROMPT_GUARD_ENABLED must be true in production");
            }
        }
        Ok(())
    }
}

/// Parse an env override, warning and returning None on failure.
fn parsed<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = key, value = %raw, "ignoring invalid env override");
            None
        }
    }
}

use anyhow::{Context, Result, anyhow};
use chrono::FixedOffset;
use serde::Deserialize;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub plans: PlansConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            Self::from_file(path)?
        } else {
            let default_path = PathBuf::from("usage-dashboard.toml");
            if default_path.exists() {
                Self::from_file(&default_path)?
            } else {
                Self::default()
            }
        };

        config.apply_env_overrides();
        config.analytics.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| "failed to parse configuration TOML")?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = env::var("USAGE_DASHBOARD_LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }
        if let Ok(path) = env::var("USAGE_DASHBOARD_DATA_PATH") {
            self.data.data_path = PathBuf::from(path);
        }
        if let Some(hours) = parse_env("USAGE_DASHBOARD_SESSION_WINDOW_HOURS") {
            self.analytics.session_window_hours = hours;
        }
        if let Some(secs) = parse_env("USAGE_DASHBOARD_BROADCAST_INTERVAL") {
            self.broadcast.interval_secs = secs;
        }
        if let Some(secs) = parse_env("USAGE_DASHBOARD_CACHE_TTL") {
            self.data.cache_ttl_secs = secs;
        }
    }
}

fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            api_prefix: default_api_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

impl DataConfig {
    /// Data path with a leading `~` expanded against `$HOME`.
    pub fn resolved_data_path(&self) -> PathBuf {
        expand_home(&self.data_path)
    }

    pub fn is_data_path_valid(&self) -> bool {
        self.resolved_data_path().is_dir()
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyticsConfig {
    #[serde(default = "default_session_window_hours")]
    pub session_window_hours: u32,
    #[serde(default = "default_burn_rate_minutes")]
    pub burn_rate_minutes: u32,
    /// Fixed offset used for every calendar-date and hour-of-day decision.
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            session_window_hours: default_session_window_hours(),
            burn_rate_minutes: default_burn_rate_minutes(),
            utc_offset: default_utc_offset(),
        }
    }
}

impl AnalyticsConfig {
    pub fn offset(&self) -> Result<FixedOffset> {
        parse_utc_offset(&self.utc_offset)
    }

    fn validate(&self) -> Result<()> {
        if self.session_window_hours == 0 {
            return Err(anyhow!("session_window_hours must be at least 1"));
        }
        self.offset().map(|_| ())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_broadcast_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_broadcast_interval(),
            send_timeout_secs: default_send_timeout(),
        }
    }
}

impl BroadcastConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlansConfig {
    #[serde(default = "default_plan_name")]
    pub default_plan: String,
    /// Overrides or additions to the built-in plan table, keyed by plan name.
    #[serde(default)]
    pub custom: HashMap<String, PlanOverride>,
}

impl Default for PlansConfig {
    fn default() -> Self {
        Self {
            default_plan: default_plan_name(),
            custom: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanOverride {
    pub display_name: Option<String>,
    pub token_limit: Option<u64>,
    pub cost_limit: Option<f64>,
    pub message_limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PricingConfig {
    /// Rates keyed by model family; a model matches the first family whose
    /// name it contains.
    #[serde(default = "default_model_pricing")]
    pub models: HashMap<String, ModelPricing>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            models: default_model_pricing(),
        }
    }
}

impl PricingConfig {
    pub fn rates_for(&self, model: &str) -> Option<&ModelPricing> {
        let model = model.to_ascii_lowercase();
        if let Some(exact) = self.models.get(&model) {
            return Some(exact);
        }
        // Longest family name wins so "sonnet-4" beats "sonnet".
        self.models
            .iter()
            .filter(|(family, _)| model.contains(family.to_ascii_lowercase().as_str()))
            .max_by_key(|(family, _)| family.len())
            .map(|(_, pricing)| pricing)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(from = "ModelPricingInput")]
pub struct ModelPricing {
    pub input_per_1m: f64,
    pub output_per_1m: f64,
    pub cache_creation_per_1m: f64,
    pub cache_read_per_1m: f64,
}

#[derive(Debug, Deserialize)]
struct ModelPricingInput {
    input_per_1m: Option<f64>,
    output_per_1m: Option<f64>,
    cache_creation_per_1m: Option<f64>,
    cache_read_per_1m: Option<f64>,
    input_per_1k: Option<f64>,
    output_per_1k: Option<f64>,
}

impl From<ModelPricingInput> for ModelPricing {
    fn from(input: ModelPricingInput) -> Self {
        let input_per_1m = input
            .input_per_1m
            .or(input.input_per_1k.map(|value| value * 1000.0))
            .unwrap_or(0.0);
        let output_per_1m = input
            .output_per_1m
            .or(input.output_per_1k.map(|value| value * 1000.0))
            .unwrap_or(0.0);
        // Anthropic bills cache writes at 1.25x and cache reads at 0.1x input.
        let cache_creation_per_1m = input.cache_creation_per_1m.unwrap_or(input_per_1m * 1.25);
        let cache_read_per_1m = input.cache_read_per_1m.unwrap_or(input_per_1m * 0.1);

        Self {
            input_per_1m,
            output_per_1m,
            cache_creation_per_1m,
            cache_read_per_1m,
        }
    }
}

pub fn parse_utc_offset(raw: &str) -> Result<FixedOffset> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("utc") || trimmed.eq_ignore_ascii_case("z") {
        return FixedOffset::east_opt(0).ok_or_else(|| anyhow!("invalid utc offset"));
    }
    let (sign, rest) = match trimmed.split_at_checked(1) {
        Some(("+", rest)) => (1, rest),
        Some(("-", rest)) => (-1, rest),
        _ => return Err(anyhow!("utc_offset must look like +HH:MM, got {trimmed:?}")),
    };
    let (hours, minutes) = rest
        .split_once(':')
        .ok_or_else(|| anyhow!("utc_offset must look like +HH:MM, got {trimmed:?}"))?;
    let hours: i32 = hours
        .parse()
        .with_context(|| format!("invalid hours in utc_offset {trimmed:?}"))?;
    let minutes: i32 = minutes
        .parse()
        .with_context(|| format!("invalid minutes in utc_offset {trimmed:?}"))?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| anyhow!("utc_offset out of range: {trimmed:?}"))
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

fn default_listen_addr() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_api_prefix() -> String {
    "/api".to_string()
}

fn default_data_path() -> PathBuf {
    PathBuf::from("~/.claude/projects")
}

fn default_cache_ttl() -> u64 {
    30
}

fn default_session_window_hours() -> u32 {
    5
}

fn default_burn_rate_minutes() -> u32 {
    30
}

fn default_utc_offset() -> String {
    "+00:00".to_string()
}

fn default_broadcast_interval() -> u64 {
    10
}

fn default_send_timeout() -> u64 {
    5
}

fn default_plan_name() -> String {
    "custom".to_string()
}

fn default_model_pricing() -> HashMap<String, ModelPricing> {
    let mut models = HashMap::new();

    models.insert(
        "opus".to_string(),
        ModelPricing {
            input_per_1m: 15.0,
            output_per_1m: 75.0,
            cache_creation_per_1m: 18.75,
            cache_read_per_1m: 1.5,
        },
    );
    models.insert(
        "opus-4-5".to_string(),
        ModelPricing {
            input_per_1m: 5.0,
            output_per_1m: 25.0,
            cache_creation_per_1m: 6.25,
            cache_read_per_1m: 0.5,
        },
    );
    models.insert(
        "sonnet".to_string(),
        ModelPricing {
            input_per_1m: 3.0,
            output_per_1m: 15.0,
            cache_creation_per_1m: 3.75,
            cache_read_per_1m: 0.3,
        },
    );
    models.insert(
        "haiku".to_string(),
        ModelPricing {
            input_per_1m: 0.8,
            output_per_1m: 4.0,
            cache_creation_per_1m: 1.0,
            cache_read_per_1m: 0.08,
        },
    );
    models.insert(
        "haiku-4-5".to_string(),
        ModelPricing {
            input_per_1m: 1.0,
            output_per_1m: 5.0,
            cache_creation_per_1m: 1.25,
            cache_read_per_1m: 0.1,
        },
    );

    models
}

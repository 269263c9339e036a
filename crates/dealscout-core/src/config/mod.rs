//! Configuration management with file persistence

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};

use crate::invoker::RetryPolicy;
use crate::registry::{Catalog, ModelDescriptor, Provider};
use crate::scoring::{self, DEFAULT_COMP_PRICE_CEILING};
use crate::weights::validate_update;

/// Dealscout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_models")]
    pub models: Vec<ModelDescriptor>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub invoker: InvokerConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub trainer: TrainerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Preferred model per task type
    pub task_defaults: BTreeMap<String, String>,
    /// Model preferred when the input exceeds `max_input_chars`
    pub long_input_model: Option<String>,
    pub max_input_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokerConfig {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Comparable sale price that normalizes to 1.0
    pub comp_price_ceiling: f64,
    /// Baseline feature weights
    pub weights: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub interval_secs: u64,
    /// Wake the trainer early after this many new feedback records (0 disables)
    pub trigger_after_records: u64,
    pub min_samples: usize,
    pub learning_rate: f64,
    pub bias_scale: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database for feedback and weight history; defaults to the config directory
    pub database_path: Option<PathBuf>,
}

fn default_models() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor::new(
            "gpt-4o",
            Provider::OpenAiCompatible {
                base_url: "https://api.openai.com/v1".to_string(),
                model: "gpt-4o".to_string(),
                api_key_env: "OPENAI_API_KEY".to_string(),
            },
        )
        .with_capabilities(["summarize", "classify", "extract", "generate", "comps", "sms"])
        .with_priority(0)
        .with_cost_weight(1.0),
        ModelDescriptor::new(
            "mistral-7b",
            Provider::Ollama {
                base_url: "http://localhost:11434".to_string(),
                model: "mistral".to_string(),
            },
        )
        .with_capabilities(["summarize", "classify", "extract", "comps"])
        .with_priority(1)
        .with_cost_weight(0.1),
        ModelDescriptor::new(
            "phi3",
            Provider::Ollama {
                base_url: "http://localhost:11434".to_string(),
                model: "phi3".to_string(),
            },
        )
        .with_capabilities(["sms", "classify", "generate"])
        .with_priority(2)
        .with_cost_weight(0.05),
    ]
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            task_defaults: [("sms", "phi3"), ("comps", "mistral-7b")]
                .into_iter()
                .map(|(task, model)| (task.to_string(), model.to_string()))
                .collect(),
            long_input_model: Some("gpt-4o".to_string()),
            max_input_chars: 4000,
        }
    }
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            connect_timeout_secs: 10,
            max_retries: 3,
            backoff_base_ms: 1000,
            backoff_max_ms: 30_000,
        }
    }
}

impl InvokerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            comp_price_ceiling: DEFAULT_COMP_PRICE_CEILING,
            weights: scoring::baseline_weights()
                .into_iter()
                .map(|(name, weight)| (name.to_string(), weight))
                .collect(),
        }
    }
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            trigger_after_records: 100,
            min_samples: 5,
            learning_rate: 1.0,
            bias_scale: 2.0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            models: default_models(),
            routing: RoutingConfig::default(),
            invoker: InvokerConfig::default(),
            scoring: ScoringConfig::default(),
            trainer: TrainerConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("DEALSCOUT_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("dealscout")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// SQLite database path, from `storage.database_path` or the config directory
    pub fn database_path(&self) -> anyhow::Result<PathBuf> {
        match &self.storage.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join("dealscout.db")),
        }
    }

    /// Load configuration from file, or defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config = Self::from_toml(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let catalog = Catalog::new(self.models.clone()).context("Invalid model catalog")?;

        for (task, model) in &self.routing.task_defaults {
            if catalog.get(model).is_none() {
                return Err(anyhow!(
                    "routing.task_defaults maps '{}' to unknown model '{}'",
                    task,
                    model
                ));
            }
        }
        if let Some(model) = &self.routing.long_input_model {
            if catalog.get(model).is_none() {
                return Err(anyhow!("routing.long_input_model '{}' is not in the catalog", model));
            }
        }

        if self.invoker.timeout_secs == 0 {
            return Err(anyhow!("invoker.timeout_secs must be positive"));
        }
        if self.invoker.backoff_base_ms > self.invoker.backoff_max_ms {
            return Err(anyhow!("invoker.backoff_base_ms must not exceed invoker.backoff_max_ms"));
        }

        let ceiling = self.scoring.comp_price_ceiling;
        if !ceiling.is_finite() || ceiling <= 0.0 {
            return Err(anyhow!("scoring.comp_price_ceiling must be positive"));
        }
        validate_update(&self.scoring.weights, &BTreeMap::new()).context("Invalid scoring.weights")?;
        if let Some(unknown) = self.scoring.weights.keys().find(|k| !scoring::features::is_known(k)) {
            return Err(anyhow!("scoring.weights has unknown feature '{}'", unknown));
        }

        let trainer = &self.trainer;
        if trainer.min_samples == 0 {
            return Err(anyhow!("trainer.min_samples must be at least 1"));
        }
        if !trainer.learning_rate.is_finite() || trainer.learning_rate <= 0.0 {
            return Err(anyhow!("trainer.learning_rate must be positive"));
        }
        if !trainer.bias_scale.is_finite() || trainer.bias_scale < 0.0 {
            return Err(anyhow!("trainer.bias_scale must be non-negative"));
        }
        if trainer.interval_secs == 0 {
            return Err(anyhow!("trainer.interval_secs must be positive"));
        }
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "models" => Ok(self
                .models
                .iter()
                .map(|m| m.id.as_str())
                .collect::<Vec<_>>()
                .join(", ")),

            "routing.task_defaults" => Ok(self
                .routing
                .task_defaults
                .iter()
                .map(|(task, model)| format!("{}={}", task, model))
                .collect::<Vec<_>>()
                .join(", ")),
            "routing.long_input_model" => Ok(self
                .routing
                .long_input_model
                .clone()
                .unwrap_or_else(|| "(none)".to_string())),
            "routing.max_input_chars" => Ok(self.routing.max_input_chars.to_string()),

            "invoker.timeout_secs" => Ok(self.invoker.timeout_secs.to_string()),
            "invoker.connect_timeout_secs" => Ok(self.invoker.connect_timeout_secs.to_string()),
            "invoker.max_retries" => Ok(self.invoker.max_retries.to_string()),
            "invoker.backoff_base_ms" => Ok(self.invoker.backoff_base_ms.to_string()),
            "invoker.backoff_max_ms" => Ok(self.invoker.backoff_max_ms.to_string()),

            "scoring.comp_price_ceiling" => Ok(self.scoring.comp_price_ceiling.to_string()),
            "scoring.weights" => Ok(self
                .scoring
                .weights
                .iter()
                .map(|(feature, weight)| format!("{}={}", feature, weight))
                .collect::<Vec<_>>()
                .join(", ")),

            "trainer.interval_secs" => Ok(self.trainer.interval_secs.to_string()),
            "trainer.trigger_after_records" => Ok(self.trainer.trigger_after_records.to_string()),
            "trainer.min_samples" => Ok(self.trainer.min_samples.to_string()),
            "trainer.learning_rate" => Ok(self.trainer.learning_rate.to_string()),
            "trainer.bias_scale" => Ok(self.trainer.bias_scale.to_string()),

            "storage.database_path" => Ok(self.database_path()?.display().to_string()),

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `dealscout config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    ///
    /// The change is applied only if the resulting configuration validates.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut next = self.clone();
        next.apply(key, value)?;
        next.validate()?;
        *self = next;
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "routing.task_defaults" => {
                let mut defaults = BTreeMap::new();
                for pair in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    let (task, model) = pair
                        .split_once('=')
                        .ok_or_else(|| anyhow!("Expected task=model, got '{}'", pair))?;
                    defaults.insert(task.trim().to_lowercase(), model.trim().to_string());
                }
                self.routing.task_defaults = defaults;
            }
            "routing.long_input_model" => {
                self.routing.long_input_model = match value.trim() {
                    "" | "none" => None,
                    model => Some(model.to_string()),
                };
            }
            "routing.max_input_chars" => {
                self.routing.max_input_chars = value
                    .parse()
                    .with_context(|| format!("Invalid max_input_chars value: {}", value))?;
            }
            "invoker.timeout_secs" => {
                self.invoker.timeout_secs = value
                    .parse()
                    .with_context(|| format!("Invalid timeout_secs value: {}", value))?;
            }
            "invoker.connect_timeout_secs" => {
                self.invoker.connect_timeout_secs = value
                    .parse()
                    .with_context(|| format!("Invalid connect_timeout_secs value: {}", value))?;
            }
            "invoker.max_retries" => {
                self.invoker.max_retries = value
                    .parse()
                    .with_context(|| format!("Invalid max_retries value: {}", value))?;
            }
            "invoker.backoff_base_ms" => {
                self.invoker.backoff_base_ms = value
                    .parse()
                    .with_context(|| format!("Invalid backoff_base_ms value: {}", value))?;
            }
            "invoker.backoff_max_ms" => {
                self.invoker.backoff_max_ms = value
                    .parse()
                    .with_context(|| format!("Invalid backoff_max_ms value: {}", value))?;
            }
            "scoring.comp_price_ceiling" => {
                self.scoring.comp_price_ceiling = value
                    .parse()
                    .with_context(|| format!("Invalid comp_price_ceiling value: {}", value))?;
            }
            "trainer.interval_secs" => {
                self.trainer.interval_secs = value
                    .parse()
                    .with_context(|| format!("Invalid interval_secs value: {}", value))?;
            }
            "trainer.trigger_after_records" => {
                self.trainer.trigger_after_records = value
                    .parse()
                    .with_context(|| format!("Invalid trigger_after_records value: {}", value))?;
            }
            "trainer.min_samples" => {
                self.trainer.min_samples = value
                    .parse()
                    .with_context(|| format!("Invalid min_samples value: {}", value))?;
            }
            "trainer.learning_rate" => {
                self.trainer.learning_rate = value
                    .parse()
                    .with_context(|| format!("Invalid learning_rate value: {}", value))?;
            }
            "trainer.bias_scale" => {
                self.trainer.bias_scale = value
                    .parse()
                    .with_context(|| format!("Invalid bias_scale value: {}", value))?;
            }
            "storage.database_path" => {
                self.storage.database_path = match value.trim() {
                    "" => None,
                    path => Some(PathBuf::from(path)),
                };
            }
            "models" | "scoring.weights" => {
                return Err(anyhow!(
                    "{} cannot be set from the command line; edit {} instead",
                    key,
                    Self::config_path()?.display()
                ));
            }
            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `dealscout config list` to see available keys.",
                    key
                ));
            }
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let keys = [
            "models",
            "routing.task_defaults",
            "routing.long_input_model",
            "routing.max_input_chars",
            "invoker.timeout_secs",
            "invoker.connect_timeout_secs",
            "invoker.max_retries",
            "invoker.backoff_base_ms",
            "invoker.backoff_max_ms",
            "scoring.comp_price_ceiling",
            "scoring.weights",
            "trainer.interval_secs",
            "trainer.trigger_after_records",
            "trainer.min_samples",
            "trainer.learning_rate",
            "trainer.bias_scale",
            "storage.database_path",
        ];

        keys.into_iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }
}

//! Types describing model backends and the tasks they serve

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Category of work routed to a model (e.g. summarize, classify, extract, generate)
///
/// Task types double as capability tags: a model serves a task type when it
/// advertises a capability with the same normalized name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskType(String);

impl TaskType {
    /// Create a task type, trimming and lower-casing the name
    pub fn new(name: impl AsRef<str>) -> Result<Self> {
        let normalized = name.as_ref().trim().to_lowercase();
        if normalized.is_empty() {
            return Err(Error::InvalidTaskType("task type must not be empty".to_string()));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for TaskType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<TaskType> for String {
    fn from(value: TaskType) -> Self {
        value.0
    }
}

/// Where a backend runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Local,
    Cloud,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Cloud => write!(f, "cloud"),
        }
    }
}

/// How a backend is reached
///
/// Adding a backend family means adding a variant here and one arm in the
/// HTTP backend; call sites never branch on the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provider {
    /// Local Ollama daemon (`/api/generate`)
    Ollama {
        base_url: String,
        /// Model name as known to Ollama (e.g. "mistral:7b")
        model: String,
    },
    /// Hosted OpenAI-compatible chat completions endpoint
    OpenAiCompatible {
        base_url: String,
        /// Model name as known to the provider (e.g. "gpt-4o")
        model: String,
        /// Environment variable holding the bearer token
        api_key_env: String,
    },
}

impl Provider {
    /// Local or cloud, derived from the variant
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Ollama { .. } => ProviderKind::Local,
            Self::OpenAiCompatible { .. } => ProviderKind::Cloud,
        }
    }

    pub fn base_url(&self) -> &str {
        match self {
            Self::Ollama { base_url, .. } | Self::OpenAiCompatible { base_url, .. } => base_url,
        }
    }
}

/// A model backend in the catalog
///
/// Descriptors are immutable once loaded; the registry replaces the whole
/// catalog when anything changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Catalog identifier (e.g. "gpt-4o", "mistral-7b")
    pub id: String,
    pub provider: Provider,
    /// Capability tags, normalized to lower case on load
    pub capabilities: Vec<String>,
    /// Configured priority, lower is preferred
    #[serde(default)]
    pub priority: u32,
    /// Relative cost, lower is cheaper
    #[serde(default)]
    pub cost_weight: f64,
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool {
    true
}

impl ModelDescriptor {
    /// Create a descriptor with no capabilities, priority 0 and cost 0
    pub fn new(id: impl Into<String>, provider: Provider) -> Self {
        Self {
            id: id.into(),
            provider,
            capabilities: Vec::new(),
            priority: 0,
            cost_weight: 0.0,
            available: true,
        }
    }

    /// Set capability tags
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.capabilities = capabilities
            .into_iter()
            .map(|c| c.as_ref().trim().to_lowercase())
            .collect();
        self
    }

    /// Set priority
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set cost weight
    pub fn with_cost_weight(mut self, cost_weight: f64) -> Self {
        self.cost_weight = cost_weight;
        self
    }

    /// Set availability
    pub fn with_available(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    pub fn kind(&self) -> ProviderKind {
        self.provider.kind()
    }

    /// Whether this model advertises the capability for a task type
    pub fn supports(&self, task_type: &TaskType) -> bool {
        self.capabilities.iter().any(|c| c == task_type.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ollama(model: &str) -> Provider {
        Provider::Ollama {
            base_url: "http://localhost:11434".to_string(),
            model: model.to_string(),
        }
    }

    #[test]
    fn test_task_type_normalizes() {
        let task: TaskType = "  Classify ".parse().unwrap();
        assert_eq!(task.as_str(), "classify");
        assert!(TaskType::new("   ").is_err());
    }

    #[test]
    fn test_provider_kind() {
        assert_eq!(ollama("phi3").kind(), ProviderKind::Local);
        let cloud = Provider::OpenAiCompatible {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
        };
        assert_eq!(cloud.kind(), ProviderKind::Cloud);
    }

    #[test]
    fn test_descriptor_supports() {
        let model = ModelDescriptor::new("mistral-7b", ollama("mistral:7b"))
            .with_capabilities(["Summarize", "classify"]);
        assert!(model.supports(&TaskType::new("summarize").unwrap()));
        assert!(model.supports(&TaskType::new("CLASSIFY").unwrap()));
        assert!(!model.supports(&TaskType::new("generate").unwrap()));
    }

    #[test]
    fn test_descriptor_deserializes_tagged_provider() {
        let toml_src = r#"
            id = "phi3"
            capabilities = ["sms"]
            priority = 2
            cost_weight = 0.1

            [provider]
            kind = "ollama"
            base_url = "http://localhost:11434"
            model = "phi3"
        "#;
        let model: ModelDescriptor = toml::from_str(toml_src).unwrap();
        assert_eq!(model.kind(), ProviderKind::Local);
        assert!(model.available);
        assert_eq!(model.priority, 2);
    }
}

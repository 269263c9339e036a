//! Model selection policy

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::types::{RoutingContext, RoutingDecision, RoutingReason};
use crate::config::RoutingConfig;
use crate::error::{Error, Result};
use crate::registry::{ModelDescriptor, ModelRegistry, TaskType};
use crate::weights::{WeightSet, WeightStore};

/// Chooses a model for a task
///
/// Selection reads the registry snapshot and the active weight set's routing
/// bias; the same registry state and bias always yield the same model.
pub struct RoutingPolicy {
    registry: Arc<ModelRegistry>,
    weights: Arc<WeightStore>,
    task_defaults: HashMap<String, String>,
    long_input_model: Option<String>,
    max_input_chars: usize,
}

struct Plan {
    /// Candidates in the order they should be tried
    order: Vec<ModelDescriptor>,
    preferred: Option<(String, RoutingReason)>,
}

impl RoutingPolicy {
    pub fn new(
        registry: Arc<ModelRegistry>,
        weights: Arc<WeightStore>,
        config: &RoutingConfig,
    ) -> Self {
        let task_defaults = config
            .task_defaults
            .iter()
            .map(|(task, model)| (task.trim().to_lowercase(), model.clone()))
            .collect();
        Self {
            registry,
            weights,
            task_defaults,
            long_input_model: config.long_input_model.clone(),
            max_input_chars: config.max_input_chars,
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn weights(&self) -> &Arc<WeightStore> {
        &self.weights
    }

    /// Select a model for a task
    pub fn select(&self, task_type: &TaskType, context: &RoutingContext) -> Result<RoutingDecision> {
        let plan = self.plan(task_type, context)?;

        let mut fallback_chain: Vec<String> = context.exclude.clone();
        for candidate in &plan.order {
            if !candidate.available {
                fallback_chain.push(candidate.id.clone());
                continue;
            }

            let reason = match &plan.preferred {
                Some((id, reason)) if *id == candidate.id => *reason,
                _ if !fallback_chain.is_empty() => RoutingReason::Fallback,
                _ => RoutingReason::Priority,
            };
            debug!(
                task_type = %task_type,
                model = %candidate.id,
                reason = %reason,
                skipped = fallback_chain.len(),
                "Selected model"
            );
            return Ok(RoutingDecision::new(
                task_type.clone(),
                candidate.id.clone(),
                fallback_chain,
                reason,
            ));
        }

        Err(Error::NoAvailableModel {
            task_type: task_type.to_string(),
            attempted: context.exclude.clone(),
        })
    }

    /// Available candidates in the order `select` would try them
    pub fn candidates(
        &self,
        task_type: &TaskType,
        context: &RoutingContext,
    ) -> Result<Vec<ModelDescriptor>> {
        let plan = self.plan(task_type, context)?;
        Ok(plan.order.into_iter().filter(|m| m.available).collect())
    }

    fn plan(&self, task_type: &TaskType, context: &RoutingContext) -> Result<Plan> {
        let capable = self.registry.list(task_type);
        if capable.is_empty() {
            return Err(Error::NoAvailableModel {
                task_type: task_type.to_string(),
                attempted: Vec::new(),
            });
        }

        let bias = self.weights.active();
        let mut order: Vec<ModelDescriptor> = capable
            .into_iter()
            .filter(|m| !context.is_excluded(&m.id))
            .collect();
        order.sort_by(|a, b| compare(a, b, &bias));

        let preferred = self.preferred(task_type, context, &order);
        if let Some((id, _)) = &preferred {
            if let Some(pos) = order.iter().position(|m| &m.id == id) {
                let model = order.remove(pos);
                order.insert(0, model);
            }
        }

        Ok(Plan { order, preferred })
    }

    fn preferred(
        &self,
        task_type: &TaskType,
        context: &RoutingContext,
        order: &[ModelDescriptor],
    ) -> Option<(String, RoutingReason)> {
        let eligible = |id: &str| order.iter().any(|m| m.id == id);

        if context.input_chars > self.max_input_chars {
            if let Some(id) = &self.long_input_model {
                if eligible(id) {
                    return Some((id.clone(), RoutingReason::LongInput));
                }
            }
        }

        self.task_defaults
            .get(task_type.as_str())
            .filter(|id| eligible(id))
            .map(|id| (id.clone(), RoutingReason::TaskDefault))
    }
}

/// Effective priority (configured priority minus learned bias), then cost, then id
fn compare(a: &ModelDescriptor, b: &ModelDescriptor, weights: &WeightSet) -> Ordering {
    let effective = |m: &ModelDescriptor| f64::from(m.priority) - weights.bias(&m.id);
    effective(a)
        .total_cmp(&effective(b))
        .then_with(|| a.cost_weight.total_cmp(&b.cost_weight))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::registry::Provider;

    fn cloud(id: &str, priority: u32, capabilities: &[&str]) -> ModelDescriptor {
        ModelDescriptor::new(
            id,
            Provider::OpenAiCompatible {
                base_url: "https://api.openai.com/v1".to_string(),
                model: id.to_string(),
                api_key_env: "OPENAI_API_KEY".to_string(),
            },
        )
        .with_capabilities(capabilities)
        .with_priority(priority)
        .with_cost_weight(1.0)
    }

    fn local(id: &str, priority: u32, capabilities: &[&str]) -> ModelDescriptor {
        ModelDescriptor::new(
            id,
            Provider::Ollama {
                base_url: "http://localhost:11434".to_string(),
                model: id.to_string(),
            },
        )
        .with_capabilities(capabilities)
        .with_priority(priority)
    }

    fn policy_with(models: Vec<ModelDescriptor>, config: RoutingConfig) -> RoutingPolicy {
        let registry = Arc::new(ModelRegistry::new(models).unwrap());
        let weights = Arc::new(WeightStore::new(WeightSet::baseline([("comps", 1.0)])));
        RoutingPolicy::new(registry, weights, &config)
    }

    fn plain_config() -> RoutingConfig {
        RoutingConfig {
            task_defaults: BTreeMap::new(),
            long_input_model: None,
            max_input_chars: 4000,
        }
    }

    fn task(name: &str) -> TaskType {
        TaskType::new(name).unwrap()
    }

    #[test]
    fn test_unavailable_preferred_falls_back_to_next_priority() {
        let policy = policy_with(
            vec![
                cloud("gpt-4o", 0, &["classify"]),
                local("mistral-7b", 1, &["classify"]),
            ],
            plain_config(),
        );
        policy.registry().set_available("gpt-4o", false).unwrap();

        let decision = policy.select(&task("classify"), &RoutingContext::new()).unwrap();
        assert_eq!(decision.model_id(), "mistral-7b");
        assert_eq!(decision.fallback_chain(), ["gpt-4o".to_string()]);
        assert_eq!(decision.reason(), RoutingReason::Fallback);
    }

    #[test]
    fn test_selected_model_always_supports_task() {
        let policy = policy_with(
            vec![
                cloud("gpt-4o", 0, &["summarize", "classify", "generate"]),
                local("mistral-7b", 1, &["classify", "comps"]),
                local("phi3", 2, &["sms"]),
            ],
            plain_config(),
        );
        for name in ["summarize", "classify", "generate", "comps", "sms"] {
            let decision = policy.select(&task(name), &RoutingContext::new()).unwrap();
            let model = policy.registry().resolve(decision.model_id()).unwrap();
            assert!(model.supports(&task(name)), "{} routed to {}", name, model.id);
        }
    }

    #[test]
    fn test_no_capable_model() {
        let policy = policy_with(vec![local("phi3", 0, &["sms"])], plain_config());
        let err = policy.select(&task("extract"), &RoutingContext::new()).unwrap_err();
        assert!(matches!(err, Error::NoAvailableModel { .. }));
    }

    #[test]
    fn test_all_unavailable() {
        let policy = policy_with(
            vec![local("phi3", 0, &["sms"]).with_available(false)],
            plain_config(),
        );
        assert!(matches!(
            policy.select(&task("sms"), &RoutingContext::new()),
            Err(Error::NoAvailableModel { .. })
        ));
    }

    #[test]
    fn test_task_default_wins_over_priority() {
        let mut config = plain_config();
        config.task_defaults.insert("SMS".to_string(), "phi3".to_string());
        let policy = policy_with(
            vec![cloud("gpt-4o", 0, &["sms"]), local("phi3", 2, &["sms"])],
            config,
        );

        let decision = policy.select(&task("sms"), &RoutingContext::new()).unwrap();
        assert_eq!(decision.model_id(), "phi3");
        assert_eq!(decision.reason(), RoutingReason::TaskDefault);
    }

    #[test]
    fn test_long_input_prefers_long_input_model() {
        let mut config = plain_config();
        config.task_defaults.insert("comps".to_string(), "mistral-7b".to_string());
        config.long_input_model = Some("gpt-4o".to_string());
        config.max_input_chars = 10;
        let policy = policy_with(
            vec![
                cloud("gpt-4o", 1, &["comps"]),
                local("mistral-7b", 0, &["comps"]),
            ],
            config,
        );

        let short = policy
            .select(&task("comps"), &RoutingContext::new().with_input("short"))
            .unwrap();
        assert_eq!(short.model_id(), "mistral-7b");

        let long = policy
            .select(&task("comps"), &RoutingContext::new().with_input_chars(11))
            .unwrap();
        assert_eq!(long.model_id(), "gpt-4o");
        assert_eq!(long.reason(), RoutingReason::LongInput);
    }

    #[test]
    fn test_excluded_models_are_skipped_and_reported() {
        let policy = policy_with(
            vec![
                cloud("gpt-4o", 0, &["classify"]),
                local("mistral-7b", 1, &["classify"]),
                local("phi3", 2, &["classify"]),
            ],
            plain_config(),
        );
        let ctx = RoutingContext::new().excluding("gpt-4o");

        let decision = policy.select(&task("classify"), &ctx).unwrap();
        assert_eq!(decision.model_id(), "mistral-7b");
        assert_eq!(decision.fallback_chain(), ["gpt-4o".to_string()]);

        let exhausted = RoutingContext::new()
            .excluding("gpt-4o")
            .excluding("mistral-7b")
            .excluding("phi3");
        match policy.select(&task("classify"), &exhausted) {
            Err(Error::NoAvailableModel { attempted, .. }) => assert_eq!(attempted.len(), 3),
            other => panic!("expected NoAvailableModel, got {:?}", other),
        }
    }

    #[test]
    fn test_routing_bias_reorders_candidates() {
        let policy = policy_with(
            vec![
                cloud("gpt-4o", 0, &["classify"]),
                local("mistral-7b", 1, &["classify"]),
            ],
            plain_config(),
        );
        let bias: BTreeMap<String, f64> = [("mistral-7b".to_string(), 1.5)].into_iter().collect();
        policy
            .weights()
            .publish([("comps".to_string(), 1.0)].into_iter().collect(), bias)
            .unwrap();

        let candidates = policy.candidates(&task("classify"), &RoutingContext::new()).unwrap();
        let ids: Vec<&str> = candidates.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["mistral-7b", "gpt-4o"]);
    }

    #[test]
    fn test_selection_is_deterministic() {
        let policy = policy_with(
            vec![
                local("b-model", 1, &["extract"]).with_cost_weight(0.5),
                local("a-model", 1, &["extract"]).with_cost_weight(0.5),
                local("c-model", 1, &["extract"]).with_cost_weight(0.1),
            ],
            plain_config(),
        );
        let ids: Vec<String> = policy
            .candidates(&task("extract"), &RoutingContext::new())
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["c-model", "a-model", "b-model"]);

        for _ in 0..10 {
            let decision = policy.select(&task("extract"), &RoutingContext::new()).unwrap();
            assert_eq!(decision.model_id(), "c-model");
            assert_eq!(decision.reason(), RoutingReason::Priority);
        }
    }
}

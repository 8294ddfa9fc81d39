use crate::config::PlansConfig;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanLimits {
    pub plan: String,
    pub display_name: String,
    pub token_limit: u64,
    pub cost_limit: f64,
    pub message_limit: u64,
}

impl PlanLimits {
    fn new(plan: &str, display_name: &str, token_limit: u64, cost_limit: f64, message_limit: u64) -> Self {
        Self {
            plan: plan.to_string(),
            display_name: display_name.to_string(),
            token_limit,
            cost_limit,
            message_limit,
        }
    }
}

fn builtin_plans() -> Vec<PlanLimits> {
    vec![
        PlanLimits::new("pro", "Pro", 19_000, 18.0, 250),
        PlanLimits::new("max5", "Max (5x)", 88_000, 35.0, 1_000),
        PlanLimits::new("max20", "Max (20x)", 220_000, 140.0, 2_000),
        PlanLimits::new("custom", "Custom", 44_000, 50.0, 250),
    ]
}

/// Name-to-limits lookup. Unknown names fall back to the default plan.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: HashMap<String, PlanLimits>,
    default_plan: String,
}

impl PlanCatalog {
    pub fn from_config(config: &PlansConfig) -> Self {
        let mut plans: HashMap<String, PlanLimits> = builtin_plans()
            .into_iter()
            .map(|plan| (plan.plan.clone(), plan))
            .collect();

        for (name, overrides) in &config.custom {
            let key = normalize(name);
            let base = plans.get(&key).cloned().unwrap_or_else(|| {
                PlanLimits::new(&key, name, 0, 0.0, 0)
            });
            let merged = PlanLimits {
                plan: key.clone(),
                display_name: overrides.display_name.clone().unwrap_or(base.display_name),
                token_limit: overrides.token_limit.unwrap_or(base.token_limit),
                cost_limit: overrides.cost_limit.unwrap_or(base.cost_limit),
                message_limit: overrides.message_limit.unwrap_or(base.message_limit),
            };
            plans.insert(key, merged);
        }

        let mut default_plan = normalize(&config.default_plan);
        if !plans.contains_key(&default_plan) {
            tracing::warn!(plan = %config.default_plan, "configured default plan is unknown, using custom");
            default_plan = "custom".to_string();
        }

        Self {
            plans,
            default_plan,
        }
    }

    pub fn default_plan_name(&self) -> &str {
        &self.default_plan
    }

    pub fn resolve(&self, name: &str) -> Option<&PlanLimits> {
        self.plans.get(&normalize(name))
    }

    pub fn resolve_or_default(&self, name: &str) -> PlanLimits {
        match self.resolve(name) {
            Some(plan) => plan.clone(),
            None => {
                tracing::debug!(plan = name, fallback = %self.default_plan, "unknown plan requested");
                self.default_limits()
            }
        }
    }

    fn default_limits(&self) -> PlanLimits {
        self.plans
            .get(&self.default_plan)
            .cloned()
            .unwrap_or_else(|| PlanLimits::new("custom", "Custom", 44_000, 50.0, 250))
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::from_config(&PlansConfig::default())
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

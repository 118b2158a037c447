use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Per-model token pricing, USD per 1k tokens.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelPricing {
    #[serde(default)]
    pub input_per_1k: f64,
    #[serde(default)]
    pub output_per_1k: f64,
}

impl ModelPricing {
    pub fn estimate_cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_per_1k
            + (output_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

/// Pricing table keyed by model id. Unknown models cost 0.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(default, flatten)]
    pub models: HashMap<String, ModelPricing>,
}

impl PricingConfig {
    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        self.models.get(model)
    }

    pub fn estimate_cost(&self, model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
        self.get(model)
            .map(|p| p.estimate_cost(input_tokens, output_tokens))
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_cost() {
        let pricing = ModelPricing { input_per_1k: 3.0, output_per_1k: 15.0 };
        let cost = pricing.estimate_cost(2000, 1000);
        assert!((cost - (6.0 + 15.0)).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_is_free() {
        let cfg = PricingConfig::default();
        assert_eq!(cfg.estimate_cost("nope", 1000, 1000), 0.0);
    }

    #[test]
    fn flatten_toml_table() {
        let cfg: PricingConfig = toml::from_str(
            r#"
            [planner-large]
            input_per_1k = 3.0
            output_per_1k = 15.0
            "#,
        )
        .unwrap();
        assert!(cfg.get("planner-large").is_some());
        assert!(cfg.estimate_cost("planner-large", 1000, 0) > 0.0);
    }
}

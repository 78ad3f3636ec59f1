//! Property-based tests for configuration, store and scoring invariants.

use llm_gateway::core::config::{HybridWeights, KeyConfig};
use llm_gateway::services::selector::{hybrid_score, KeyUsage};
use llm_gateway::store::{MemoryStore, UsageMetric, UsageStore};
use llm_gateway::GatewayConfig;
use proptest::prelude::*;
use std::collections::HashMap;

fn provider_id() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,8}"
}

fn config_yaml(providers: &[String], aliases: &HashMap<String, (usize, String)>, req_ratio: f64) -> String {
    let mut yaml = String::from("version: \"1\"\nproviders:\n");
    for id in providers {
        yaml.push_str(&format!(
            "  - id: \"{id}\"\n    name: openai\n    keys:\n      - id: {id}-key\n        secret: sk-{id}\n"
        ));
    }
    yaml.push_str(if aliases.is_empty() { "model_aliases: {}\n" } else { "model_aliases:\n" });
    for (alias, (provider, model)) in aliases {
        let provider = &providers[provider % providers.len()];
        yaml.push_str(&format!("  \"{alias}\": \"{provider}:{model}\"\n"));
    }
    yaml.push_str(&format!(
        "policy:\n  strategy: hybrid\n  hybrid_weights:\n    req_ratio: {req_ratio}\n"
    ));
    yaml
}

proptest! {
    #[test]
    fn config_survives_yaml_round_trip(
        providers in prop::collection::hash_set(provider_id(), 1..4),
        aliases in prop::collection::hash_map("[a-z][a-z0-9.-]{0,12}", (0usize..8, "[a-z0-9][a-z0-9.-]{0,12}"), 0..6),
        req_ratio in 0.0f64..10.0,
    ) {
        let providers: Vec<String> = providers.into_iter().collect();
        let config = GatewayConfig::from_yaml(&config_yaml(&providers, &aliases, req_ratio)).unwrap();
        prop_assert!(config.validate().is_ok());

        let reparsed = GatewayConfig::from_yaml(&config.to_yaml().unwrap()).unwrap();
        prop_assert_eq!(reparsed, config);
    }

    #[test]
    fn window_sum_sees_every_increment(deltas in prop::collection::vec(0.0f64..1000.0, 1..10)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let store = MemoryStore::new();
            for delta in &deltas {
                store.increment_usage("p", "k", UsageMetric::Tokens, *delta).await.unwrap();
            }
            let expected: f64 = deltas.iter().sum();
            let total = store.get_usage("p", "k", UsageMetric::Tokens).await.unwrap();
            let windowed = store.get_usage_in_window("p", "k", UsageMetric::Tokens, 3600).await.unwrap();
            assert!((total - expected).abs() < 1e-6);
            assert!((windowed - expected).abs() < 1e-6);
        });
    }

    #[test]
    fn fewer_requests_never_scores_higher(a in 0.0f64..1e6, b in 0.0f64..1e6, weight in 0.01f64..10.0) {
        let weights = HybridWeights { req_ratio: weight, ..HybridWeights::default() };
        let key = KeyConfig { id: "k".into(), ..Default::default() };
        let score = |req| hybrid_score(&weights, &KeyUsage { req, ..KeyUsage::default() }, &key);
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(score(low) <= score(high));
    }
}

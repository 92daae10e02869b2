use capture_core::{
    rules::{export_rules, import_rules},
    HeaderPredicate, NetworkRequest, NetworkRule, RuleAction, RuleEngine, RuleOutcome, UrlPattern,
};
use proptest::prelude::*;

fn block(id: String, priority: i32, enabled: bool) -> NetworkRule {
    NetworkRule::new(
        id.clone(),
        format!("rule {}", id),
        RuleAction::Block { reason: id },
    )
    .with_priority(priority)
    .with_enabled(enabled)
}

prop_compose! {
    fn arb_rules()(specs in prop::collection::vec((0i32..4, any::<bool>()), 0..12)) -> Vec<NetworkRule> {
        specs
            .into_iter()
            .enumerate()
            .map(|(i, (priority, enabled))| block(format!("r{}", i), priority, enabled))
            .collect()
    }
}

proptest! {
    /// The winner is the first enabled rule in (priority, input order)
    #[test]
    fn prop_first_enabled_rule_by_priority_wins(rules in arb_rules()) {
        let request = NetworkRequest::new("GET", "https://example.com/", 0);
        let engine = RuleEngine::default();

        let expected = rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.enabled)
            .min_by_key(|(index, rule)| (rule.priority, *index))
            .map(|(_, rule)| rule.id.clone());

        let outcome = engine.apply("tx", &request, &rules);
        match expected {
            Some(id) => prop_assert_eq!(outcome, RuleOutcome::Blocked(id)),
            None => prop_assert_eq!(outcome, RuleOutcome::Unmodified),
        }
        prop_assert!(engine.history().len() <= 1);
    }

    /// Disabled rules are never applied
    #[test]
    fn prop_disabled_rules_never_apply(count in 1usize..8) {
        let rules: Vec<NetworkRule> = (0..count)
            .map(|i| block(format!("r{}", i), 0, false))
            .collect();
        let engine = RuleEngine::default();
        let request = NetworkRequest::new("POST", "https://example.com/x", 0);

        prop_assert_eq!(engine.apply("tx", &request, &rules), RuleOutcome::Unmodified);
        prop_assert!(engine.history().is_empty());
    }
}

#[test]
fn test_later_matches_are_not_applied() {
    let rules = vec![
        NetworkRule::new(
            "headers",
            "add header",
            RuleAction::SetHeaders {
                set: vec![("X-Env", "staging")].into_iter().collect(),
                remove: vec![],
            },
        )
        .with_url(UrlPattern::Prefix("https://api.".into())),
        NetworkRule::new(
            "body",
            "replace body",
            RuleAction::ReplaceBody {
                body: "{}".into(),
                content_type: None,
            },
        )
        .with_priority(1),
    ];

    let request = NetworkRequest::new("PUT", "https://api.example.com/items/1", 0).with_body("[1]");
    let engine = RuleEngine::default();

    match engine.apply("tx-1", &request, &rules) {
        RuleOutcome::ModifiedRequest(modified) => {
            assert_eq!(modified.headers.get("x-env"), Some("staging"));
            assert_eq!(modified.body.as_deref(), Some("[1]"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    let history = engine.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].rule_id, "headers");
    assert_eq!(history[0].transaction_id, "tx-1");
}

#[test]
fn test_export_import_round_trip_preserves_rules() {
    let rules = vec![
        NetworkRule::new(
            "mock-users",
            "Mock users",
            RuleAction::MockResponse {
                status_code: 200,
                status_message: Some("OK".into()),
                headers: vec![("X-Mock", "1")].into_iter().collect(),
                body: Some("[]".into()),
                content_type: Some("application/json".into()),
            },
        )
        .with_url(UrlPattern::Wildcard("*/users*".into()))
        .with_method("GET")
        .with_header(HeaderPredicate::equals("Accept", "application/json"))
        .with_priority(-1),
        NetworkRule::new("slow", "Slow down", RuleAction::Delay { millis: 250 })
            .with_body_pattern("^\\{")
            .with_enabled(false),
    ];

    let json = export_rules(&rules).unwrap();
    assert!(json.contains("\"matchUrl\""));
    assert!(json.contains("\"lastModified\""));

    let imported = import_rules(&json).unwrap();
    assert_eq!(imported, rules);
}

#[test]
fn test_import_accepts_minimal_rule() {
    let json = r#"[{"id":"b","name":"block admin","matchUrl":{"type":"regex","value":"/admin"},"action":{"type":"block","reason":"no"}}]"#;
    let rules = import_rules(json).unwrap();
    assert_eq!(rules.len(), 1);
    assert!(rules[0].enabled);
    assert_eq!(rules[0].priority, 0);
    assert!(rules[0].issues().is_empty());
}

use capture_core::{HttpMethod, NetworkRule, RuleAction, RuleSet, UrlPattern};
use inspector::{ImportMode, RuleService, StoreError, TransactionStore};

async fn service() -> (RuleService, RuleSet) {
    let store = TransactionStore::in_memory().await.expect("Failed to create DB");
    let rules = RuleSet::default();
    let service = RuleService::load(store, rules.clone()).await.unwrap();
    (service, rules)
}

fn block(id: &str, priority: i32) -> NetworkRule {
    NetworkRule::new(
        id,
        format!("block {}", id),
        RuleAction::Block {
            reason: "test".into(),
        },
    )
    .with_url(UrlPattern::Prefix(format!("https://{}.example.com", id)))
    .with_priority(priority)
}

fn rule_ids(rules: &[NetworkRule]) -> Vec<&str> {
    rules.iter().map(|rule| rule.id.as_str()).collect()
}

#[tokio::test]
async fn test_save_keeps_insertion_order_and_publishes() {
    let (service, live) = service().await;

    service.save(block("b", 5)).await.unwrap();
    service.save(block("a", 1)).await.unwrap();
    // Updating keeps the original position
    service.save(block("b", 2)).await.unwrap();

    let stored = service.list().await.unwrap();
    assert_eq!(rule_ids(&stored), vec!["b", "a"]);
    assert_eq!(stored[0].priority, 2);
    assert!(stored[0].last_modified > 0);

    let snapshot = live.snapshot();
    assert_eq!(rule_ids(&snapshot), vec!["b", "a"]);
}

#[tokio::test]
async fn test_blank_id_is_generated() {
    let (service, _) = service().await;

    let saved = service
        .save(NetworkRule::new("", "anonymous", RuleAction::Delay { millis: 5 }).with_method(HttpMethod::Get))
        .await
        .unwrap();
    assert!(!saved.id.is_empty());
    assert_eq!(service.get(&saved.id).await.unwrap().name, "anonymous");
}

#[tokio::test]
async fn test_delete_and_missing_rules() {
    let (service, live) = service().await;
    service.save(block("a", 0)).await.unwrap();

    service.delete("a").await.unwrap();
    assert!(live.is_empty());

    assert!(matches!(service.delete("a").await, Err(StoreError::RuleNotFound(_))));
    assert!(matches!(service.get("a").await, Err(StoreError::RuleNotFound(_))));
    assert!(matches!(
        service.set_enabled("a", true).await,
        Err(StoreError::RuleNotFound(_))
    ));
}

#[tokio::test]
async fn test_set_enabled_refreshes_live_rules() {
    let (service, live) = service().await;
    service.save(block("a", 0)).await.unwrap();
    let mut changes = live.subscribe();
    changes.borrow_and_update();

    let updated = service.set_enabled("a", false).await.unwrap();
    assert!(!updated.enabled);

    assert!(changes.has_changed().unwrap());
    assert!(!live.snapshot()[0].enabled);
}

#[tokio::test]
async fn test_export_then_replace_import_restores_rules() {
    let (source, _) = service().await;
    source.save(block("a", 3)).await.unwrap();
    source.save(block("b", 1)).await.unwrap();
    let exported = source.export_json().await.unwrap();

    let (target, live) = service().await;
    target.save(block("stale", 0)).await.unwrap();

    let summary = target.import_json(&exported, ImportMode::Replace).await.unwrap();
    assert_eq!(summary.imported, 2);
    assert_eq!(summary.added, 2);
    assert_eq!(summary.updated, 0);
    assert_eq!(summary.removed, 1);

    let restored = target.list().await.unwrap();
    assert_eq!(restored, source.list().await.unwrap());
    assert_eq!(rule_ids(&live.snapshot()), vec!["a", "b"]);
}

#[tokio::test]
async fn test_merge_import_keeps_unlisted_rules() {
    let (service, _) = service().await;
    service.save(block("a", 0)).await.unwrap();
    service.save(block("keep", 0)).await.unwrap();

    let incoming = serde_json::to_string(&vec![block("a", 9), block("new", 1)]).unwrap();
    let summary = service.import_json(&incoming, ImportMode::Merge).await.unwrap();
    assert_eq!(summary.added, 1);
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.removed, 0);

    let stored = service.list().await.unwrap();
    assert_eq!(rule_ids(&stored), vec!["a", "keep", "new"]);
    assert_eq!(stored[0].priority, 9);
}

#[tokio::test]
async fn test_invalid_import_changes_nothing() {
    let (service, _) = service().await;
    service.save(block("a", 0)).await.unwrap();

    assert!(service.import_json("not json", ImportMode::Replace).await.is_err());

    let duplicated = serde_json::to_string(&vec![block("x", 0), block("x", 1)]).unwrap();
    assert!(matches!(
        service.import_json(&duplicated, ImportMode::Replace).await,
        Err(StoreError::Capture(_))
    ));

    assert_eq!(rule_ids(&service.list().await.unwrap()), vec!["a"]);
}

#[tokio::test]
async fn test_rules_survive_reload() {
    let store = TransactionStore::in_memory().await.unwrap();
    let first = RuleService::load(store.clone(), RuleSet::default()).await.unwrap();
    first.save(block("a", 0)).await.unwrap();

    let live = RuleSet::default();
    RuleService::load(store, live.clone()).await.unwrap();
    assert_eq!(rule_ids(&live.snapshot()), vec!["a"]);
}

use proptest::prelude::*;
use std::fs;
use toml::Value;

const MEMBERS: [&str; 3] = ["capture-core", "inspector", "workspace-tests"];

fn manifest(path: &str) -> Value {
    let content = fs::read_to_string(path).unwrap_or_else(|e| panic!("Failed to read {}: {}", path, e));
    content
        .parse::<Value>()
        .unwrap_or_else(|e| panic!("Failed to parse {}: {}", path, e))
}

fn workspace_dependencies() -> Vec<String> {
    manifest("../Cargo.toml")["workspace"]["dependencies"]
        .as_table()
        .expect("workspace dependency table")
        .keys()
        .cloned()
        .collect()
}

/// Every dependency a member shares with the workspace table must inherit from it
fn non_inherited(member: &Value, shared: &[String]) -> Vec<String> {
    let mut offenders = Vec::new();
    for section in ["dependencies", "dev-dependencies"] {
        let Some(table) = member.get(section).and_then(Value::as_table) else {
            continue;
        };
        for (name, spec) in table {
            let inherits = spec
                .get("workspace")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if shared.contains(name) && !inherits {
                offenders.push(format!("{}.{}", section, name));
            }
        }
    }
    offenders
}

proptest! {
    #[test]
    fn test_members_inherit_workspace_dependencies(member in prop::sample::select(MEMBERS.to_vec())) {
        let shared = workspace_dependencies();
        let manifest = manifest(&format!("../{}/Cargo.toml", member));

        let offenders = non_inherited(&manifest, &shared);
        prop_assert!(
            offenders.is_empty(),
            "Crate '{}' pins shared dependencies instead of inheriting: {:?}",
            member,
            offenders
        );

        let package = &manifest["package"];
        prop_assert_eq!(package["version"]["workspace"].as_bool(), Some(true));
        prop_assert_eq!(package["edition"]["workspace"].as_bool(), Some(true));
    }
}

#[test]
fn test_workspace_lists_every_member() {
    let root = manifest("../Cargo.toml");
    let members: Vec<&str> = root["workspace"]["members"]
        .as_array()
        .expect("members array")
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert_eq!(members, MEMBERS.to_vec());
}

#[test]
fn test_non_inherited_detects_pinned_versions() {
    let shared = vec!["tokio".to_string(), "serde".to_string()];
    let member: Value = r#"
[dependencies]
tokio = "1.0"
serde = { workspace = true }
clap = "4.5"
"#
    .parse()
    .unwrap();

    assert_eq!(non_inherited(&member, &shared), vec!["dependencies.tokio"]);
}

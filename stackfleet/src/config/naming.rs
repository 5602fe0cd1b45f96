//! Stack names, tags and role ARNs.

use super::project::ResolvedTest;
use crate::cloud::Tag;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Default stack name prefix.
pub const STACK_NAME_PREFIX: &str = "fleet-";

/// Tag carrying the run id.
pub const TAG_RUN_ID: &str = crate::stage::RUN_ID_TAG;
/// Tag carrying the project name.
pub const TAG_PROJECT_NAME: &str = "stackfleet-project-name";
/// Tag carrying the test name.
pub const TAG_TEST_NAME: &str = "stackfleet-test-name";

const RESERVED_TAGS: [&str; 3] = [TAG_RUN_ID, TAG_PROJECT_NAME, TAG_TEST_NAME];

/// Computes the stack name for a test.
#[must_use]
pub fn stack_name(project: &str, test: &ResolvedTest, shorten: bool, run_id: Uuid) -> String {
    let hex = run_id.simple().to_string();
    let short = &hex[..6];
    let name = &test.name;

    if let Some(explicit) = &test.stack_name {
        return explicit.clone();
    }
    let generated = if let Some(prefix) = &test.stack_name_prefix {
        if shorten {
            format!("{prefix}{name}-{short}")
        } else {
            format!("{prefix}{project}-{name}-{hex}")
        }
    } else if let Some(suffix) = &test.stack_name_suffix {
        format!("{STACK_NAME_PREFIX}{project}-{name}-{suffix}")
    } else if shorten {
        format!("{STACK_NAME_PREFIX}{name}-{short}")
    } else {
        format!("{STACK_NAME_PREFIX}{project}-{name}-{hex}")
    };
    generated.replace('/', "-")
}

/// Tags applied to every root stack of a test.
///
/// Reserved keys in `extra` are dropped so a test cannot spoof run identity.
#[must_use]
pub fn stack_tags(run_id: Uuid, project: &str, test_name: &str, extra: &BTreeMap<String, String>) -> Vec<Tag> {
    let mut tags = vec![
        Tag::new(TAG_RUN_ID, run_id.simple().to_string()),
        Tag::new(TAG_PROJECT_NAME, project),
        Tag::new(TAG_TEST_NAME, test_name),
    ];
    tags.extend(
        extra
            .iter()
            .filter(|(key, _)| !RESERVED_TAGS.contains(&key.as_str()))
            .map(|(key, value)| Tag::new(key.clone(), value.clone())),
    );
    tags
}

/// ARN of the service role for a test, if one is configured.
#[must_use]
pub fn role_arn(partition: &str, account_id: &str, role_name: Option<&str>) -> Option<String> {
    role_name.map(|role| format!("arn:{partition}:iam::{account_id}:role/{role}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::path::PathBuf;

    fn test(name: &str) -> ResolvedTest {
        ResolvedTest {
            name: name.to_string(),
            template: PathBuf::from("t.yaml"),
            regions: vec!["us-east-1".to_string()],
            parameters: Map::new(),
            tags: BTreeMap::new(),
            auth: BTreeMap::new(),
            s3_bucket: None,
            s3_regional_buckets: false,
            az_blacklist: Vec::new(),
            role_name: None,
            stack_name: None,
            stack_name_prefix: None,
            stack_name_suffix: None,
        }
    }

    fn run_id() -> Uuid {
        Uuid::parse_str("0123456789abcdef0123456789abcdef").unwrap()
    }

    #[test]
    fn test_default_and_short_names() {
        assert_eq!(
            stack_name("proj", &test("default"), false, run_id()),
            "fleet-proj-default-0123456789abcdef0123456789abcdef"
        );
        assert_eq!(stack_name("proj", &test("default"), true, run_id()), "fleet-default-012345");
    }

    #[test]
    fn test_explicit_prefix_and_suffix() {
        let mut t = test("a");
        t.stack_name = Some("exact".to_string());
        assert_eq!(stack_name("proj", &t, false, run_id()), "exact");

        let mut t = test("a");
        t.stack_name_prefix = Some("team-".to_string());
        assert_eq!(stack_name("proj", &t, true, run_id()), "team-a-012345");
        assert_eq!(
            stack_name("proj", &t, false, run_id()),
            "team-proj-a-0123456789abcdef0123456789abcdef"
        );

        let mut t = test("a");
        t.stack_name_suffix = Some("nightly".to_string());
        assert_eq!(stack_name("proj", &t, false, run_id()), "fleet-proj-a-nightly");
    }

    #[test]
    fn test_project_slashes_replaced() {
        assert_eq!(stack_name("org/proj", &test("a"), false, run_id()), format!("fleet-org-proj-a-{}", run_id().simple()));
    }

    #[test]
    fn test_reserved_tags_dropped() {
        let mut extra = BTreeMap::new();
        extra.insert(TAG_RUN_ID.to_string(), "spoofed".to_string());
        extra.insert("Owner".to_string(), "me".to_string());
        let tags = stack_tags(run_id(), "proj", "a", &extra);
        assert_eq!(tags.len(), 4);
        assert_eq!(tags[0].value, "0123456789abcdef0123456789abcdef");
        assert!(tags.iter().any(|t| t.key == "Owner"));
        assert_eq!(tags.iter().filter(|t| t.key == TAG_RUN_ID).count(), 1);
    }

    #[test]
    fn test_role_arn() {
        assert_eq!(
            role_arn("aws-us-gov", "123", Some("deployer")).as_deref(),
            Some("arn:aws-us-gov:iam::123:role/deployer")
        );
        assert_eq!(role_arn("aws", "123", None), None);
    }
}

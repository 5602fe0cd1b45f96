//! Nested stack discovery.

use super::document::load_document;
use crate::errors::TemplateError;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Resource type of a nested stack.
pub const NESTED_STACK_TYPE: &str = "AWS::CloudFormation::Stack";

/// Directory name whose templates are never managed as children.
const SUBMODULES_DIR: &str = "submodules";

/// A loaded template and its nested stack children.
#[derive(Debug)]
pub struct Template {
    path: PathBuf,
    project_root: PathBuf,
    body: Value,
    children: Vec<Arc<Template>>,
    errors: Vec<TemplateError>,
}

impl Template {
    /// Absolute path of the template file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Root of the project tree.
    #[must_use]
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// The decoded body.
    #[must_use]
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Direct children, deduplicated by path.
    #[must_use]
    pub fn children(&self) -> &[Arc<Template>] {
        &self.children
    }

    /// Problems found while discovering children. Discovery continues past them.
    #[must_use]
    pub fn errors(&self) -> &[TemplateError] {
        &self.errors
    }

    /// Path relative to the project root, with forward slashes.
    #[must_use]
    pub fn relative_path(&self) -> String {
        relative_key(&self.project_root, &self.path)
    }

    /// Object key of the template under a staging prefix.
    #[must_use]
    pub fn object_key(&self, key_prefix: &str) -> String {
        format!("{key_prefix}{}", self.relative_path())
    }

    /// The `Resources` section.
    #[must_use]
    pub fn resources(&self) -> Option<&Map<String, Value>> {
        self.body.get("Resources").and_then(Value::as_object)
    }

    /// Template parameters mapped to their defaults, `null` when absent.
    #[must_use]
    pub fn parameters(&self) -> Map<String, Value> {
        self.body
            .get("Parameters")
            .and_then(Value::as_object)
            .map(|params| {
                params
                    .iter()
                    .map(|(name, decl)| {
                        (name.clone(), decl.get("Default").cloned().unwrap_or(Value::Null))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every template reachable through children, each exactly once.
    #[must_use]
    pub fn descendants(&self) -> Vec<Arc<Template>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut stack: Vec<Arc<Template>> = self.children.iter().rev().cloned().collect();
        while let Some(template) = stack.pop() {
            if !seen.insert(template.path.clone()) {
                continue;
            }
            stack.extend(template.children.iter().rev().cloned());
            out.push(template);
        }
        out
    }

    /// Errors of this template and all descendants.
    #[must_use]
    pub fn all_errors(&self) -> Vec<TemplateError> {
        let mut errors = self.errors.clone();
        for descendant in self.descendants() {
            errors.extend(descendant.errors.iter().cloned());
        }
        errors
    }

    /// Strips the template's own relative path from its uploaded URL.
    ///
    /// `https://b.s3.r.amazonaws.com/proj/templates/main.yaml` for
    /// `templates/main.yaml` gives `https://b.s3.r.amazonaws.com/proj`.
    #[must_use]
    pub fn url_prefix(&self, url: &str) -> String {
        if url.is_empty() {
            return String::new();
        }
        let depth = self.relative_path().split('/').count();
        let segments: Vec<&str> = url.split('/').collect();
        segments[..segments.len().saturating_sub(depth)].join("/")
    }

    /// Maps a child stack's TemplateURL back onto the project tree.
    ///
    /// Tries the path under the URL prefix first, then the same path with its
    /// first segment stripped. Returns `None` for templates outside the project.
    #[must_use]
    pub fn local_path_for_url(&self, parent_url: &str, child_url: &str) -> Option<PathBuf> {
        let prefix = self.url_prefix(parent_url);
        if prefix.is_empty() {
            return None;
        }
        let relative = child_url.strip_prefix(&prefix)?.trim_start_matches('/');
        let candidate = self.project_root.join(relative);
        if candidate.is_file() {
            return Some(candidate);
        }
        let stripped = relative.split_once('/').map(|(_, rest)| rest)?;
        let candidate = self.project_root.join(stripped);
        candidate.is_file().then_some(candidate)
    }
}

/// Loads templates and their children, memoising by path.
///
/// The cache is shared across the whole run so a template referenced by
/// several parents, tests or child stacks is decoded once.
#[derive(Debug)]
pub struct TemplateLoader {
    project_root: PathBuf,
    cache: DashMap<PathBuf, Arc<Template>>,
}

impl TemplateLoader {
    /// Creates a loader for a project tree.
    #[must_use]
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            cache: DashMap::new(),
        }
    }

    /// Root of the project tree.
    #[must_use]
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Number of distinct templates loaded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Returns true if nothing has been loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Loads a template and, recursively, its children.
    pub fn load(&self, path: &Path) -> Result<Arc<Template>, TemplateError> {
        let path = self.absolute(path);
        let mut ancestors = Vec::new();
        self.load_inner(&path, &mut ancestors)
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        };
        normalize(&joined)
    }

    fn load_inner(
        &self,
        path: &Path,
        ancestors: &mut Vec<PathBuf>,
    ) -> Result<Arc<Template>, TemplateError> {
        if let Some(cached) = self.cache.get(path) {
            return Ok(cached.clone());
        }

        let body = load_document(path)?;
        let Some(resources) = body.get("Resources").and_then(Value::as_object) else {
            return Err(TemplateError::MissingResources {
                path: path.to_path_buf(),
            });
        };

        let mut errors = Vec::new();
        let mut child_paths: Vec<PathBuf> = Vec::new();
        for (logical_id, resource) in resources {
            if resource.get("Type").and_then(Value::as_str) != Some(NESTED_STACK_TYPE) {
                continue;
            }
            match self.resolve_child(path, logical_id, resource) {
                Ok(Some(child)) => {
                    if !child_paths.contains(&child) {
                        child_paths.push(child);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(template = %path.display(), error = %err, "Failed to discover child template");
                    errors.push(err);
                }
            }
        }

        ancestors.push(path.to_path_buf());
        let mut children = Vec::new();
        for child in child_paths {
            if let Some(pos) = ancestors.iter().position(|a| *a == child) {
                let mut chain = ancestors[pos..].to_vec();
                chain.push(child);
                let err = TemplateError::Cycle { chain };
                tracing::error!(template = %path.display(), error = %err, "Nested stack cycle");
                errors.push(err);
                continue;
            }
            match self.load_inner(&child, ancestors) {
                Ok(template) => children.push(template),
                Err(err) => {
                    tracing::error!(template = %child.display(), error = %err, "Failed to add child template");
                    errors.push(err);
                }
            }
        }
        ancestors.pop();

        let template = Arc::new(Template {
            path: path.to_path_buf(),
            project_root: self.project_root.clone(),
            body,
            children,
            errors,
        });
        self.cache.insert(path.to_path_buf(), template.clone());
        Ok(template)
    }

    fn resolve_child(
        &self,
        parent: &Path,
        logical_id: &str,
        resource: &Value,
    ) -> Result<Option<PathBuf>, TemplateError> {
        let reference = resource
            .get("Properties")
            .and_then(|p| p.get("TemplateURL"))
            .cloned()
            .unwrap_or(Value::Null);

        let Some(relative) = reference_to_relative(&reference) else {
            return Err(TemplateError::UnsupportedReference {
                parent: parent.to_path_buf(),
                resource: logical_id.to_string(),
                reference: reference.to_string(),
            });
        };
        let relative = relative.trim_start_matches('/');

        if Path::new(relative)
            .components()
            .any(|c| c.as_os_str() == SUBMODULES_DIR)
        {
            tracing::debug!(resource = %logical_id, reference = %relative, "Skipping submodule template");
            return Ok(None);
        }

        let candidate = normalize(&self.project_root.join(relative));
        if !candidate.is_file() {
            return Err(TemplateError::ChildNotFound {
                parent: parent.to_path_buf(),
                resource: logical_id.to_string(),
                reference: reference.to_string(),
                candidate,
            });
        }
        Ok(Some(candidate))
    }
}

/// Extracts the project-relative path from a nested stack's TemplateURL.
///
/// * a literal URL keeps its last two path segments,
/// * `Fn::Sub` keeps the text after the last `}`,
/// * `Fn::Join` keeps the last joined element.
#[must_use]
pub fn reference_to_relative(reference: &Value) -> Option<String> {
    match reference {
        Value::String(url) => {
            let segments: Vec<&str> = url.split('/').collect();
            let start = segments.len().saturating_sub(2);
            Some(segments[start..].join("/"))
        }
        Value::Object(map) => {
            if let Some(sub) = map.get("Fn::Sub") {
                let text = match sub {
                    Value::String(s) => s.as_str(),
                    Value::Array(items) => items.first()?.as_str()?,
                    _ => return None,
                };
                return text.rsplit('}').next().map(str::to_string);
            }
            if let Some(join) = map.get("Fn::Join") {
                return join
                    .get(1)?
                    .as_array()?
                    .last()?
                    .as_str()
                    .map(str::to_string);
            }
            None
        }
        _ => None,
    }
}

fn relative_key(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Lexically resolves `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ProjectBuilder;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn nested(resource: &str, url: &str) -> String {
        format!(
            "  {resource}:\n    Type: AWS::CloudFormation::Stack\n    Properties:\n      TemplateURL: {url}\n"
        )
    }

    fn leaf() -> &'static str {
        "Resources:\n  Bucket:\n    Type: AWS::S3::Bucket\n"
    }

    #[test]
    fn test_reference_forms() {
        assert_eq!(
            reference_to_relative(&json!("https://b.s3.amazonaws.com/proj/templates/a.yaml")),
            Some("templates/a.yaml".to_string())
        );
        assert_eq!(
            reference_to_relative(&json!({"Fn::Sub": "https://${B}.s3.amazonaws.com/${P}templates/a.yaml"})),
            Some("templates/a.yaml".to_string())
        );
        assert_eq!(
            reference_to_relative(&json!({"Fn::Sub": ["https://${B}/${P}templates/a.yaml", {"B": "x"}]})),
            Some("templates/a.yaml".to_string())
        );
        assert_eq!(
            reference_to_relative(&json!({"Fn::Join": ["/", ["https://x", {"Ref": "P"}, "templates/a.yaml"]]})),
            Some("templates/a.yaml".to_string())
        );
        assert_eq!(reference_to_relative(&json!({"Ref": "Url"})), None);
    }

    #[test]
    fn test_dedup_across_parents() {
        let main = format!(
            "Resources:\n{}{}{}",
            nested("A", "https://b/x/templates/a.yaml"),
            nested("B", "https://b/x/templates/b.yaml"),
            nested("SharedDirect", "https://b/x/templates/shared.yaml"),
        );
        let a = format!("Resources:\n{}", nested("S", "https://b/x/templates/shared.yaml"));
        let b = format!("Resources:\n{}", nested("S", "https://b/x/templates/shared.yaml"));
        let project = ProjectBuilder::new()
            .file("templates/main.yaml", &main)
            .file("templates/a.yaml", &a)
            .file("templates/b.yaml", &b)
            .file("templates/shared.yaml", leaf())
            .build();

        let loader = TemplateLoader::new(project.path());
        let template = loader.load(Path::new("templates/main.yaml")).unwrap();

        let descendants: Vec<String> = template.descendants().iter().map(|t| t.relative_path()).collect();
        assert_eq!(descendants.len(), 3);
        assert_eq!(
            descendants.iter().filter(|p| p.as_str() == "templates/shared.yaml").count(),
            1
        );
        assert_eq!(loader.len(), 4);
        assert!(template.all_errors().is_empty());
    }

    #[test]
    fn test_same_path_twice_in_one_template() {
        let main = format!(
            "Resources:\n{}{}",
            nested("One", "https://b/x/templates/leaf.yaml"),
            nested("Two", "https://b/x/templates/leaf.yaml"),
        );
        let project = ProjectBuilder::new()
            .file("templates/main.yaml", &main)
            .file("templates/leaf.yaml", leaf())
            .build();

        let template = TemplateLoader::new(project.path())
            .load(Path::new("templates/main.yaml"))
            .unwrap();
        assert_eq!(template.children().len(), 1);
    }

    #[test]
    fn test_missing_child_recorded_not_fatal() {
        let main = format!(
            "Resources:\n{}{}",
            nested("Gone", "https://b/x/templates/missing.yaml"),
            nested("Here", "https://b/x/templates/leaf.yaml"),
        );
        let project = ProjectBuilder::new()
            .file("templates/main.yaml", &main)
            .file("templates/leaf.yaml", leaf())
            .build();

        let template = TemplateLoader::new(project.path())
            .load(Path::new("templates/main.yaml"))
            .unwrap();
        assert_eq!(template.children().len(), 1);
        assert!(matches!(template.errors()[0], TemplateError::ChildNotFound { .. }));
    }

    #[test]
    fn test_submodule_reference_skipped() {
        let main = format!("Resources:\n{}", nested("Vendored", "https://b/submodules/vpc.yaml"));
        let project = ProjectBuilder::new()
            .file("templates/main.yaml", &main)
            .file("submodules/vpc.yaml", leaf())
            .build();

        let template = TemplateLoader::new(project.path())
            .load(Path::new("templates/main.yaml"))
            .unwrap();
        assert!(template.children().is_empty());
        assert!(template.errors().is_empty());
    }

    #[test]
    fn test_cycle_detected() {
        let a = format!("Resources:\n{}", nested("B", "https://b/x/templates/b.yaml"));
        let b = format!("Resources:\n{}", nested("A", "https://b/x/templates/a.yaml"));
        let project = ProjectBuilder::new()
            .file("templates/a.yaml", &a)
            .file("templates/b.yaml", &b)
            .build();

        let template = TemplateLoader::new(project.path())
            .load(Path::new("templates/a.yaml"))
            .unwrap();
        let errors = template.all_errors();
        assert!(errors.iter().any(|e| matches!(e, TemplateError::Cycle { chain } if chain.len() == 3)));
        assert_eq!(template.descendants().len(), 1);
    }

    #[test]
    fn test_missing_resources_rejected() {
        let project = ProjectBuilder::new()
            .file("templates/main.yaml", "Parameters: {}\n")
            .build();
        let err = TemplateLoader::new(project.path())
            .load(Path::new("templates/main.yaml"))
            .unwrap_err();
        assert!(matches!(err, TemplateError::MissingResources { .. }));
    }

    #[test]
    fn test_parameters_defaults() {
        let project = ProjectBuilder::new()
            .file(
                "templates/main.yaml",
                "Parameters:\n  A:\n    Type: String\n    Default: x\n  B:\n    Type: String\nResources:\n  R:\n    Type: AWS::S3::Bucket\n",
            )
            .build();
        let template = TemplateLoader::new(project.path())
            .load(Path::new("templates/main.yaml"))
            .unwrap();
        assert_eq!(Value::Object(template.parameters()), json!({"A": "x", "B": null}));
    }

    #[test]
    fn test_url_prefix_and_child_mapping() {
        let main = format!("Resources:\n{}", nested("Child", "https://b/x/templates/child.yaml"));
        let project = ProjectBuilder::new()
            .file("templates/main.yaml", &main)
            .file("templates/child.yaml", leaf())
            .build();
        let template = TemplateLoader::new(project.path())
            .load(Path::new("templates/main.yaml"))
            .unwrap();

        let url = "https://bkt.s3.us-east-1.amazonaws.com/demo/templates/main.yaml";
        assert_eq!(template.url_prefix(url), "https://bkt.s3.us-east-1.amazonaws.com/demo");
        assert_eq!(template.object_key("demo/"), "demo/templates/main.yaml");

        let child_url = "https://bkt.s3.us-east-1.amazonaws.com/demo/templates/child.yaml";
        assert_eq!(
            template.local_path_for_url(url, child_url),
            Some(project.path().join("templates/child.yaml"))
        );
        assert_eq!(
            template.local_path_for_url(url, "https://other.example.com/remote.yaml"),
            None
        );
    }
}

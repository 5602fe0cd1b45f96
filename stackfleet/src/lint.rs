//! Pre-flight template checks.
//!
//! Linting runs before anything is uploaded so a broken template fails the
//! run without creating buckets or stacks. The [`StructuralLinter`] only
//! checks shape; richer rule engines plug in through [`TemplateLinter`].

use crate::errors::TemplateError;
use crate::template::Template;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// How serious a finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Reported, does not fail the run.
    Warning,
    /// Fails the run.
    Error,
}

/// One problem found in a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintFinding {
    /// Rule code, e.g. `LINT-002-TYPE`.
    pub code: String,
    /// Severity.
    pub severity: Severity,
    /// Project-relative template path.
    pub template: String,
    /// Logical id of the offending resource or parameter.
    pub subject: Option<String>,
    /// Human readable message.
    pub message: String,
}

impl LintFinding {
    /// Creates an error finding.
    #[must_use]
    pub fn error(code: &str, template: &Template, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            severity: Severity::Error,
            template: template.relative_path(),
            subject: None,
            message: message.into(),
        }
    }

    /// Creates a warning finding.
    #[must_use]
    pub fn warning(code: &str, template: &Template, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(code, template, message)
        }
    }

    /// Names the resource or parameter the finding is about.
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

impl fmt::Display for LintFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.template)?;
        if let Some(subject) = &self.subject {
            write!(f, " {subject}")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Checks one template.
pub trait TemplateLinter: Send + Sync {
    /// Linter name used in logs.
    fn name(&self) -> &str;

    /// Returns every finding for `template`, children excluded.
    fn lint(&self, template: &Template) -> Vec<LintFinding>;
}

/// Shape checks every template must pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralLinter;

impl TemplateLinter for StructuralLinter {
    fn name(&self) -> &str {
        "structural"
    }

    fn lint(&self, template: &Template) -> Vec<LintFinding> {
        let mut findings = Vec::new();

        match template.resources() {
            None => findings.push(LintFinding::error(
                "LINT-001-RESOURCES",
                template,
                "template has no Resources section",
            )),
            Some(resources) if resources.is_empty() => findings.push(LintFinding::error(
                "LINT-001-RESOURCES",
                template,
                "Resources section is empty",
            )),
            Some(resources) => {
                for (logical_id, resource) in resources {
                    match resource.get("Type") {
                        Some(Value::String(kind)) if !kind.is_empty() => {}
                        Some(_) => findings.push(
                            LintFinding::error("LINT-002-TYPE", template, "resource Type must be a non-empty string")
                                .with_subject(logical_id),
                        ),
                        None => findings.push(
                            LintFinding::error("LINT-002-TYPE", template, "resource has no Type").with_subject(logical_id),
                        ),
                    }
                }
            }
        }

        if let Some(parameters) = template.body().get("Parameters").and_then(Value::as_object) {
            for (name, declaration) in parameters {
                if declaration.get("Type").and_then(Value::as_str).is_none() {
                    findings.push(
                        LintFinding::warning("LINT-003-PARAM_TYPE", template, "parameter has no Type")
                            .with_subject(name),
                    );
                }
            }
        }

        for error in template.errors() {
            findings.push(LintFinding::error("LINT-004-NESTED", template, error.to_string()));
        }

        findings
    }
}

/// Findings for a root template and all its descendants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintReport {
    /// Every finding, root template first.
    pub findings: Vec<LintFinding>,
}

impl LintReport {
    /// Returns true if any finding is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Error)
    }

    /// Error findings only.
    pub fn errors(&self) -> impl Iterator<Item = &LintFinding> {
        self.findings.iter().filter(|f| f.severity == Severity::Error)
    }

    /// Converts error findings into a template error for `template`.
    pub fn into_result(self, template: &Template) -> Result<Self, TemplateError> {
        if self.has_errors() {
            return Err(TemplateError::Lint {
                path: template.path().to_path_buf(),
                findings: self.errors().map(ToString::to_string).collect(),
            });
        }
        Ok(self)
    }
}

/// The linters a run uses unless told otherwise.
#[must_use]
pub fn default_linters() -> Vec<Arc<dyn TemplateLinter>> {
    vec![Arc::new(StructuralLinter)]
}

/// Runs every linter over a template tree.
#[must_use]
pub fn lint_tree(linters: &[Arc<dyn TemplateLinter>], template: &Arc<Template>) -> LintReport {
    let mut templates = vec![Arc::clone(template)];
    templates.extend(template.descendants());

    let mut findings = Vec::new();
    for linter in linters {
        for template in &templates {
            let found = linter.lint(template);
            for finding in &found {
                match finding.severity {
                    Severity::Error => tracing::error!(linter = linter.name(), finding = %finding, "Lint error"),
                    Severity::Warning => tracing::warn!(linter = linter.name(), finding = %finding, "Lint warning"),
                }
            }
            findings.extend(found);
        }
    }
    LintReport { findings }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::TemplateLoader;
    use crate::testing::ProjectBuilder;
    use std::path::Path;

    fn lint(files: &[(&str, &str)]) -> LintReport {
        let project = files
            .iter()
            .fold(ProjectBuilder::new(), |b, (path, body)| b.file(*path, *body))
            .build();
        let template = TemplateLoader::new(project.path())
            .load(Path::new("main.yaml"))
            .unwrap();
        lint_tree(&default_linters(), &template)
    }

    #[test]
    fn test_clean_template() {
        let report = lint(&[("main.yaml", "Parameters:\n  A:\n    Type: String\nResources:\n  T:\n    Type: AWS::SNS::Topic\n")]);
        assert!(report.findings.is_empty());
    }

    #[test]
    fn test_untyped_resource_is_error() {
        let report = lint(&[("main.yaml", "Resources:\n  T:\n    Properties: {}\n")]);
        assert!(report.has_errors());
        assert_eq!(report.findings[0].code, "LINT-002-TYPE");
        assert_eq!(report.findings[0].subject.as_deref(), Some("T"));
    }

    #[test]
    fn test_empty_resources_and_untyped_parameter() {
        let report = lint(&[("main.yaml", "Parameters:\n  A:\n    Default: x\nResources: {}\n")]);
        let codes: Vec<&str> = report.findings.iter().map(|f| f.code.as_str()).collect();
        assert_eq!(codes, vec!["LINT-001-RESOURCES", "LINT-003-PARAM_TYPE"]);
    }

    #[test]
    fn test_children_are_linted() {
        let report = lint(&[
            (
                "main.yaml",
                "Resources:\n  C:\n    Type: AWS::CloudFormation::Stack\n    Properties:\n      TemplateURL: https://b.s3.amazonaws.com/p/templates/child.yaml\n",
            ),
            ("templates/child.yaml", "Resources:\n  X:\n    Type: ''\n"),
        ]);
        assert!(report.errors().any(|f| f.template == "templates/child.yaml"));
    }

    #[test]
    fn test_into_result_carries_findings() {
        let project = ProjectBuilder::new()
            .file("main.yaml", "Resources:\n  T:\n    Properties: {}\n")
            .build();
        let template = TemplateLoader::new(project.path()).load(Path::new("main.yaml")).unwrap();
        let err = lint_tree(&default_linters(), &template)
            .into_result(&template)
            .unwrap_err();
        assert!(err.to_string().contains("LINT-002-TYPE"));
    }
}

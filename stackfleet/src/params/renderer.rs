//! Ordered single-pass parameter rendering.

use super::directives::{Directive, Splice};
use super::password::{generate_password, random_digits, random_lowercase, PasswordKind};
use crate::cloud::{LookupApi, ObjectStore};
use crate::errors::RenderError;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const RANDOM_LENGTH: usize = 20;
const KEY_PAIR_NAME: &str = "cikey";
const OVERRIDE_PLACEHOLDER: &str = "override_this";
const DEFAULT_PRESIGN_EXPIRY_SECS: u64 = 3600;

/// Values the renderer substitutes for context directives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderContext {
    /// Region being rendered for.
    pub region: String,
    /// Staging bucket name.
    pub bucket_name: String,
    /// Key prefix of the staged project, e.g. `my-project/`.
    pub bucket_prefix: String,
    /// Project name.
    pub project_name: String,
    /// Test name.
    pub test_name: String,
    /// Zone ids never handed out by zone directives.
    pub az_excludes: HashSet<String>,
}

impl RenderContext {
    /// Creates a context for a region.
    #[must_use]
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            ..Self::default()
        }
    }

    /// Sets the staging bucket and key prefix.
    #[must_use]
    pub fn with_bucket(mut self, name: impl Into<String>, prefix: impl Into<String>) -> Self {
        self.bucket_name = name.into();
        self.bucket_prefix = prefix.into();
        self
    }

    /// Sets the project and test names.
    #[must_use]
    pub fn with_names(mut self, project: impl Into<String>, test: impl Into<String>) -> Self {
        self.project_name = project.into();
        self.test_name = test.into();
        self
    }

    /// Sets the excluded zone ids.
    #[must_use]
    pub fn with_az_excludes<I, S>(mut self, excludes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.az_excludes = excludes.into_iter().map(Into::into).collect();
        self
    }
}

/// Resolves directives in a parameter set for one test and region.
///
/// Parameters are rendered in map order, one at a time. A `getval`
/// directive only sees parameters rendered before it, so a forward reference
/// fails instead of being reordered.
pub struct ParameterRenderer {
    context: RenderContext,
    lookup: Arc<dyn LookupApi>,
    objects: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for ParameterRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterRenderer")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl ParameterRenderer {
    /// Creates a renderer.
    #[must_use]
    pub fn new(
        context: RenderContext,
        lookup: Arc<dyn LookupApi>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            context,
            lookup,
            objects,
        }
    }

    /// Returns the render context.
    #[must_use]
    pub fn context(&self) -> &RenderContext {
        &self.context
    }

    /// Renders every parameter, preserving order.
    pub async fn render(&self, params: &Map<String, Value>) -> Result<Map<String, Value>, RenderError> {
        if let Some((name, _)) = params.iter().find(|(_, v)| v.is_null()) {
            return Err(RenderError::MissingValue { param: name.clone() });
        }

        let mut rendered = Map::new();
        for (name, value) in params {
            let value = self.render_value(name, value, &rendered).await?;
            rendered.insert(name.clone(), value);
        }
        Ok(rendered)
    }

    fn render_value<'a>(
        &'a self,
        param: &'a str,
        value: &'a Value,
        rendered: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<Value, RenderError>> {
        async move {
            match value {
                Value::Null => Err(RenderError::MissingValue {
                    param: param.to_string(),
                }),
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.render_value(param, item, rendered).await?);
                    }
                    Ok(Value::Array(out))
                }
                Value::Object(map) => {
                    let mut out = Map::new();
                    for (key, item) in map {
                        out.insert(key.clone(), self.render_value(param, item, rendered).await?);
                    }
                    Ok(Value::Object(out))
                }
                scalar => {
                    let text = coerce_to_text(scalar);
                    self.render_text(param, text, rendered).await.map(Value::String)
                }
            }
        }
        .boxed()
    }

    async fn render_text(
        &self,
        param: &str,
        mut value: String,
        rendered: &Map<String, Value>,
    ) -> Result<String, RenderError> {
        if !value.contains("$[") {
            return Ok(value);
        }

        for directive in Directive::ORDER {
            let pattern = directive.pattern();
            match directive.splice() {
                Splice::WholeValue => {
                    let arg = match pattern.captures(&value) {
                        Some(caps) => caps.get(1).map_or_else(String::new, |m| m.as_str().to_string()),
                        None => continue,
                    };
                    value = self.evaluate(directive, param, &[arg], rendered).await?;
                }
                Splice::Token => {
                    let mut tokens: Vec<(String, Vec<String>)> = Vec::new();
                    for caps in pattern.captures_iter(&value) {
                        let token = caps[0].to_string();
                        if tokens.iter().any(|(t, _)| *t == token) {
                            continue;
                        }
                        let args = caps
                            .iter()
                            .skip(1)
                            .map(|m| m.map_or_else(String::new, |m| m.as_str().to_string()))
                            .collect();
                        tokens.push((token, args));
                    }
                    for (token, args) in tokens {
                        let replacement = self.evaluate(directive, param, &args, rendered).await?;
                        value = value.replace(&token, &replacement);
                    }
                }
            }
            tracing::trace!(param = %param, directive = %directive, "Checked directive");
        }
        Ok(value)
    }

    async fn evaluate(
        &self,
        directive: Directive,
        param: &str,
        args: &[String],
        rendered: &Map<String, Value>,
    ) -> Result<String, RenderError> {
        let arg = |i: usize| nth_arg(args, i);
        tracing::debug!(param = %param, directive = %directive, region = %self.context.region, "Resolving directive");

        match directive {
            Directive::RandomNumbers => Ok(random_digits(RANDOM_LENGTH)),
            Directive::RandomString => Ok(random_lowercase(RANDOM_LENGTH)),
            Directive::AutoBucket => Ok(self.context.bucket_name.clone()),
            Directive::AutoBucketPrefix => Ok(self.context.bucket_prefix.clone()),
            Directive::Password => {
                let length = parse_count(param, arg(0))?;
                if length == 0 {
                    return Err(RenderError::malformed(param, "password length must be at least 1"));
                }
                let suffix = Some(arg(1)).filter(|s| !s.is_empty());
                Ok(generate_password(length, PasswordKind::from_suffix(suffix)))
            }
            Directive::AzList => {
                let count = match parse_count(param, arg(0))? {
                    0 => {
                        tracing::info!(param = %param, "Number of zones not specified, defaulting to 1");
                        1
                    }
                    n => n,
                };
                Ok(self.available_zones(param, count).await?.join(","))
            }
            Directive::SingleAz => {
                let ordinal = parse_count(param, arg(0))?;
                let zones = self.available_zones(param, ordinal + 1).await?;
                zones
                    .into_iter()
                    .nth(ordinal)
                    .ok_or_else(|| RenderError::malformed(param, format!("no zone at ordinal {ordinal}")))
            }
            Directive::KeyPair => Ok(KEY_PAIR_NAME.to_string()),
            Directive::LicenseBucket | Directive::MediaBucket => Ok(OVERRIDE_PLACEHOLDER.to_string()),
            Directive::LicenseContent => self.object_content(param, arg(0)).await,
            Directive::PresignedUrl => self.presigned_url(param, arg(0)).await,
            Directive::Ssm => self
                .lookup
                .get_parameter(arg(0))
                .await
                .map_err(|e| RenderError::lookup(param, e)),
            Directive::SecretsManager => self
                .lookup
                .get_secret_value(arg(0))
                .await
                .map_err(|e| RenderError::lookup(param, e)),
            Directive::GetVal => {
                let referenced = arg(0);
                rendered
                    .get(referenced)
                    .map(coerce_to_text)
                    .ok_or_else(|| RenderError::forward_reference(param, referenced))
            }
            Directive::Uuid => Ok(uuid::Uuid::new_v4().to_string()),
            Directive::CurrentRegion => Ok(self.context.region.clone()),
            Directive::ProjectName => Ok(self.context.project_name.clone()),
            Directive::TestName => Ok(self.context.test_name.clone()),
        }
    }

    /// Returns `count` available zone names, sorted, excluding configured zone ids.
    async fn available_zones(&self, param: &str, count: usize) -> Result<Vec<String>, RenderError> {
        let mut zones: Vec<String> = self
            .lookup
            .describe_availability_zones()
            .await
            .map_err(|e| RenderError::lookup(param, e))?
            .into_iter()
            .filter(|az| az.state == "available" && !self.context.az_excludes.contains(&az.zone_id))
            .map(|az| az.zone_name)
            .collect();
        zones.sort();
        zones.dedup();

        if zones.len() < count {
            return Err(RenderError::InsufficientZones {
                region: self.context.region.clone(),
                requested: count,
                available: zones.len(),
            });
        }
        zones.truncate(count);
        Ok(zones)
    }

    /// `$[x_getlicensecontent]/bucket/key/with/slashes`
    async fn object_content(&self, param: &str, reference: &str) -> Result<String, RenderError> {
        let mut parts = reference.trim().split('/').skip(1);
        let bucket = parts.next().unwrap_or_default();
        let key = parts.collect::<Vec<_>>().join("/");
        if bucket.is_empty() || key.is_empty() {
            return Err(RenderError::malformed(param, "expected /<bucket>/<key> after getlicensecontent"));
        }

        let body = self.objects.get_object(bucket, &key).await.map_err(|e| {
            tracing::error!(bucket = %bucket, key = %key, "Failed to fetch object content");
            RenderError::lookup(param, e)
        })?;
        Ok(String::from_utf8_lossy(&body).trim().to_string())
    }

    /// `$[x_presignedurl],bucket,key[,expiry]`
    async fn presigned_url(&self, param: &str, spec: &str) -> Result<String, RenderError> {
        let args: Vec<&str> = spec.split(',').skip(1).map(str::trim).collect();
        if args.len() < 2 || args[0].is_empty() || args[1].is_empty() {
            return Err(RenderError::malformed(
                param,
                "syntax is $[taskcat_presignedurl],bucket,key[,expiry]",
            ));
        }
        let expiry = match args.get(2) {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| RenderError::malformed(param, format!("invalid expiry '{raw}'")))?,
            None => DEFAULT_PRESIGN_EXPIRY_SECS,
        };

        self.objects
            .presigned_url(args[0], args[1], Duration::from_secs(expiry))
            .await
            .map_err(|e| RenderError::lookup(param, e))
    }
}

fn nth_arg(args: &[String], i: usize) -> &str {
    args.get(i).map_or("", String::as_str)
}

fn parse_count(param: &str, raw: &str) -> Result<usize, RenderError> {
    raw.parse::<usize>()
        .map_err(|_| RenderError::malformed(param, format!("'{raw}' is not a number")))
}

/// Converts a scalar parameter value to the text directives operate on.
#[must_use]
pub fn coerce_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

//! Request validation against a backend's self-described API
//!
//! A backend publishes a document whose `paths` object maps path templates
//! (e.g. `/session/{id}/message`) to the methods they accept. Every proxied
//! request is checked against it before it is forwarded.

use regex::Regex;
use serde_json::Value;
use std::borrow::Cow;
use std::sync::OnceLock;
use tracing::warn;

/// Why a request was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid spec: no paths defined")]
    InvalidSpec,
    #[error("Method '{method}' not allowed for path '{path}'")]
    MethodNotAllowed { method: String, path: String },
    #[error("Path '{path}' not found in spec")]
    PathNotFound { path: String },
}

/// A single declared path template with its compiled matcher
#[derive(Debug, Clone)]
pub struct PathTemplate {
    template: String,
    pattern: Regex,
    methods: Vec<String>,
}

impl PathTemplate {
    fn new(template: &str, methods: Vec<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            template: template.to_string(),
            pattern: template_to_regex(template)?,
            methods,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Lowercased method names declared for this template
    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    pub fn matches(&self, path: &str) -> bool {
        self.pattern.is_match(path)
    }

    pub fn allows(&self, method: &str) -> bool {
        let method = method.to_ascii_lowercase();
        self.methods.iter().any(|m| *m == method)
    }
}

/// A parsed API description
///
/// `paths` is `None` when the document has no usable `paths` object.
#[derive(Debug, Clone)]
pub struct ApiSpec {
    paths: Option<Vec<PathTemplate>>,
}

impl ApiSpec {
    /// Build from a decoded JSON document, keeping the declared path order
    pub fn from_value(document: &Value) -> Self {
        let Some(paths) = document.get("paths").and_then(Value::as_object) else {
            return Self { paths: None };
        };

        let templates = paths
            .iter()
            .filter_map(|(template, item)| {
                let methods = item
                    .as_object()
                    .map(|ops| ops.keys().map(|m| m.to_ascii_lowercase()).collect())
                    .unwrap_or_default();
                match PathTemplate::new(template, methods) {
                    Ok(t) => Some(t),
                    Err(e) => {
                        warn!(template, error = %e, "Skipping unusable path template");
                        None
                    }
                }
            })
            .collect();

        Self {
            paths: Some(templates),
        }
    }

    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        let document: Value = serde_json::from_slice(body)?;
        Ok(Self::from_value(&document))
    }

    pub fn templates(&self) -> Option<&[PathTemplate]> {
        self.paths.as_deref()
    }
}

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{[^}]+\}").expect("static placeholder pattern"))
}

/// Convert a path template to an anchored regex; each `{name}` matches one segment
pub fn template_to_regex(template: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::from("^");
    let mut last = 0;

    for placeholder in placeholder_regex().find_iter(template) {
        pattern.push_str(&regex::escape(&template[last..placeholder.start()]));
        pattern.push_str("[^/]+");
        last = placeholder.end();
    }
    pattern.push_str(&regex::escape(&template[last..]));
    pattern.push('$');

    Regex::new(&pattern)
}

/// Percent-decode a request path
fn decode_path(path: &str) -> Cow<'_, str> {
    match urlencoding::decode(path) {
        Ok(decoded) => decoded,
        Err(_) => {
            let bytes = urlencoding::decode_binary(path.as_bytes());
            Cow::Owned(String::from_utf8_lossy(&bytes).into_owned())
        }
    }
}

/// Check a method and path against the spec
///
/// The first template (in declaration order) whose pattern matches the decoded
/// path decides the outcome.
pub fn validate(spec: &ApiSpec, method: &str, path: &str) -> Result<(), ValidationError> {
    let templates = spec.templates().ok_or(ValidationError::InvalidSpec)?;
    let decoded = decode_path(path);

    match templates.iter().find(|t| t.matches(&decoded)) {
        Some(template) if template.allows(method) => Ok(()),
        Some(_) => Err(ValidationError::MethodNotAllowed {
            method: method.to_string(),
            path: decoded.into_owned(),
        }),
        None => Err(ValidationError::PathNotFound {
            path: decoded.into_owned(),
        }),
    }
}

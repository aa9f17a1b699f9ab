//! Diagnostic pages and static assets.
//!
//! # Responsibilities
//! - Hold the no-route (502) and backend-unavailable (503) templates
//! - Render them with live routing-table contents
//! - Hold the favicon served in place of error pages
//!
//! # Design Decisions
//! - Templates are validated once at construction; rendering cannot fail
//! - Placeholders are `{{ name }}`; every substituted value is HTML-escaped
//!   except the pre-rendered route list, whose parts are escaped individually

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use axum::body::Bytes;
use regex::{Captures, Regex};
use thiserror::Error;

use crate::config::AssetsConfig;
use crate::routing::RoutingTable;

/// Hint shown on every backend-unavailable page.
pub const UNAVAILABLE_HINT: &str = "The deployed pod(s) may be unavailable or unresponsive.";

const NO_ROUTE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
	<head>
		<title>Bad Gateway</title>
		<style>
			body { font-family: courier; margin: 5em 25%; background-color: #f1f6f8; }
		</style>
	</head>
	<body>
		<h1>502 Bad Gateway</h1>
		<p>No {{ scheme }} route exists for host '{{ host }}'.</p>
		<p>Registered routes:</p>
		<ul>
{{ routes }}
		</ul>
	</body>
</html>
"#;

const UNAVAILABLE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
	<head>
		<title>Service Unavailable</title>
		<style>
			body { font-family: courier; margin: 5em 25%; background-color: #f1f6f8; }
		</style>
	</head>
	<body>
		<h1>503 Service Unavailable</h1>
		<p>{{ reason }} from {{ target }}</p>
		<p>{{ message }}</p>
	</body>
</html>
"#;

const NO_ROUTE_VARS: &[&str] = &["host", "scheme", "routes"];
const UNAVAILABLE_VARS: &[&str] = &["reason", "target", "message"];

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template {template}: unknown placeholder {{{{ {name} }}}}")]
    UnknownVariable { template: &'static str, name: String },

    #[error("template {template}: unterminated placeholder")]
    Unterminated { template: &'static str },

    #[error("template {template}: failed to read override: {source}")]
    Io {
        template: &'static str,
        #[source]
        source: io::Error,
    },
}

fn placeholder() -> Regex {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder pattern is valid")
}

#[derive(Debug, Clone)]
struct Template {
    source: String,
}

impl Template {
    fn parse(
        name: &'static str,
        source: String,
        allowed: &[&str],
        pattern: &Regex,
    ) -> Result<Self, TemplateError> {
        for caps in pattern.captures_iter(&source) {
            let var = &caps[1];
            if !allowed.contains(&var) {
                return Err(TemplateError::UnknownVariable {
                    template: name,
                    name: var.to_string(),
                });
            }
        }

        // whatever is left after removing valid placeholders must not open one
        if pattern.replace_all(&source, "").contains("{{") {
            return Err(TemplateError::Unterminated { template: name });
        }

        Ok(Self { source })
    }

    fn render(&self, pattern: &Regex, values: &HashMap<&str, String>) -> String {
        pattern
            .replace_all(&self.source, |caps: &Captures<'_>| {
                values.get(&caps[1]).cloned().unwrap_or_default()
            })
            .into_owned()
    }
}

/// The two diagnostic pages.
#[derive(Debug, Clone)]
pub struct ErrorPages {
    pattern: Regex,
    no_route: Template,
    unavailable: Template,
}

impl ErrorPages {
    /// Built-in templates.
    pub fn new() -> Result<Self, TemplateError> {
        Self::from_sources(NO_ROUTE_TEMPLATE.to_string(), UNAVAILABLE_TEMPLATE.to_string())
    }

    pub fn from_sources(no_route: String, unavailable: String) -> Result<Self, TemplateError> {
        let pattern = placeholder();
        Ok(Self {
            no_route: Template::parse("502.html", no_route, NO_ROUTE_VARS, &pattern)?,
            unavailable: Template::parse("503.html", unavailable, UNAVAILABLE_VARS, &pattern)?,
            pattern,
        })
    }

    /// Built-in templates, replaced by `502.html` / `503.html` found in `dir`.
    pub fn load(dir: Option<&Path>) -> Result<Self, TemplateError> {
        let Some(dir) = dir else {
            return Self::new();
        };
        let no_route = read_override(dir, "502.html")?.unwrap_or_else(|| NO_ROUTE_TEMPLATE.into());
        let unavailable =
            read_override(dir, "503.html")?.unwrap_or_else(|| UNAVAILABLE_TEMPLATE.into());
        Self::from_sources(no_route, unavailable)
    }

    /// Page for a host no registered key claims.
    pub fn no_route(&self, host: &str, scheme: &str, table: &RoutingTable) -> String {
        let links: Vec<String> = table
            .keys()
            .map(|key| {
                let href = route_link(scheme, host, key);
                format!(
                    "\t\t\t<li><a href=\"{}\">{}</a></li>",
                    escape_html(&href),
                    escape_html(key)
                )
            })
            .collect();

        let values = HashMap::from([
            ("host", escape_html(host)),
            ("scheme", escape_html(&scheme.to_uppercase())),
            ("routes", links.join("\n")),
        ]);
        self.no_route.render(&self.pattern, &values)
    }

    /// Page for a backend that failed or could not be reached.
    pub fn unavailable(&self, reason: &str, target: &str) -> String {
        let values = HashMap::from([
            ("reason", escape_html(reason)),
            ("target", escape_html(target)),
            ("message", escape_html(UNAVAILABLE_HINT)),
        ]);
        self.unavailable.render(&self.pattern, &values)
    }
}

fn read_override(dir: &Path, name: &'static str) -> Result<Option<String>, TemplateError> {
    match fs::read_to_string(dir.join(name)) {
        Ok(source) => Ok(Some(source)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(TemplateError::Io {
            template: name,
            source,
        }),
    }
}

/// Link to `key` under the requested host's parent domain.
///
/// `bar.example.com:8080` with key `foo` gives `http://foo.example.com:8080/`.
pub fn route_link(scheme: &str, host: &str, key: &str) -> String {
    let host = host.trim();
    let (name, port) = match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            (name, Some(port))
        }
        _ => (host, None),
    };
    let parent = name.split_once('.').map(|(_, rest)| rest).unwrap_or("");

    let mut link = format!("{}://{}", scheme.to_lowercase(), key);
    if !parent.is_empty() {
        link.push('.');
        link.push_str(parent);
    }
    if let Some(port) = port {
        link.push(':');
        link.push_str(port);
    }
    link.push('/');
    link
}

pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Static files served by the proxy itself.
#[derive(Debug, Clone, Default)]
pub struct Assets {
    pub favicon: Bytes,
}

impl Assets {
    /// Read assets once. A missing favicon yields an empty body.
    pub fn load(config: &AssetsConfig) -> Self {
        let favicon = match &config.favicon_path {
            Some(path) => match fs::read(path) {
                Ok(bytes) => Bytes::from(bytes),
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Failed to read favicon");
                    Bytes::new()
                }
            },
            None => Bytes::new(),
        };
        Self { favicon }
    }
}

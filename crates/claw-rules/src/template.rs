//! Label and annotation templating.
//!
//! Rules treat rendering as an opaque `render(templates) -> labels` step behind
//! the [`TemplateRenderer`] trait. [`DefaultRenderer`] understands the
//! placeholders most alert definitions need:
//!
//! - `{{ $labels.<name> }}`: value of a label of the result row (empty if absent)
//! - `{{ $value }}`: the sample value
//! - `{{ $expr }}`: the rule expression

use std::fmt;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::error::{Result, RuleError};
use crate::types::Labels;

static PLACEHOLDER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*\$(?:labels\.([a-zA-Z_][a-zA-Z0-9_]*)|(value)|(expr))\s*\}\}")
        .unwrap_or_else(|_| unreachable!())
});

static ANY_ACTION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{.*?\}\}").unwrap_or_else(|_| unreachable!()));

/// Data available to templates.
#[derive(Debug, Clone, Copy)]
pub struct TemplateData<'a> {
    /// Labels of the alert or result row.
    pub labels: &'a Labels,
    /// Sample value.
    pub value: f64,
    /// Rule expression.
    pub expr: &'a str,
}

/// Renders label and annotation templates.
pub trait TemplateRenderer: Send + Sync + fmt::Debug {
    /// Renders every value of `templates` against `data`.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::Template` if any value fails to render.
    fn render(&self, templates: &Labels, data: &TemplateData<'_>) -> Result<Labels>;

    /// Checks that every value of `templates` is renderable.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::Template` if any value fails to render.
    fn validate(&self, templates: &Labels) -> Result<()> {
        let empty = Labels::new();
        let data = TemplateData {
            labels: &empty,
            value: 0.0,
            expr: "",
        };
        self.render(templates, &data).map(|_| ())
    }
}

/// Placeholder-substitution renderer.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRenderer;

impl DefaultRenderer {
    /// Creates a new renderer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Renders a single template string.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::Template` if the text contains an unsupported action.
    pub fn render_str(&self, text: &str, data: &TemplateData<'_>) -> Result<String> {
        if !text.contains("{{") {
            return Ok(text.to_string());
        }

        let rendered = PLACEHOLDER_REGEX.replace_all(text, |caps: &Captures<'_>| {
            if let Some(name) = caps.get(1) {
                data.labels
                    .get(name.as_str())
                    .cloned()
                    .unwrap_or_default()
            } else if caps.get(2).is_some() {
                format_value(data.value)
            } else {
                data.expr.to_string()
            }
        });

        if let Some(m) = ANY_ACTION_REGEX.find(&rendered) {
            return Err(RuleError::Template {
                reason: format!("unsupported template action {:?} in {text:?}", m.as_str()),
            });
        }
        if rendered.contains("{{") {
            return Err(RuleError::Template {
                reason: format!("unclosed template action in {text:?}"),
            });
        }

        Ok(rendered.into_owned())
    }
}

impl TemplateRenderer for DefaultRenderer {
    fn render(&self, templates: &Labels, data: &TemplateData<'_>) -> Result<Labels> {
        templates
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.render_str(v, data)?)))
            .collect()
    }
}

fn format_value(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        let s = if v > 0.0 { "+Inf" } else { "-Inf" };
        s.to_string()
    } else {
        v.to_string()
    }
}

//! Parameter substitution and runtime template rendering.
//!
//! Two distinct passes operate on workflow text:
//!
//! 1. `render_params` runs once at flow start, before parsing, replacing
//!    `{{ params.<name> }}` placeholders so the stored snapshot is the
//!    literal document that executes. Runtime expressions (`nodes.*`,
//!    `review.*`, `task.*`) are left untouched.
//! 2. `render` runs at node dispatch, evaluating a prompt or role template
//!    against the runtime context.

use crate::error::TemplateError;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

fn params_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\s*params\.(\w+)\s*\}\}").expect("valid pattern"))
}

/// Replaces `{{ params.<name> }}` placeholders with values from `params`.
///
/// Unresolved placeholders are left as-is. The substitution is a pure
/// function of `(dsl, params)` and is idempotent: substituted values are
/// plain text and never re-match the pattern unless a value itself embeds
/// a params placeholder.
#[must_use]
pub fn render_params(dsl: &str, params: &HashMap<String, String>) -> String {
    params_pattern()
        .replace_all(dsl, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            match params.get(key) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Renders a template string against the runtime context.
///
/// Strings without template syntax are returned unchanged without
/// touching the engine.
///
/// # Errors
///
/// Returns an error when the template fails to parse or render; callers
/// decide whether to fall back to the raw string.
pub fn render(template: &str, context: &serde_json::Value) -> Result<String, TemplateError> {
    if !template.contains("{{") && !template.contains("{%") {
        return Ok(template.to_string());
    }

    let env = minijinja::Environment::new();
    env.render_str(template, context)
        .map_err(|e| TemplateError {
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_params() {
        let out = render_params(
            "deploy {{ params.service }} to {{params.env}}",
            &params(&[("service", "api"), ("env", "staging")]),
        );
        assert_eq!(out, "deploy api to staging");
    }

    #[test]
    fn leaves_unresolved_params() {
        let out = render_params("use {{ params.missing }}", &params(&[]));
        assert_eq!(out, "use {{ params.missing }}");
    }

    #[test]
    fn leaves_runtime_expressions_untouched() {
        let dsl = "prompt: '{{ nodes.plan.outputs.plan }} for {{ params.service }}'";
        let out = render_params(dsl, &params(&[("service", "api")]));
        assert_eq!(out, "prompt: '{{ nodes.plan.outputs.plan }} for api'");
    }

    #[test]
    fn substitution_is_pure_and_idempotent() {
        let vars = params(&[("name", "flowforge")]);
        let first = render_params("hello {{ params.name }}", &vars);
        let second = render_params(&first, &vars);
        assert_eq!(first, "hello flowforge");
        assert_eq!(first, second);
    }

    #[test]
    fn renders_runtime_context() {
        let ctx = json!({
            "nodes": { "plan": { "outputs": { "plan": "v1" } } },
            "task": { "title": "Add login" },
        });
        let out = render("Implement {{ nodes.plan.outputs.plan }} ({{ task.title }})", &ctx)
            .expect("render");
        assert_eq!(out, "Implement v1 (Add login)");
    }

    #[test]
    fn plain_strings_pass_through() {
        let out = render("no templates here", &json!({})).expect("render");
        assert_eq!(out, "no templates here");
    }

    #[test]
    fn render_error_reported() {
        let err = render("{{ unclosed", &json!({})).unwrap_err();
        assert!(!err.message.is_empty());
    }
}

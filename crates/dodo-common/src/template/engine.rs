//! minijinja environment with `${...}` variables
//!
//! - Variables: `${...}`
//! - Blocks: `{%...%}`
//! - Comments: `{#...#}`
//! - Escape: `$${...}` renders as a literal `${...}` (shell snippets in
//!   ConfigMaps need this)

use minijinja::syntax::SyntaxConfig;
use minijinja::{Environment, UndefinedBehavior, Value};
use serde::Serialize;

use super::error::TemplateError;
use super::filters;

const ESCAPED_PLACEHOLDER: &str = "\x00__DODO_ESCAPED_DOLLAR_BRACE__\x00";

/// Renders app resources and evaluates constraint expressions
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl TemplateEngine {
    /// Create an engine with `${...}` syntax and strict undefined handling
    pub fn new() -> Result<Self, TemplateError> {
        let syntax = SyntaxConfig::builder()
            .variable_delimiters("${", "}")
            .block_delimiters("{%", "%}")
            .comment_delimiters("{#", "#}")
            .build()
            .map_err(|e| TemplateError::Syntax(e.to_string()))?;

        let mut env = Environment::new();
        env.set_syntax(syntax);
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);

        env.add_filter("default", filters::default_filter);
        env.add_filter("required", filters::required);
        env.add_filter("base64_encode", filters::base64_encode);
        env.add_filter("base64_decode", filters::base64_decode);
        env.add_filter("quote", filters::quote);
        env.add_filter("label", filters::label);

        Ok(Self { env })
    }

    /// Render a template against a serializable context
    pub fn render<S: Serialize>(&self, template: &str, ctx: &S) -> Result<String, TemplateError> {
        let source = template.replace("$${", ESCAPED_PLACEHOLDER);
        let rendered = self
            .env
            .render_str(&source, Value::from_serialize(ctx))?;
        Ok(rendered.replace(ESCAPED_PLACEHOLDER, "${"))
    }

    /// Evaluate a bare expression (no delimiters) and return its truthiness
    pub fn eval_bool<S: Serialize>(&self, expr: &str, ctx: &S) -> Result<bool, TemplateError> {
        let compiled = self.env.compile_expression(expr)?;
        Ok(compiled.eval(Value::from_serialize(ctx))?.is_true())
    }

    /// True if `s` contains anything the engine would interpret
    pub fn has_template_syntax(s: &str) -> bool {
        s.contains("${") || s.contains("{%") || s.contains("{#")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> TemplateEngine {
        TemplateEngine::new().expect("engine builds")
    }

    fn ctx() -> serde_json::Value {
        json!({
            "release": {"namespace": "app-vaultwarden", "appInstanceId": "vaultwarden-abcdef"},
            "input": {
                "subdomain": "bitwarden",
                "network": {"name": "Public", "domain": "example.com"},
                "replicas": 2,
            }
        })
    }

    #[test]
    fn renders_nested_variables() {
        let out = engine()
            .render("host: ${input.subdomain}.${input.network.domain}", &ctx())
            .expect("renders");
        assert_eq!(out, "host: bitwarden.example.com");
    }

    #[test]
    fn keeps_trailing_newline() {
        let out = engine()
            .render("name: ${release.appInstanceId}\n", &ctx())
            .expect("renders");
        assert_eq!(out, "name: vaultwarden-abcdef\n");
    }

    #[test]
    fn undefined_variable_is_an_error() {
        assert!(engine().render("${input.missing}", &ctx()).is_err());
    }

    #[test]
    fn escape_produces_literal() {
        let out = engine()
            .render("PORT=$${PORT:-${input.replicas}}", &ctx())
            .expect("renders");
        assert_eq!(out, "PORT=${PORT:-2}");
    }

    #[test]
    fn blocks_and_yaml_braces_coexist() {
        let template = "values: {}\n{% if input.replicas > 1 %}ha: true\n{% endif %}";
        let out = engine().render(template, &ctx()).expect("renders");
        assert_eq!(out, "values: {}\nha: true\n");
    }

    #[test]
    fn evaluates_constraint_expressions() {
        let engine = engine();
        assert!(engine
            .eval_bool("input.subdomain | length > 0", &ctx())
            .expect("evaluates"));
        assert!(!engine
            .eval_bool("input.replicas > 5", &ctx())
            .expect("evaluates"));
    }

    #[test]
    fn detects_template_syntax() {
        assert!(TemplateEngine::has_template_syntax("${a}"));
        assert!(!TemplateEngine::has_template_syntax("plain"));
    }
}

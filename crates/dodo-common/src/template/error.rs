//! Template error types

use thiserror::Error;

/// Errors that can occur while rendering templates or evaluating expressions
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Template rendering or expression evaluation failed
    #[error("template render error: {0}")]
    Render(#[from] minijinja::Error),

    /// The template environment could not be configured
    #[error("template syntax error: {0}")]
    Syntax(String),

    /// The render context could not be serialized
    #[error("template context error: {0}")]
    Context(String),
}

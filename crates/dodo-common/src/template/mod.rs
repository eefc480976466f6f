//! `${...}` templating for app resources
//!
//! Resource files of an app package are minijinja templates whose variables
//! use `${...}` delimiters so that they read naturally inside YAML:
//!
//! - `${release.namespace}`, `${release.appInstanceId}` - release descriptor
//! - `${global.domain}` - environment configuration
//! - `${input.network.ingressClass}` - derived input values
//! - `{% if %}...{% endif %}`, `{% for %}...{% endfor %}` - control flow
//! - Filters: `default`, `required`, `base64_encode`, `quote`, `label`
//!
//! The same environment evaluates bare expressions for template constraints.

mod engine;
mod error;
mod filters;

pub use engine::TemplateEngine;
pub use error::TemplateError;

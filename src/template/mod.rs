//! Notification template rendering.
//!
//! Templates are text with `{{ ... }}` actions evaluated against a JSON data
//! map:
//!
//! - `{{.name}}`, `{{.user.email}}`, `{{.}}` field access
//! - `{{.name | trim | upper}}` pipelines and `{{replace .s "a" "b"}}` calls
//! - `{{if .x}} ... {{else}} ... {{end}}` and `{{range .items}} ... {{end}}`
//! - `{{include "partial.html"}}` composition
//! - `{{/* comments */}}` and `{{-`/`-}}` whitespace trimming
//!
//! The only helper functions are `upper`, `lower`, `trim`, `replace` and
//! `contains`. Every template name, including names reached through
//! `include`, must resolve inside the template root.
//!
//! # Example
//!
//! ```ignore
//! let renderer = Renderer::with_root("./templates", true)?;
//!
//! // welcome.html: Hello, {{.name}}!
//! let html = renderer.render("welcome.html", &json!({"name": "Ann"})).await?;
//! assert_eq!(html, "Hello, Ann!");
//! ```

mod exec;
mod parse;
mod renderer;

use thiserror::Error;

pub use parse::Template;
pub use renderer::Renderer;

/// Nesting limit for `{{include}}`
pub const MAX_INCLUDE_DEPTH: usize = 10;

/// Template-specific error type
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Template not found: {0}")]
    NotFound(String),

    #[error("Template parse error: {0}")]
    Parse(String),

    #[error("Template execution error: {0}")]
    Execution(String),

    #[error("Template path escapes template root: {0}")]
    PathEscape(String),

    #[error("Template I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for template operations
pub type TemplateResult<T> = Result<T, TemplateError>;

//! Parameter directive rendering.
//!
//! Raw parameter values may contain `$[scope_directive_args]` placeholders.
//! The [`ParameterRenderer`] resolves them per test and region, consulting
//! the cloud for zone, object and secret lookups.

mod directives;
mod password;
mod renderer;

pub use directives::{Directive, Splice};
pub use password::{generate_password, random_digits, random_lowercase, PasswordKind};
pub use renderer::{coerce_to_text, ParameterRenderer, RenderContext};

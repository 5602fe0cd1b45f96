//! Template loading and nested stack graph.

mod document;
mod graph;

pub use document::{load_document, parse_document, yaml_to_json};
pub use graph::{reference_to_relative, Template, TemplateLoader, NESTED_STACK_TYPE};

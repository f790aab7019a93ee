//! Jinja rendering of node SQL against a resolved graph
//!
//! This crate handles:
//! - `ref()` / `source()` / `var()` / `config()` and the `target` global
//! - Inlining ephemeral models as CTEs
//! - Collecting the relations a compiled query reads from
//!
//! Rendering only reads node qualifiers. Whether a node was deferred has
//! already been decided by the time anything here runs.

pub mod context;
pub mod functions;
pub mod renderer;

pub use context::{RenderContext, RenderContextBuilder, TargetContext};
pub use functions::ephemeral_cte_name;
pub use renderer::{RenderError, RenderedNode, Renderer};

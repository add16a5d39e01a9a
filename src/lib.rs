//! Stepwise: a declarative step-execution engine.
//!
//! Tests are ordered lists of steps, each naming an action and a bag
//! of properties. Properties are interpolated against a variable
//! scope (`$(expr)` markers evaluate CEL expressions), and
//! control-flow actions (`if`, `for-each-*`, `run-steps`, `pipe`,
//! `all`, `or`) re-enter the step runner to build nested trees.

pub mod actions;
pub mod callbacks;
pub mod config;
pub mod error;
pub mod expression;
pub mod model;
pub mod properties;
pub mod registry;
pub mod runner;
pub mod scope;
pub mod step;
pub mod step_runner;
pub mod value;

pub use config::*;
pub use error::{PropertyError, RunError};
pub use model::*;
pub use registry::{Action, ActionContext, ActionDescriptor, ActionRegistry};
pub use runner::*;
pub use scope::Scope;
pub use step::{Step, StepList};
pub use step_runner::{StepCallback, StepRunner, StepStatus};
pub use value::{Value, Variables};

/// Crate version, reported to tests as `AGENT_VERSION`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

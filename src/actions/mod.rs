//! Built-in actions.
//!
//! Control-flow actions re-enter the step runner with a derived step
//! numbering; basic actions are leaves.

mod basic;
mod control;

use crate::registry::ActionRegistry;

/// Register every built-in action into `registry`.
pub fn register_builtins(registry: &mut ActionRegistry) {
    control::register(registry);
    basic::register(registry);
}

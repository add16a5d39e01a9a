//! The variable scope of a single test run.

use crate::expression;
use crate::value::{Lazy, Value, Variables};
use anyhow::Result;
use dashmap::DashMap;
use std::net::UdpSocket;
use std::sync::Arc;
use tracing::debug;

/// Scope variable holding the number of the step currently running.
pub const STEP_NUMBER_VARIABLE: &str = "STEP_NUMBER";

/// Normalize a variable name so it can be used as an expression
/// identifier: `()[]{}-:=/\` and whitespace become `_`.
pub fn fix_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_whitespace()
                || matches!(c, '(' | ')' | '[' | ']' | '{' | '}' | '-' | ':' | '=' | '/' | '\\')
            {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// Mutable named-value store shared by the runner and the actions of
/// one test run.
///
/// `Scope` is a handle: clones share the same variables. Concurrent
/// test runs must each create their own scope.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    variables: Arc<DashMap<String, Value>>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a scope pre-populated with `variables`.
    pub fn with_variables(variables: &Variables) -> Self {
        let scope = Self::new();
        scope.extend(variables);
        scope
    }

    /// Store `value` under the normalized form of `name`, replacing
    /// any previous value.
    pub fn put(&self, name: &str, value: impl Into<Value>) {
        self.variables.insert(fix_name(name), value.into());
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.variables
            .get(&fix_name(name))
            .map(|entry| entry.value().clone())
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.variables.remove(&fix_name(name)).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(&fix_name(name))
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Merge `variables` into the scope. Merged values persist.
    pub fn extend(&self, variables: &Variables) {
        for (name, value) in variables {
            self.put(name, value.clone());
        }
    }

    /// Copy of all variables, used as an expression context.
    pub fn snapshot(&self) -> Variables {
        self.variables
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Evaluate a raw expression against the current variables.
    pub fn evaluate(&self, code: &str) -> Result<Value> {
        expression::evaluate(code, &self.snapshot())
    }

    /// Look up a variable by dotted path, e.g. `user.address.city`.
    ///
    /// A variable stored under exactly that name wins; otherwise the
    /// path is evaluated as an expression.
    pub fn lookup(&self, path: &str) -> Result<Value> {
        match self.get(path) {
            Some(value) => Ok(value.resolved()),
            None => self.evaluate(path),
        }
    }

    /// Current step number, if a step is running.
    pub fn step_number(&self) -> Option<String> {
        self.get(STEP_NUMBER_VARIABLE).map(|v| v.to_string())
    }

    /// Add every process environment variable under its normalized
    /// name.
    pub fn seed_environment(&self) {
        let mut count = 0;
        for (key, value) in std::env::vars() {
            self.put(&key, value);
            count += 1;
        }
        debug!("Seeded {} environment variables", count);
    }

    /// Add facts about the machine running the test.
    ///
    /// `AGENT_IP` is lazy and only resolved when an expression uses it.
    pub fn seed_agent_facts(&self) {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        self.put("AGENT_HOSTNAME", host);
        self.put("AGENT_OS", std::env::consts::OS);
        self.put("AGENT_ARCH", std::env::consts::ARCH);
        self.put("AGENT_VERSION", crate::VERSION);
        self.put("AGENT_IP", Lazy::new(|| Value::from(local_ip())));
    }
}

/// Address of the interface used for outbound traffic. Connecting a
/// UDP socket sends no packets.
fn local_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

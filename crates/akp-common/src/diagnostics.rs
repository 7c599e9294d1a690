//! Per-operation diagnostics
//!
//! A controller operation runs several sub-steps. Failures and warnings from
//! each are collected here so the caller sees all of them, not only the first.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Diagnostic severity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// The operation failed
    Error,
    /// The operation succeeded but something needs attention
    Warning,
}

/// One diagnostic message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Severity
    pub severity: Severity,
    /// Short summary, e.g. "Unable to create IP allow list"
    pub summary: String,
    /// Full detail, including operation, entity and instance id
    pub detail: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{}: {}: {}", tag, self.summary, self.detail)
    }
}

/// Where a diagnostic came from
#[derive(Clone, Debug, Default)]
pub struct DiagContext {
    /// create, read, update, delete, import
    pub operation: String,
    /// Resource type and id, e.g. "ip_allow_list 6f0c..."
    pub entity: String,
    /// Target instance id
    pub instance_id: Option<String>,
}

impl DiagContext {
    /// Build a context
    pub fn new(operation: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            entity: entity.into(),
            instance_id: None,
        }
    }

    /// Attach the instance id
    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    fn render(&self, message: &str) -> String {
        match &self.instance_id {
            Some(instance) => format!(
                "{} {} (instance_id={}): {}",
                self.operation, self.entity, instance, message
            ),
            None => format!("{} {}: {}", self.operation, self.entity, message),
        }
    }
}

/// Ordered collection of diagnostics
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics(Vec<Diagnostic>);

impl Diagnostics {
    /// Empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error with its context
    pub fn add_error(&mut self, ctx: &DiagContext, summary: impl Into<String>, err: &Error) {
        self.0.push(Diagnostic {
            severity: Severity::Error,
            summary: summary.into(),
            detail: ctx.render(&err.to_string()),
        });
    }

    /// Record a warning with its context
    pub fn add_warning(
        &mut self,
        ctx: &DiagContext,
        summary: impl Into<String>,
        detail: impl AsRef<str>,
    ) {
        self.0.push(Diagnostic {
            severity: Severity::Warning,
            summary: summary.into(),
            detail: ctx.render(detail.as_ref()),
        });
    }

    /// Append everything from another collection
    pub fn extend(&mut self, other: Diagnostics) {
        self.0.extend(other.0);
    }

    /// True if any diagnostic is an error
    pub fn has_error(&self) -> bool {
        self.0.iter().any(|d| d.severity == Severity::Error)
    }

    /// Errors only
    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter().filter(|d| d.severity == Severity::Error)
    }

    /// Warnings only
    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter().filter(|d| d.severity == Severity::Warning)
    }

    /// All diagnostics in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter()
    }

    /// Number of diagnostics
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

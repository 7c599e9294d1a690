//! Result shape of controller operations
//!
//! The IaC engine owns state. Every controller operation hands back the state
//! to commit (or `None` to drop it) together with the diagnostics gathered
//! along the way, so a failure in a late step can still commit what earlier
//! steps created.

use serde::Serialize;

use akp_common::{DiagContext, Diagnostics, Error};

/// Outcome of one controller operation
#[derive(Debug)]
pub struct Outcome<T> {
    /// State to commit; `None` removes the resource from state
    pub state: Option<T>,
    /// Errors and warnings from every sub-step
    pub diagnostics: Diagnostics,
    /// Committed state is partial; replace the resource on the next apply
    pub tainted: bool,
    error: Option<Error>,
}

impl<T> Outcome<T> {
    /// Successful operation committing `state`
    pub fn ok(state: T) -> Self {
        Self {
            state: Some(state),
            diagnostics: Diagnostics::new(),
            tainted: false,
            error: None,
        }
    }

    /// Successful operation that removes the resource
    pub fn removed() -> Self {
        Self {
            state: None,
            diagnostics: Diagnostics::new(),
            tainted: false,
            error: None,
        }
    }

    /// Failed operation that commits nothing
    pub fn failed(ctx: &DiagContext, summary: &str, err: Error) -> Self {
        let mut outcome = Self::removed();
        outcome.fail(ctx, summary, err);
        outcome
    }

    /// Failed operation that still commits `state`
    pub fn partial(state: T, ctx: &DiagContext, summary: &str, err: Error) -> Self {
        let mut outcome = Self::ok(state);
        outcome.fail(ctx, summary, err);
        outcome
    }

    /// Record an error; the first one becomes the operation's error
    pub fn fail(&mut self, ctx: &DiagContext, summary: &str, err: Error) {
        self.diagnostics.add_error(ctx, summary, &err);
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Record a warning
    pub fn warn(&mut self, ctx: &DiagContext, summary: &str, detail: impl AsRef<str>) {
        self.diagnostics.add_warning(ctx, summary, detail);
    }

    /// Mark the committed state for replacement
    pub fn taint(mut self) -> Self {
        self.tainted = true;
        self
    }

    /// True when any error was recorded
    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }

    /// First recorded error
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Collapse into the state or the first error
    pub fn into_result(self) -> Result<Option<T>, Error> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.state),
        }
    }
}

/// What applying a declaration to existing state would do
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlanAction {
    /// No state yet
    Create,
    /// Change in place
    Update,
    /// Destroy then create because an immutable field changed
    Replace {
        /// Immutable fields that differ
        fields: Vec<&'static str>,
    },
    /// Nothing to do
    NoOp,
}

impl PlanAction {
    /// Build a plan from the changed immutable fields and whether anything
    /// else changed
    pub fn from_changes(replace_fields: Vec<&'static str>, changed: bool) -> Self {
        if !replace_fields.is_empty() {
            Self::Replace {
                fields: replace_fields,
            }
        } else if changed {
            Self::Update
        } else {
            Self::NoOp
        }
    }
}

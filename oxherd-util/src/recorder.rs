//! Error recorders for complex asynchronous operations.
//!
//! Fan-out call sites run many sub-tasks in parallel and need a single
//! outcome at the end. The recorders here are mutex-guarded and safe to
//! share across tasks.

use oxherd_errors::OxherdError;
use parking_lot::Mutex;
use tracing::error;

/// A sink for errors produced by parallel sub-tasks.
pub trait ErrorRecorder: Send + Sync {
    /// Record a possible error. Does nothing for `Ok`.
    fn record<T>(&self, result: Result<T, OxherdError>) {
        if let Err(e) = result {
            self.record_error(e);
        }
    }

    /// Record an error.
    fn record_error(&self, err: OxherdError);

    /// True if any error was ever recorded.
    fn has_errors(&self) -> bool;

    /// The aggregate outcome, or `None` if nothing failed.
    fn error(&self) -> Option<OxherdError>;
}

/// Records the first error and logs the others.
#[derive(Default)]
pub struct FirstErrorRecorder {
    inner: Mutex<FirstErrorInner>,
}

#[derive(Default)]
struct FirstErrorInner {
    error_count: usize,
    first_error: Option<OxherdError>,
}

impl FirstErrorRecorder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ErrorRecorder for FirstErrorRecorder {
    fn record_error(&self, err: OxherdError) {
        let mut inner = self.inner.lock();
        inner.error_count += 1;
        if inner.error_count == 1 {
            inner.first_error = Some(err);
        } else {
            error!(count = inner.error_count, %err, "additional error");
        }
    }

    fn has_errors(&self) -> bool {
        self.inner.lock().error_count > 0
    }

    fn error(&self) -> Option<OxherdError> {
        self.inner.lock().first_error.clone()
    }
}

/// Records every error; the aggregate is a [`OxherdError::Partial`] whose
/// message joins the individual errors with newlines.
#[derive(Default)]
pub struct AllErrorRecorder {
    errors: Mutex<Vec<String>>,
}

impl AllErrorRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The recorded error strings, in arrival order.
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }
}

impl ErrorRecorder for AllErrorRecorder {
    fn record_error(&self, err: OxherdError) {
        self.errors.lock().push(err.to_string());
    }

    fn has_errors(&self) -> bool {
        !self.errors.lock().is_empty()
    }

    fn error(&self) -> Option<OxherdError> {
        let errors = self.errors.lock();
        if errors.is_empty() {
            return None;
        }
        Some(OxherdError::Partial {
            errors: errors.join("\n"),
        })
    }
}

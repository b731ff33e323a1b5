//! LIFO compensation stack.

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::SagaError;

/// Undo closure registered while a workflow step runs. Receives the
/// cancellation token of the failing execution.
pub type CompensationFn =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<(), SagaError>> + Send>;

struct CompensationEntry {
    name: String,
    undo: CompensationFn,
}

/// Named undo actions for one saga execution attempt, popped strictly
/// in LIFO order.
#[derive(Default)]
pub struct CompensationStack {
    entries: Vec<CompensationEntry>,
}

impl CompensationStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an undo action. The name is used for logging and the
    /// post-compensation report.
    pub fn register(&mut self, name: impl Into<String>, undo: CompensationFn) {
        self.entries.push(CompensationEntry {
            name: name.into(),
            undo,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered action names, oldest first.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    /// Run all undo actions in LIFO order.
    ///
    /// Errors are aggregated in the report unless `stop_on_first_error`
    /// is set, in which case remaining actions are skipped.
    pub async fn compensate(
        mut self,
        cancellation: CancellationToken,
        stop_on_first_error: bool,
    ) -> CompensationReport {
        let mut report = CompensationReport::default();

        while let Some(entry) = self.entries.pop() {
            info!(action = %entry.name, "Running compensation");
            match (entry.undo)(cancellation.clone()).await {
                Ok(()) => report.executed.push(entry.name),
                Err(e) => {
                    error!(action = %entry.name, error = %e, "Compensation failed");
                    report.failed.push((entry.name, e.to_string()));
                    if stop_on_first_error {
                        report.skipped = self.entries.len();
                        break;
                    }
                }
            }
        }
        report
    }
}

/// Outcome of a compensation run: which actions ran and which failed.
#[derive(Debug, Clone, Default)]
pub struct CompensationReport {
    /// Successfully executed action names, in execution (LIFO) order.
    pub executed: Vec<String>,
    /// Failed actions with their error messages.
    pub failed: Vec<(String, String)>,
    /// Actions skipped because of `stop_on_first_error`.
    pub skipped: usize,
}

impl CompensationReport {
    pub fn succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total_attempted(&self) -> usize {
        self.executed.len() + self.failed.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    fn recording(
        order: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
        fail: bool,
    ) -> CompensationFn {
        let order = Arc::clone(order);
        Box::new(move |_cancel| {
            Box::pin(async move {
                order.lock().unwrap().push(name);
                if fail {
                    Err(SagaError::action(format!("{} failed", name)))
                } else {
                    Ok(())
                }
            })
        })
    }

    #[tokio::test]
    async fn test_lifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = CompensationStack::new();
        stack.register("first", recording(&order, "first", false));
        stack.register("second", recording(&order, "second", false));
        stack.register("third", recording(&order, "third", false));

        let report = stack
            .compensate(CancellationToken::new(), false)
            .await;
        assert_eq!(*order.lock().unwrap(), vec!["third", "second", "first"]);
        assert_eq!(report.executed, vec!["third", "second", "first"]);
        assert!(report.succeeded());
    }

    #[tokio::test]
    async fn test_errors_aggregated_when_continuing() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = CompensationStack::new();
        stack.register("a", recording(&order, "a", false));
        stack.register("b", recording(&order, "b", true));
        stack.register("c", recording(&order, "c", false));

        let report = stack.compensate(CancellationToken::new(), false).await;
        assert_eq!(*order.lock().unwrap(), vec!["c", "b", "a"]);
        assert_eq!(report.executed, vec!["c", "a"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.total_attempted(), 3);
    }

    #[tokio::test]
    async fn test_stop_on_first_error_skips_rest() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = CompensationStack::new();
        stack.register("a", recording(&order, "a", false));
        stack.register("b", recording(&order, "b", true));
        stack.register("c", recording(&order, "c", false));

        let report = stack.compensate(CancellationToken::new(), true).await;
        assert_eq!(*order.lock().unwrap(), vec!["c", "b"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_cancellation_token_propagated() {
        let observed = Arc::new(AtomicBool::new(false));
        let mut stack = CompensationStack::new();
        let observed_in = Arc::clone(&observed);
        stack.register(
            "watcher",
            Box::new(move |cancel| {
                Box::pin(async move {
                    observed_in.store(cancel.is_cancelled(), Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        let token = CancellationToken::new();
        token.cancel();
        stack.compensate(token, false).await;
        assert!(observed.load(Ordering::SeqCst));
    }
}

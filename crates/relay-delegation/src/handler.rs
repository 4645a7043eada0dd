//! Task handlers and the per-type registry.
//!
//! Dispatch is keyed by the envelope's `task_type`. A handler returns an
//! explicit outcome: `Ok(results)` becomes a `completed` response and
//! `Err(TaskError)` a `failed` one, so handler failures never unwind
//! through the delegate loop.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{Map, Value};

use relay_protocol::{TaskEnvelope, TaskError};

use crate::ProgressReporter;

pub type HandlerOutcome = Result<Option<Map<String, Value>>, TaskError>;

/// Application code executing one kind of task.
///
/// Handlers for distinct entries may run concurrently, so implementations
/// must be reentrant.
pub trait TaskHandler: Send + Sync {
    fn handle<'a>(
        &'a self,
        task: &'a TaskEnvelope,
        progress: ProgressReporter,
    ) -> Pin<Box<dyn Future<Output = HandlerOutcome> + Send + 'a>>;
}

/// Adapter turning an async closure into a `TaskHandler`.
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TaskEnvelope, ProgressReporter) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    FnHandler(f)
}

impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskEnvelope, ProgressReporter) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    fn handle<'a>(
        &'a self,
        task: &'a TaskEnvelope,
        progress: ProgressReporter,
    ) -> Pin<Box<dyn Future<Output = HandlerOutcome> + Send + 'a>> {
        Box::pin((self.0)(task.clone(), progress))
    }
}

/// Maps task types to handlers. The last registration for a type wins.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `task_type`, returning `true` if it replaced
    /// an earlier registration.
    pub fn register(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) -> bool {
        let task_type = task_type.into();
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_type.clone(), handler)
            .is_some();
        tracing::info!(task_type = %task_type, replaced, "Registered task handler");
        replaced
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_type)
            .cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.get(task_type).is_some()
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}

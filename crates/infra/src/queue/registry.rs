//! Worker dispatch registry: task type -> handler.
//!
//! Built once at startup, read-only afterwards. Handlers are external
//! collaborators (job board fetchers, the match scorer, CSV rendering, email
//! delivery); the queue only knows their shape.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use taskq_core::{DomainError, Payload, TaskType};

/// Failure reported by a handler. The message ends up in `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<DomainError> for HandlerError {
    fn from(err: DomainError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Executes one task type.
///
/// Must be safe to run more than once for the same payload: delivery is
/// at-least-once.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, payload: Payload) -> Result<Payload, HandlerError>;
}

/// Handler backed by an async closure. See [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Turn `|payload| async move { ... }` into a [`TaskHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload, HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload, HandlerError>> + Send + 'static,
{
    async fn handle(&self, payload: Payload) -> Result<Payload, HandlerError> {
        (self.f)(payload).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate handler for task type {0}")]
    DuplicateHandler(TaskType),
}

/// Registry of handlers (task type -> handler).
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a task type. A second registration for the same
    /// type is rejected.
    pub fn register<H>(&mut self, task_type: TaskType, handler: H) -> Result<(), RegistryError>
    where
        H: TaskHandler + 'static,
    {
        self.register_arc(task_type, Arc::new(handler))
    }

    pub fn register_arc(
        &mut self,
        task_type: TaskType,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&task_type) {
            return Err(RegistryError::DuplicateHandler(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<H>(mut self, task_type: TaskType, handler: H) -> Result<Self, RegistryError>
    where
        H: TaskHandler + 'static,
    {
        self.register(task_type, handler)?;
        Ok(self)
    }

    pub fn get(&self, task_type: TaskType) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type)
    }

    pub fn registered_types(&self) -> Vec<TaskType> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }

    /// Task types with no handler; tasks of these types can never succeed here.
    pub fn missing_types(&self) -> Vec<TaskType> {
        TaskType::ALL
            .into_iter()
            .filter(|t| !self.handlers.contains_key(t))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.registered_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> impl TaskHandler {
        handler_fn(|payload: Payload| async move { Ok(payload) })
    }

    #[tokio::test]
    async fn registered_handler_is_found_and_runs() {
        let registry = HandlerRegistry::new()
            .with(TaskType::CsvGeneration, echo())
            .unwrap();

        let handler = registry.get(TaskType::CsvGeneration).unwrap();
        let out = handler
            .handle(Payload::new(serde_json::json!({"rows": 3})))
            .await
            .unwrap();
        assert_eq!(out, Payload::new(serde_json::json!({"rows": 3})));

        assert!(registry.get(TaskType::EmailDelivery).is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register(TaskType::Matching, echo()).unwrap();

        let err = registry.register(TaskType::Matching, echo()).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateHandler(TaskType::Matching));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn missing_types_lists_unregistered_tags() {
        let registry = HandlerRegistry::new()
            .with(TaskType::JobFetch, echo())
            .unwrap()
            .with(TaskType::Matching, echo())
            .unwrap();

        assert_eq!(
            registry.missing_types(),
            vec![TaskType::CsvGeneration, TaskType::EmailDelivery]
        );
        assert_eq!(
            registry.registered_types(),
            vec![TaskType::JobFetch, TaskType::Matching]
        );
    }

    #[tokio::test]
    async fn payload_decode_errors_become_handler_errors() {
        let handler = handler_fn(|payload: Payload| async move {
            let n: u64 = payload.decode()?;
            Ok::<_, HandlerError>(Payload::new(serde_json::json!(n + 1)))
        });

        let err = handler
            .handle(Payload::new(serde_json::json!("x")))
            .await
            .unwrap_err();
        assert!(err.message().contains("decode failed"));
    }
}

//! Operation registry and guarded dispatch.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use metrics::{counter, histogram};
use serde_json::Value;
use statelink_core::protocol::MessageType;
use tracing::{error, warn};

use crate::errors::{HANDLER_NOT_FOUND, RouterError};
use crate::types::{OperationRequest, operation_key};

/// Maximum time a single handler is allowed to run.
pub const HANDLER_TIMEOUT: Duration = Duration::from_secs(60);

/// Operation dispatches (counter, labels: operation).
pub const OPERATION_REQUESTS_TOTAL: &str = "operation_requests_total";
/// Failed operation dispatches (counter, labels: operation, code).
pub const OPERATION_ERRORS_TOTAL: &str = "operation_errors_total";
/// Operation handler latency (histogram, labels: operation).
pub const OPERATION_DURATION_SECONDS: &str = "operation_duration_seconds";

/// Implemented by every `fileSystem`/`git`/`prompt`/`config` handler.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Execute the operation.
    async fn handle(&self, request: OperationRequest) -> Result<Value, RouterError>;
}

/// Maps `"<type>.<operation>"` to a handler.
///
/// Dispatch is unguarded: callers bound it with [`run_guarded`] once, at the
/// router boundary.
pub struct OperationRegistry {
    handlers: HashMap<String, Arc<dyn OperationHandler>>,
}

impl OperationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for one operation of an operation-carrying type.
    pub fn register(
        &mut self,
        kind: MessageType,
        operation: &str,
        handler: impl OperationHandler + 'static,
    ) {
        debug_assert!(kind.carries_operation(), "{kind} does not carry operations");
        let _ = self
            .handlers
            .insert(operation_key(kind, operation), Arc::new(handler));
    }

    /// Run the handler registered for `request`.
    pub async fn dispatch(&self, request: OperationRequest) -> Result<Value, RouterError> {
        let key = request.key();
        counter!(OPERATION_REQUESTS_TOTAL, "operation" => key.clone()).increment(1);

        let Some(handler) = self.handlers.get(&key).cloned() else {
            counter!(OPERATION_ERRORS_TOTAL, "operation" => key.clone(), "code" => HANDLER_NOT_FOUND).increment(1);
            return Err(RouterError::NotFound {
                message: format!(
                    "No handler for {} operation '{}'",
                    request.kind, request.operation
                ),
            });
        };

        let start = Instant::now();
        let result = handler.handle(request).await;

        if let Err(ref err) = result {
            counter!(OPERATION_ERRORS_TOTAL, "operation" => key.clone(), "code" => err.code()).increment(1);
        }
        let duration = start.elapsed();
        histogram!(OPERATION_DURATION_SECONDS, "operation" => key.clone()).record(duration.as_secs_f64());
        if duration.as_secs() >= 5 {
            warn!(operation = %key, duration_secs = duration.as_secs_f64(), "slow operation");
        }
        result
    }

    /// All registered keys (sorted).
    pub fn operations(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.handlers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Whether a handler is registered for `kind.operation`.
    pub fn has_handler(&self, kind: MessageType, operation: &str) -> bool {
        self.handlers.contains_key(&operation_key(kind, operation))
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive `fut` under `timeout`, turning a panic into an execution error.
pub async fn run_guarded<F>(label: &str, timeout: Duration, fut: F) -> Result<Value, RouterError>
where
    F: Future<Output = Result<Value, RouterError>>,
{
    match tokio::time::timeout(timeout, AssertUnwindSafe(fut).catch_unwind()).await {
        Ok(Ok(result)) => result,
        Ok(Err(payload)) => {
            error!(label, panic = %panic_message(payload.as_ref()), "handler panicked");
            Err(RouterError::execution(format!("handler for '{label}' panicked")))
        }
        Err(_elapsed) => {
            error!(label, "handler timed out after {timeout:?}");
            Err(RouterError::Timeout {
                message: format!("Handler for '{label}' timed out"),
            })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

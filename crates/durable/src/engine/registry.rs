//! Orchestration registry for type-erased orchestrator lookup
//!
//! The registry maps orchestration names to orchestrators that take and
//! return JSON, so the dispatcher can run them without knowing the concrete
//! type.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::orchestration::{OrchestrationContext, OrchestrationError, Orchestrator};

/// Future returned by a type-erased orchestrator
pub type OrchestrationFuture = BoxFuture<'static, Result<Value, OrchestrationError>>;

/// Type-erased orchestrator interface
///
/// All inputs and outputs are JSON.
pub trait AnyOrchestrator: Send + Sync {
    /// Registered name
    fn name(&self) -> &str;

    /// Create the orchestrator future for one replay
    fn start(&self, ctx: OrchestrationContext, input: Value) -> OrchestrationFuture;
}

/// Wrapper to implement AnyOrchestrator for any Orchestrator
struct OrchestratorWrapper<O: Orchestrator> {
    inner: Arc<O>,
}

impl<O: Orchestrator> AnyOrchestrator for OrchestratorWrapper<O> {
    fn name(&self) -> &str {
        O::NAME
    }

    fn start(&self, ctx: OrchestrationContext, input: Value) -> OrchestrationFuture {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let typed_input: O::Input = serde_json::from_value(input)?;
            let output = inner.run(ctx, typed_input).await?;
            Ok(serde_json::to_value(output)?)
        })
    }
}

/// Orchestrator backed by a plain async function
struct FnOrchestrator<F> {
    name: String,
    func: F,
}

impl<F, Fut> AnyOrchestrator for FnOrchestrator<F>
where
    F: Fn(OrchestrationContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, OrchestrationError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self, ctx: OrchestrationContext, input: Value) -> OrchestrationFuture {
        Box::pin((self.func)(ctx, input))
    }
}

/// Registry of orchestrators by name
#[derive(Clone, Default)]
pub struct OrchestrationRegistry {
    orchestrators: HashMap<String, Arc<dyn AnyOrchestrator>>,
}

impl OrchestrationRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed orchestrator under `O::NAME`
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut registry = OrchestrationRegistry::new();
    /// registry.register(GreetingOrchestrator);
    /// ```
    pub fn register<O: Orchestrator>(&mut self, orchestrator: O) -> &mut Self {
        self.orchestrators.insert(
            O::NAME.to_string(),
            Arc::new(OrchestratorWrapper {
                inner: Arc::new(orchestrator),
            }),
        );
        self
    }

    /// Register an async function as an orchestrator
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, func: F) -> &mut Self
    where
        F: Fn(OrchestrationContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, OrchestrationError>> + Send + 'static,
    {
        let name = name.into();
        self.orchestrators
            .insert(name.clone(), Arc::new(FnOrchestrator { name, func }));
        self
    }

    /// Check if an orchestration is registered
    pub fn contains(&self, name: &str) -> bool {
        self.orchestrators.contains_key(name)
    }

    /// Look up an orchestrator by name
    pub fn get(&self, name: &str) -> Result<Arc<dyn AnyOrchestrator>, RegistryError> {
        self.orchestrators
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownOrchestration(name.to_string()))
    }

    /// Get the number of registered orchestrations
    pub fn len(&self) -> usize {
        self.orchestrators.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.orchestrators.is_empty()
    }

    /// Get all registered orchestration names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.orchestrators.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for OrchestrationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestrationRegistry")
            .field("orchestrations", &self.orchestrators.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    /// Orchestration not registered
    #[error("unknown orchestration: {0}")]
    UnknownOrchestration(String),

    /// Activity not registered
    #[error("unknown activity: {0}")]
    UnknownActivity(String),
}

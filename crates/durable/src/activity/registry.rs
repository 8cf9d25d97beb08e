//! Activity registry for type-erased activity lookup

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use super::{Activity, ActivityContext, ActivityError};

/// Future returned by a type-erased activity
pub type ActivityFuture = BoxFuture<'static, Result<Value, ActivityError>>;

/// Type-erased activity interface
pub trait AnyActivity: Send + Sync {
    /// Registered name
    fn name(&self) -> &str;

    /// Run the activity with JSON input
    fn execute(&self, ctx: ActivityContext, input: Value) -> ActivityFuture;
}

struct ActivityWrapper<A: Activity> {
    inner: Arc<A>,
}

impl<A: Activity> AnyActivity for ActivityWrapper<A> {
    fn name(&self) -> &str {
        A::NAME
    }

    fn execute(&self, ctx: ActivityContext, input: Value) -> ActivityFuture {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let typed_input: A::Input = serde_json::from_value(input)?;
            let output = inner.execute(&ctx, typed_input).await?;
            Ok(serde_json::to_value(output)?)
        })
    }
}

struct FnActivity<F> {
    name: String,
    func: F,
}

impl<F, Fut> AnyActivity for FnActivity<F>
where
    F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, ctx: ActivityContext, input: Value) -> ActivityFuture {
        Box::pin((self.func)(ctx, input))
    }
}

/// Registry of activities by name
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    activities: HashMap<String, Arc<dyn AnyActivity>>,
}

impl ActivityRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed activity under `A::NAME`
    pub fn register<A: Activity>(&mut self, activity: A) -> &mut Self {
        self.activities.insert(
            A::NAME.to_string(),
            Arc::new(ActivityWrapper {
                inner: Arc::new(activity),
            }),
        );
        self
    }

    /// Register an async function as an activity
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, func: F) -> &mut Self
    where
        F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
    {
        let name = name.into();
        self.activities
            .insert(name.clone(), Arc::new(FnActivity { name, func }));
        self
    }

    /// Check if an activity is registered
    pub fn contains(&self, name: &str) -> bool {
        self.activities.contains_key(name)
    }

    /// Look up an activity by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn AnyActivity>> {
        self.activities.get(name).cloned()
    }

    /// Get the number of registered activities
    pub fn len(&self) -> usize {
        self.activities.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }
}

impl fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("activities", &self.activities.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct Square;

    #[async_trait]
    impl Activity for Square {
        const NAME: &'static str = "square";
        type Input = i64;
        type Output = i64;

        async fn execute(&self, _ctx: &ActivityContext, n: i64) -> Result<i64, ActivityError> {
            Ok(n * n)
        }
    }

    async fn shout(_ctx: ActivityContext, input: Value) -> Result<Value, ActivityError> {
        let text: String = serde_json::from_value(input)?;
        Ok(json!(text.to_uppercase()))
    }

    fn ctx() -> ActivityContext {
        ActivityContext::new("inst-1", "exec-1", 0, "test")
    }

    #[tokio::test]
    async fn test_typed_activity_round_trips_json() {
        let mut registry = ActivityRegistry::new();
        registry.register(Square);

        let activity = registry.get("square").unwrap();
        let result = activity.execute(ctx(), json!(7)).await.unwrap();

        assert_eq!(result, json!(49));
    }

    #[tokio::test]
    async fn test_fn_activity() {
        let mut registry = ActivityRegistry::new();
        registry.register_fn("shout", shout);

        let result = registry
            .get("shout")
            .unwrap()
            .execute(ctx(), json!("hi"))
            .await
            .unwrap();

        assert_eq!(result, json!("HI"));
    }

    #[tokio::test]
    async fn test_bad_input_is_serialization_error() {
        let mut registry = ActivityRegistry::new();
        registry.register(Square);

        let err = registry
            .get("square")
            .unwrap()
            .execute(ctx(), json!("not a number"))
            .await
            .unwrap_err();

        assert_eq!(
            err.error_type.as_deref(),
            Some(crate::history::error_types::SERIALIZATION)
        );
    }

    #[test]
    fn test_unknown_activity() {
        let registry = ActivityRegistry::new();
        assert!(registry.get("missing").is_none());
        assert!(registry.is_empty());
    }
}

//! Immutable name → handler registries for orchestrations and activities.
//!
//! Both registries use the same `Registry<H>` type. They are assembled once
//! through a builder, frozen into an `Arc`'d map and then shared read-only by
//! the runtime, the instance manager and every worker task.

use std::collections::HashMap;
use std::sync::Arc;

use super::{ActivityContext, ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::_typed_codec::Codec;
use crate::OrchestrationContext;

/// Generic immutable registry. Cloning shares the underlying map.
pub struct Registry<H: ?Sized> {
    pub(crate) inner: Arc<HashMap<String, Arc<H>>>,
}

// Manual Clone impl since H: ?Sized doesn't auto-derive Clone
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
        }
    }
}

/// Generic registry builder. Duplicate names are collected as errors and
/// reported by [`RegistryBuilder::build_result`].
pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, Arc<H>>,
    errors: Vec<String>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

// ============================================================================
// Generic Registry Implementation
// ============================================================================

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Start a builder pre-populated with this registry's handlers.
    pub fn builder_from(reg: &Registry<H>) -> RegistryBuilder<H> {
        RegistryBuilder {
            map: reg.inner.as_ref().clone(),
            errors: Vec::new(),
        }
    }

    /// Look up a handler by name.
    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        let result = self.inner.get(name).cloned();
        if result.is_none() {
            self.log_registry_miss(name);
        }
        result
    }

    /// List all registered names, sorted.
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    fn log_registry_miss(&self, name: &str) {
        tracing::debug!(
            target: "duraflow::runtime::registry",
            requested_name = %name,
            registered_count = self.inner.len(),
            registered_names = ?self.list_names(),
            "Registry lookup miss"
        );
    }
}

// ============================================================================
// Generic Builder Implementation
// ============================================================================

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn build(self) -> Registry<H> {
        Registry {
            inner: Arc::new(self.map),
        }
    }

    /// Build the registry, returning an error if there were any registration errors.
    ///
    /// # Errors
    ///
    /// Returns all registration errors joined with `; `.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    fn merge_registry(mut self, other: Registry<H>, error_prefix: &str) -> Self {
        for (name, handler) in other.inner.iter() {
            if self.map.contains_key(name) {
                self.errors.push(format!("duplicate {error_prefix} in merge: {name}"));
            } else {
                self.map.insert(name.clone(), Arc::clone(handler));
            }
        }
        self
    }

    /// Insert `handler` unless `name` is taken, in which case record an error.
    fn insert_unique(&mut self, name: String, handler: Arc<H>, error_prefix: &str) {
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate {error_prefix} registration: {name}"));
        } else {
            self.map.insert(name, handler);
        }
    }
}

// ============================================================================
// Orchestration Builder - Specialized Methods
// ============================================================================

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert_unique(name.into(), Arc::new(FnOrchestration(f)), "orchestration");
        self
    }

    /// Register an orchestration with JSON-decoded input and JSON-encoded output.
    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let wrapper = move |ctx: OrchestrationContext, input_s: String| {
            let f_inner = f.clone();
            async move {
                let input: In = crate::_typed_codec::Json::decode(&input_s)?;
                let out: Out = f_inner(ctx, input).await?;
                crate::_typed_codec::Json::encode(&out)
            }
        };
        self.insert_unique(name.into(), Arc::new(FnOrchestration(wrapper)), "orchestration");
        self
    }

    pub fn merge(self, other: OrchestrationRegistry) -> Self {
        self.merge_registry(other, "orchestration")
    }
}

// ============================================================================
// Activity Builder - Specialized Methods
// ============================================================================

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert_unique(name.into(), Arc::new(FnActivity(f)), "activity");
        self
    }

    /// Register an activity with JSON-decoded input and JSON-encoded output.
    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f_shared = Arc::new(f);
        let wrapper = move |ctx: ActivityContext, input_s: String| {
            let f_inner = Arc::clone(&f_shared);
            async move {
                let input: In = crate::_typed_codec::Json::decode(&input_s)?;
                let out: Out = (f_inner)(ctx, input).await?;
                crate::_typed_codec::Json::encode(&out)
            }
        };
        self.insert_unique(name.into(), Arc::new(FnActivity(wrapper)), "activity");
        self
    }

    pub fn merge(self, other: ActivityRegistry) -> Self {
        self.merge_registry(other, "activity")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activity_ctx() -> ActivityContext {
        ActivityContext::new("inst", 1, "Add", 1)
    }

    #[test]
    fn duplicate_names_are_reported() {
        let result = ActivityRegistry::builder()
            .register("A", |_ctx, input: String| async move { Ok(input) })
            .register("A", |_ctx, _input: String| async move { Ok(String::new()) })
            .build_result();
        let err = result.err().expect("duplicate must be rejected");
        assert!(err.contains("duplicate activity registration: A"), "{err}");
    }

    #[test]
    fn merge_reports_collisions() {
        let first = OrchestrationRegistry::builder()
            .register("o", |_ctx, input: String| async move { Ok(input) })
            .build();
        let result = OrchestrationRegistry::builder()
            .register("o", |_ctx, input: String| async move { Ok(input) })
            .merge(first)
            .build_result();
        assert!(result.is_err());
    }

    #[test]
    fn lookup_and_listing() {
        let reg = ActivityRegistry::builder()
            .register("B", |_ctx, input: String| async move { Ok(input) })
            .register("A", |_ctx, input: String| async move { Ok(input) })
            .build();
        assert_eq!(reg.list_names(), vec!["A", "B"]);
        assert_eq!(reg.count(), 2);
        assert!(reg.has("A"));
        assert!(reg.get("missing").is_none());

        let extended = ActivityRegistry::builder_from(&reg)
            .register("C", |_ctx, input: String| async move { Ok(input) })
            .build();
        assert_eq!(extended.count(), 3);
        assert_eq!(reg.count(), 2);
    }

    #[tokio::test]
    async fn typed_activity_round_trips_json() {
        #[derive(serde::Deserialize)]
        struct Pair {
            a: i64,
            b: i64,
        }
        let reg = ActivityRegistry::builder()
            .register_typed("Add", |_ctx, pair: Pair| async move { Ok(pair.a + pair.b) })
            .build();
        let handler = reg.get("Add").unwrap();
        let out = handler.invoke(activity_ctx(), r#"{"a":2,"b":3}"#.into()).await.unwrap();
        assert_eq!(out, "5");
        let err = handler.invoke(activity_ctx(), "not json".into()).await.unwrap_err();
        assert!(!err.is_empty());
    }
}

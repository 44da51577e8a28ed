//! Offline fallback hooks
//!
//! When the connectivity probe reports offline, the executor looks for a
//! hook whose pattern is a substring of the endpoint and returns its value
//! instead of attempting the network call. Hooks see the endpoint and the
//! method, so a single hook can serve cached reads and queue mutations.

use std::fmt;
use std::sync::Arc;

use resilience::ApiError;
use serde_json::Value;
use transport::Method;

/// Hook invoked for an offline request.
pub type FallbackFn = Arc<dyn Fn(&str, &Method) -> Result<Value, ApiError> + Send + Sync>;

/// Ordered registry of offline hooks. First matching pattern wins.
#[derive(Clone, Default)]
pub struct OfflineFallbacks {
    hooks: Vec<(String, FallbackFn)>,
}

impl OfflineFallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `hook` for endpoints containing `pattern`.
    pub fn register<F>(&mut self, pattern: impl Into<String>, hook: F) -> &mut Self
    where
        F: Fn(&str, &Method) -> Result<Value, ApiError> + Send + Sync + 'static,
    {
        self.hooks.push((pattern.into(), Arc::new(hook)));
        self
    }

    pub fn find(&self, endpoint: &str) -> Option<&FallbackFn> {
        self.hooks
            .iter()
            .find(|(pattern, _)| endpoint.contains(pattern.as_str()))
            .map(|(_, hook)| hook)
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl fmt::Debug for OfflineFallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.hooks.iter().map(|(pattern, _)| pattern))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_matching_pattern_wins() {
        let mut fallbacks = OfflineFallbacks::new();
        fallbacks
            .register("/items/archived", |_, _| Ok(json!("archived")))
            .register("/items", |_, _| Ok(json!("items")));

        let hook = fallbacks.find("/items/archived?page=1").unwrap();
        assert_eq!(hook("/items/archived", &Method::GET).unwrap(), json!("archived"));
        let hook = fallbacks.find("/items/42").unwrap();
        assert_eq!(hook("/items/42", &Method::GET).unwrap(), json!("items"));
        assert!(fallbacks.find("/users").is_none());
    }

    #[test]
    fn hook_sees_method() {
        let mut fallbacks = OfflineFallbacks::new();
        fallbacks.register("/items", |endpoint, method| {
            if *method == Method::GET {
                Ok(json!([]))
            } else {
                Ok(json!({ "queued": endpoint }))
            }
        });

        let hook = fallbacks.find("/items").unwrap();
        assert_eq!(hook("/items", &Method::POST).unwrap(), json!({ "queued": "/items" }));
        assert_eq!(format!("{fallbacks:?}"), r#"["/items"]"#);
    }
}

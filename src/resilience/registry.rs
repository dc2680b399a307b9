//! Named breakers shared by one owner.
//!
//! A registry is an ordinary value: whoever needs breakers constructs one
//! and hands clones of it to its collaborators.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::circuit_breaker::{BreakerStats, CircuitBreaker, CircuitBreakerConfig};

#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    breakers: Arc<RwLock<BTreeMap<String, Arc<CircuitBreaker>>>>,
}

impl CircuitBreakerRegistry {
    /// Creates a registry whose lazily created breakers use `defaults`.
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults,
            breakers: Arc::default(),
        }
    }

    /// Adds `breaker`, replacing any breaker with the same name.
    pub fn register(&self, breaker: Arc<CircuitBreaker>) {
        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        breakers.insert(breaker.name().to_string(), breaker);
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        let breakers = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        breakers.get(name).cloned()
    }

    /// Returns the breaker called `name`, creating it with the registry
    /// defaults on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, || self.defaults.clone())
    }

    /// Like [`CircuitBreakerRegistry::get_or_create`], with a custom config
    /// for the first creation. An existing breaker keeps its config.
    pub fn get_or_create_with(
        &self,
        name: &str,
        config: impl FnOnce() -> CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config()))),
        )
    }

    pub fn names(&self) -> Vec<String> {
        let breakers = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        breakers.keys().cloned().collect()
    }

    /// Stats for every registered breaker, ordered by name.
    pub fn all_stats(&self) -> Vec<BreakerStats> {
        let breakers = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        breakers.values().map(|breaker| breaker.get_stats()).collect()
    }
}

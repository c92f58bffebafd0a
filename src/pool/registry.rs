//! Pool provider registry
//!
//! Providers are registered by name with a priority. Configuration names the
//! provider to use; without a name the highest-priority available provider wins.

use anyhow::Result;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::{BackendPool, DeadpoolBackendPool, DirectBackendPool, PoolSettings};
use crate::backend::{BackendDriver, BackendTarget};
use crate::error::ProxyError;

/// Factory for one pool implementation
pub trait PoolProvider: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Higher wins when no provider is named
    fn priority(&self) -> i32;

    fn is_available(&self) -> bool {
        true
    }

    /// Create a pool for `target`
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be built from `settings`
    fn create(
        &self,
        driver: Arc<dyn BackendDriver>,
        target: BackendTarget,
        settings: &PoolSettings,
    ) -> Result<Arc<dyn BackendPool>>;
}

#[derive(Debug, Default)]
pub struct DeadpoolProvider;

impl PoolProvider for DeadpoolProvider {
    fn name(&self) -> &str {
        "deadpool"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn create(
        &self,
        driver: Arc<dyn BackendDriver>,
        target: BackendTarget,
        settings: &PoolSettings,
    ) -> Result<Arc<dyn BackendPool>> {
        let pool = DeadpoolBackendPool::builder(driver, target)
            .settings(settings.clone())
            .build()?;
        Ok(Arc::new(pool))
    }
}

#[derive(Debug, Default)]
pub struct DirectProvider;

impl PoolProvider for DirectProvider {
    fn name(&self) -> &str {
        "direct"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn create(
        &self,
        driver: Arc<dyn BackendDriver>,
        target: BackendTarget,
        settings: &PoolSettings,
    ) -> Result<Arc<dyn BackendPool>> {
        Ok(Arc::new(DirectBackendPool::new(
            driver,
            target,
            settings.max_size,
        )))
    }
}

#[derive(Debug, Clone, Default)]
pub struct PoolProviderRegistry {
    providers: Arc<DashMap<String, Arc<dyn PoolProvider>>>,
}

impl PoolProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the deadpool and direct providers
    #[must_use]
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(DeadpoolProvider));
        registry.register(Arc::new(DirectProvider));
        registry
    }

    pub fn register(&self, provider: Arc<dyn PoolProvider>) {
        debug!(
            provider = provider.name(),
            priority = provider.priority(),
            "Registered pool provider"
        );
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Look up a provider by name, or the best available one when `name` is `None`
    ///
    /// # Errors
    ///
    /// Returns `UnknownProvider` if no matching available provider is registered
    pub fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn PoolProvider>, ProxyError> {
        match name {
            Some(name) => self
                .providers
                .get(name)
                .map(|p| p.value().clone())
                .filter(|p| p.is_available())
                .ok_or_else(|| ProxyError::UnknownProvider(name.to_string())),
            None => self
                .providers
                .iter()
                .filter(|p| p.is_available())
                .max_by_key(|p| p.priority())
                .map(|p| p.value().clone())
                .ok_or_else(|| ProxyError::UnknownProvider("<default>".to_string())),
        }
    }

    /// Provider names, highest priority first
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut entries: Vec<_> = self
            .providers
            .iter()
            .map(|p| (p.priority(), p.key().clone()))
            .collect();
        entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        entries.into_iter().map(|(_, name)| name).collect()
    }
}

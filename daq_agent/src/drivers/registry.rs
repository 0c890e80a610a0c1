use std::collections::HashMap;
use std::sync::Arc;

use crate::drivers::fake::FakeDriver;
use crate::drivers::traits::{Driver, DriverConfig};
use crate::error::{AgentError, AgentResult};

/// A driver factory: given a connection's config, produce an unconnected
/// driver instance.
pub type DriverFactory = Arc<dyn Fn(&DriverConfig) -> AgentResult<Arc<dyn Driver>> + Send + Sync>;

/// Maps connector type names ("fake", ...) to factories. Populated at
/// startup with `with_builtins()`; tests may inject additional
/// factories to avoid needing a real backend.
#[derive(Clone)]
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl DriverRegistry {
    pub fn empty() -> Self {
        Self { factories: HashMap::new() }
    }

    /// The registry used in production: only the `fake` reference
    /// driver, matching the spec's Non-goal against shipping further
    /// driver implementations.
    pub fn with_builtins() -> Self {
        let mut reg = Self::empty();
        reg.register("fake", Arc::new(|cfg: &DriverConfig| {
            Ok(Arc::new(FakeDriver::new(cfg.id.clone())) as Arc<dyn Driver>)
        }));
        reg
    }

    pub fn register(&mut self, kind: &str, factory: DriverFactory) {
        self.factories.insert(kind.to_string(), factory);
    }

    pub fn list_supported_connectors(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn build(&self, config: &DriverConfig) -> AgentResult<Arc<dyn Driver>> {
        let factory = self
            .factories
            .get(&config.kind)
            .ok_or_else(|| AgentError::UnsupportedConnectorType(config.kind.clone()))?;
        factory(config)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

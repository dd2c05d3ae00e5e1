use super::simple::SimpleTradingController;
use super::{Controller, ControllerError};
use crate::settings::ControllerSettings;
use std::collections::BTreeMap;

pub type ControllerFactory = fn(&ControllerSettings) -> Result<Box<dyn Controller>, ControllerError>;

/// Name to factory table, built once at startup
#[derive(Clone)]
pub struct ControllerRegistry {
    factories: BTreeMap<String, ControllerFactory>,
}

impl ControllerRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with every built-in controller type
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(SimpleTradingController::TYPE, |settings| {
            Ok(Box::new(SimpleTradingController::from_settings(settings)?))
        });
        registry
    }

    /// Add or replace a controller type
    pub fn register(&mut self, name: impl Into<String>, factory: ControllerFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn build(&self, settings: &ControllerSettings) -> Result<Box<dyn Controller>, ControllerError> {
        let factory = self
            .factories
            .get(&settings.controller_type)
            .ok_or_else(|| ControllerError::UnknownType(settings.controller_type.clone()))?;
        factory(settings)
    }
}

impl Default for ControllerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(controller_type: &str) -> ControllerSettings {
        ControllerSettings {
            id: "ctrl".to_string(),
            controller_type: controller_type.to_string(),
            instrument: "BTCUSDT".to_string(),
            tick_interval_ms: 1_000,
            params: Default::default(),
        }
    }

    #[test]
    fn test_builds_registered_types() {
        let registry = ControllerRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["simple_trading"]);

        let controller = registry.build(&settings("simple_trading")).unwrap();
        assert_eq!(controller.id(), "ctrl");
        assert_eq!(controller.instrument(), "BTCUSDT");
    }

    #[test]
    fn test_unknown_type() {
        let registry = ControllerRegistry::with_builtins();
        assert!(matches!(
            registry.build(&settings("grid")),
            Err(ControllerError::UnknownType(name)) if name == "grid"
        ));
    }
}

//! Named-settings registry consumed by the scheduler and writable by
//! `Inject(Setting)` steps.
//!
//! Each cell is typed; injected values are parsed per the cell's existing
//! type, so a bad value fails the inject without corrupting the cell.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Unknown setting '{0}'")]
    Unknown(String),

    #[error("Invalid value '{value}' for setting '{name}'")]
    InvalidValue { name: String, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SettingValue {
    Float(f64),
    Int(i64),
    Bool(bool),
}

impl SettingValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SettingValue::Float(v) => Some(*v),
            SettingValue::Int(v) => Some(*v as f64),
            SettingValue::Bool(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SettingValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Parse a raw string into a value of the same type as `self`.
    fn parse_same_type(&self, raw: &str) -> Option<SettingValue> {
        match self {
            SettingValue::Float(_) => raw.trim().parse().ok().map(SettingValue::Float),
            SettingValue::Int(_) => raw.trim().parse().ok().map(SettingValue::Int),
            SettingValue::Bool(_) => raw.trim().parse().ok().map(SettingValue::Bool),
        }
    }
}

/// Well-known setting names.
pub mod keys {
    /// Seconds between scheduler ticks while a step is dwelling.
    pub const SCAN_INTERVAL: &str = "scan_interval";
    /// Pointer move duration in seconds.
    pub const MOUSE_SPEED: &str = "mouse_speed";
    /// Click hold duration in seconds.
    pub const HOLD_DURATION: &str = "hold_duration";
    /// Humanization knobs, consumed by driver implementations.
    pub const LOC_OFFSET_VARIANCE: &str = "loc_offset_variance";
    pub const SPEED_VARIANCE: &str = "speed_variance";
    pub const HOLD_DURATION_VARIANCE: &str = "hold_duration_variance";
}

#[derive(Debug, Clone, Default)]
pub struct SettingsRegistry {
    cells: HashMap<String, SettingValue>,
}

impl SettingsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the automation defaults.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(keys::SCAN_INTERVAL, SettingValue::Float(0.25));
        registry.register(keys::MOUSE_SPEED, SettingValue::Float(0.25));
        registry.register(keys::HOLD_DURATION, SettingValue::Float(0.08));
        registry.register(keys::LOC_OFFSET_VARIANCE, SettingValue::Int(4));
        registry.register(keys::SPEED_VARIANCE, SettingValue::Float(0.06));
        registry.register(keys::HOLD_DURATION_VARIANCE, SettingValue::Float(0.03));
        registry
    }

    pub fn register(&mut self, name: &str, value: SettingValue) {
        self.cells.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<SettingValue> {
        self.cells.get(name).copied()
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|v| v.as_f64())
    }

    /// Overwrite a cell from a raw string, keeping the cell's type.
    pub fn set_from_str(&mut self, name: &str, raw: &str) -> Result<SettingValue, SettingsError> {
        let current = self
            .cells
            .get(name)
            .ok_or_else(|| SettingsError::Unknown(name.to_string()))?;
        let parsed = current
            .parse_same_type(raw)
            .ok_or_else(|| SettingsError::InvalidValue {
                name: name.to_string(),
                value: raw.to_string(),
            })?;
        self.cells.insert(name.to_string(), parsed);
        Ok(parsed)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.cells.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_present() {
        let registry = SettingsRegistry::with_defaults();
        assert_eq!(registry.f64(keys::SCAN_INTERVAL), Some(0.25));
        assert_eq!(
            registry.get(keys::LOC_OFFSET_VARIANCE).unwrap().as_i64(),
            Some(4)
        );
    }

    #[test]
    fn test_set_from_str_keeps_cell_type() {
        let mut registry = SettingsRegistry::with_defaults();
        registry.set_from_str(keys::LOC_OFFSET_VARIANCE, "7").unwrap();
        assert_eq!(
            registry.get(keys::LOC_OFFSET_VARIANCE),
            Some(SettingValue::Int(7))
        );
    }

    #[test]
    fn test_set_from_str_rejects_wrong_type() {
        let mut registry = SettingsRegistry::with_defaults();
        let err = registry
            .set_from_str(keys::LOC_OFFSET_VARIANCE, "2.5")
            .unwrap_err();
        assert!(matches!(err, SettingsError::InvalidValue { .. }));
        // Cell unchanged on failure.
        assert_eq!(
            registry.get(keys::LOC_OFFSET_VARIANCE),
            Some(SettingValue::Int(4))
        );
    }

    #[test]
    fn test_set_from_str_unknown_name() {
        let mut registry = SettingsRegistry::with_defaults();
        assert!(matches!(
            registry.set_from_str("nope", "1"),
            Err(SettingsError::Unknown(_))
        ));
    }

    #[test]
    fn test_bool_cell_round_trip() {
        let mut registry = SettingsRegistry::new();
        registry.register("dynamic_speed", SettingValue::Bool(false));
        registry.set_from_str("dynamic_speed", "true").unwrap();
        assert_eq!(registry.get("dynamic_speed").unwrap().as_bool(), Some(true));
    }
}

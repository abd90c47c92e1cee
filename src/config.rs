use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PowerFlowError, Result};
use crate::loadflow::Method;

/// Settings accepted by every solver. `acceleration` is only read by
/// Gauss-Seidel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub tolerance: f64,
    pub max_iter: usize,
    pub acceleration: f64,
    /// Bus count above which matrices are held sparse.
    pub sparse_threshold: usize,
    /// Condition estimate above which a linear solve logs a diagnostic.
    pub condition_ceiling: f64,
    /// Bus count up to which trace records keep a per-bus voltage snapshot.
    pub snapshot_threshold: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_iter: 20,
            acceleration: 1.0,
            sparse_threshold: 50,
            condition_ceiling: 1e12,
            snapshot_threshold: 20,
        }
    }
}

impl SolverConfig {
    pub fn for_method(method: Method) -> Self {
        let max_iter = match method {
            Method::NewtonRaphson => 20,
            Method::GaussSeidel | Method::FastDecoupled => 100,
        };
        Self {
            max_iter,
            ..Self::default()
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_acceleration(mut self, acceleration: f64) -> Self {
        self.acceleration = acceleration;
        self
    }

    pub fn with_sparse_threshold(mut self, sparse_threshold: usize) -> Self {
        self.sparse_threshold = sparse_threshold;
        self
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: SolverConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Applies the fields present in a JSON object on top of `self`.
    pub fn with_overrides(self, json: &str) -> Result<Self> {
        let overrides: serde_json::Value = serde_json::from_str(json)?;
        let Some(fields) = overrides.as_object() else {
            return Err(PowerFlowError::InvalidConfig(
                "configuration must be a JSON object".to_string(),
            ));
        };
        let mut merged = serde_json::to_value(self)?;
        if let Some(base) = merged.as_object_mut() {
            for (key, value) in fields {
                base.insert(key.clone(), value.clone());
            }
        }
        let config: SolverConfig = serde_json::from_value(merged)?;
        config.validate()?;
        Ok(config)
    }

    /// Layers a JSON config file over `self`, keeping fields it omits.
    pub fn with_overrides_file(self, path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        self.with_overrides(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(PowerFlowError::InvalidConfig(format!(
                "tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if !(self.acceleration > 0.0 && self.acceleration < 2.0) {
            return Err(PowerFlowError::InvalidConfig(format!(
                "acceleration factor must lie in (0, 2), got {}",
                self.acceleration
            )));
        }
        if !(self.condition_ceiling > 1.0) {
            return Err(PowerFlowError::InvalidConfig(format!(
                "condition ceiling must exceed 1, got {}",
                self.condition_ceiling
            )));
        }
        Ok(())
    }

    pub fn use_sparse(&self, n_buses: usize) -> bool {
        n_buses > self.sparse_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SolverConfig::default();
        assert_eq!(config.tolerance, 1e-6);
        assert_eq!(config.acceleration, 1.0);
        assert_eq!(config.condition_ceiling, 1e12);
        assert!(!config.use_sparse(50));
        assert!(config.use_sparse(51));
    }

    #[test]
    fn method_budgets() {
        assert_eq!(SolverConfig::for_method(Method::NewtonRaphson).max_iter, 20);
        assert_eq!(SolverConfig::for_method(Method::GaussSeidel).max_iter, 100);
        assert_eq!(SolverConfig::for_method(Method::FastDecoupled).max_iter, 100);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = SolverConfig::from_json_str(r#"{"tolerance": 1e-8, "max_iter": 5}"#).unwrap();
        assert_eq!(config.tolerance, 1e-8);
        assert_eq!(config.max_iter, 5);
        assert_eq!(config.acceleration, 1.0);
        assert_eq!(config.sparse_threshold, 50);
    }

    #[test]
    fn overrides_keep_method_budget() {
        let config = SolverConfig::for_method(Method::GaussSeidel)
            .with_overrides(r#"{"acceleration": 1.6}"#)
            .unwrap();
        assert_eq!(config.max_iter, 100);
        assert_eq!(config.acceleration, 1.6);
        assert!(SolverConfig::default().with_overrides("[1, 2]").is_err());
        assert!(SolverConfig::default().with_overrides(r#"{"acceleration": 3.0}"#).is_err());
    }

    #[test]
    fn override_file_keeps_method_budget() {
        let path = std::env::temp_dir().join(format!("gridflow-config-{}.json", std::process::id()));
        fs::write(&path, r#"{"tolerance": 1e-8}"#).unwrap();
        let config = SolverConfig::for_method(Method::FastDecoupled)
            .with_overrides_file(&path)
            .unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(config.tolerance, 1e-8);
        assert_eq!(config.max_iter, 100);
        assert!(SolverConfig::default().with_overrides_file(&path).is_err());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(SolverConfig::default().with_tolerance(0.0).validate().is_err());
        assert!(SolverConfig::default().with_acceleration(2.5).validate().is_err());
        assert!(SolverConfig::from_json_str(r#"{"tolerance": -1.0}"#).is_err());
        assert!(SolverConfig::from_json_str("not json").is_err());
    }
}

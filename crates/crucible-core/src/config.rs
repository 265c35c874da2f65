use crate::errors::ConfigurationError;
use crate::model::{TestConfiguration, SUPPORTED_CONFIG_VERSION};
use std::collections::HashSet;
use std::path::Path;

pub fn load_config(path: &Path) -> Result<TestConfiguration, ConfigurationError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigurationError::Read {
        path: path.display().to_string(),
        detail: e.to_string(),
    })?;
    parse_config(&raw, &path.display().to_string())
}

/// Parses YAML and checks the version. Structural validation is separate so
/// that `validate` can report on configs that parse but cannot run.
pub fn parse_config(raw: &str, origin: &str) -> Result<TestConfiguration, ConfigurationError> {
    let cfg: TestConfiguration =
        serde_yaml::from_str(raw).map_err(|e| ConfigurationError::Parse {
            path: origin.to_string(),
            detail: e.to_string(),
        })?;
    if cfg.version != SUPPORTED_CONFIG_VERSION {
        return Err(ConfigurationError::UnsupportedVersion {
            found: cfg.version,
            supported: SUPPORTED_CONFIG_VERSION,
        });
    }
    Ok(cfg)
}

/// Checks that must hold before a run is created.
pub fn validate(cfg: &TestConfiguration) -> Result<(), ConfigurationError> {
    if cfg.tests.is_empty() {
        return Err(ConfigurationError::EmptyTestSet { id: cfg.id.clone() });
    }

    match &cfg.target {
        None => {
            return Err(ConfigurationError::UnresolvableTarget {
                id: cfg.id.clone(),
                detail: "no target configured".into(),
            })
        }
        Some(target) => {
            if let Some(detail) = target.unresolvable_reason() {
                return Err(ConfigurationError::UnresolvableTarget {
                    id: cfg.id.clone(),
                    detail,
                });
            }
        }
    }

    let mut seen = HashSet::new();
    for tc in &cfg.tests {
        if !seen.insert(tc.id.as_str()) {
            return Err(ConfigurationError::DuplicateTestCase {
                id: cfg.id.clone(),
                test_case_id: tc.id.clone(),
            });
        }
    }
    Ok(())
}

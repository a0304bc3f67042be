use ag_cache::HasherKind;
use ag_partition::{MinCutConfig, PartitionerKind};
use serde::{Deserialize, Serialize};

use crate::errors::ApiError;

pub const PARTITIONER_ENV: &str = "AG_PARTITIONER";
pub const HASHER_ENV: &str = "AG_HASHER";

/// Compile settings for an [`AotFunction`](crate::AotFunction).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AotConfig {
    pub partitioner: PartitionerKind,
    pub hasher: HasherKind,
    pub min_cut: MinCutConfig,
    /// Registry name used by [`aot_function_on`](crate::aot_function_on).
    pub backend: String,
}

impl Default for AotConfig {
    fn default() -> Self {
        Self {
            partitioner: PartitionerKind::Default,
            hasher: HasherKind::StaticShape,
            min_cut: MinCutConfig::default(),
            backend: "cpu".to_owned(),
        }
    }
}

impl AotConfig {
    #[must_use]
    pub fn with_partitioner(mut self, partitioner: PartitionerKind) -> Self {
        self.partitioner = partitioner;
        self
    }

    #[must_use]
    pub fn with_hasher(mut self, hasher: HasherKind) -> Self {
        self.hasher = hasher;
        self
    }

    #[must_use]
    pub fn with_min_cut(mut self, min_cut: MinCutConfig) -> Self {
        self.min_cut = min_cut;
        self
    }

    #[must_use]
    pub fn with_backend(mut self, backend: &str) -> Self {
        self.backend = backend.to_owned();
        self
    }

    /// Defaults overridden by `AG_PARTITIONER` and `AG_HASHER`.
    pub fn from_env() -> Result<Self, ApiError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ApiError> {
        let mut config = Self::default();
        if let Some(raw) = lookup(PARTITIONER_ENV) {
            config.partitioner =
                PartitionerKind::parse(&raw).ok_or_else(|| invalid(PARTITIONER_ENV, &raw))?;
        }
        if let Some(raw) = lookup(HASHER_ENV) {
            config.hasher = HasherKind::parse(&raw).ok_or_else(|| invalid(HASHER_ENV, &raw))?;
        }
        Ok(config)
    }
}

fn invalid(var: &str, value: &str) -> ApiError {
    ApiError::Config {
        var: var.to_owned(),
        value: value.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |var| {
            pairs
                .iter()
                .find(|(name, _)| *name == var)
                .map(|(_, value)| (*value).to_owned())
        }
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = AotConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config, AotConfig::default());
    }

    #[test]
    fn environment_selects_partitioner_and_hasher() {
        let config = AotConfig::from_lookup(lookup(&[
            (PARTITIONER_ENV, "min_cut"),
            (HASHER_ENV, "dynamic"),
        ]))
        .expect("config");
        assert_eq!(config.partitioner, PartitionerKind::MinCut);
        assert_eq!(config.hasher, HasherKind::DynamicShape);
    }

    #[test]
    fn unknown_values_are_rejected() {
        let err = AotConfig::from_lookup(lookup(&[(PARTITIONER_ENV, "greedy")]))
            .expect_err("unknown partitioner");
        assert!(matches!(err, ApiError::Config { ref var, .. } if var == PARTITIONER_ENV));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: AotConfig =
            serde_json::from_str(r#"{"partitioner":"min_cut","min_cut":{"intermediate_cost_multiplier":2}}"#)
                .expect("deserialize");
        assert_eq!(config.partitioner, PartitionerKind::MinCut);
        assert_eq!(config.min_cut.intermediate_cost_multiplier, 2);
        assert!(config.min_cut.prune_unused_saved);
        assert_eq!(config.backend, "cpu");
    }
}

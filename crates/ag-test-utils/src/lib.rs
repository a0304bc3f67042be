#![forbid(unsafe_code)]

//! Shared helpers for aotgraph test suites: structured case records,
//! fixture digests, proptest knobs and log capture.

pub mod proptest_strategies;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

pub const CASE_LOG_SCHEMA: &str = "aotgraph.case-log.v1";

const CASES_ENV: &str = "AG_PROPTEST_CASES";
const SEED_ENVS: [&str; 2] = ["AG_PROPTEST_SEED", "PROPTEST_RNG_SEED"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    Skip,
}

/// Where a case ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHost {
    pub os: String,
    pub arch: String,
    pub ci: bool,
    pub recorded_at_ms: u64,
}

impl RunHost {
    #[must_use]
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_owned(),
            arch: std::env::consts::ARCH.to_owned(),
            ci: std::env::var_os("CI").is_some(),
            recorded_at_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |elapsed| {
                    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
                }),
        }
    }
}

/// One structured record per partitioned case, serializable to JSON lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseLog {
    pub schema: String,
    pub case: String,
    pub fixture_digest: String,
    pub partitioner: String,
    pub verdict: Verdict,
    pub seed: Option<u64>,
    pub host: RunHost,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_saved: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl CaseLog {
    #[must_use]
    pub fn new(
        case: impl Into<String>,
        fixture_digest: impl Into<String>,
        partitioner: impl Into<String>,
        verdict: Verdict,
    ) -> Self {
        Self {
            schema: CASE_LOG_SCHEMA.to_owned(),
            case: case.into(),
            fixture_digest: fixture_digest.into(),
            partitioner: partitioner.into(),
            verdict,
            seed: proptest_seed(),
            host: RunHost::current(),
            num_saved: None,
            saved_bytes: None,
            note: None,
        }
    }

    #[must_use]
    pub fn with_saved(mut self, num_saved: usize, saved_bytes: Option<u64>) -> Self {
        self.num_saved = Some(num_saved);
        self.saved_bytes = saved_bytes;
        self
    }

    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Hex sha256 of a fixture's JSON encoding.
pub fn fixture_digest<T: Serialize>(fixture: &T) -> Result<String, serde_json::Error> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(fixture)?);
    let mut hex = String::with_capacity(64);
    for byte in hasher.finalize() {
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(hex)
}

/// Cases per proptest property: `AG_PROPTEST_CASES` if set and positive,
/// more on CI than locally otherwise.
#[must_use]
pub fn property_test_case_count() -> u32 {
    let configured = std::env::var(CASES_ENV)
        .ok()
        .and_then(|raw| raw.trim().parse::<u32>().ok())
        .filter(|&cases| cases > 0);
    configured.unwrap_or(if std::env::var_os("CI").is_some() { 512 } else { 128 })
}

#[must_use]
pub fn proptest_seed() -> Option<u64> {
    SEED_ENVS
        .iter()
        .find_map(|var| std::env::var(var).ok()?.trim().parse().ok())
}

#[must_use]
pub fn case_name(module_path: &str, test_name: &str) -> String {
    format!("{module_path}::{test_name}")
}

/// Routes `tracing` output through the test harness's captured writer.
/// Honors `RUST_LOG`; safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use ag_core::fixtures::{JointSpec, build_joint};

    #[test]
    fn equal_fixtures_share_a_digest() {
        let chain = fixture_digest(&build_joint(JointSpec::Chain).expect("fixture")).expect("digest");
        let again = fixture_digest(&build_joint(JointSpec::Chain).expect("fixture")).expect("digest");
        let mul_sum =
            fixture_digest(&build_joint(JointSpec::MulSum).expect("fixture")).expect("digest");
        assert_eq!(chain, again);
        assert_eq!(chain.len(), 64);
        assert_ne!(chain, mul_sum);
    }

    #[test]
    fn case_count_is_positive() {
        assert!(property_test_case_count() > 0);
    }

    #[test]
    fn case_log_survives_json() {
        let log = CaseLog::new(
            case_name(module_path!(), "case_log_survives_json"),
            "digest",
            "min_cut",
            Verdict::Pass,
        )
        .with_saved(2, Some(48));
        let line = log.to_json_line().expect("serialize");
        assert!(!line.contains("\"note\""));
        let decoded: CaseLog = serde_json::from_str(&line).expect("deserialize");
        assert_eq!(decoded, log);
        assert_eq!(decoded.schema, CASE_LOG_SCHEMA);
    }
}

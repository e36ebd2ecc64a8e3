#![forbid(unsafe_code)]

//! Shared helpers for tensorjit tests: logger setup, property-test sizing,
//! float comparison and structured per-test JSON records.
//!
//! A record is written for every [`run_logged_test`] invocation to
//! `$TJ_TEST_LOG_DIR/<suite>/<test>.json` (default `target/tj-test-logs`).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Once;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub const TEST_LOG_SCHEMA_VERSION: &str = "tensorjit.test-log.v1";

/// Environment variables consulted for a reproducible property-test seed,
/// in priority order.
const SEED_VARS: [&str; 2] = ["TJ_PROPTEST_SEED", "PROPTEST_RNG_SEED"];

/// Compatibility mode a scenario was exercised under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestMode {
    Strict,
    Hardened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestResult {
    Pass,
    Fail,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub os: String,
    pub arch: String,
    pub crate_version: String,
    pub started_unix_ms: u64,
}

impl HostInfo {
    #[must_use]
    pub fn capture() -> Self {
        Self {
            os: std::env::consts::OS.to_owned(),
            arch: std::env::consts::ARCH.to_owned(),
            crate_version: env!("CARGO_PKG_VERSION").to_owned(),
            started_unix_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .ok()
                .and_then(|d| u64::try_from(d.as_millis()).ok())
                .unwrap_or(0),
        }
    }
}

/// Wall time of one named stage of a logged test, in microseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub phase: String,
    pub micros: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestLogV1 {
    pub schema_version: String,
    pub test_id: String,
    pub suite_id: Option<String>,
    pub fixture_id: String,
    pub seed: Option<u64>,
    pub mode: TestMode,
    pub host: HostInfo,
    pub result: TestResult,
    pub phases: Vec<PhaseTiming>,
    pub artifact_refs: Vec<String>,
    pub failure: Option<String>,
}

impl TestLogV1 {
    /// A record for a test run outside any suite.
    #[must_use]
    pub fn unit(
        test_id: impl Into<String>,
        fixture_id: impl Into<String>,
        mode: TestMode,
        result: TestResult,
    ) -> Self {
        Self {
            schema_version: TEST_LOG_SCHEMA_VERSION.to_owned(),
            test_id: test_id.into(),
            suite_id: None,
            fixture_id: fixture_id.into(),
            seed: capture_proptest_seed(),
            mode,
            host: HostInfo::capture(),
            result,
            phases: Vec::new(),
            artifact_refs: Vec::new(),
            failure: None,
        }
    }

    #[must_use]
    pub fn total_micros(&self) -> u64 {
        self.phases.iter().map(|p| p.micros).sum()
    }

    fn time<R>(&mut self, phase: &str, body: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let out = body();
        self.phases.push(PhaseTiming {
            phase: phase.to_owned(),
            micros: u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX),
        });
        out
    }
}

/// Installs `env_logger` once per test binary. Honors `RUST_LOG`.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Hex SHA-256 of the fixture's JSON encoding.
pub fn fixture_id_from_json<T: Serialize>(fixture: &T) -> Result<String, serde_json::Error> {
    let digest = Sha256::digest(serde_json::to_vec(fixture)?);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Cases per property test: `TJ_PROPTEST_CASES` when set to a positive
/// number, otherwise 256 under CI and 64 locally.
#[must_use]
pub fn property_test_case_count() -> u32 {
    std::env::var("TJ_PROPTEST_CASES")
        .ok()
        .and_then(|raw| raw.trim().parse::<u32>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(if std::env::var_os("CI").is_some() { 256 } else { 64 })
}

#[must_use]
pub fn capture_proptest_seed() -> Option<u64> {
    SEED_VARS
        .iter()
        .find_map(|var| std::env::var(var).ok()?.trim().parse().ok())
}

#[must_use]
pub fn test_id(module_path: &str, test_name: &str) -> String {
    format!("{module_path}::{test_name}")
}

/// Compares two flattened tensors elementwise with a mixed tolerance.
pub fn assert_close(actual: &[f64], expected: &[f64], tol: f64) -> Result<(), String> {
    if actual.len() != expected.len() {
        return Err(format!(
            "length mismatch: actual={} expected={}",
            actual.len(),
            expected.len()
        ));
    }
    for (idx, (a, e)) in actual.iter().zip(expected).enumerate() {
        let bound = tol * (1.0 + e.abs());
        if (a - e).abs() > bound || a.is_nan() != e.is_nan() {
            return Err(format!("element {idx}: actual={a} expected={e} tol={bound}"));
        }
    }
    Ok(())
}

/// Runs `body` under a structured log record and fails the test when the
/// body returns `Err` or panics. The record is written either way.
///
/// `body` returns references to any artifacts it produced (printed graphs,
/// cache keys), which are stored in the record.
pub fn run_logged_test<Fixture, F>(
    suite_id: &str,
    test_id: &str,
    fixture: &Fixture,
    mode: TestMode,
    body: F,
) where
    Fixture: Serialize,
    F: FnOnce() -> Result<Vec<String>, String>,
{
    init_test_logging();
    let mut log = TestLogV1::unit(test_id, String::new(), mode, TestResult::Fail);
    log.suite_id = Some(suite_id.to_owned());
    log.fixture_id = log.time("fixture", || {
        fixture_id_from_json(fixture).unwrap_or_else(|err| format!("<unencodable: {err}>"))
    });

    let outcome = log.time("body", || catch_unwind(AssertUnwindSafe(body)));
    let mut unwound = None;
    match outcome {
        Ok(Ok(artifacts)) => {
            log.result = TestResult::Pass;
            log.artifact_refs = artifacts;
        }
        Ok(Err(detail)) => log.failure = Some(detail),
        Err(payload) => {
            log.failure = Some(describe_panic(payload.as_ref()));
            unwound = Some(payload);
        }
    }

    let path = log_dir().join(suite_id).join(format!("{}.json", test_id.replace("::", "__")));
    let written = std::fs::create_dir_all(path.parent().unwrap_or(&path))
        .map_err(|err| err.to_string())
        .and_then(|()| serde_json::to_vec_pretty(&log).map_err(|err| err.to_string()))
        .and_then(|bytes| std::fs::write(&path, bytes).map_err(|err| err.to_string()));
    match written {
        Ok(()) => log::debug!("{test_id}: {:?} logged to {}", log.result, path.display()),
        Err(err) => log::warn!("{test_id}: test log not written: {err}"),
    }

    if let Some(payload) = unwound {
        std::panic::resume_unwind(payload);
    }
    if let Some(detail) = log.failure {
        panic!("{test_id} failed: {detail}");
    }
}

fn log_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("TJ_TEST_LOG_DIR") {
        return PathBuf::from(dir);
    }
    std::env::var_os("CARGO_TARGET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../target"))
        .join("tj-test-logs")
}

fn describe_panic(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(|s| (*s).to_owned()))
        .unwrap_or_else(|| "panic with a non-string payload".to_owned())
}

#[cfg(test)]
mod tests {
    use super::{
        TEST_LOG_SCHEMA_VERSION, TestLogV1, TestMode, TestResult, assert_close,
        fixture_id_from_json, property_test_case_count, run_logged_test, test_id,
    };

    #[test]
    fn fixture_digest_depends_on_content() {
        let mul_add = serde_json::json!({ "graph": "mul_add", "inputs": [2, 3] });
        let digest = fixture_id_from_json(&mul_add).expect("digest");
        assert_eq!(digest, fixture_id_from_json(&mul_add).expect("digest"));
        assert_eq!(digest.len(), 64);
        let other = serde_json::json!({ "graph": "mul_add", "inputs": [3, 2] });
        assert_ne!(digest, fixture_id_from_json(&other).expect("digest"));
    }

    #[test]
    fn property_case_count_is_positive() {
        assert!(property_test_case_count() >= 1);
    }

    #[test]
    fn unit_records_survive_json() {
        let mut log = TestLogV1::unit(
            test_id(module_path!(), "unit_records_survive_json"),
            "fixture-id",
            TestMode::Hardened,
            TestResult::Pass,
        );
        assert_eq!(log.schema_version, TEST_LOG_SCHEMA_VERSION);
        assert!(log.suite_id.is_none());
        let answer = log.time("compute", || 6 * 7);
        assert_eq!(answer, 42);
        assert_eq!(log.phases.len(), 1);
        let encoded = serde_json::to_string(&log).expect("serialize");
        let decoded: TestLogV1 = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(decoded, log);
        assert_eq!(decoded.total_micros(), log.phases[0].micros);
    }

    #[test]
    fn close_comparison_reports_first_bad_element() {
        assert!(assert_close(&[1.0, 2.0], &[1.0, 2.0 + 1e-9], 1e-6).is_ok());
        let err = assert_close(&[1.0, 2.5], &[1.0, 2.0], 1e-6).expect_err("should differ");
        assert!(err.starts_with("element 1"), "{err}");
        assert!(assert_close(&[1.0], &[1.0, 2.0], 1e-6).is_err());
        assert!(assert_close(&[f64::NAN], &[0.0], 1e-6).is_err());
    }

    #[test]
    fn logged_failures_fail_the_test() {
        let failed = std::panic::catch_unwind(|| {
            run_logged_test(
                "tj_test_utils",
                &test_id(module_path!(), "logged_failures_fail_the_test"),
                &("failing", 1),
                TestMode::Strict,
                || Err("mismatch".to_owned()),
            );
        });
        assert!(failed.is_err());

        run_logged_test(
            "tj_test_utils",
            &test_id(module_path!(), "logged_passes"),
            &("passing", 1),
            TestMode::Strict,
            || Ok(vec!["artifact".to_owned()]),
        );
    }
}

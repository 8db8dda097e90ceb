//! Demonstration workloads
//!
//! Small stochastic trials used to exercise the engine from the command
//! line: naive recursive Fibonacci with a randomly drawn argument, random
//! lowercase strings built in a per-slot buffer, and a Monte Carlo estimate
//! of pi.

use clap::ValueEnum;
use replicate_core_rs::{
    replicate_with_report, RandomSource, ReplicationError, RngManager, RunConfig, RunManifest,
    RunReport, SharedRandom, TrialContext,
};
use serde::Serialize;
use thiserror::Error;

/// Length of every generated string
pub const STRING_LEN: usize = 16;

/// Points sampled per pi trial
pub const PI_POINTS: usize = 1_000;

/// Fibonacci arguments are drawn from `[FIB_MIN, FIB_MAX)`
pub const FIB_MIN: i64 = 20;
pub const FIB_MAX: i64 = 28;

type Ctx<'a> = TrialContext<'a, RngManager>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Workload {
    Fib,
    Strings,
    Pi,
}

/// Failure injected with `--fail-at`
#[derive(Debug, Error)]
pub enum TrialError {
    #[error("injected failure at trial {0}")]
    Injected(usize),

    #[error(transparent)]
    Lock(#[from] replicate_core_rs::LockViolation),
}

/// What the CLI prints after a successful run
#[derive(Debug, Serialize)]
pub struct Summary {
    pub workload: String,
    pub seed: u64,
    pub manifest: RunManifest,
    pub results_digest: String,

    /// Mean of the per-trial statistic (fib value, pi estimate); None for strings
    pub mean: Option<f64>,

    /// First few results
    pub preview: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FibSample {
    pub n: u32,
    pub value: u64,
}

/// Naive doubly recursive Fibonacci
pub fn fib(n: u32) -> u64 {
    if n < 2 {
        n as u64
    } else {
        fib(n - 1) + fib(n - 2)
    }
}

fn check_injected(ctx: &Ctx<'_>, fail_at: Option<usize>) -> Result<(), TrialError> {
    match fail_at {
        Some(k) if k == ctx.index() => Err(TrialError::Injected(k)),
        _ => Ok(()),
    }
}

fn fib_trial(ctx: &Ctx<'_>, fail_at: Option<usize>) -> Result<FibSample, TrialError> {
    check_injected(ctx, fail_at)?;
    let n = ctx.range(FIB_MIN, FIB_MAX)? as u32;
    Ok(FibSample { n, value: fib(n) })
}

/// Fill the slot's buffer with lowercase letters drawn in one acquisition
fn string_trial(
    ctx: &Ctx<'_>,
    buf: &mut String,
    fail_at: Option<usize>,
) -> Result<String, TrialError> {
    check_injected(ctx, fail_at)?;
    buf.clear();
    ctx.with_random(|rng| {
        for _ in 0..STRING_LEN {
            buf.push((b'a' + rng.range(0, 26) as u8) as char);
        }
    })?;
    Ok(buf.clone())
}

/// Estimate pi from `PI_POINTS` uniform points in the unit square
fn pi_trial(ctx: &Ctx<'_>, coords: &mut Vec<f64>, fail_at: Option<usize>) -> Result<f64, TrialError> {
    check_injected(ctx, fail_at)?;
    coords.clear();
    ctx.with_random(|rng| {
        coords.extend((0..PI_POINTS * 2).map(|_| rng.next_f64()));
    })?;

    let inside = coords
        .chunks_exact(2)
        .filter(|p| p[0] * p[0] + p[1] * p[1] <= 1.0)
        .count();
    Ok(4.0 * inside as f64 / PI_POINTS as f64)
}

/// Run `workload` with a fresh generator seeded with `seed`
pub fn run_workload(
    workload: Workload,
    config: &RunConfig,
    seed: u64,
    fail_at: Option<usize>,
) -> Result<Summary, ReplicationError> {
    let random = SharedRandom::new(RngManager::new(seed));

    match workload {
        Workload::Fib => {
            let report = replicate_with_report(
                |ctx: &Ctx<'_>, _: &mut ()| fib_trial(ctx, fail_at),
                config,
                &random,
                |_| (),
            )?;
            let mean = mean(report.results.iter().map(|s| s.value as f64));
            summarize("fib", seed, report, mean)
        }
        Workload::Strings => {
            let report = replicate_with_report(
                |ctx: &Ctx<'_>, buf: &mut String| string_trial(ctx, buf, fail_at),
                config,
                &random,
                |_| String::with_capacity(STRING_LEN),
            )?;
            summarize("strings", seed, report, None)
        }
        Workload::Pi => {
            let report = replicate_with_report(
                |ctx: &Ctx<'_>, coords: &mut Vec<f64>| pi_trial(ctx, coords, fail_at),
                config,
                &random,
                |_| Vec::with_capacity(PI_POINTS * 2),
            )?;
            let mean = mean(report.results.iter().copied());
            summarize("pi", seed, report, mean)
        }
    }
}

fn mean(values: impl ExactSizeIterator<Item = f64>) -> Option<f64> {
    let n = values.len();
    (n > 0).then(|| values.sum::<f64>() / n as f64)
}

const PREVIEW_LEN: usize = 5;

fn summarize<T: Serialize>(
    workload: &str,
    seed: u64,
    report: RunReport<T>,
    mean: Option<f64>,
) -> Result<Summary, ReplicationError> {
    let results_digest = report.results_digest()?;
    let preview = report
        .results
        .iter()
        .take(PREVIEW_LEN)
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ReplicationError::Serialization(e.to_string()))?;

    Ok(Summary {
        workload: workload.to_string(),
        seed,
        manifest: report.manifest,
        results_digest,
        mean,
        preview,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fib_values() {
        let values: Vec<u64> = (0..10).map(fib).collect();
        assert_eq!(values, vec![0, 1, 1, 2, 3, 5, 8, 13, 21, 34]);
        assert_eq!(fib(20), 6765);
    }

    #[test]
    fn test_fib_workload_draws_in_range() {
        let summary = run_workload(Workload::Fib, &RunConfig::parallel(12).with_pool_size(3), 1, None)
            .unwrap();
        assert_eq!(summary.manifest.total_trials(), 12);
        for sample in &summary.preview {
            let n = sample["n"].as_u64().unwrap() as i64;
            assert!((FIB_MIN..FIB_MAX).contains(&n));
        }
        assert!(summary.mean.unwrap() >= fib(FIB_MIN as u32) as f64);
    }

    #[test]
    fn test_strings_are_lowercase_and_reproducible() {
        let config = RunConfig::sequential(20);
        let a = run_workload(Workload::Strings, &config, 99, None).unwrap();
        let b = run_workload(Workload::Strings, &config, 99, None).unwrap();

        assert_eq!(a.results_digest, b.results_digest);
        for s in &a.preview {
            let s = s.as_str().unwrap();
            assert_eq!(s.len(), STRING_LEN);
            assert!(s.bytes().all(|c| c.is_ascii_lowercase()));
        }
        assert!(a.mean.is_none());
    }

    #[test]
    fn test_pi_estimate_is_close() {
        let summary =
            run_workload(Workload::Pi, &RunConfig::parallel(200).with_pool_size(4), 7, None)
                .unwrap();
        let estimate = summary.mean.unwrap();
        assert!((estimate - std::f64::consts::PI).abs() < 0.05, "estimate {}", estimate);
    }

    #[test]
    fn test_injected_failure_surfaces_index() {
        let err = run_workload(Workload::Pi, &RunConfig::parallel(50).with_pool_size(2), 7, Some(13))
            .unwrap_err();
        assert_eq!(err.trial_index(), Some(13));
        assert!(err.to_string().contains("injected failure at trial 13"));
    }

    #[test]
    fn test_empty_run_has_no_mean() {
        let summary = run_workload(Workload::Fib, &RunConfig::sequential(0), 1, None).unwrap();
        assert!(summary.mean.is_none());
        assert!(summary.preview.is_empty());
    }
}

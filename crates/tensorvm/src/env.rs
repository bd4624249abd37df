use std::env;
use std::sync::OnceLock;

static WORKERS: OnceLock<Option<usize>> = OnceLock::new();
static FOLD_ITERS: OnceLock<usize> = OnceLock::new();
static PASS_STATS: OnceLock<bool> = OnceLock::new();
static FORCE_SCALAR: OnceLock<bool> = OnceLock::new();
static PLAN_CACHE_CAPACITY: OnceLock<Option<usize>> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn parse_usize(name: &'static str) -> Option<usize> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value.trim().parse().ok(),
        _ => None,
    }
}

/// Worker-thread count override (`TENSORVM_WORKERS`); defaults to the
/// host parallelism when unset.
pub(crate) fn worker_override() -> Option<usize> {
    *WORKERS.get_or_init(|| parse_usize("TENSORVM_WORKERS").filter(|&n| n > 0))
}

/// Bound on constant-folding fixed-point iterations (`TENSORVM_FOLD_ITERS`).
pub(crate) fn fold_iters() -> usize {
    *FOLD_ITERS.get_or_init(|| parse_usize("TENSORVM_FOLD_ITERS").unwrap_or(8).max(1))
}

/// Whether optimizer passes report per-pass statistics to the profile sink
/// (`TENSORVM_PASS_STATS`).
pub(crate) fn pass_stats_enabled() -> bool {
    *PASS_STATS.get_or_init(|| match env::var("TENSORVM_PASS_STATS") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

/// Forces every kernel onto the scalar path (`TENSORVM_FORCE_SCALAR`),
/// bypassing the vector units without re-probing capabilities.
pub fn force_scalar() -> bool {
    *FORCE_SCALAR.get_or_init(|| match env::var("TENSORVM_FORCE_SCALAR") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

/// Plan-cache capacity override (`TENSORVM_PLAN_CACHE`).
pub(crate) fn plan_cache_capacity() -> Option<usize> {
    *PLAN_CACHE_CAPACITY.get_or_init(|| parse_usize("TENSORVM_PLAN_CACHE").filter(|&n| n > 0))
}

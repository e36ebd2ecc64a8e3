use tj_core::CompatibilityMode;

/// Knobs for a [`crate::GraphExecutor`]. `Default` gives an optimizing,
/// grad-enabled, unbounded, strict executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Run constant pooling and dead code elimination while specializing.
    pub optimize: bool,
    /// Whether inputs' requires-grad flags are honored. When false every
    /// specialization is inference-only.
    pub grad_enabled: bool,
    /// Group differentiable nodes into `prim::DifferentiableGraph` nodes of
    /// at least this many members.
    pub autodiff_subgraph_threshold: Option<usize>,
    /// LRU bound on cached plans.
    pub cache_capacity: Option<usize>,
    pub mode: CompatibilityMode,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            optimize: true,
            grad_enabled: true,
            autodiff_subgraph_threshold: None,
            cache_capacity: None,
            mode: CompatibilityMode::Strict,
        }
    }
}

impl ExecutorOptions {
    /// Defaults overlaid with `TJ_EXECUTOR_CACHE_CAPACITY`,
    /// `TJ_AUTODIFF_SUBGRAPH_THRESHOLD`, `TJ_DISABLE_OPTIMIZATION`,
    /// `TJ_GRAD_ENABLED` and `TJ_COMPATIBILITY_MODE`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`ExecutorOptions::from_env`] with variables read from `lookup`.
    /// Unparseable values are ignored with a warning.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut options = Self::default();
        if let Some(raw) = lookup("TJ_EXECUTOR_CACHE_CAPACITY") {
            options.cache_capacity = parse_optional_count("TJ_EXECUTOR_CACHE_CAPACITY", &raw)
                .unwrap_or(options.cache_capacity);
        }
        if let Some(raw) = lookup("TJ_AUTODIFF_SUBGRAPH_THRESHOLD") {
            options.autodiff_subgraph_threshold =
                parse_optional_count("TJ_AUTODIFF_SUBGRAPH_THRESHOLD", &raw)
                    .unwrap_or(options.autodiff_subgraph_threshold);
        }
        if let Some(raw) = lookup("TJ_DISABLE_OPTIMIZATION")
            && let Some(disable) = parse_flag("TJ_DISABLE_OPTIMIZATION", &raw)
        {
            options.optimize = !disable;
        }
        if let Some(raw) = lookup("TJ_GRAD_ENABLED")
            && let Some(enabled) = parse_flag("TJ_GRAD_ENABLED", &raw)
        {
            options.grad_enabled = enabled;
        }
        if let Some(raw) = lookup("TJ_COMPATIBILITY_MODE") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "strict" => options.mode = CompatibilityMode::Strict,
                "hardened" => options.mode = CompatibilityMode::Hardened,
                other => log::warn!("ignoring TJ_COMPATIBILITY_MODE={other}"),
            }
        }
        options
    }
}

/// `none`/`0` mean unset. `None` signals an unparseable value.
fn parse_optional_count(name: &str, raw: &str) -> Option<Option<usize>> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("none") {
        return Some(None);
    }
    match trimmed.parse::<usize>() {
        Ok(0) => Some(None),
        Ok(count) => Some(Some(count)),
        Err(_) => {
            log::warn!("ignoring {name}={raw}");
            None
        }
    }
}

fn parse_flag(name: &str, raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            log::warn!("ignoring {name}={raw}");
            None
        }
    }
}

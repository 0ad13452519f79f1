use kiln_core::config::fixed_pool_size;
use tracing::warn;

/// Where duplicate workers of one inner task run.
pub(crate) enum WorkPool {
    /// One named scoped thread per duplicate; growth is bounded by tokens.
    Dynamic,
    /// Tasks that take no tokens would otherwise spawn without bound.
    Fixed(rayon::ThreadPool),
}

impl WorkPool {
    pub(crate) fn for_task(name: &str, token_count: usize, max_tokens: usize) -> Self {
        if token_count > 0 {
            return Self::Dynamic;
        }
        let threads = fixed_pool_size(max_tokens);
        let prefix = name.to_string();
        match rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |i| format!("{prefix}-dup-{i}"))
            .build()
        {
            Ok(pool) => Self::Fixed(pool),
            Err(e) => {
                warn!("Falling back to scoped threads for {}: {}", name, e);
                Self::Dynamic
            }
        }
    }

    /// Upper bound on concurrent workers, core invocation included.
    pub(crate) fn worker_cap(token_count: usize, max_tokens: usize, max_environment_factor: i32) -> Option<usize> {
        let factor_cap = usize::try_from(max_environment_factor).ok().filter(|n| *n > 0);
        if token_count > 0 {
            return factor_cap;
        }
        let threads = fixed_pool_size(max_tokens);
        Some(factor_cap.map_or(threads, |cap| cap.min(threads)))
    }
}

//! Thread-local cache of compiled Oniguruma patterns
//!
//! Grammar patterns are compiled on first use and cached by their final
//! source text. End/while patterns resolved with backreferences at push time
//! embed the captured text in their source, so the same cache also serves as
//! the per-instance cache for those: re-tokenizing a line that re-enters the
//! same rule with the same captured text reuses the compiled regex.
//!
//! Failed compilations are cached too, so an invalid pattern is reported
//! once per thread and then skipped.
//!
//! Resolved end/while patterns add one entry per distinct captured text. The
//! cache is therefore bounded by [`MAX_CACHE_SIZE`] and starts over when it
//! is full. Grammar patterns keep their compiled regex in their own lazy
//! slots, so only resolved patterns are ever compiled again.

use super::error::PatternCompileError;
use ahash::RandomState;
use hashbrown::HashMap;
use onig::{Regex, RegexOptions, Syntax};
use std::cell::RefCell;
use std::sync::Arc;

type CacheResult = Result<Arc<Regex>, PatternCompileError>;

/// Entries kept per thread before the cache is cleared
pub const MAX_CACHE_SIZE: usize = 1024;

thread_local! {
    /// Thread-local cache of compiled regex patterns
    static REGEX_CACHE: RefCell<HashMap<String, CacheResult, RandomState>> =
        RefCell::new(HashMap::default());

    static STATS: RefCell<CacheStats> = RefCell::new(CacheStats::default());
}

/// Hit/miss counters for the current thread's cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that compiled a pattern
    pub misses: u64,
}

/// Compile a pattern with the options TextMate grammars expect
///
/// Plain groups stay capturing even when a pattern also uses named groups.
pub fn compile(pattern: &str) -> CacheResult {
    Regex::with_options(
        pattern,
        RegexOptions::REGEX_OPTION_CAPTURE_GROUP,
        Syntax::default(),
    )
    .map(Arc::new)
    .map_err(|err| PatternCompileError {
        pattern: pattern.to_string(),
        message: err.description().to_string(),
    })
}

/// Get or compile a regex pattern
///
/// # Returns
/// * `Ok(regex)` if the pattern is valid
/// * `Err(error)` if the pattern is invalid (cached as well)
#[inline]
pub fn get_or_compile(pattern: &str) -> CacheResult {
    REGEX_CACHE.with(|cache| {
        if let Some(result) = cache.borrow().get(pattern) {
            STATS.with(|s| s.borrow_mut().hits += 1);
            return result.clone();
        }

        STATS.with(|s| s.borrow_mut().misses += 1);
        let result = compile(pattern);
        if let Err(_err) = &result {
            log_warn!("{}", _err);
        }

        let mut cache = cache.borrow_mut();
        if cache.len() >= MAX_CACHE_SIZE {
            log_debug!("Regex cache full ({} patterns), clearing", cache.len());
            cache.clear();
        }
        cache.insert(pattern.to_string(), result.clone());
        result
    })
}

/// Clear the regex cache of the current thread
///
/// Call this to free memory if many unique patterns have been compiled.
pub fn clear_cache() {
    REGEX_CACHE.with(|cache| cache.borrow_mut().clear());
    STATS.with(|s| *s.borrow_mut() = CacheStats::default());
}

/// Get the number of cached patterns
pub fn cache_size() -> usize {
    REGEX_CACHE.with(|cache| cache.borrow().len())
}

/// Get the hit/miss counters of the current thread
pub fn stats() -> CacheStats {
    STATS.with(|s| *s.borrow())
}

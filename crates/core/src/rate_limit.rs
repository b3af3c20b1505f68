// Per-caller sliding-window rate limits

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("rate limit exceeded for {scope}, retry in {}s", .retry_after.as_secs().max(1))]
    Exceeded { scope: String, retry_after: Duration },
}

impl RateLimitError {
    pub fn retry_after(&self) -> Duration {
        match self {
            RateLimitError::Exceeded { retry_after, .. } => *retry_after,
        }
    }
}

/// Request allowance within a window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    pub fn per_minute(max_requests: usize) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }
}

/// Settings for [`RateLimiter`], as found in the `[rate_limit]` config section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Requests per minute per caller, across all methods. 0 disables.
    pub requests_per_minute: usize,
    /// Tools with their own stricter per-caller limit
    pub expensive_tools: BTreeSet<String>,
    pub expensive_per_minute: usize,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_minute: 120,
            expensive_tools: BTreeSet::new(),
            expensive_per_minute: 5,
        }
    }
}

/// Timestamps of accepted requests inside the current window
#[derive(Debug, Default)]
struct SlidingWindow {
    hits: VecDeque<Instant>,
}

impl SlidingWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.hits.front() {
            if now.duration_since(oldest) >= window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record a hit, or return how long until one would be accepted
    fn try_hit(&mut self, now: Instant, config: RateLimitConfig) -> Result<(), Duration> {
        self.prune(now, config.window);
        if self.hits.len() < config.max_requests {
            self.hits.push_back(now);
            return Ok(());
        }
        let oldest = self.hits.front().copied().unwrap_or(now);
        Err(config.window.saturating_sub(now.duration_since(oldest)))
    }

    fn undo(&mut self) {
        self.hits.pop_back();
    }
}

/// Sliding-window limiter keyed by caller id, with a second, stricter
/// window per (caller, tool) for expensive tools.
pub struct RateLimiter {
    general: Option<RateLimitConfig>,
    expensive: Option<RateLimitConfig>,
    expensive_tools: BTreeSet<String>,
    per_caller: Mutex<HashMap<String, SlidingWindow>>,
    per_caller_tool: Mutex<HashMap<(String, String), SlidingWindow>>,
}

impl RateLimiter {
    pub fn new(settings: &RateLimitSettings) -> Self {
        let enabled = |n: usize| (n > 0).then(|| RateLimitConfig::per_minute(n));
        Self {
            general: enabled(settings.requests_per_minute),
            expensive: enabled(settings.expensive_per_minute),
            expensive_tools: settings.expensive_tools.clone(),
            per_caller: Mutex::new(HashMap::new()),
            per_caller_tool: Mutex::new(HashMap::new()),
        }
    }

    /// Limiter with explicit windows, for tests and embedders
    pub fn with_configs(
        general: Option<RateLimitConfig>,
        expensive: Option<RateLimitConfig>,
        expensive_tools: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            general,
            expensive,
            expensive_tools: expensive_tools.into_iter().collect(),
            per_caller: Mutex::new(HashMap::new()),
            per_caller_tool: Mutex::new(HashMap::new()),
        }
    }

    /// A limiter that accepts everything
    pub fn unlimited() -> Self {
        Self::with_configs(None, None, Vec::new())
    }

    pub fn is_expensive(&self, tool: &str) -> bool {
        self.expensive_tools.contains(tool)
    }

    /// Count one request by `caller`, optionally for `tool`.
    ///
    /// A request rejected by the expensive-tool window does not consume
    /// general allowance.
    pub fn check(&self, caller: &str, tool: Option<&str>) -> Result<(), RateLimitError> {
        self.check_at(caller, tool, Instant::now())
    }

    fn check_at(&self, caller: &str, tool: Option<&str>, now: Instant) -> Result<(), RateLimitError> {
        let mut callers = self.per_caller.lock();
        let mut general_hit = false;
        if let Some(config) = self.general {
            let window = callers.entry(caller.to_string()).or_default();
            window.try_hit(now, config).map_err(|retry_after| RateLimitError::Exceeded {
                scope: format!("caller {}", caller),
                retry_after,
            })?;
            general_hit = true;
        }

        if let (Some(config), Some(tool)) = (self.expensive, tool) {
            if self.is_expensive(tool) {
                let mut tools = self.per_caller_tool.lock();
                let window = tools
                    .entry((caller.to_string(), tool.to_string()))
                    .or_default();
                if let Err(retry_after) = window.try_hit(now, config) {
                    if general_hit {
                        if let Some(window) = callers.get_mut(caller) {
                            window.undo();
                        }
                    }
                    return Err(RateLimitError::Exceeded {
                        scope: format!("tool {}", tool),
                        retry_after,
                    });
                }
            }
        }
        Ok(())
    }

    /// Drop windows with no hits inside their period
    pub fn cleanup(&self) {
        let now = Instant::now();
        if let Some(config) = self.general {
            let mut callers = self.per_caller.lock();
            callers.values_mut().for_each(|w| w.prune(now, config.window));
            callers.retain(|_, w| !w.hits.is_empty());
        }
        if let Some(config) = self.expensive {
            let mut tools = self.per_caller_tool.lock();
            tools.values_mut().for_each(|w| w.prune(now, config.window));
            tools.retain(|_, w| !w.hits.is_empty());
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("general", &self.general)
            .field("expensive", &self.expensive)
            .field("expensive_tools", &self.expensive_tools)
            .finish()
    }
}

//! Atomic multi-window rate limiting.
//!
//! A [`RateLimitWindow`] is an ordered list of `(attempts, seconds)`
//! entries, e.g. "5 per minute, then 20 per hour". Each check increments
//! one counter per entry inside a single server-side script, so concurrent
//! checks from any number of processes never interleave.
//!
//! Every increment refreshes the counter's expiry. A bucket therefore lives
//! for `seconds` after the *last* hit rather than the first, which makes a
//! steady stream of requests stay limited longer than a strict fixed window
//! would.

use crate::backend::{RemoteStore, Script, ScriptContext};
use crate::error::{Error, Result};
use crate::key::CacheKeyBuilder;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// One limit within a window: at most `attempts` hits per `seconds`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowEntry {
    pub attempts: u32,
    pub seconds: u32,
}

impl WindowEntry {
    pub fn new(attempts: u32, seconds: u32) -> Self {
        WindowEntry { attempts, seconds }
    }
}

/// Ordered set of limits evaluated together. The first exceeded entry wins.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitWindow {
    /// Keys the cache of prepared script arguments. Two windows with
    /// different entries must not share an id.
    pub id: i32,
    pub entries: Vec<WindowEntry>,
}

impl RateLimitWindow {
    pub fn new(id: i32, entries: Vec<WindowEntry>) -> Self {
        RateLimitWindow { id, entries }
    }

    pub fn validate(&self) -> Result<()> {
        if self.entries.is_empty() {
            return Err(Error::ConfigError(format!(
                "Rate limit window {} has no entries",
                self.id
            )));
        }
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.attempts == 0 || entry.seconds == 0 {
                return Err(Error::ConfigError(format!(
                    "Rate limit window {} entry {} needs positive attempts and seconds (got {}/{}s)",
                    self.id, i, entry.attempts, entry.seconds
                )));
            }
        }
        Ok(())
    }

    /// Script arguments: `[attempts0, seconds0, attempts1, seconds1, ...]`.
    fn flatten(&self) -> Vec<i64> {
        self.entries
            .iter()
            .flat_map(|e| [i64::from(e.attempts), i64::from(e.seconds)])
            .collect()
    }
}

/// Outcome of one [`RateLimiter::check`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitResult {
    /// Hits counted against the deciding entry. When over the limit this is
    /// the count before the rejected hit.
    pub count: i64,
    /// 1-based position of the exceeded entry, or 0 when under every limit.
    pub index: usize,
    pub over_limit: bool,
}

impl fmt::Display for RateLimitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.over_limit {
            write!(f, "over limit at entry {} ({} hits)", self.index, self.count)
        } else {
            write!(f, "under limit ({} hits)", self.count)
        }
    }
}

const RATE_LIMIT_LUA: &str = r#"
local first = 0
for i = 1, #KEYS do
    local count = redis.call('INCR', KEYS[i])
    redis.call('EXPIRE', KEYS[i], ARGV[i * 2])
    if i == 1 then
        first = count
    end
    if count > tonumber(ARGV[i * 2 - 1]) then
        return {count - 1, i, 1}
    end
end
return {first, 0, 0}
"#;

fn rate_limit_native(ctx: &mut dyn ScriptContext, keys: &[String], args: &[i64]) -> Vec<i64> {
    let mut first = 0;
    for (i, key) in keys.iter().enumerate() {
        let count = ctx.incr(key);
        let attempts = args.get(i * 2).copied().unwrap_or(0);
        let seconds = args.get(i * 2 + 1).copied().unwrap_or(0);
        ctx.expire(key, Duration::from_secs(seconds.max(0) as u64));
        if i == 0 {
            first = count;
        }
        if count > attempts {
            return vec![count - 1, i as i64 + 1, 1];
        }
    }
    vec![first, 0, 0]
}

pub static RATE_LIMIT_SCRIPT: Script = Script {
    name: "coord_kit_rate_limit",
    source: RATE_LIMIT_LUA,
    native: rate_limit_native,
};

const RATE_LIMIT_CLEAR_LUA: &str = r#"
return {redis.call('DEL', unpack(KEYS))}
"#;

fn rate_limit_clear_native(
    ctx: &mut dyn ScriptContext,
    keys: &[String],
    _args: &[i64],
) -> Vec<i64> {
    for key in keys {
        ctx.del(key);
    }
    vec![keys.len() as i64]
}

/// Deletes every counter of a window in one step.
pub static RATE_LIMIT_CLEAR_SCRIPT: Script = Script {
    name: "coord_kit_rate_limit_clear",
    source: RATE_LIMIT_CLEAR_LUA,
    native: rate_limit_clear_native,
};

/// Checks and clears rate-limit counters on the shared store.
///
/// # Example
///
/// ```
/// use coord_kit::backend::InMemoryStore;
/// use coord_kit::rate_limit::{RateLimitWindow, RateLimiter, WindowEntry};
///
/// # #[tokio::main]
/// # async fn main() -> coord_kit::Result<()> {
/// let limiter = RateLimiter::new(InMemoryStore::new());
/// let login = RateLimitWindow::new(1, vec![WindowEntry::new(5, 60)]);
///
/// let result = limiter.check("login:10.0.0.1", &login).await?;
/// assert!(!result.over_limit);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RateLimiter<R: RemoteStore> {
    store: R,
    prepared: Arc<DashMap<i32, Arc<Vec<i64>>>>,
}

impl<R: RemoteStore> RateLimiter<R> {
    pub fn new(store: R) -> Self {
        RateLimiter {
            store,
            prepared: Arc::new(DashMap::new()),
        }
    }

    /// Register the scripts with the store ahead of the first call.
    pub async fn load(&self) -> Result<()> {
        self.store.load_script(&RATE_LIMIT_SCRIPT).await?;
        self.store.load_script(&RATE_LIMIT_CLEAR_SCRIPT).await
    }

    /// Count one hit for `key` against every entry of `window`.
    ///
    /// Store errors are returned as-is; failing open or closed is the
    /// caller's policy.
    pub async fn check(&self, key: &str, window: &RateLimitWindow) -> Result<RateLimitResult> {
        window.validate()?;

        let args = self.arguments(window);
        let keys = counter_keys(key, window);
        let reply = self.eval(&RATE_LIMIT_SCRIPT, &keys, &args).await?;

        let result = parse_reply(&reply)?;
        if result.over_limit {
            debug!("✗ Rate limit hit for {}: {}", key, result);
        } else {
            debug!("✓ Rate limit check for {}: {}", key, result);
        }
        Ok(result)
    }

    /// Reset every counter of `window` for `key`.
    ///
    /// All counters go in one script call: a concurrent check sees either
    /// all of them or none.
    pub async fn clear(&self, key: &str, window: &RateLimitWindow) -> Result<()> {
        let keys = counter_keys(key, window);
        self.eval(&RATE_LIMIT_CLEAR_SCRIPT, &keys, &[]).await?;
        debug!("✓ Rate limit counters cleared for {} ({} keys)", key, keys.len());
        Ok(())
    }

    /// Run `script`, loading it once and retrying if the store lost it.
    async fn eval(
        &self,
        script: &'static Script,
        keys: &[String],
        args: &[i64],
    ) -> Result<Vec<i64>> {
        match self.store.eval_script(script, keys, args).await {
            Err(Error::ScriptNotFound(name)) => {
                warn!("⚠ Script {} missing on store, reloading", name);
                self.store.load_script(script).await?;
                self.store.eval_script(script, keys, args).await
            }
            other => other,
        }
    }

    fn arguments(&self, window: &RateLimitWindow) -> Arc<Vec<i64>> {
        self.prepared
            .entry(window.id)
            .or_insert_with(|| Arc::new(window.flatten()))
            .value()
            .clone()
    }
}

fn counter_keys(key: &str, window: &RateLimitWindow) -> Vec<String> {
    (0..window.entries.len())
        .map(|i| CacheKeyBuilder::rate_limit(key, i))
        .collect()
}

fn parse_reply(reply: &[i64]) -> Result<RateLimitResult> {
    match reply {
        &[count, index, over] if index >= 0 => Ok(RateLimitResult {
            count,
            index: index as usize,
            over_limit: over != 0,
        }),
        _ => Err(Error::BackendError(format!(
            "Unexpected rate limit script reply: {:?}",
            reply
        ))),
    }
}

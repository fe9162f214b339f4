//! Single entry point used by request handlers.
//!
//! The facade picks a window store once at startup and then answers every
//! check with a `LimitDecision`. Backend faults and expired deadlines never
//! reach the caller: they are turned into a decision by the configured
//! `FailurePolicy`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::backend::{BackendKind, WindowStore};
use super::clock::{Clock, SystemClock};
use super::decision::LimitDecision;
use super::limiter::{expiry_of, CountingMode, Quota, SlidingWindowLimiter};
use super::local::LocalWindowStore;
use super::remote::RemoteWindowStore;
use crate::config::{FormGuardConfig, RemoteConfig};
use crate::error::{FormGuardError, Result};

/// What to decide when the window store cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Admit the action and log the degradation
    #[default]
    FailOpen,
    /// Deny the action
    FailClosed,
}

/// Which store the configuration asks for. Decided once, before any check.
#[derive(Debug, Clone)]
pub enum BackendSelection {
    Local { sweep_every: u64 },
    Remote {
        remote: RemoteConfig,
        sweep_every: u64,
    },
}

impl BackendSelection {
    /// Validate `config` and choose a backend from it.
    pub fn from_config(config: &FormGuardConfig) -> Result<Self> {
        config.validate()?;
        let sweep_every = config.limiter.sweep_every;
        if config.remote.is_configured() {
            Ok(BackendSelection::Remote {
                remote: config.remote.clone(),
                sweep_every,
            })
        } else {
            Ok(BackendSelection::Local { sweep_every })
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            BackendSelection::Local { .. } => BackendKind::Local,
            BackendSelection::Remote { .. } => BackendKind::Remote,
        }
    }

    /// Build the selected store.
    ///
    /// An unreachable remote backend falls back to the local store when
    /// `fallback_to_local` is set, and is a fatal configuration error otherwise.
    pub async fn into_store(self) -> Result<Arc<dyn WindowStore>> {
        match self {
            BackendSelection::Local { sweep_every } => Ok(Arc::new(LocalWindowStore::new(sweep_every))),
            BackendSelection::Remote {
                remote,
                sweep_every,
            } => match RemoteWindowStore::connect(&remote).await {
                Ok(store) => Ok(Arc::new(store)),
                Err(FormGuardError::BackendUnavailable(reason)) if remote.fallback_to_local => {
                    warn!(
                        reason = %reason,
                        "Remote window store unreachable at startup, limiting per instance only"
                    );
                    Ok(Arc::new(LocalWindowStore::new(sweep_every)))
                }
                Err(FormGuardError::BackendUnavailable(reason)) => {
                    error!(reason = %reason, "Remote window store unreachable at startup");
                    Err(FormGuardError::Configuration(format!(
                        "remote window store unreachable and fallback_to_local is disabled: {}",
                        reason
                    )))
                }
                Err(e) => Err(e),
            },
        }
    }
}

/// Counters describing what the facade has decided so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    pub checks: u64,
    pub denied: u64,
    /// Decisions made by the failure policy
    pub degraded: u64,
}

#[derive(Debug, Default)]
struct Counters {
    checks: AtomicU64,
    denied: AtomicU64,
    degraded: AtomicU64,
}

/// The rate limiter as seen by collaborators.
pub struct RateLimitFacade {
    limiter: SlidingWindowLimiter,
    failure_policy: FailurePolicy,
    counters: Counters,
}

impl RateLimitFacade {
    /// Validate `config`, select and build the backend, and return a ready facade.
    pub async fn from_config(config: &FormGuardConfig) -> Result<Self> {
        Self::from_config_with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn from_config_with_clock(
        config: &FormGuardConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let selection = BackendSelection::from_config(config)?;
        let quota = Quota::new(config.limiter.max_events, config.limiter.window())?;
        let requested = selection.kind();
        let store = selection.into_store().await?;

        info!(
            backend = %store.kind(),
            requested = %requested,
            max_events = quota.max_events(),
            window_secs = config.limiter.window_secs,
            failure_policy = ?config.limiter.failure_policy,
            counting = ?config.limiter.counting,
            "Rate limiter backend selected"
        );

        Ok(Self::with_store(
            store,
            clock,
            quota,
            config.limiter.counting,
            config.limiter.failure_policy,
        ))
    }

    /// Assemble a facade around an already built store.
    pub fn with_store(
        store: Arc<dyn WindowStore>,
        clock: Arc<dyn Clock>,
        quota: Quota,
        counting: CountingMode,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            limiter: SlidingWindowLimiter::new(store, clock, quota, counting),
            failure_policy,
            counters: Counters::default(),
        }
    }

    /// Check and record an action by `identifier`.
    pub async fn check_rate_limit(&self, identifier: &str) -> LimitDecision {
        let outcome = self.limiter.check_default(identifier).await;
        self.settle(identifier, outcome)
    }

    /// Like `check_rate_limit`, but gives up at `deadline` and applies the
    /// failure policy instead of keeping the caller waiting.
    pub async fn check_with_deadline(&self, identifier: &str, deadline: Instant) -> LimitDecision {
        let budget = deadline.saturating_duration_since(Instant::now());
        let outcome = match tokio::time::timeout_at(deadline, self.limiter.check_default(identifier))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(FormGuardError::DeadlineExceeded(budget)),
        };
        self.settle(identifier, outcome)
    }

    /// Where `identifier` stands, without consuming quota.
    pub async fn rate_limit_info(&self, identifier: &str) -> LimitDecision {
        match self.limiter.peek(identifier, self.limiter.quota()).await {
            Ok(decision) => decision,
            Err(e) => self.degrade(&e),
        }
    }

    pub fn backend(&self) -> BackendKind {
        self.limiter.backend()
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub fn quota(&self) -> Quota {
        self.limiter.quota()
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            checks: self.counters.checks.load(Ordering::Relaxed),
            denied: self.counters.denied.load(Ordering::Relaxed),
            degraded: self.counters.degraded.load(Ordering::Relaxed),
        }
    }

    fn settle(&self, identifier: &str, outcome: Result<LimitDecision>) -> LimitDecision {
        self.counters.checks.fetch_add(1, Ordering::Relaxed);
        let decision = match outcome {
            Ok(decision) => decision,
            Err(e) => self.degrade(&e),
        };
        if !decision.allowed {
            self.counters.denied.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            identifier = %identifier,
            allowed = decision.allowed,
            remaining = decision.remaining,
            degraded = decision.degraded,
            "Rate limit decision made"
        );
        decision
    }

    fn degrade(&self, err: &FormGuardError) -> LimitDecision {
        self.counters.degraded.fetch_add(1, Ordering::Relaxed);
        if err.is_transient() {
            warn!(
                backend = %self.backend(),
                policy = ?self.failure_policy,
                error = %err,
                "Window store unavailable, applying failure policy"
            );
        } else {
            error!(
                backend = %self.backend(),
                policy = ?self.failure_policy,
                error = %err,
                "Unexpected window store error, applying failure policy"
            );
        }

        let quota = self.limiter.quota();
        let now = self.limiter.clock().now_millis();
        let reset_at = expiry_of(now, quota.window());
        match self.failure_policy {
            FailurePolicy::FailOpen => LimitDecision {
                allowed: true,
                remaining: quota.max_events().saturating_sub(1),
                reset_at,
                degraded: true,
            },
            FailurePolicy::FailClosed => LimitDecision {
                allowed: false,
                remaining: 0,
                reset_at,
                degraded: true,
            },
        }
    }
}

//! Metrics collection for observability
//!
//! Each ledger owns its own Prometheus registry, so several ledgers (tests,
//! embedded hosts) can live in one process.
//!
//! # Metrics
//!
//! - `ledger_votes_committed_total` - Votes applied
//! - `ledger_votes_rejected_total{reason}` - Votes rejected, by error reason
//! - `ledger_commit_conflicts_total` - Commits aborted on a stale precondition
//! - `ledger_commit_duration_seconds` - Vote latency including retries
//! - `ledger_points_credited_total` - Points added by grants, adjustments and purchases
//! - `ledger_feed_subscribers` - Open feed subscriptions

use crate::{Error, Result};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct LedgerMetrics {
    /// Votes applied
    pub votes_committed: IntCounter,

    /// Votes rejected, labelled by reason
    pub votes_rejected: IntCounterVec,

    /// Aborted commits
    pub commit_conflicts: IntCounter,

    /// Vote latency histogram
    pub commit_duration: Histogram,

    /// Points credited
    pub points_credited: IntCounter,

    /// Open feed subscriptions
    pub feed_subscribers: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl LedgerMetrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let votes_committed =
            IntCounter::new("ledger_votes_committed_total", "Total number of votes applied")?;
        registry.register(Box::new(votes_committed.clone()))?;

        let votes_rejected = IntCounterVec::new(
            Opts::new("ledger_votes_rejected_total", "Total number of votes rejected"),
            &["reason"],
        )?;
        registry.register(Box::new(votes_rejected.clone()))?;

        let commit_conflicts = IntCounter::new(
            "ledger_commit_conflicts_total",
            "Commits aborted on a stale precondition",
        )?;
        registry.register(Box::new(commit_conflicts.clone()))?;

        let commit_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_commit_duration_seconds",
                "Histogram of vote latencies including retries",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(commit_duration.clone()))?;

        let points_credited =
            IntCounter::new("ledger_points_credited_total", "Total points credited")?;
        registry.register(Box::new(points_credited.clone()))?;

        let feed_subscribers =
            IntGauge::new("ledger_feed_subscribers", "Open live feed subscriptions")?;
        registry.register(Box::new(feed_subscribers.clone()))?;

        Ok(Self {
            votes_committed,
            votes_rejected,
            commit_conflicts,
            commit_duration,
            points_credited,
            feed_subscribers,
            registry,
        })
    }

    /// Record an applied vote
    pub fn record_vote_committed(&self, duration_seconds: f64) {
        self.votes_committed.inc();
        self.commit_duration.observe(duration_seconds);
    }

    /// Record a failed vote
    pub fn record_vote_failed(&self, error: &Error) {
        self.votes_rejected.with_label_values(&[error.reason()]).inc();
    }

    /// Record an aborted commit
    pub fn record_conflict(&self) {
        self.commit_conflicts.inc();
    }

    /// Count an aborted commit and pass the result through
    pub fn observe_commit(&self, result: Result<()>) -> Result<()> {
        if let Err(Error::ConcurrentConflict(_)) = &result {
            self.record_conflict();
        }
        result
    }

    /// Record credited points
    pub fn record_points_credited(&self, points: i64) {
        if points > 0 {
            self.points_credited.inc_by(points as u64);
        }
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the Prometheus text format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Other(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| Error::Other(format!("Metrics not UTF-8: {}", e)))
    }
}

//! Points Ledger
//!
//! Points-and-voting ledger: user balances, votes on listed tokens,
//! per-token tallies and an audit journal, kept consistent over a pluggable
//! store.
//!
//! # Architecture
//!
//! - **Store-side CAS**: every mutation is one atomic multi-record commit
//!   with optimistic version preconditions
//! - **Single Writer**: backends serialise check-then-write under one commit lock
//! - **Bounded Retry**: conflicts and store outages retry with backoff and jitter
//! - **Explicit Sessions**: no process-wide "current user"
//!
//! # Invariants
//!
//! - Conservation: points = starting points + Σ(completed journal amounts)
//! - Tally correctness: token votes = vote records in the current epoch
//! - At-most-once: one `cast_vote` call applies at most one vote
//! - Non-negative balance: a debit below zero is rejected, not applied
//! - Idempotent bootstrap: signing in again never resets points

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod accounts;
pub mod admin;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod journal;
pub mod ledger;
pub mod metrics;
pub mod registry;
pub mod reports;
pub mod retry;
pub mod session;
pub mod settings;
pub mod store;
pub mod types;

// Re-exports
pub use admin::AdminConsole;
pub use config::Config;
pub use error::{Error, Result};
pub use feed::Subscription;
pub use ledger::Ledger;
pub use session::Session;
pub use store::LedgerStore;
pub use types::{
    Account, FeedEntry, Identity, LoginMethod, PrimaryToken, SystemSettings, Token, TokenDetails,
    TokenName, TokenSpec, Transaction, TransactionKind, TransactionStatus, UserId, VoteRecord,
};

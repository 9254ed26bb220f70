//! Core types for the ledger
//!
//! All persisted types are serialized with bincode, so fields avoid
//! `skip_serializing_if` and untagged representations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Stable user identifier produced by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Create new user ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token name, trimmed and upper-cased
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenName(String);

impl TokenName {
    /// Normalize a raw name; `None` if nothing is left after trimming
    pub fn parse(raw: &str) -> Option<Self> {
        let name = raw.trim().to_uppercase();
        if name.is_empty() {
            None
        } else {
            Some(Self(name))
        }
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the user authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoginMethod {
    /// Browser wallet extension
    Wallet,
    /// OAuth provider
    OAuth,
}

/// Resolved identity handed over by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable identifier
    pub id: UserId,

    /// Display name
    pub display_name: String,

    /// Login method
    pub login_method: LoginMethod,

    /// Wallet address for wallet logins
    pub wallet_address: Option<String>,
}

impl Identity {
    /// Identity from a wallet connection, keyed by address
    pub fn wallet(address: impl Into<String>) -> Self {
        let address = address.into();
        let prefix: String = address.chars().take(8).collect();
        Self {
            id: UserId::new(address.clone()),
            display_name: format!("User{}", prefix),
            login_method: LoginMethod::Wallet,
            wallet_address: Some(address),
        }
    }

    /// Identity from an OAuth sign-in
    pub fn oauth(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            display_name: display_name.into(),
            login_method: LoginMethod::OAuth,
            wallet_address: None,
        }
    }
}

/// User account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// User ID
    pub id: UserId,

    /// Display name
    pub display_name: String,

    /// Login method used at creation
    pub login_method: LoginMethod,

    /// Wallet address
    pub wallet_address: Option<String>,

    /// Current balance
    pub points: i64,

    /// Balance granted at creation
    pub starting_points: i64,

    /// Votes cast over the account's lifetime
    pub total_votes_cast: u64,

    /// Points debited over the account's lifetime
    pub total_points_spent: i64,

    /// Creation time
    pub joined_at: DateTime<Utc>,

    /// Last bootstrap
    pub last_login_at: DateTime<Utc>,

    /// Whether the account may vote
    pub active: bool,
}

impl Account {
    /// Fresh account for an identity
    pub fn open(identity: &Identity, starting_points: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: identity.id.clone(),
            display_name: identity.display_name.clone(),
            login_method: identity.login_method,
            wallet_address: identity.wallet_address.clone(),
            points: starting_points,
            starting_points,
            total_votes_cast: 0,
            total_points_spent: 0,
            joined_at: now,
            last_login_at: now,
            active: true,
        }
    }
}

/// Voteable token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// Primary key
    pub name: TokenName,

    /// Display icon
    pub icon: String,

    /// Color tag used by the UI
    pub color_tag: String,

    /// Free-form description
    pub description: Option<String>,

    /// Votes in the current tally epoch
    pub total_votes: u64,

    /// Accepting votes
    pub active: bool,

    /// Contract address or other external reference
    pub contract_ref: Option<String>,

    /// Registration time
    pub created_at: DateTime<Utc>,
}

/// Input for registering a token
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenSpec {
    /// Raw name (normalized on registration)
    pub name: String,

    /// Display icon
    pub icon: String,

    /// Color tag
    pub color_tag: String,

    /// Description
    pub description: Option<String>,

    /// Contract reference
    pub contract_ref: Option<String>,
}

impl TokenSpec {
    /// Definition with name, icon and color
    pub fn new(name: impl Into<String>, icon: impl Into<String>, color_tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            icon: icon.into(),
            color_tag: color_tag.into(),
            description: None,
            contract_ref: None,
        }
    }
}

/// Editable token fields; `None` leaves a field unchanged
#[derive(Debug, Clone, Default)]
pub struct TokenDetails {
    /// New icon
    pub icon: Option<String>,
    /// New color tag
    pub color_tag: Option<String>,
    /// New description
    pub description: Option<String>,
    /// New contract reference
    pub contract_ref: Option<String>,
}

/// Committed vote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteRecord {
    /// Unique vote ID (UUIDv7 for time-ordering)
    pub vote_id: Uuid,

    /// Voter
    pub user_id: UserId,

    /// Token voted for
    pub token_name: TokenName,

    /// Points debited
    pub points_cost: i64,

    /// Tally epoch the vote counts towards
    pub epoch: u64,

    /// Commit time
    pub cast_at: DateTime<Utc>,
}

/// Kind of balance-affecting event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Vote debit
    Vote,
    /// Points bought through the payment collaborator
    Purchase,
    /// Operator grant
    AdminGrant,
    /// Operator correction (either sign)
    AdminAdjustment,
}

impl TransactionKind {
    /// Stable lowercase label
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Vote => "vote",
            TransactionKind::Purchase => "purchase",
            TransactionKind::AdminGrant => "admin_grant",
            TransactionKind::AdminAdjustment => "admin_adjustment",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    /// Applied to the balance
    Completed,
    /// Recorded for audit only, no balance effect
    Failed,
}

/// Journal entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction ID
    pub transaction_id: Uuid,

    /// Account affected
    pub user_id: UserId,

    /// Kind
    pub kind: TransactionKind,

    /// Signed amount: positive credits, negative debits
    pub amount: i64,

    /// Additional metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Event timestamp
    pub occurred_at: DateTime<Utc>,

    /// Status
    pub status: TransactionStatus,
}

impl Transaction {
    /// Whether the amount counts towards the balance
    pub fn is_completed(&self) -> bool {
        self.status == TransactionStatus::Completed
    }
}

/// Journal entry to commit alongside a balance change
#[derive(Debug, Clone)]
pub struct JournalEntry {
    /// Transaction ID (fresh UUIDv7 unless derived from an external reference)
    pub transaction_id: Uuid,

    /// Kind
    pub kind: TransactionKind,

    /// Metadata
    pub metadata: BTreeMap<String, String>,
}

impl JournalEntry {
    /// Entry with a fresh time-ordered ID
    pub fn new(kind: TransactionKind) -> Self {
        Self {
            transaction_id: Uuid::now_v7(),
            kind,
            metadata: BTreeMap::new(),
        }
    }

    /// Add a metadata field
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Override the transaction ID
    pub fn with_id(mut self, transaction_id: Uuid) -> Self {
        self.transaction_id = transaction_id;
        self
    }
}

/// Account state plus the transaction committed with it
#[derive(Debug, Clone, PartialEq)]
pub struct Posting {
    /// Account after the change
    pub account: Account,
    /// Journal record
    pub transaction: Transaction,
}

/// Featured token with its on-chain reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryToken {
    /// Display name
    pub name: String,
    /// Contract address
    pub contract_address: Option<String>,
    /// Description
    pub description: Option<String>,
}

/// Singleton system settings row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSettings {
    /// Points per vote
    pub vote_cost: i64,

    /// Points granted to new accounts
    pub default_starting_points: i64,

    /// Voting switch
    pub voting_enabled: bool,

    /// Current tally generation
    pub tally_epoch: u64,

    /// Token featured outside the voting board
    pub primary_token: Option<PrimaryToken>,

    /// Last change
    pub updated_at: DateTime<Utc>,
}

/// Live feed row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    /// Vote ID
    pub vote_id: Uuid,
    /// Voter
    pub user_id: UserId,
    /// Token
    pub token_name: TokenName,
    /// Points debited
    pub points_cost: i64,
    /// Commit time
    pub cast_at: DateTime<Utc>,
}

impl From<&VoteRecord> for FeedEntry {
    fn from(vote: &VoteRecord) -> Self {
        Self {
            vote_id: vote.vote_id,
            user_id: vote.user_id.clone(),
            token_name: vote.token_name.clone(),
            points_cost: vote.points_cost,
            cast_at: vote.cast_at,
        }
    }
}

//! Core types for the metering system.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a user.
pub type UserId = String;

/// Credit amounts in micro-units (1 credit = 1,000,000 micro-credits).
///
/// Signed so that ledger deltas can express both spends and refills.
pub type MicroCredits = i64;

/// Micro-credits per whole credit.
pub const MICROS_PER_CREDIT: i64 = 1_000_000;

/// Convert a fractional credit amount to micro-credits.
pub fn to_micros(credits: f64) -> MicroCredits {
    (credits * MICROS_PER_CREDIT as f64).round() as MicroCredits
}

/// Convert micro-credits to a fractional credit amount (for display and wire formats).
pub fn to_credits(micros: MicroCredits) -> f64 {
    micros as f64 / MICROS_PER_CREDIT as f64
}

/// Human-readable credit amount.
pub fn format_credits(micros: MicroCredits) -> String {
    let credits = to_credits(micros);
    if credits.abs() < 0.01 && micros != 0 {
        format!("{:.4} credits", credits)
    } else {
        format!("{:.2} credits", credits)
    }
}

/// Category of tokens being priced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenCategory {
    Prompt,
    Completion,
}

impl std::fmt::Display for TokenCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenCategory::Prompt => write!(f, "prompt"),
            TokenCategory::Completion => write!(f, "completion"),
        }
    }
}

/// Context in which a spend is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpendContext {
    /// A normal, fully delivered completion.
    Message,
    /// A generation aborted before it finished (client disconnect, stop button).
    Incomplete,
    /// Title or summary generation on behalf of the user.
    Title,
}

impl std::fmt::Display for SpendContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpendContext::Message => write!(f, "message"),
            SpendContext::Incomplete => write!(f, "incomplete"),
            SpendContext::Title => write!(f, "title"),
        }
    }
}

/// Token usage from an LLM response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }
}

/// Unit of an auto-refill interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
}

impl IntervalUnit {
    /// Length of `value` units, or `None` if it does not fit in a duration.
    /// Months are treated as 30 days.
    pub fn span(self, value: u32) -> Option<ChronoDuration> {
        let value = i64::from(value);
        match self {
            IntervalUnit::Seconds => ChronoDuration::try_seconds(value),
            IntervalUnit::Minutes => ChronoDuration::try_minutes(value),
            IntervalUnit::Hours => ChronoDuration::try_hours(value),
            IntervalUnit::Days => ChronoDuration::try_days(value),
            IntervalUnit::Weeks => ChronoDuration::try_weeks(value),
            IntervalUnit::Months => ChronoDuration::try_days(30 * value),
        }
    }
}

/// Locally persisted balance record.
///
/// `token_credits` is never negative; every write path clamps at zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalBalanceRecord {
    pub user_id: UserId,
    pub token_credits: MicroCredits,
    #[serde(default)]
    pub auto_refill_enabled: bool,
    #[serde(default)]
    pub refill_amount: MicroCredits,
    #[serde(default = "default_refill_interval_value")]
    pub refill_interval_value: u32,
    #[serde(default = "default_refill_interval_unit")]
    pub refill_interval_unit: IntervalUnit,
    #[serde(default)]
    pub last_refill: Option<DateTime<Utc>>,
}

fn default_refill_interval_value() -> u32 {
    30
}

fn default_refill_interval_unit() -> IntervalUnit {
    IntervalUnit::Days
}

impl LocalBalanceRecord {
    /// Create an empty balance for a user.
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            token_credits: 0,
            auto_refill_enabled: false,
            refill_amount: 0,
            refill_interval_value: default_refill_interval_value(),
            refill_interval_unit: default_refill_interval_unit(),
            last_refill: None,
        }
    }

    /// Whether an auto-refill is due at `now`.
    ///
    /// An interval too long to represent is never due.
    pub fn refill_due(&self, now: DateTime<Utc>) -> bool {
        if !self.auto_refill_enabled || self.refill_amount <= 0 {
            return false;
        }
        match self.last_refill {
            None => true,
            Some(last) => self
                .refill_interval_unit
                .span(self.refill_interval_value)
                .and_then(|span| last.checked_add_signed(span))
                .map_or(false, |due| due <= now),
        }
    }
}

/// Extra fields written together with a ledger delta.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BalanceUpdate {
    pub auto_refill_enabled: Option<bool>,
    pub refill_amount: Option<MicroCredits>,
    pub refill_interval: Option<(u32, IntervalUnit)>,
    pub last_refill: Option<DateTime<Utc>>,
}

impl BalanceUpdate {
    /// Apply these fields on top of a record.
    pub fn apply_to(&self, record: &mut LocalBalanceRecord) {
        if let Some(enabled) = self.auto_refill_enabled {
            record.auto_refill_enabled = enabled;
        }
        if let Some(amount) = self.refill_amount {
            record.refill_amount = amount.max(0);
        }
        if let Some((value, unit)) = self.refill_interval {
            record.refill_interval_value = value;
            record.refill_interval_unit = unit;
        }
        if let Some(at) = self.last_refill {
            record.last_refill = Some(at);
        }
    }
}

/// Kind of audited transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Prompt,
    Completion,
    /// Credits granted by an auto-refill.
    Credits,
}

impl From<TokenCategory> for TransactionType {
    fn from(category: TokenCategory) -> Self {
        match category {
            TokenCategory::Prompt => TransactionType::Prompt,
            TokenCategory::Completion => TransactionType::Completion,
        }
    }
}

/// Append-only audit record for a spend or refill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub user_id: UserId,
    pub token_type: TransactionType,
    /// Raw tokens consumed (or micro-credits granted for refills).
    pub raw_amount: u64,
    /// Effective USD price per million tokens, cancel multiplier included.
    pub rate: f64,
    /// Charged (or granted) amount.
    pub token_value: MicroCredits,
    pub model: String,
    pub context: String,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(
        user_id: impl Into<UserId>,
        token_type: TransactionType,
        raw_amount: u64,
        rate: f64,
        token_value: MicroCredits,
        model: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            token_type,
            raw_amount,
            rate,
            token_value,
            model: model.into(),
            context: context.into(),
            created_at: Utc::now(),
        }
    }
}

/// A provisional hold on a user's balance taken at admission time.
///
/// Reservations without a ticket are untracked (zero amounts, or local mode
/// where the ledger itself is the authority) and releasing them is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub user_id: UserId,
    pub amount: MicroCredits,
    pub(crate) ticket: Option<u64>,
}

impl Reservation {
    pub(crate) fn tracked(user_id: &str, amount: MicroCredits, ticket: u64) -> Self {
        Self {
            user_id: user_id.to_string(),
            amount,
            ticket: Some(ticket),
        }
    }

    pub(crate) fn untracked(user_id: &str, amount: MicroCredits) -> Self {
        Self {
            user_id: user_id.to_string(),
            amount,
            ticket: None,
        }
    }

    /// Whether this reservation holds capacity in the balance cache.
    pub fn is_tracked(&self) -> bool {
        self.ticket.is_some()
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The request may proceed; the reservation must be released once charged.
    Granted(Reservation),
    /// Not enough credit. Carries the observed balance and the exact amount required.
    Insufficient {
        balance: MicroCredits,
        required: MicroCredits,
    },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted(_))
    }
}

/// Result of recording a spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpendOutcome {
    pub credits_charged: MicroCredits,
    /// Balance after the charge, when the active ledger reports one.
    pub new_balance: Option<MicroCredits>,
}

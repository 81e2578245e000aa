//! Expiry policies shared by files, tickets and grants.
//!
//! Every expirable entity carries one of four policy types:
//!
//! - `none`: never expires.
//! - `single`: expires after the first qualifying event (download or upload).
//! - `auto`: expires using the system defaults.
//! - `custom`: expires using the entity's own limits.
//!
//! Time-based expiry is the earlier of two deadlines: `created_at + total_days`
//! and `last_event + days_since_last_event`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::datetime::add_days;
use crate::{FransError, Result};

/// Expiry policy type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpiryType {
    None,
    Single,
    Auto,
    Custom,
}

impl ExpiryType {
    /// Convert to the stored string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpiryType::None => "none",
            ExpiryType::Single => "single",
            ExpiryType::Auto => "auto",
            ExpiryType::Custom => "custom",
        }
    }
}

impl FromStr for ExpiryType {
    type Err = FransError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(ExpiryType::None),
            "single" => Ok(ExpiryType::Single),
            "auto" => Ok(ExpiryType::Auto),
            "custom" => Ok(ExpiryType::Custom),
            other => Err(FransError::Validation(format!(
                "unknown expiry type: {other}"
            ))),
        }
    }
}

impl TryFrom<String> for ExpiryType {
    type Error = FransError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl fmt::Display for ExpiryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// System-configured limits used by the `auto` policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryDefaults {
    pub total_days: i64,
    pub days_since_last_event: i64,
    pub total_events: i64,
}

/// Policy stored on a file, ticket or grant.
///
/// The numeric fields are only consulted for the `custom` type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    pub expiry_type: ExpiryType,
    pub total_days: i64,
    pub days_since_last_event: i64,
    pub total_events: i64,
}

impl ExpiryPolicy {
    pub fn new(
        expiry_type: ExpiryType,
        total_days: i64,
        days_since_last_event: i64,
        total_events: i64,
    ) -> Self {
        Self {
            expiry_type,
            total_days,
            days_since_last_event,
            total_events,
        }
    }

    pub fn none() -> Self {
        Self::new(ExpiryType::None, 0, 0, 0)
    }

    pub fn single() -> Self {
        Self::new(ExpiryType::Single, 0, 0, 0)
    }

    pub fn auto() -> Self {
        Self::new(ExpiryType::Auto, 0, 0, 0)
    }

    pub fn custom(total_days: i64, days_since_last_event: i64, total_events: i64) -> Self {
        Self::new(
            ExpiryType::Custom,
            total_days,
            days_since_last_event,
            total_events,
        )
    }

    /// Reject negative limits before they reach the database.
    pub fn validate(&self) -> Result<()> {
        if self.total_days < 0 || self.days_since_last_event < 0 || self.total_events < 0 {
            return Err(FransError::Validation(
                "expiry limits must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Limits in effect for this policy: its own for `custom`, the defaults otherwise.
    fn limits(&self, defaults: &ExpiryDefaults) -> ExpiryDefaults {
        match self.expiry_type {
            ExpiryType::Custom => ExpiryDefaults {
                total_days: self.total_days,
                days_since_last_event: self.days_since_last_event,
                total_events: self.total_events,
            },
            _ => *defaults,
        }
    }
}

/// Compute when an entity expires by time.
///
/// Returns `None` for the `none` policy. All arithmetic is in UTC.
pub fn estimated_expiry(
    policy: &ExpiryPolicy,
    defaults: &ExpiryDefaults,
    created_at: DateTime<Utc>,
    last_event: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    if policy.expiry_type == ExpiryType::None {
        return None;
    }
    let limits = policy.limits(defaults);
    let total_limit = add_days(created_at, limits.total_days);

    match last_event {
        None => Some(total_limit),
        Some(last) => {
            let event_limit = add_days(last, limits.days_since_last_event);
            Some(total_limit.min(event_limit))
        }
    }
}

/// Decide whether an entity should be deleted at `now`.
///
/// Count-based and time-based triggers are independent; either one suffices.
pub fn should_delete(
    policy: &ExpiryPolicy,
    defaults: &ExpiryDefaults,
    created_at: DateTime<Utc>,
    last_event: Option<DateTime<Utc>>,
    event_count: i64,
    now: DateTime<Utc>,
) -> bool {
    match policy.expiry_type {
        ExpiryType::None => false,
        ExpiryType::Single => event_count > 0,
        ExpiryType::Auto | ExpiryType::Custom => {
            if event_count >= policy.limits(defaults).total_events {
                return true;
            }
            estimated_expiry(policy, defaults, created_at, last_event)
                .is_some_and(|expiry| expiry < now)
        }
    }
}

/// An entity governed by an expiry policy and a qualifying-event counter.
pub trait Expirable {
    fn policy(&self) -> ExpiryPolicy;
    fn created_at(&self) -> DateTime<Utc>;
    fn last_event(&self) -> Option<DateTime<Utc>>;
    fn event_count(&self) -> i64;

    fn estimated_expiry(&self, defaults: &ExpiryDefaults) -> Option<DateTime<Utc>> {
        estimated_expiry(&self.policy(), defaults, self.created_at(), self.last_event())
    }

    fn should_delete(&self, defaults: &ExpiryDefaults, now: DateTime<Utc>) -> bool {
        should_delete(
            &self.policy(),
            defaults,
            self.created_at(),
            self.last_event(),
            self.event_count(),
            now,
        )
    }
}

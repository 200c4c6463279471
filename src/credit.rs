//! Credit ledger rules and grant arbitration
//!
//! Rewards are tied to the event id that triggered them; the uniqueness of
//! `(user_ref, kind, source_event_id)` in the ledger is the entire
//! idempotency mechanism. Daily/weekly caps are counters scoped to
//! `(user_ref, kind)`, zeroed by the scheduler's quota-reset job.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Lifecycle checkpoints that can earn credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditEventKind {
    LetterCreated,
    LetterGenerated,
    LetterDelivered,
    PublicLike,
    CourierFirstDelivery,
    CourierDelivery,
    MuseumApproved,
}

impl CreditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditEventKind::LetterCreated => "letter_created",
            CreditEventKind::LetterGenerated => "letter_generated",
            CreditEventKind::LetterDelivered => "letter_delivered",
            CreditEventKind::PublicLike => "public_like",
            CreditEventKind::CourierFirstDelivery => "courier_first_delivery",
            CreditEventKind::CourierDelivery => "courier_delivery",
            CreditEventKind::MuseumApproved => "museum_approved",
        }
    }

    pub fn all() -> [CreditEventKind; 7] {
        [
            CreditEventKind::LetterCreated,
            CreditEventKind::LetterGenerated,
            CreditEventKind::LetterDelivered,
            CreditEventKind::PublicLike,
            CreditEventKind::CourierFirstDelivery,
            CreditEventKind::CourierDelivery,
            CreditEventKind::MuseumApproved,
        ]
    }
}

impl std::str::FromStr for CreditEventKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CreditEventKind::all()
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| CoreError::bad_input(format!("unknown credit event kind: {s:?}")))
    }
}

impl std::fmt::Display for CreditEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reward rule for one event kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditRule {
    pub points: i64,
    pub daily_limit: Option<u32>,
    pub weekly_limit: Option<u32>,
    pub active: bool,
}

impl CreditRule {
    pub fn new(points: i64) -> Self {
        Self {
            points,
            daily_limit: None,
            weekly_limit: None,
            active: true,
        }
    }

    pub fn with_daily_limit(mut self, limit: u32) -> Self {
        self.daily_limit = Some(limit);
        self
    }

    pub fn with_weekly_limit(mut self, limit: u32) -> Self {
        self.weekly_limit = Some(limit);
        self
    }
}

/// One idempotent award of points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditGrant {
    pub id: Uuid,
    pub user_ref: String,
    pub kind: CreditEventKind,
    pub points: i64,
    pub source_event_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// A grant the lifecycle coordinator wants applied inside (or after) a
/// transition transaction; the store arbitrates caps and idempotency.
#[derive(Debug, Clone)]
pub struct PendingGrant {
    pub user_ref: String,
    pub kind: CreditEventKind,
    pub points: i64,
    pub daily_limit: Option<u32>,
    pub weekly_limit: Option<u32>,
}

/// What became of one pending grant.
#[derive(Debug, Clone)]
pub enum GrantOutcome {
    Granted(CreditGrant),
    /// A grant with the same (user, kind, event) already existed.
    Existing(CreditGrant),
    /// Daily or weekly cap reached; silent no-op for the caller.
    CapReached,
}

impl GrantOutcome {
    pub fn granted(&self) -> Option<&CreditGrant> {
        match self {
            GrantOutcome::Granted(g) => Some(g),
            _ => None,
        }
    }
}

/// Rule table consulted at lifecycle checkpoints.
#[derive(Debug, Clone)]
pub struct CreditEngine {
    rules: HashMap<CreditEventKind, CreditRule>,
}

impl CreditEngine {
    pub fn new(rules: HashMap<CreditEventKind, CreditRule>) -> Self {
        Self { rules }
    }

    /// The stock rule table; config entries override per kind.
    pub fn default_rules() -> HashMap<CreditEventKind, CreditRule> {
        let mut rules = HashMap::new();
        rules.insert(
            CreditEventKind::LetterCreated,
            CreditRule::new(10).with_daily_limit(5),
        );
        rules.insert(CreditEventKind::LetterGenerated, CreditRule::new(5));
        rules.insert(CreditEventKind::LetterDelivered, CreditRule::new(20));
        rules.insert(
            CreditEventKind::PublicLike,
            CreditRule::new(2).with_daily_limit(20),
        );
        rules.insert(CreditEventKind::CourierFirstDelivery, CreditRule::new(100));
        rules.insert(
            CreditEventKind::CourierDelivery,
            CreditRule::new(10).with_daily_limit(50).with_weekly_limit(200),
        );
        rules.insert(CreditEventKind::MuseumApproved, CreditRule::new(50));
        rules
    }

    pub fn rule(&self, kind: CreditEventKind) -> Option<&CreditRule> {
        self.rules.get(&kind)
    }

    /// Build the pending grant for `kind`, or `None` when the rule is
    /// missing or inactive (no-op per protocol step 1).
    pub fn pending(&self, user_ref: &str, kind: CreditEventKind) -> Option<PendingGrant> {
        let rule = self.rules.get(&kind).filter(|r| r.active)?;
        Some(PendingGrant {
            user_ref: user_ref.to_string(),
            kind,
            points: rule.points,
            daily_limit: rule.daily_limit,
            weekly_limit: rule.weekly_limit,
        })
    }
}

impl Default for CreditEngine {
    fn default() -> Self {
        Self::new(Self::default_rules())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_rule_yields_no_pending_grant() {
        let mut rules = CreditEngine::default_rules();
        if let Some(rule) = rules.get_mut(&CreditEventKind::LetterCreated) {
            rule.active = false;
        }
        let engine = CreditEngine::new(rules);
        assert!(engine.pending("alice", CreditEventKind::LetterCreated).is_none());
        assert!(engine.pending("alice", CreditEventKind::LetterDelivered).is_some());
    }

    #[test]
    fn pending_grant_carries_rule_limits() {
        let engine = CreditEngine::default();
        let pending = engine
            .pending("alice", CreditEventKind::LetterCreated)
            .expect("active rule");
        assert_eq!(pending.points, 10);
        assert_eq!(pending.daily_limit, Some(5));
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in CreditEventKind::all() {
            let parsed: CreditEventKind = kind.as_str().parse().expect("round trip");
            assert_eq!(parsed, kind);
        }
    }
}

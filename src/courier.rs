//! Courier hierarchy
//!
//! Couriers form a 4-level tree: city (L4) -> school (L3) -> area (L2) ->
//! building (L1). Each node manages an OP-Code prefix; a child's prefix must
//! begin with its parent's and its level sits exactly one beneath. City and
//! school nodes both manage 2-character prefixes (the school code), so the
//! L4 -> L3 edge is the one place equal prefixes are legal.
//!
//! Tree mutations are serialised per school subtree via a distributed lease,
//! which keeps concurrent re-parentings from producing orphans.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::lock::LockManager;
use crate::opcode::OpCodePrefix;
use crate::store::CoreStore;

// ============================================================================
// Model
// ============================================================================

/// Courier tier. Ordering follows authority: Building < Area < School < City.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CourierLevel {
    Building,
    Area,
    School,
    City,
}

impl CourierLevel {
    pub fn as_u8(&self) -> u8 {
        match self {
            CourierLevel::Building => 1,
            CourierLevel::Area => 2,
            CourierLevel::School => 3,
            CourierLevel::City => 4,
        }
    }

    pub fn from_u8(n: u8) -> Result<Self, CoreError> {
        match n {
            1 => Ok(CourierLevel::Building),
            2 => Ok(CourierLevel::Area),
            3 => Ok(CourierLevel::School),
            4 => Ok(CourierLevel::City),
            other => Err(CoreError::bad_input(format!(
                "courier level must be 1..=4, got {other}"
            ))),
        }
    }

    /// Required managed-prefix length at this level.
    pub fn prefix_len(&self) -> usize {
        match self {
            CourierLevel::Building => 6,
            CourierLevel::Area => 4,
            CourierLevel::School | CourierLevel::City => 2,
        }
    }

    /// The level a courier of this tier may create and manage.
    pub fn child(&self) -> Option<CourierLevel> {
        match self {
            CourierLevel::City => Some(CourierLevel::School),
            CourierLevel::School => Some(CourierLevel::Area),
            CourierLevel::Area => Some(CourierLevel::Building),
            CourierLevel::Building => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CourierStatus {
    Active,
    Suspended,
    /// Soft deletion; the row survives for audit and history.
    Resigned,
}

impl CourierStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CourierStatus::Active => "active",
            CourierStatus::Suspended => "suspended",
            CourierStatus::Resigned => "resigned",
        }
    }
}

impl std::str::FromStr for CourierStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(CourierStatus::Active),
            "suspended" => Ok(CourierStatus::Suspended),
            "resigned" => Ok(CourierStatus::Resigned),
            other => Err(CoreError::bad_input(format!(
                "unknown courier status: {other:?}"
            ))),
        }
    }
}

/// A node in the courier tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Courier {
    pub id: Uuid,
    pub user_ref: String,
    pub level: CourierLevel,
    pub managed_prefix: OpCodePrefix,
    pub parent_id: Option<Uuid>,
    pub status: CourierStatus,
    /// Set when a re-parent had to fall back to the grandparent.
    pub needs_reassignment: bool,
    /// Completed delivery legs.
    pub completed: i32,
    /// Legs completed without reassignment or failure.
    pub successful: i32,
    pub rating: f64,
    pub created_at: DateTime<Utc>,
}

impl Courier {
    pub fn new(
        user_ref: impl Into<String>,
        level: CourierLevel,
        managed_prefix: OpCodePrefix,
        parent_id: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_ref: user_ref.into(),
            level,
            managed_prefix,
            parent_id,
            status: CourierStatus::Active,
            needs_reassignment: false,
            completed: 0,
            successful: 0,
            rating: 5.0,
            created_at: Utc::now(),
        }
    }

    /// Fraction of completed legs that succeeded; unproven couriers rank as 1.0.
    pub fn success_rate(&self) -> f64 {
        if self.completed <= 0 {
            1.0
        } else {
            f64::from(self.successful) / f64::from(self.completed)
        }
    }

    /// The school subtree this courier belongs to, used as the tree-lock key.
    pub fn school_prefix(&self) -> &str {
        &self.managed_prefix.as_str()[..2]
    }
}

// ============================================================================
// Pure tree rules
// ============================================================================

/// Validate a prospective child against its parent: level one beneath,
/// prefix length matching the level, prefix beginning with the parent's
/// (strictly longer except on the City -> School edge).
pub fn validate_child(
    parent: &Courier,
    level: CourierLevel,
    prefix: &OpCodePrefix,
) -> Result<(), CoreError> {
    match parent.level.child() {
        Some(expected) if expected == level => {}
        _ => {
            return Err(CoreError::bad_input(format!(
                "level {} courier may only create level {} children",
                parent.level.as_u8(),
                parent
                    .level
                    .child()
                    .map(|l| l.as_u8().to_string())
                    .unwrap_or_else(|| "no".to_string()),
            )))
        }
    }
    if prefix.len() != level.prefix_len() {
        return Err(CoreError::bad_input(format!(
            "level {} prefix must be {} characters, got {}",
            level.as_u8(),
            level.prefix_len(),
            prefix.len()
        )));
    }
    let same_length_edge =
        parent.level == CourierLevel::City && level == CourierLevel::School;
    if same_length_edge {
        if !prefix.within(&parent.managed_prefix) {
            return Err(CoreError::bad_input(format!(
                "child prefix {prefix} must begin with parent prefix {}",
                parent.managed_prefix
            )));
        }
    } else if !prefix.strictly_extends(&parent.managed_prefix) {
        return Err(CoreError::bad_input(format!(
            "child prefix {prefix} must strictly extend parent prefix {}",
            parent.managed_prefix
        )));
    }
    Ok(())
}

/// Pick the re-parent target for `child` among the resigned courier's
/// siblings: the sibling whose prefix is the longest one containing the
/// child's prefix. Returns `None` when no sibling qualifies (fall back to
/// the grandparent).
pub fn choose_new_parent<'a>(child: &Courier, siblings: &'a [Courier]) -> Option<&'a Courier> {
    siblings
        .iter()
        .filter(|s| s.status == CourierStatus::Active)
        .filter(|s| child.managed_prefix.within(&s.managed_prefix))
        .max_by_key(|s| s.managed_prefix.len())
}

// ============================================================================
// Registry (tree mutations)
// ============================================================================

fn tree_lock_key(school_prefix: &str) -> String {
    format!("courier:tree:{school_prefix}")
}

/// Serialised courier-tree mutations over the store.
pub struct CourierRegistry {
    store: Arc<dyn CoreStore>,
    locks: Arc<LockManager>,
}

impl CourierRegistry {
    pub fn new(store: Arc<dyn CoreStore>, locks: Arc<LockManager>) -> Self {
        Self { store, locks }
    }

    /// Create a city (L4) root. At most one root may exist per school prefix;
    /// the permission oracle has already restricted this to admins.
    pub async fn create_root(
        &self,
        prefix: OpCodePrefix,
        user_ref: &str,
    ) -> CoreResult<Courier> {
        if prefix.len() != CourierLevel::City.prefix_len() {
            return Err(CoreError::bad_input(format!(
                "city root prefix must be {} characters",
                CourierLevel::City.prefix_len()
            )));
        }
        let store = Arc::clone(&self.store);
        let key = tree_lock_key(prefix.as_str());
        let user_ref = user_ref.to_string();
        self.locks
            .with_lock_waiting(&key, async move {
                if let Some(existing) = store.city_root_for_prefix(prefix.as_str()).await? {
                    return Err(CoreError::Conflict(format!(
                        "city root for {} already exists: {}",
                        prefix, existing.id
                    )));
                }
                let root = Courier::new(user_ref, CourierLevel::City, prefix, None);
                let root = store.insert_courier(root).await?;
                info!(courier_id = %root.id, prefix = %root.managed_prefix, "city root created");
                Ok(root)
            })
            .await
    }

    /// Create a child courier beneath `parent_id`. The caller has already
    /// consulted the permission oracle; this enforces the tree invariants.
    pub async fn create_child(
        &self,
        parent_id: Uuid,
        level: CourierLevel,
        prefix: OpCodePrefix,
        user_ref: &str,
    ) -> CoreResult<Courier> {
        let parent = self
            .store
            .courier_by_id(parent_id)
            .await?
            .ok_or_else(|| CoreError::not_found("courier", parent_id.to_string()))?;
        if parent.status != CourierStatus::Active {
            return Err(CoreError::Conflict(format!(
                "parent courier {parent_id} is not active"
            )));
        }
        validate_child(&parent, level, &prefix)?;

        let store = Arc::clone(&self.store);
        let key = tree_lock_key(parent.school_prefix());
        let user_ref = user_ref.to_string();
        self.locks
            .with_lock_waiting(&key, async move {
                let child = Courier::new(user_ref, level, prefix, Some(parent_id));
                let child = store.insert_courier(child).await?;
                info!(
                    courier_id = %child.id,
                    parent_id = %parent_id,
                    level = child.level.as_u8(),
                    prefix = %child.managed_prefix,
                    "courier created"
                );
                Ok(child)
            })
            .await
    }

    /// Soft-resign a courier and re-parent its children: each child moves to
    /// the resignee's sibling with the longest matching prefix, else up to
    /// the grandparent with `needs_reassignment` set.
    pub async fn resign(&self, courier_id: Uuid) -> CoreResult<Courier> {
        let courier = self
            .store
            .courier_by_id(courier_id)
            .await?
            .ok_or_else(|| CoreError::not_found("courier", courier_id.to_string()))?;
        if courier.status == CourierStatus::Resigned {
            return Ok(courier); // idempotent
        }

        let store = Arc::clone(&self.store);
        let key = tree_lock_key(courier.school_prefix());
        let mut courier = courier;
        self.locks
            .with_lock_waiting(&key, async move {
                courier.status = CourierStatus::Resigned;
                store.update_courier(courier.clone()).await?;

                let siblings = match courier.parent_id {
                    Some(parent_id) => store
                        .children_of(parent_id)
                        .await?
                        .into_iter()
                        .filter(|s| s.id != courier.id)
                        .collect::<Vec<_>>(),
                    None => Vec::new(),
                };

                let children = store.children_of(courier.id).await?;
                for mut child in children {
                    match choose_new_parent(&child, &siblings) {
                        Some(sibling) => {
                            child.parent_id = Some(sibling.id);
                            child.needs_reassignment = false;
                        }
                        None => {
                            child.parent_id = courier.parent_id;
                            child.needs_reassignment = true;
                            warn!(
                                courier_id = %child.id,
                                "no sibling covers child prefix; escalated to grandparent"
                            );
                        }
                    }
                    let child_id = child.id;
                    store.update_courier(child).await?;
                    // The level invariant makes cycles impossible in a
                    // well-formed tree; assert it held after the write.
                    assert_acyclic(store.as_ref(), child_id).await?;
                }

                info!(courier_id = %courier.id, "courier resigned");
                Ok(courier)
            })
            .await
    }
}

/// Walk the parent chain from `courier_id`; the tree is at most 4 deep, so
/// more than 4 hops means a cycle slipped in.
pub(crate) async fn assert_acyclic(store: &dyn CoreStore, courier_id: Uuid) -> CoreResult<()> {
    let mut current = courier_id;
    for _ in 0..4 {
        match store.courier_by_id(current).await? {
            Some(c) => match c.parent_id {
                Some(parent) => {
                    if parent == courier_id {
                        return Err(CoreError::Conflict(format!(
                            "re-parent introduced a cycle at courier {courier_id}"
                        )));
                    }
                    current = parent;
                }
                None => return Ok(()),
            },
            None => return Ok(()),
        }
    }
    Err(CoreError::Conflict(format!(
        "parent chain from courier {courier_id} exceeds tree depth"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn courier(level: CourierLevel, prefix: &str) -> Courier {
        Courier::new(
            format!("user-{prefix}"),
            level,
            OpCodePrefix::parse(prefix).expect("valid prefix"),
            None,
        )
    }

    #[test]
    fn prefix_lengths_by_level() {
        assert_eq!(CourierLevel::Building.prefix_len(), 6);
        assert_eq!(CourierLevel::Area.prefix_len(), 4);
        assert_eq!(CourierLevel::School.prefix_len(), 2);
        assert_eq!(CourierLevel::City.prefix_len(), 2);
    }

    #[test]
    fn child_must_be_one_level_down() {
        let school = courier(CourierLevel::School, "PK");
        let prefix = OpCodePrefix::parse("PK5F").expect("valid prefix");
        assert!(validate_child(&school, CourierLevel::Area, &prefix).is_ok());
        assert!(validate_child(&school, CourierLevel::Building, &prefix).is_err());
        assert!(validate_child(&school, CourierLevel::School, &prefix).is_err());
    }

    #[test]
    fn child_prefix_must_extend_parent() {
        let area = courier(CourierLevel::Area, "PK5F");
        let inside = OpCodePrefix::parse("PK5F3D").expect("valid prefix");
        let outside = OpCodePrefix::parse("PK6A3D").expect("valid prefix");
        assert!(validate_child(&area, CourierLevel::Building, &inside).is_ok());
        assert!(validate_child(&area, CourierLevel::Building, &outside).is_err());
    }

    #[test]
    fn child_prefix_length_must_match_level() {
        let school = courier(CourierLevel::School, "PK");
        let too_short = OpCodePrefix::parse("PK").expect("valid prefix");
        assert!(validate_child(&school, CourierLevel::Area, &too_short).is_err());
    }

    #[test]
    fn city_to_school_edge_allows_equal_prefix() {
        let city = courier(CourierLevel::City, "PK");
        let same = OpCodePrefix::parse("PK").expect("valid prefix");
        assert!(validate_child(&city, CourierLevel::School, &same).is_ok());
        let wrong = OpCodePrefix::parse("QH").expect("valid prefix");
        assert!(validate_child(&city, CourierLevel::School, &wrong).is_err());
    }

    #[test]
    fn reparent_prefers_longest_matching_sibling() {
        let child = courier(CourierLevel::Building, "PK5F3D");
        let wide = courier(CourierLevel::Area, "PK5F");
        let other = courier(CourierLevel::Area, "PK6A");
        let siblings = vec![other, wide.clone()];
        let chosen = choose_new_parent(&child, &siblings).expect("sibling found");
        assert_eq!(chosen.id, wide.id);
    }

    #[test]
    fn reparent_skips_inactive_siblings() {
        let child = courier(CourierLevel::Building, "PK5F3D");
        let mut wide = courier(CourierLevel::Area, "PK5F");
        wide.status = CourierStatus::Resigned;
        assert!(choose_new_parent(&child, &[wide]).is_none());
    }

    #[test]
    fn success_rate_defaults_high_for_new_couriers() {
        let c = courier(CourierLevel::Building, "PK5F3D");
        assert_eq!(c.success_rate(), 1.0);
    }
}

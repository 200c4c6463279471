//! Shared fixtures for integration tests: an engine over the in-memory
//! store, plus a small campus courier tree (city PK -> school PK ->
//! area PK5F -> buildings).

#![allow(dead_code)]

use std::sync::Arc;

use openpenpal_core::collaborators::{Notifier, RecordingNotifier};
use openpenpal_core::engine::Collaborators;
use openpenpal_core::lifecycle::OpContext;
use openpenpal_core::lock::MemoryLeaseStore;
use openpenpal_core::{
    Actor, CoreConfig, CoreEngine, CoreStore, Courier, CourierIdentity, CourierLevel,
    MemoryStore, OpCodePrefix,
};

pub struct TestHarness {
    pub engine: CoreEngine,
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn harness() -> TestHarness {
    harness_with_config(CoreConfig::default())
}

pub fn harness_with_config(config: CoreConfig) -> TestHarness {
    let store = Arc::new(MemoryStore::new());
    let leases = Arc::new(MemoryLeaseStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let collaborators = Collaborators {
        notifier: Arc::clone(&notifier) as Arc<dyn Notifier>,
        ..Default::default()
    };
    let engine = CoreEngine::new(
        Arc::clone(&store) as Arc<dyn CoreStore>,
        leases,
        config,
        collaborators,
    )
    .expect("engine builds");
    TestHarness {
        engine,
        store,
        notifier,
    }
}

pub fn admin_ctx() -> OpContext {
    OpContext::new(Actor::admin("root-admin"))
}

pub fn user_ctx(user_ref: &str) -> OpContext {
    OpContext::new(Actor::user(user_ref))
}

pub fn courier_ctx(courier: &Courier) -> OpContext {
    OpContext::new(Actor::courier(
        courier.user_ref.clone(),
        CourierIdentity {
            id: courier.id,
            level: courier.level,
            managed_prefix: courier.managed_prefix.clone(),
            status: courier.status,
        },
    ))
}

pub fn prefix(s: &str) -> OpCodePrefix {
    OpCodePrefix::parse(s).expect("valid prefix")
}

/// Standard tree: city PK, school PK, area PK5F, and one building courier
/// per given (prefix, user) pair. Returns the building couriers in order.
pub async fn seed_campus(engine: &CoreEngine, buildings: &[(&str, &str)]) -> Vec<Courier> {
    let admin = admin_ctx();
    let city = engine
        .create_courier(&admin, None, CourierLevel::City, prefix("PK"), "city-head")
        .await
        .expect("city root");
    let school = engine
        .create_courier(
            &admin,
            Some(city.id),
            CourierLevel::School,
            prefix("PK"),
            "school-head",
        )
        .await
        .expect("school courier");
    let area = engine
        .create_courier(
            &admin,
            Some(school.id),
            CourierLevel::Area,
            prefix("PK5F"),
            "area-head",
        )
        .await
        .expect("area courier");

    let mut result = Vec::new();
    for (building_prefix, user_ref) in buildings {
        let courier = engine
            .create_courier(
                &admin,
                Some(area.id),
                CourierLevel::Building,
                prefix(building_prefix),
                user_ref,
            )
            .await
            .expect("building courier");
        result.push(courier);
    }
    result
}

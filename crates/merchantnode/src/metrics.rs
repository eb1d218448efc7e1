use crate::Error;
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry, IntCounter,
    IntCounterVec, Registry,
};

// Create a new registry named `merchantnode`
lazy_static! {
    pub static ref MERCHANTNODE_REGISTRY: Registry =
        Registry::new_custom(Some("merchantnode".to_string()), None).unwrap();
}

lazy_static! {
    pub static ref ANNOUNCE_CHECKS: IntCounterVec = register_int_counter_vec_with_registry!(
        "announce_checks_total",
        "Announcement validations by stage and outcome",
        &["stage", "outcome"],
        MERCHANTNODE_REGISTRY
    )
    .unwrap();
    pub static ref PING_CHECKS: IntCounterVec = register_int_counter_vec_with_registry!(
        "ping_checks_total",
        "Ping validations by outcome",
        &["outcome"],
        MERCHANTNODE_REGISTRY
    )
    .unwrap();
    pub static ref STATE_TRANSITIONS: IntCounterVec = register_int_counter_vec_with_registry!(
        "state_transitions_total",
        "Lifecycle state changes by target state",
        &["state"],
        MERCHANTNODE_REGISTRY
    )
    .unwrap();
    pub static ref POSE_BANS: IntCounter = register_int_counter_with_registry!(
        "pose_bans_total",
        "Merchantnodes banned for reaching the maximum PoSe score",
        MERCHANTNODE_REGISTRY
    )
    .unwrap();
}

pub(crate) fn outcome<T>(result: &Result<T, Error>) -> &'static str {
    match result {
        Ok(_) => "accepted",
        Err(err) if err.is_transient() => "retry",
        Err(err) if err.misbehavior() > 0 => "misbehavior",
        Err(_) => "rejected",
    }
}

pub(crate) fn record_announce<T>(stage: &str, result: &Result<T, Error>) {
    ANNOUNCE_CHECKS
        .with_label_values(&[stage, outcome(result)])
        .inc();
}

pub(crate) fn record_ping<T>(result: &Result<T, Error>) {
    PING_CHECKS.with_label_values(&[outcome(result)]).inc();
}

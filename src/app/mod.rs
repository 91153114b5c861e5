mod orchestrator;

pub use orchestrator::{
    AccessLifecycleOrchestrator, OffboardOutcome, OnboardOutcome, OFFBOARD_REASON,
    ROTATED_CA_VALIDITY_DAYS,
};

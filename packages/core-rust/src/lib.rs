//! Keel Core: lifecycle state machines, instance identity, path rewrite
//! rules and metrics snapshot types shared by the server.

pub mod instance;
pub mod lifecycle;
pub mod metrics;
pub mod path;
pub mod types;

pub use instance::InstanceId;
pub use lifecycle::{LifecyclePhase, ResourceState, ShutdownState, TaskState};
pub use metrics::{
    DegradedSubsystem, MetricsSnapshot, RequestStats, ResourceSnapshot, TaskSnapshot,
};
pub use path::{PathNormalizer, PathRewrite, PathRuleError};
pub use types::{Criticality, DeploymentMode, ParseModeError};

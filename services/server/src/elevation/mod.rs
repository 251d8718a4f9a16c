// Elevation engine: request validation, composite roles, the durable state
// machine and its provider-facing activities.

pub mod activities;
pub mod role;
pub mod types;
pub mod workflow;

pub use activities::ElevationActivities;
pub use role::RoleCatalog;
pub use types::*;
pub use workflow::{ElevationWorkflow, ELEVATION_WORKFLOW};

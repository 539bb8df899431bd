//! Control Policy and Command Dispatch
//!
//! Telemetry in, device commands out: [`ThresholdPolicy`] turns a grid-power
//! reading into a [`ControlDecision`], [`CommandDispatcher`] publishes it as a
//! `batteryTarget` property write.

mod dispatcher;
mod policy;
mod properties;

pub use dispatcher::{report_filter, write_topic, CommandDispatcher, ControlCommand};
pub use policy::{
    parse_grid_power, ControlDecision, PolicyError, ThresholdPolicy, DEFAULT_THRESHOLD_WATTS,
};
pub use properties::{PropertyError, PropertyWrite, PROPERTY_NAMES};

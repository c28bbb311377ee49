// poise-core: Dynamics interface, configuration and errors for the Poise balance controller.

pub mod config;
pub mod error;
pub mod traits;

pub use config::{
    BodyMotionParams, Bounds, ControllerConfig, ControllerParams, ControllerSettings,
    FailSafePolicy, FootLayout, IntegratorParams, ParamSets, RobotLayoutConfig,
    VRefIntegratorParams, WholeBodyParams,
};
pub use error::ConfigError;
pub use traits::{BodyId, RigidBodyDynamics};

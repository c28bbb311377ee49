//! Static index tables resolved once per robot.

use nalgebra::{DMatrix, DVector};
use poise_core::config::RobotLayoutConfig;
use poise_core::error::ConfigError;
use poise_core::traits::{BodyId, RigidBodyDynamics};

/// Velocity indices of one foot's leg.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FootIndices {
    pub name: String,
    pub body: BodyId,
    pub leg: Vec<usize>,
    pub ankles: Vec<usize>,
    pub knee: Option<usize>,
}

/// Robot constants the controller needs every tick.
#[derive(Clone, Debug)]
pub struct RobotPropertyCache {
    pub nv: usize,
    pub pelvis: BodyId,
    pub feet: Vec<FootIndices>,
    /// Velocity indices driven by at least one actuator, ascending.
    pub actuated: Vec<usize>,
    /// Velocity indices with no actuation (floating base), ascending.
    pub unactuated: Vec<usize>,
    /// Inverse of the actuated rows of the actuation map (nu × nu).
    pub b_act_inv: DMatrix<f64>,
    pub umin: DVector<f64>,
    pub umax: DVector<f64>,
    pub joint_min: DVector<f64>,
    pub joint_max: DVector<f64>,
}

impl RobotPropertyCache {
    /// Resolve names and actuation structure against a dynamics model.
    pub fn resolve<D: RigidBodyDynamics + ?Sized>(
        dynamics: &D,
        layout: &RobotLayoutConfig,
    ) -> Result<Self, ConfigError> {
        let nv = dynamics.num_velocities();
        let body = |name: &str| {
            dynamics
                .body_id(name)
                .ok_or_else(|| ConfigError::UnknownBody(name.into()))
        };
        let joint = |name: &str| {
            dynamics
                .joint_index(name)
                .ok_or_else(|| ConfigError::UnknownJoint(name.into()))
        };

        let pelvis = body(&layout.pelvis)?;
        let feet = layout
            .feet
            .iter()
            .map(|foot| {
                Ok(FootIndices {
                    name: foot.body.clone(),
                    body: body(&foot.body)?,
                    leg: foot
                        .leg_joints
                        .iter()
                        .map(|j| joint(j))
                        .collect::<Result<_, _>>()?,
                    ankles: foot
                        .ankle_joints
                        .iter()
                        .map(|j| joint(j))
                        .collect::<Result<_, _>>()?,
                    knee: foot.knee_joint.as_deref().map(joint).transpose()?,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let b = dynamics.actuation_matrix();
        if b.nrows() != nv {
            return Err(ConfigError::LengthMismatch {
                field: "actuation_matrix rows".into(),
                expected: nv,
                got: b.nrows(),
            });
        }
        let nu = b.ncols();
        let (actuated, unactuated): (Vec<usize>, Vec<usize>) =
            (0..nv).partition(|&i| b.row(i).iter().any(|v| *v != 0.0));
        if actuated.len() != nu {
            return Err(ConfigError::Incompatible(format!(
                "{} actuated coordinates for {nu} actuators",
                actuated.len()
            )));
        }
        let b_act = b.select_rows(actuated.iter());
        let b_act_inv = b_act.try_inverse().ok_or_else(|| {
            ConfigError::Incompatible("actuated block of the actuation map is singular".into())
        })?;

        let (umin, umax) = dynamics.actuator_limits();
        let (joint_min, joint_max) = dynamics.joint_limits();
        for (field, len, expected) in [
            ("actuator_limits", umin.len().max(umax.len()), nu),
            ("actuator_limits", umin.len().min(umax.len()), nu),
            ("joint_limits", joint_min.len().max(joint_max.len()), nv),
            ("joint_limits", joint_min.len().min(joint_max.len()), nv),
        ] {
            if len != expected {
                return Err(ConfigError::LengthMismatch {
                    field: field.into(),
                    expected,
                    got: len,
                });
            }
        }
        for (field, min, max) in [
            ("actuator_limits", &umin, &umax),
            ("joint_limits", &joint_min, &joint_max),
        ] {
            for (index, (&lo, &hi)) in min.iter().zip(max.iter()).enumerate() {
                if lo.is_nan() || hi.is_nan() {
                    return Err(ConfigError::InvalidValue {
                        field: format!("{field}[{index}]"),
                        message: "must not be NaN".into(),
                    });
                }
                if lo > hi {
                    return Err(ConfigError::InvertedBounds {
                        field: field.into(),
                        index,
                        min: lo,
                        max: hi,
                    });
                }
            }
        }

        Ok(Self {
            nv,
            pelvis,
            feet,
            actuated,
            unactuated,
            b_act_inv,
            umin,
            umax,
            joint_min,
            joint_max,
        })
    }

    /// Number of actuators.
    pub fn nu(&self) -> usize {
        self.actuated.len()
    }
}

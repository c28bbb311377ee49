use std::collections::BTreeMap;

use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Serde default functions
// ---------------------------------------------------------------------------

const fn default_true() -> bool {
    true
}
const fn default_solve_budget_us() -> u64 {
    20_000
}
const fn default_max_active_set_iterations() -> u32 {
    100
}
const fn default_damping_ratio() -> f64 {
    1.0
}
const fn default_integrator_eta() -> f64 {
    1.0
}
const fn default_vref_eta() -> f64 {
    0.001
}
const fn default_w_kdot() -> [[f64; 3]; 3] {
    [[0.0; 3]; 3]
}
const fn default_kp_ang() -> f64 {
    1.0
}
const fn default_w_slack() -> f64 {
    0.05
}
const fn default_slack_limit() -> f64 {
    30.0
}
const fn default_kp_accel() -> f64 {
    1.0
}
const fn default_contact_threshold() -> f64 {
    0.002
}
const fn default_body_weight() -> f64 {
    0.0
}
fn default_unbounded6() -> Bounds {
    Bounds::unbounded(6)
}

// ---------------------------------------------------------------------------
// Bounds
// ---------------------------------------------------------------------------

/// Component-wise `[min, max]` bounds. Infinite entries are unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

impl Bounds {
    /// Bounds of dimension `n` that admit everything.
    pub fn unbounded(n: usize) -> Self {
        Self {
            min: vec![f64::NEG_INFINITY; n],
            max: vec![f64::INFINITY; n],
        }
    }

    /// Symmetric bounds `[-limit, limit]` of dimension `n`.
    pub fn symmetric(n: usize, limit: f64) -> Self {
        Self {
            min: vec![-limit; n],
            max: vec![limit; n],
        }
    }

    pub fn len(&self) -> usize {
        self.min.len()
    }

    pub fn is_empty(&self) -> bool {
        self.min.is_empty()
    }

    /// Clamp `value` into the bounds of component `i`.
    pub fn clamp(&self, i: usize, value: f64) -> f64 {
        value.max(self.min[i]).min(self.max[i])
    }

    fn validate(&self, field: &str, expected_len: usize) -> Result<(), ConfigError> {
        check_len(&format!("{field}.min"), expected_len, self.min.len())?;
        check_len(&format!("{field}.max"), expected_len, self.max.len())?;
        for (index, (&min, &max)) in self.min.iter().zip(&self.max).enumerate() {
            // NaN fails this comparison too.
            if !(min <= max) {
                return Err(ConfigError::InvertedBounds {
                    field: field.into(),
                    index,
                    min,
                    max,
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Whole-body parameters
// ---------------------------------------------------------------------------

/// Position-error integrator of the whole-body PID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegratorParams {
    /// Per-DOF integral gains.
    pub gains: Vec<f64>,
    /// Per-DOF magnitude clamp on the accumulated state.
    pub clamps: Vec<f64>,
    /// Decay factor in `[0, 1]` applied to the state every tick.
    #[serde(default = "default_integrator_eta")]
    pub eta: f64,
}

/// Joint-space tracking gains and weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WholeBodyParams {
    pub kp: Vec<f64>,
    /// Derivative gains. Derived from `kp` and `damping_ratio` when absent.
    #[serde(default)]
    pub kd: Option<Vec<f64>>,
    /// Weights on `(qdd - qdd_des)^2` in the QP cost.
    pub w_qdd: Vec<f64>,
    #[serde(default = "default_damping_ratio")]
    pub damping_ratio: f64,
    pub integrator: IntegratorParams,
    pub qdd_bounds: Bounds,
}

impl WholeBodyParams {
    /// Derivative gains in use: explicit `kd`, or `2 ζ sqrt(kp)`.
    pub fn effective_kd(&self) -> Vec<f64> {
        self.kd.clone().unwrap_or_else(|| {
            self.kp
                .iter()
                .map(|&kp| 2.0 * self.damping_ratio * kp.sqrt())
                .collect()
        })
    }
}

// ---------------------------------------------------------------------------
// Body motion parameters
// ---------------------------------------------------------------------------

/// Tracking gains, bounds and weight for one body acceleration objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyMotionParams {
    /// Body name, resolved against the dynamics model.
    pub body: String,
    #[serde(default)]
    pub kp: [f64; 6],
    #[serde(default)]
    pub kd: [f64; 6],
    #[serde(default = "default_unbounded6")]
    pub accel_bounds: Bounds,
    /// Positive: cost weight. Negative: hard equality. Zero: bounds only.
    #[serde(default = "default_body_weight")]
    pub weight: f64,
}

// ---------------------------------------------------------------------------
// Velocity reference integrator parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VRefIntegratorParams {
    /// Zero a foot's ankle entries when that foot touches down.
    #[serde(default = "default_true")]
    pub zero_ankles_on_contact: bool,
    /// Blend factor in `[0, 1]` toward the measured velocity.
    #[serde(default = "default_vref_eta")]
    pub eta: f64,
    /// Per-DOF magnitude clamp on the integrated velocity.
    pub clamps: Vec<f64>,
}

// ---------------------------------------------------------------------------
// ControllerParams
// ---------------------------------------------------------------------------

/// One named parameter set. Selected per tick by the command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerParams {
    pub whole_body: WholeBodyParams,
    #[serde(default)]
    pub body_motion: Vec<BodyMotionParams>,
    pub vref_integrator: VRefIntegratorParams,
    /// Weight matrix on the centroidal angular momentum rate error.
    #[serde(default = "default_w_kdot")]
    pub w_kdot: [[f64; 3]; 3],
    /// Proportional gain driving angular momentum to zero.
    #[serde(default = "default_kp_ang")]
    pub kp_ang: f64,
    #[serde(default = "default_w_slack")]
    pub w_slack: f64,
    /// Magnitude bound on each contact acceleration slack variable.
    #[serde(default = "default_slack_limit")]
    pub slack_limit: f64,
    /// Weight on the squared force basis coefficients.
    #[serde(default)]
    pub w_grf: f64,
    /// Gain of the contact-point velocity damping: `a_contact = -kp_accel * v_contact`.
    #[serde(default = "default_kp_accel")]
    pub kp_accel: f64,
    /// Height above terrain (m) below which an available support counts as in contact.
    #[serde(default = "default_contact_threshold")]
    pub contact_threshold: f64,
    /// Knee position below which the knee may not accelerate further downward.
    #[serde(default)]
    pub min_knee_angle: Option<f64>,
}

impl ControllerParams {
    /// A parameter set with the same gains on every DOF.
    ///
    /// Handy for tests and demos; production sets come from TOML.
    pub fn uniform(nv: usize, kp: f64, w_qdd: f64) -> Self {
        Self {
            whole_body: WholeBodyParams {
                kp: vec![kp; nv],
                kd: None,
                w_qdd: vec![w_qdd; nv],
                damping_ratio: default_damping_ratio(),
                integrator: IntegratorParams {
                    gains: vec![0.0; nv],
                    clamps: vec![0.0; nv],
                    eta: default_integrator_eta(),
                },
                qdd_bounds: Bounds::symmetric(nv, 100.0),
            },
            body_motion: Vec::new(),
            vref_integrator: VRefIntegratorParams {
                zero_ankles_on_contact: true,
                eta: default_vref_eta(),
                clamps: vec![1.0; nv],
            },
            w_kdot: default_w_kdot(),
            kp_ang: default_kp_ang(),
            w_slack: default_w_slack(),
            slack_limit: default_slack_limit(),
            w_grf: 0.0,
            kp_accel: default_kp_accel(),
            contact_threshold: default_contact_threshold(),
            min_knee_angle: None,
        }
    }

    /// Validate values that do not depend on the robot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let wb = &self.whole_body;
        check_non_negative("whole_body.kp", &wb.kp)?;
        if let Some(kd) = &wb.kd {
            check_non_negative("whole_body.kd", kd)?;
        }
        check_non_negative("whole_body.w_qdd", &wb.w_qdd)?;
        check_scalar_non_negative("whole_body.damping_ratio", wb.damping_ratio)?;
        check_non_negative("whole_body.integrator.gains", &wb.integrator.gains)?;
        check_non_negative("whole_body.integrator.clamps", &wb.integrator.clamps)?;
        check_unit_interval("whole_body.integrator.eta", wb.integrator.eta)?;
        wb.qdd_bounds
            .validate("whole_body.qdd_bounds", wb.qdd_bounds.min.len())?;

        check_unit_interval("vref_integrator.eta", self.vref_integrator.eta)?;
        check_non_negative("vref_integrator.clamps", &self.vref_integrator.clamps)?;

        for (i, body) in self.body_motion.iter().enumerate() {
            let field = format!("body_motion[{i}]");
            check_non_negative(&format!("{field}.kp"), &body.kp)?;
            check_non_negative(&format!("{field}.kd"), &body.kd)?;
            body.accel_bounds
                .validate(&format!("{field}.accel_bounds"), 6)?;
            if !body.weight.is_finite() {
                return Err(ConfigError::invalid(
                    format!("{field}.weight"),
                    "must be finite",
                ));
            }
        }

        if self.w_kdot.iter().flatten().any(|v| !v.is_finite()) {
            return Err(ConfigError::invalid("w_kdot", "must be finite"));
        }
        // Only the symmetric part enters the cost; it must be PSD.
        let w_kdot = Matrix3::from_fn(|r, c| 0.5 * (self.w_kdot[r][c] + self.w_kdot[c][r]));
        let min_eigenvalue = w_kdot.symmetric_eigen().eigenvalues.min();
        if min_eigenvalue < -1e-9 * (1.0 + w_kdot.amax()) {
            return Err(ConfigError::invalid(
                "w_kdot",
                format!("must be positive semi-definite, smallest eigenvalue {min_eigenvalue}"),
            ));
        }

        check_scalar_non_negative("kp_ang", self.kp_ang)?;
        check_scalar_non_negative("w_slack", self.w_slack)?;
        // An infinite slack limit leaves the slack unbounded.
        if !(self.slack_limit >= 0.0) {
            return Err(ConfigError::invalid(
                "slack_limit",
                format!("must be non-negative, got {}", self.slack_limit),
            ));
        }
        check_scalar_non_negative("w_grf", self.w_grf)?;
        check_scalar_non_negative("kp_accel", self.kp_accel)?;
        if !self.contact_threshold.is_finite() {
            return Err(ConfigError::invalid("contact_threshold", "must be finite"));
        }
        if let Some(angle) = self.min_knee_angle {
            if !angle.is_finite() {
                return Err(ConfigError::invalid("min_knee_angle", "must be finite"));
            }
        }
        Ok(())
    }

    /// Validate that every per-DOF vector has `nv` entries.
    pub fn validate_dofs(&self, nv: usize) -> Result<(), ConfigError> {
        let wb = &self.whole_body;
        check_len("whole_body.kp", nv, wb.kp.len())?;
        if let Some(kd) = &wb.kd {
            check_len("whole_body.kd", nv, kd.len())?;
        }
        check_len("whole_body.w_qdd", nv, wb.w_qdd.len())?;
        check_len("whole_body.integrator.gains", nv, wb.integrator.gains.len())?;
        check_len("whole_body.integrator.clamps", nv, wb.integrator.clamps.len())?;
        wb.qdd_bounds.validate("whole_body.qdd_bounds", nv)?;
        check_len(
            "vref_integrator.clamps",
            nv,
            self.vref_integrator.clamps.len(),
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ParamSets
// ---------------------------------------------------------------------------

/// Parameter sets keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamSets(pub BTreeMap<String, ControllerParams>);

impl ParamSets {
    /// A collection holding a single set.
    pub fn single(name: impl Into<String>, params: ControllerParams) -> Self {
        let mut sets = BTreeMap::new();
        sets.insert(name.into(), params);
        Self(sets)
    }

    pub fn get(&self, name: &str) -> Option<&ControllerParams> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, params: ControllerParams) {
        self.0.insert(name.into(), params);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ControllerParams)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Validate every set, prefixing errors with the set name.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, params) in &self.0 {
            params.validate().map_err(|e| prefix_error(name, e))?;
        }
        Ok(())
    }

    /// Validate per-DOF vector lengths of every set.
    pub fn validate_dofs(&self, nv: usize) -> Result<(), ConfigError> {
        for (name, params) in &self.0 {
            params.validate_dofs(nv).map_err(|e| prefix_error(name, e))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ControllerSettings
// ---------------------------------------------------------------------------

/// What to emit when both QP solvers fail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailSafePolicy {
    /// Repeat the last successful output; PID torque when none exists yet.
    #[default]
    HoldPrevious,
    /// Inverse-dynamics torque of the PID acceleration, without contacts.
    PidTorque,
}

/// Controller-wide settings that do not change between ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerSettings {
    /// Try the warm-started active-set solver before the interior-point one.
    #[serde(default = "default_true")]
    pub use_fast_qp: bool,
    /// Capture a `DebugData` snapshot every tick.
    #[serde(default)]
    pub capture_debug: bool,
    /// Wall-clock budget for the whole solve phase of one tick.
    #[serde(default = "default_solve_budget_us")]
    pub solve_budget_us: u64,
    #[serde(default = "default_max_active_set_iterations")]
    pub max_active_set_iterations: u32,
    /// Terrain height used by the support height proxy.
    #[serde(default)]
    pub terrain_height: f64,
    #[serde(default)]
    pub fail_safe: FailSafePolicy,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            use_fast_qp: true,
            capture_debug: false,
            solve_budget_us: default_solve_budget_us(),
            max_active_set_iterations: default_max_active_set_iterations(),
            terrain_height: 0.0,
            fail_safe: FailSafePolicy::default(),
        }
    }
}

impl ControllerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.solve_budget_us == 0 {
            return Err(ConfigError::invalid("solve_budget_us", "must be > 0"));
        }
        if self.max_active_set_iterations == 0 {
            return Err(ConfigError::invalid(
                "max_active_set_iterations",
                "must be > 0",
            ));
        }
        if !self.terrain_height.is_finite() {
            return Err(ConfigError::invalid("terrain_height", "must be finite"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RobotLayoutConfig
// ---------------------------------------------------------------------------

/// Names of one foot and the joints of its leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FootLayout {
    pub body: String,
    #[serde(default)]
    pub leg_joints: Vec<String>,
    #[serde(default)]
    pub ankle_joints: Vec<String>,
    #[serde(default)]
    pub knee_joint: Option<String>,
}

/// Body and joint names the controller needs to know about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotLayoutConfig {
    pub pelvis: String,
    #[serde(default)]
    pub feet: Vec<FootLayout>,
}

// ---------------------------------------------------------------------------
// ControllerConfig
// ---------------------------------------------------------------------------

/// Complete controller configuration loaded from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub controller: ControllerSettings,
    pub robot: RobotLayoutConfig,
    pub param_sets: ParamSets,
}

impl ControllerConfig {
    /// Validate configuration. Returns Err on invalid values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.controller.validate()?;
        if self.param_sets.is_empty() {
            return Err(ConfigError::invalid(
                "param_sets",
                "at least one parameter set is required",
            ));
        }
        self.param_sets.validate()
    }

    /// Parse and validate from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

fn check_len(field: &str, expected: usize, got: usize) -> Result<(), ConfigError> {
    if expected == got {
        Ok(())
    } else {
        Err(ConfigError::LengthMismatch {
            field: field.into(),
            expected,
            got,
        })
    }
}

fn check_non_negative(field: &str, values: &[f64]) -> Result<(), ConfigError> {
    for (i, &v) in values.iter().enumerate() {
        if !(v.is_finite() && v >= 0.0) {
            return Err(ConfigError::invalid(
                format!("{field}[{i}]"),
                format!("must be finite and non-negative, got {v}"),
            ));
        }
    }
    Ok(())
}

fn check_scalar_non_negative(field: &str, value: f64) -> Result<(), ConfigError> {
    check_non_negative(field, &[value]).map_err(|_| {
        ConfigError::invalid(field, format!("must be finite and non-negative, got {value}"))
    })
}

fn check_unit_interval(field: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!("must be in [0, 1], got {value}"),
        ))
    }
}

fn prefix_error(set: &str, err: ConfigError) -> ConfigError {
    match err {
        ConfigError::InvalidValue { field, message } => ConfigError::InvalidValue {
            field: format!("{set}.{field}"),
            message,
        },
        ConfigError::InvertedBounds {
            field,
            index,
            min,
            max,
        } => ConfigError::InvertedBounds {
            field: format!("{set}.{field}"),
            index,
            min,
            max,
        },
        ConfigError::LengthMismatch {
            field,
            expected,
            got,
        } => ConfigError::LengthMismatch {
            field: format!("{set}.{field}"),
            expected,
            got,
        },
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

use nalgebra::{DMatrix, DVector, Isometry3, Point3, Vector3, Vector6};

/// Index of a rigid body in a dynamics model.
pub type BodyId = usize;

// ---------------------------------------------------------------------------
// RigidBodyDynamics
// ---------------------------------------------------------------------------

/// Rigid-body dynamics engine consumed by the controller.
///
/// Every query is evaluated at the configuration passed in and must not
/// mutate shared state: the controller may call any method in any order, any
/// number of times per tick.
///
/// Conventions:
/// - `q` and `qd` both have [`num_velocities`](Self::num_velocities) entries.
/// - Spatial quantities (body Jacobians, centroidal momentum) stack the
///   angular part first: `[ω; v]`, expressed in the world frame.
/// - Contact points are given in the frame of their body.
pub trait RigidBodyDynamics {
    /// Number of velocity degrees of freedom.
    fn num_velocities(&self) -> usize;

    /// Number of rigid bodies. Valid body ids are `0..num_bodies()`.
    fn num_bodies(&self) -> usize;

    /// Look up a body by name.
    fn body_id(&self, name: &str) -> Option<BodyId>;

    /// Look up a joint by name, returning its velocity index.
    fn joint_index(&self, name: &str) -> Option<usize>;

    /// Actuation map `B` (nv × nu): generalized forces are `B u`.
    fn actuation_matrix(&self) -> DMatrix<f64>;

    /// Actuator effort limits `(umin, umax)`, each of length nu.
    fn actuator_limits(&self) -> (DVector<f64>, DVector<f64>);

    /// Joint position limits `(min, max)`, each of length nv. Unlimited
    /// coordinates use infinities.
    fn joint_limits(&self) -> (DVector<f64>, DVector<f64>);

    /// Joint-space mass matrix `H(q)`.
    fn mass_matrix(&self, q: &DVector<f64>) -> DMatrix<f64>;

    /// Bias forces `C(q, qd)` (Coriolis, centrifugal and gravity).
    fn bias(&self, q: &DVector<f64>, qd: &DVector<f64>) -> DVector<f64>;

    /// World pose of a body.
    fn body_transform(&self, q: &DVector<f64>, body: BodyId) -> Isometry3<f64>;

    /// Linear Jacobian (3 × nv) of a body-fixed point, world frame.
    fn point_jacobian(
        &self,
        q: &DVector<f64>,
        body: BodyId,
        point: &Vector3<f64>,
    ) -> DMatrix<f64>;

    /// `J̇ qd` for the point Jacobian.
    fn point_jacobian_dot_times_v(
        &self,
        q: &DVector<f64>,
        qd: &DVector<f64>,
        body: BodyId,
        point: &Vector3<f64>,
    ) -> Vector3<f64>;

    /// Spatial Jacobian (6 × nv) of a body origin, `[ω; v]`.
    fn body_jacobian(&self, q: &DVector<f64>, body: BodyId) -> DMatrix<f64>;

    /// `J̇ qd` for the body Jacobian.
    fn body_jacobian_dot_times_v(
        &self,
        q: &DVector<f64>,
        qd: &DVector<f64>,
        body: BodyId,
    ) -> Vector6<f64>;

    /// Centroidal momentum matrix `A(q)` (6 × nv), angular rows first.
    fn centroidal_momentum_matrix(&self, q: &DVector<f64>) -> DMatrix<f64>;

    /// `Ȧ qd` for the centroidal momentum matrix.
    fn centroidal_momentum_matrix_dot_times_v(
        &self,
        q: &DVector<f64>,
        qd: &DVector<f64>,
    ) -> Vector6<f64>;

    /// World position of a body-fixed point.
    fn point_position(&self, q: &DVector<f64>, body: BodyId, point: &Vector3<f64>) -> Vector3<f64> {
        let pose = self.body_transform(q, body);
        pose.transform_point(&Point3::from(*point)).coords
    }

    /// Human-readable name for this model.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

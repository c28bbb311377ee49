//! Reference rigid-body models for the poise balance controller.
//!
//! Real robots plug their own dynamics engine in through
//! [`poise_core::RigidBodyDynamics`]. The models here are small analytic
//! robots with closed-form dynamics, used by the controller's tests and by the
//! demo binary.

pub mod biped;

pub use biped::PointFootBiped;

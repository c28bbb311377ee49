//! Support state resolution.

use nalgebra::DVector;
use poise_core::traits::RigidBodyDynamics;

use crate::robot::FootIndices;
use crate::types::{SupportData, SupportElement, SupportMode};

/// Resolve which command supports bear force this tick.
///
/// Unavailable supports are dropped. An available support is active when its
/// contact is sensed or when its lowest contact point is less than
/// `contact_threshold` above `terrain_height`. The result keeps command order.
///
/// `contact_sensed` must have one entry per command support; the caller
/// checks this.
pub fn resolve_supports<D: RigidBodyDynamics + ?Sized>(
    dynamics: &D,
    q: &DVector<f64>,
    supports: &[SupportData],
    contact_sensed: &[bool],
    contact_threshold: f64,
    terrain_height: f64,
) -> Vec<SupportElement> {
    supports
        .iter()
        .zip(contact_sensed)
        .enumerate()
        .filter(|(_, (support, _))| support.available)
        .map(|(command_index, (support, &sensed))| {
            let in_contact = sensed || {
                let lowest = support
                    .geometry
                    .points()
                    .iter()
                    .map(|p| dynamics.point_position(q, support.body, p).z)
                    .fold(f64::INFINITY, f64::min);
                lowest - terrain_height < contact_threshold
            };
            SupportElement {
                command_index,
                body: support.body,
                geometry: support.geometry.clone(),
                normal: support.normal.normalize(),
                mu: support.mu,
                mode: if in_contact {
                    SupportMode::Active
                } else {
                    SupportMode::Available
                },
            }
        })
        .collect()
}

/// Per-foot contact flags derived from the active supports.
pub fn foot_contacts(feet: &[FootIndices], supports: &[SupportElement]) -> Vec<bool> {
    feet.iter()
        .map(|foot| {
            supports
                .iter()
                .any(|s| s.is_active() && s.body == foot.body)
        })
        .collect()
}

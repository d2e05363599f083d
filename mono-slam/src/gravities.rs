use cv_core::nalgebra::{UnitVector3, Vector3};
use mono_core::Index32;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// The gravity vectors reported for individual frames, in camera coordinates.
#[derive(Debug, Default)]
pub struct Gravities {
    gravities: RwLock<BTreeMap<Index32, UnitVector3<f64>>>,
}

impl Gravities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the gravity of a frame, zero vectors are ignored.
    pub fn set_gravity(&self, frame_index: Index32, gravity: &Vector3<f64>) -> bool {
        match UnitVector3::try_new(*gravity, f64::EPSILON) {
            Some(gravity) => {
                self.gravities.write().insert(frame_index, gravity);
                true
            }
            None => false,
        }
    }

    pub fn gravity(&self, frame_index: Index32) -> Option<UnitVector3<f64>> {
        self.gravities.read().get(&frame_index).copied()
    }

    /// The most recent gravity and its frame index.
    pub fn latest(&self) -> Option<(Index32, UnitVector3<f64>)> {
        self.gravities
            .read()
            .iter()
            .next_back()
            .map(|(&frame, &gravity)| (frame, gravity))
    }

    pub fn len(&self) -> usize {
        self.gravities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_gravity_is_ignored() {
        let gravities = Gravities::new();
        assert!(!gravities.set_gravity(0, &Vector3::zeros()));
        assert!(gravities.set_gravity(3, &Vector3::new(0.0, -9.81, 0.0)));
        assert!(gravities.set_gravity(1, &Vector3::new(0.0, 0.0, -2.0)));
        assert_eq!(gravities.len(), 2);
        assert_eq!(gravities.gravity(3).unwrap().y, -1.0);
        assert_eq!(gravities.latest().unwrap().0, 3);
        assert!(gravities.gravity(0).is_none());
    }
}

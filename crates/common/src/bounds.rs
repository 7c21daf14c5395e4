use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::types::Transform;

/// Axis-aligned box in world or local coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }

    pub fn from_center_half_extents(center: Vec3, half: Vec3) -> Self {
        Self::new(center - half, center + half)
    }

    /// A box covering all of space.
    pub fn everything() -> Self {
        Self {
            min: Vec3::splat(f32::NEG_INFINITY),
            max: Vec3::splat(f32::INFINITY),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.min.is_finite() && self.max.is_finite()
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Overlap test; touching faces count as intersecting.
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.cmple(other.max).all() && other.min.cmple(self.max).all()
    }

    pub fn contains_point(&self, p: Vec3) -> bool {
        self.min.cmple(p).all() && p.cmple(self.max).all()
    }

    /// Closest point inside the box to `p`.
    fn closest_point(&self, p: Vec3) -> Vec3 {
        // max/min rather than clamp: clamp asserts min <= max even for
        // infinite boxes.
        p.max(self.min).min(self.max)
    }
}

/// Bounding volume of a cell.
///
/// Spheres with an infinite radius are unbounded and intersect everything;
/// the world root uses one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Bounds {
    Sphere { center: Vec3, radius: f32 },
    Box { min: Vec3, max: Vec3 },
}

impl Bounds {
    pub fn sphere(center: Vec3, radius: f32) -> Self {
        Self::Sphere {
            center,
            radius: radius.abs(),
        }
    }

    pub fn cube(center: Vec3, half_extent: f32) -> Self {
        let aabb = Aabb::from_center_half_extents(center, Vec3::splat(half_extent.abs()));
        Self::Box {
            min: aabb.min,
            max: aabb.max,
        }
    }

    pub fn from_aabb(aabb: Aabb) -> Self {
        Self::Box {
            min: aabb.min,
            max: aabb.max,
        }
    }

    /// Bounds that intersect every other volume.
    pub fn unbounded() -> Self {
        Self::Sphere {
            center: Vec3::ZERO,
            radius: f32::INFINITY,
        }
    }

    pub fn is_finite(&self) -> bool {
        match self {
            Self::Sphere { center, radius } => center.is_finite() && radius.is_finite(),
            Self::Box { min, max } => min.is_finite() && max.is_finite(),
        }
    }

    pub fn center(&self) -> Vec3 {
        match self {
            Self::Sphere { center, .. } => *center,
            Self::Box { min, max } => (*min + *max) * 0.5,
        }
    }

    /// Smallest axis-aligned box enclosing these bounds.
    pub fn aabb(&self) -> Aabb {
        match self {
            Self::Sphere { center, radius } => {
                if radius.is_infinite() {
                    Aabb::everything()
                } else {
                    Aabb::from_center_half_extents(*center, Vec3::splat(*radius))
                }
            }
            Self::Box { min, max } => Aabb::new(*min, *max),
        }
    }

    /// Map local bounds through `t`. Boxes stay axis-aligned in the target
    /// space by enclosing their eight transformed corners.
    pub fn transformed(&self, t: &Transform) -> Bounds {
        if !self.is_finite() {
            return Self::unbounded();
        }
        match self {
            Self::Sphere { center, radius } => Self::Sphere {
                center: t.transform_point(*center),
                radius: radius * t.max_scale(),
            },
            Self::Box { min, max } => {
                let mut out_min = Vec3::splat(f32::INFINITY);
                let mut out_max = Vec3::splat(f32::NEG_INFINITY);
                for i in 0..8 {
                    let corner = Vec3::new(
                        if i & 1 == 0 { min.x } else { max.x },
                        if i & 2 == 0 { min.y } else { max.y },
                        if i & 4 == 0 { min.z } else { max.z },
                    );
                    let p = t.transform_point(corner);
                    out_min = out_min.min(p);
                    out_max = out_max.max(p);
                }
                Self::Box {
                    min: out_min,
                    max: out_max,
                }
            }
        }
    }

    pub fn intersects(&self, other: &Bounds) -> bool {
        match (self, other) {
            (
                Self::Sphere {
                    center: a,
                    radius: ra,
                },
                Self::Sphere {
                    center: b,
                    radius: rb,
                },
            ) => {
                let reach = ra + rb;
                reach.is_infinite() || a.distance_squared(*b) <= reach * reach
            }
            (Self::Sphere { center, radius }, Self::Box { min, max })
            | (Self::Box { min, max }, Self::Sphere { center, radius }) => {
                sphere_hits_box(*center, *radius, &Aabb::new(*min, *max))
            }
            (Self::Box { .. }, Self::Box { .. }) => self.aabb().intersects(&other.aabb()),
        }
    }

    /// Test against an axis-aligned region such as a partition extent.
    pub fn intersects_aabb(&self, region: &Aabb) -> bool {
        match self {
            Self::Sphere { center, radius } => sphere_hits_box(*center, *radius, region),
            Self::Box { .. } => self.aabb().intersects(region),
        }
    }

    pub fn contains_point(&self, p: Vec3) -> bool {
        match self {
            Self::Sphere { center, radius } => {
                radius.is_infinite() || center.distance_squared(p) <= radius * radius
            }
            Self::Box { min, max } => Aabb::new(*min, *max).contains_point(p),
        }
    }
}

fn sphere_hits_box(center: Vec3, radius: f32, aabb: &Aabb) -> bool {
    if radius.is_infinite() {
        return true;
    }
    aabb.closest_point(center).distance_squared(center) <= radius * radius
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    #[test]
    fn spheres_intersect_when_touching() {
        let a = Bounds::sphere(Vec3::ZERO, 1.0);
        let b = Bounds::sphere(Vec3::new(2.0, 0.0, 0.0), 1.0);
        let c = Bounds::sphere(Vec3::new(2.1, 0.0, 0.0), 1.0);
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn sphere_box_intersection() {
        let sphere = Bounds::sphere(Vec3::new(3.0, 0.0, 0.0), 1.5);
        let near = Bounds::cube(Vec3::ZERO, 2.0);
        let far = Bounds::cube(Vec3::new(-5.0, 0.0, 0.0), 1.0);
        assert!(sphere.intersects(&near));
        assert!(near.intersects(&sphere));
        assert!(!sphere.intersects(&far));
    }

    #[test]
    fn unbounded_hits_everything() {
        let all = Bounds::unbounded();
        let far = Bounds::cube(Vec3::splat(1.0e6), 1.0);
        assert!(all.intersects(&far));
        assert!(far.intersects(&all));
        assert!(all.intersects_aabb(&Aabb::from_center_half_extents(
            Vec3::splat(-1.0e7),
            Vec3::ONE
        )));
        assert!(!all.is_finite());
        assert!(!all.aabb().is_finite());
    }

    #[test]
    fn transformed_sphere_follows_translation_and_scale() {
        let local = Bounds::sphere(Vec3::ZERO, 2.0);
        let t = Transform {
            position: Vec3::new(5.0, 0.0, 0.0),
            rotation: Quat::IDENTITY,
            scale: Vec3::new(1.0, 3.0, 1.0),
        };
        assert_eq!(
            local.transformed(&t),
            Bounds::Sphere {
                center: Vec3::new(5.0, 0.0, 0.0),
                radius: 6.0
            }
        );
    }

    #[test]
    fn transformed_box_encloses_rotated_corners() {
        let local = Bounds::cube(Vec3::ZERO, 1.0);
        let t = Transform {
            rotation: Quat::from_rotation_z(std::f32::consts::FRAC_PI_4),
            ..Transform::default()
        };
        let world = local.transformed(&t).aabb();
        let r = 2.0_f32.sqrt();
        assert!((world.max.x - r).abs() < 1e-5);
        assert!((world.min.y + r).abs() < 1e-5);
        assert!((world.max.z - 1.0).abs() < 1e-5);
    }

    #[test]
    fn transformed_unbounded_stays_unbounded() {
        let t = Transform::from_position(Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(Bounds::unbounded().transformed(&t), Bounds::unbounded());
    }

    #[test]
    fn aabb_new_orders_corners() {
        let aabb = Aabb::new(Vec3::ONE, Vec3::ZERO);
        assert_eq!(aabb.min, Vec3::ZERO);
        assert_eq!(aabb.max, Vec3::ONE);
        assert!(aabb.contains_point(Vec3::splat(0.5)));
    }
}

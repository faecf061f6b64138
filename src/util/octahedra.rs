//! Visit-order generator for concentric octahedral shells.

use glam::IVec3;

/// Yields every integer point with `|x| + |y| + |z| <= radius`, walking
/// shell by shell outwards from the center.
///
/// Within one shell points are ordered by ascending X, then ascending Z,
/// then positive Y before negative Y. After the last point of the
/// outermost shell is returned, [`wrapped_around`](Self::wrapped_around)
/// reports `true` and the walk restarts from the center.
pub struct ConcentricOctahedraWalker {
    radius: i32,
    cur_radius: i32,
    x: i32,
    z: i32,
    y_positive: bool,
    wrapped: bool,
}

impl ConcentricOctahedraWalker {
    pub fn new(radius: u32) -> Self {
        Self {
            radius: radius as i32,
            cur_radius: 0,
            x: 0,
            z: 0,
            y_positive: true,
            wrapped: false,
        }
    }

    /// True when the previous `step()` returned the last point of the walk
    pub fn wrapped_around(&self) -> bool {
        self.wrapped
    }

    pub fn step(&mut self) -> IVec3 {
        let r = self.cur_radius;
        let y_budget = r - self.x.abs() - self.z.abs();

        let y = if y_budget == 0 {
            0
        } else if self.y_positive {
            y_budget
        } else {
            -y_budget
        };

        let point = IVec3::new(self.x, y, self.z);
        self.advance(y_budget);
        point
    }

    fn advance(&mut self, y_budget: i32) {
        // Both Y signs are emitted for a nonzero budget
        if y_budget != 0 && self.y_positive {
            self.y_positive = false;
            return;
        }
        self.y_positive = true;

        let r = self.cur_radius;
        let z_budget = r - self.x.abs();

        if self.z < z_budget {
            self.z += 1;
            self.wrapped = false;
            return;
        }

        if self.x < r {
            self.x += 1;
            self.z = -(r - self.x.abs());
            self.wrapped = false;
            return;
        }

        // Shell exhausted, go one shell out or wrap back to the center
        if self.cur_radius < self.radius {
            self.cur_radius += 1;
            self.wrapped = false;
        } else {
            self.cur_radius = 0;
            self.wrapped = true;
        }

        self.x = -self.cur_radius;
        self.z = 0;
    }
}

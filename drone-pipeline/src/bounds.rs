/// Planar and vertical extent of point clouds and rasters
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
    pub min_z: f64,
    pub max_z: f64,
}

impl Default for Extent {
    fn default() -> Self {
        Self::empty()
    }
}

impl Extent {
    /// Inverted extent that any update overwrites
    pub fn empty() -> Self {
        Self {
            min_x: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            min_y: f64::INFINITY,
            max_y: f64::NEG_INFINITY,
            min_z: f64::INFINITY,
            max_z: f64::NEG_INFINITY,
        }
    }

    /// Planar extent with a flat vertical range
    pub fn planar(min_x: f64, max_x: f64, min_y: f64, max_y: f64) -> Self {
        Self {
            min_x,
            max_x,
            min_y,
            max_y,
            min_z: 0.0,
            max_z: 0.0,
        }
    }

    /// Grow the extent to include a point
    pub fn update(&mut self, x: f64, y: f64, z: f64) {
        self.min_x = self.min_x.min(x);
        self.max_x = self.max_x.max(x);
        self.min_y = self.min_y.min(y);
        self.max_y = self.max_y.max(y);
        self.min_z = self.min_z.min(z);
        self.max_z = self.max_z.max(z);
    }

    pub fn from_xy<I: IntoIterator<Item = (f64, f64)>>(points: I) -> Self {
        let mut extent = Self::empty();
        for (x, y) in points {
            extent.update(x, y, 0.0);
        }
        if extent.min_z > extent.max_z {
            extent.min_z = 0.0;
            extent.max_z = 0.0;
        }
        extent
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// True when nothing has been accumulated or either side is degenerate
    pub fn is_empty(&self) -> bool {
        !(self.width() > 0.0 && self.height() > 0.0)
    }

    pub fn area(&self) -> f64 {
        if self.is_empty() {
            0.0
        } else {
            self.width() * self.height()
        }
    }

    /// Whether `other` lies inside this extent (planar only)
    pub fn contains(&self, other: &Extent, tolerance: f64) -> bool {
        other.min_x >= self.min_x - tolerance
            && other.max_x <= self.max_x + tolerance
            && other.min_y >= self.min_y - tolerance
            && other.max_y <= self.max_y + tolerance
    }
}

impl From<las::Bounds> for Extent {
    fn from(bounds: las::Bounds) -> Self {
        Self {
            min_x: bounds.min.x,
            max_x: bounds.max.x,
            min_y: bounds.min.y,
            max_y: bounds.max.y,
            min_z: bounds.min.z,
            max_z: bounds.max.z,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_until_updated() {
        let mut extent = Extent::empty();
        assert!(extent.is_empty());
        extent.update(1.0, 2.0, 3.0);
        extent.update(4.0, 6.0, -1.0);
        assert_eq!(extent.width(), 3.0);
        assert_eq!(extent.height(), 4.0);
        assert_eq!(extent.min_z, -1.0);
        assert_eq!(extent.area(), 12.0);
    }

    #[test]
    fn containment_uses_tolerance() {
        let outer = Extent::planar(0.0, 10.0, 0.0, 10.0);
        let inner = Extent::planar(0.0, 10.0 + 1e-9, 2.0, 3.0);
        assert!(outer.contains(&inner, 1e-6));
        assert!(!outer.contains(&Extent::planar(-1.0, 1.0, 0.0, 1.0), 1e-6));
    }
}

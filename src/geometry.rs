use image::GrayImage;

/// 2D vector in mask pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Unit vector in the same direction.
    ///
    /// The zero vector maps to the zero vector rather than dividing by zero.
    pub fn normalize(self) -> Vec2 {
        let length = (self.x * self.x + self.y * self.y).sqrt();
        if length == 0.0 {
            Vec2::ZERO
        } else {
            Vec2::new(self.x / length, self.y / length)
        }
    }
}

impl std::ops::Sub for Vec2 {
    type Output = Vec2;

    fn sub(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

/// Image axis used when measuring subject spacing along the motion direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
}

/// Minimal axis-aligned rectangle enclosing all non-zero pixels of a mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn center(&self) -> Vec2 {
        Vec2::new(
            self.x as f32 + self.width as f32 / 2.0,
            self.y as f32 + self.height as f32 / 2.0,
        )
    }

    pub fn center_along(&self, axis: Axis) -> f32 {
        let center = self.center();
        match axis {
            Axis::X => center.x,
            Axis::Y => center.y,
        }
    }

    pub fn span(&self, axis: Axis) -> u32 {
        match axis {
            Axis::X => self.width,
            Axis::Y => self.height,
        }
    }
}

/// Scan a mask for the minimal rectangle enclosing its non-zero pixels.
///
/// Returns `None` when the mask is entirely zero.
pub fn bounding_box(mask: &GrayImage) -> Option<BoundingBox> {
    let (width, height) = mask.dimensions();
    let mut min_x = width;
    let mut max_x = 0u32;
    let mut min_y = height;
    let mut max_y = 0u32;
    let mut found = false;

    for (y, row) in mask.as_raw().chunks_exact(width as usize).enumerate() {
        for (x, &value) in row.iter().enumerate() {
            if value == 0 {
                continue;
            }
            let x = x as u32;
            let y = y as u32;
            min_x = min_x.min(x);
            max_x = max_x.max(x);
            min_y = min_y.min(y);
            max_y = max_y.max(y);
            found = true;
        }
    }

    if !found {
        return None;
    }

    Some(BoundingBox {
        x: min_x,
        y: min_y,
        width: max_x - min_x + 1,
        height: max_y - min_y + 1,
    })
}

use num::{Float, Num};

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Point<T: Num> {
    pub x: T,
    pub y: T,
}

impl<T: Num> Point<T> {
    pub fn new(x: T, y: T) -> Self {
        Point { x, y }
    }
}

impl<T: Num + Copy> From<(T, T)> for Point<T> {
    fn from((x, y): (T, T)) -> Self {
        Point { x, y }
    }
}

impl<T: Float> Point<T> {
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// Clamps the point into `[0, width] x [0, height]`.
    pub fn clamp_to(&self, width: T, height: T) -> Self {
        Point {
            x: self.x.max(T::zero()).min(width),
            y: self.y.max(T::zero()).min(height),
        }
    }
}

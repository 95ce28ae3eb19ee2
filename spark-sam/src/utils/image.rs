use ndarray::ArrayView3;

/// RGB u8 image, memory layout RGBRGBRGB...
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageU8 {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl ImageU8 {
    pub fn new(width: usize, height: usize, data: Vec<u8>) -> Self {
        ImageU8 {
            width,
            height,
            data,
        }
    }

    pub fn filled(width: usize, height: usize, rgb: [u8; 3]) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(width * height * 3)
            .collect();
        ImageU8::new(width, height, data)
    }

    /// Writes one pixel. Returns false and leaves the image untouched when
    /// `(x, y)` lies outside it or the buffer is too short.
    pub fn put_pixel(&mut self, x: usize, y: usize, rgb: [u8; 3]) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        let index = 3 * (y * self.width + x);
        match self.data.get_mut(index..index + 3) {
            Some(pixel) => {
                pixel.copy_from_slice(&rgb);
                true
            }
            None => false,
        }
    }
}

/// Normalized RGB f32 image at the model's square input resolution.
#[derive(Debug, Clone)]
pub struct ImageF32 {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl ImageF32 {
    pub(crate) fn zeros(width: usize, height: usize) -> Self {
        ImageF32 {
            width,
            height,
            data: vec![0.0; width * height * 3],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// `[height, width, 3]` view of the pixel data.
    pub fn view(&self) -> ArrayView3<'_, f32> {
        ArrayView3::from_shape((self.height, self.width, 3), &self.data)
            .expect("image buffer length matches its dimensions")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_pixel_ignores_out_of_range_coordinates() {
        let mut image = ImageU8::filled(2, 2, [0, 0, 0]);
        assert!(image.put_pixel(1, 1, [1, 2, 3]));
        assert_eq!(&image.data[9..12], &[1, 2, 3]);

        let before = image.clone();
        assert!(!image.put_pixel(2, 0, [9, 9, 9]));
        assert!(!image.put_pixel(0, 2, [9, 9, 9]));
        assert_eq!(image, before);

        let mut short = ImageU8::new(2, 2, vec![0; 6]);
        assert!(!short.put_pixel(1, 1, [9, 9, 9]));
    }
}

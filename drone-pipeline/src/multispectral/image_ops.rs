/// Grayscale conversion and resizing helpers for band alignment
use crate::error::Result;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage};
use opencv::core::{self, Mat};
use opencv::prelude::*;
use std::path::Path;

/// Load any supported image, keeping its bit depth.
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    Ok(image::open(path)?)
}

/// Min/max stretch to 8-bit grayscale.
/// 8-bit grayscale input is returned as-is unless `force_normalize`.
pub fn to_8bit(image: &DynamicImage, force_normalize: bool) -> GrayImage {
    if let (DynamicImage::ImageLuma8(gray), false) = (image, force_normalize) {
        return gray.clone();
    }

    let wide = image.to_luma16();
    let (min, max) = wide
        .pixels()
        .fold((u16::MAX, u16::MIN), |(lo, hi), p| (lo.min(p.0[0]), hi.max(p.0[0])));
    let range = f32::from(max.saturating_sub(min));

    GrayImage::from_fn(wide.width(), wide.height(), |x, y| {
        let value = wide.get_pixel(x, y).0[0];
        let scaled = if range > 0.0 {
            f32::from(value - min) * 255.0 / range
        } else {
            0.0
        };
        image::Luma([scaled.round().clamp(0.0, 255.0) as u8])
    })
}

/// Normalise an 8-bit image to the full 0..255 range.
pub fn normalize(image: &GrayImage) -> GrayImage {
    to_8bit(&DynamicImage::ImageLuma8(image.clone()), true)
}

/// Resize to `(width, height)`: area-style when shrinking both axes, Lanczos otherwise.
pub fn resize_match(image: &GrayImage, dimension: (u32, u32)) -> GrayImage {
    let (w, h) = image.dimensions();
    let (mw, mh) = dimension;
    if (w, h) == (mw, mh) || mw == 0 || mh == 0 {
        return image.clone();
    }

    let filter = if mw < w && mh < h {
        FilterType::Triangle
    } else {
        FilterType::Lanczos3
    };
    imageops::resize(image, mw, mh, filter)
}

/// Uniform scale by `factor` with area-style filtering.
pub fn scale_down(image: &GrayImage, factor: f64) -> GrayImage {
    let (w, h) = image.dimensions();
    let nw = ((f64::from(w) * factor).round() as u32).max(1);
    let nh = ((f64::from(h) * factor).round() as u32).max(1);
    imageops::resize(image, nw, nh, FilterType::Triangle)
}

/// Copy an 8-bit image into a single channel OpenCV matrix.
pub fn to_mat(image: &GrayImage) -> Result<Mat> {
    let mut mat = Mat::new_rows_cols_with_default(
        image.height() as i32,
        image.width() as i32,
        core::CV_8UC1,
        core::Scalar::all(0.0),
    )?;
    mat.data_bytes_mut()?.copy_from_slice(image.as_raw());
    Ok(mat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    #[test]
    fn sixteen_bit_input_is_stretched() {
        let wide: ImageBuffer<Luma<u16>, Vec<u16>> =
            ImageBuffer::from_fn(4, 1, |x, _| Luma([1000 + x as u16 * 1000]));
        let gray = to_8bit(&DynamicImage::ImageLuma16(wide), false);
        let values: Vec<u8> = gray.pixels().map(|p| p.0[0]).collect();
        assert_eq!(values, vec![0, 85, 170, 255]);
    }

    #[test]
    fn eight_bit_input_is_kept_unless_forced() {
        let gray = GrayImage::from_fn(2, 1, |x, _| Luma([10 + x as u8 * 10]));
        let dynamic = DynamicImage::ImageLuma8(gray.clone());
        assert_eq!(to_8bit(&dynamic, false), gray);

        let forced = to_8bit(&dynamic, true);
        assert_eq!(forced.get_pixel(0, 0).0[0], 0);
        assert_eq!(forced.get_pixel(1, 0).0[0], 255);
    }

    #[test]
    fn resize_match_reaches_target_dimensions() {
        let gray = GrayImage::new(40, 20);
        assert_eq!(resize_match(&gray, (20, 10)).dimensions(), (20, 10));
        assert_eq!(resize_match(&gray, (80, 10)).dimensions(), (80, 10));
        assert_eq!(resize_match(&gray, (40, 20)).dimensions(), (40, 20));
    }

    #[test]
    fn matrix_copy_keeps_layout() {
        let gray = GrayImage::from_fn(3, 2, |x, y| Luma([(10 * y + x) as u8]));
        let mat = to_mat(&gray).unwrap();
        assert_eq!((mat.rows(), mat.cols()), (2, 3));
        assert_eq!(mat.typ(), core::CV_8UC1);
        assert_eq!(*mat.at_2d::<u8>(1, 2).unwrap(), 12);
        assert_eq!(*mat.at_2d::<u8>(0, 1).unwrap(), 1);
    }
}

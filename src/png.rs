//! PNG encoding of generated images.

use std::io::Cursor;

use image::{ImageFormat, RgbImage};

use crate::pipeline::GeneratedImage;
use crate::{Error, Result};

/// Encode an RGB8 image as an in-memory PNG file.
pub fn encode_png(image: &GeneratedImage) -> Result<Vec<u8>> {
    let buffer = RgbImage::from_raw(image.width, image.height, image.pixels.clone()).ok_or_else(
        || {
            Error::Image(format!(
                "pixel buffer of {} bytes does not match {}x{} RGB",
                image.pixels.len(),
                image.width,
                image.height
            ))
        },
    )?;
    let mut cursor = Cursor::new(Vec::new());
    buffer.write_to(&mut cursor, ImageFormat::Png)?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_png_round_trips_pixels() {
        let image = GeneratedImage {
            width: 2,
            height: 1,
            pixels: vec![255, 0, 0, 0, 0, 255],
        };
        let bytes = encode_png(&image).unwrap();
        assert_eq!(&bytes[1..4], b"PNG");

        let decoded = image::load_from_memory(&bytes).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (2, 1));
        assert_eq!(decoded.as_raw(), &image.pixels);
    }

    #[test]
    fn test_encode_png_rejects_short_buffer() {
        let image = GeneratedImage {
            width: 4,
            height: 4,
            pixels: vec![0; 10],
        };
        assert!(matches!(encode_png(&image), Err(Error::Image(_))));
    }
}

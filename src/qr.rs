//! QR tokens and their rendered images.
//!
//! A token is the only thing encoded in the image; scanners decode it in the
//! browser and post it back to the check-in endpoint.

use std::io::Cursor;

use image::{DynamicImage, ImageOutputFormat, Luma};
use qrcode::render::svg;
use qrcode::{EcLevel, QrCode};
use rand::Rng;

use crate::error::{Error, Result};

/// Uppercase letters and digits minus the look-alikes 0/O, 1/I/L.
const TOKEN_CHARSET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Random token of `len` characters.
#[must_use]
pub fn generate_token(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| TOKEN_CHARSET[rng.gen_range(0..TOKEN_CHARSET.len())] as char)
        .collect()
}

fn encode(token: &str) -> Result<QrCode> {
    QrCode::with_error_correction_level(token.as_bytes(), EcLevel::M)
        .map_err(|e| Error::Qr(e.to_string()))
}

/// Render `token` as a PNG at least `size` pixels wide.
///
/// # Errors
///
/// Returns [`Error::Qr`] if the token cannot be encoded or the image
/// cannot be written.
pub fn render_png(token: &str, size: u32) -> Result<Vec<u8>> {
    let image = encode(token)?
        .render::<Luma<u8>>()
        .min_dimensions(size, size)
        .build();

    let mut bytes = Vec::new();
    DynamicImage::ImageLuma8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)
        .map_err(|e| Error::Qr(e.to_string()))?;
    Ok(bytes)
}

/// Render `token` as a standalone SVG document.
///
/// # Errors
///
/// Returns [`Error::Qr`] if the token cannot be encoded.
pub fn render_svg(token: &str, size: u32) -> Result<String> {
    Ok(encode(token)?
        .render::<svg::Color>()
        .min_dimensions(size, size)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#ffffff"))
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_token_length_and_alphabet() {
        for len in [6, 10, 32] {
            let token = generate_token(len);
            assert_eq!(token.len(), len);
            assert!(token.bytes().all(|b| TOKEN_CHARSET.contains(&b)));
        }
    }

    #[test]
    fn test_generate_token_avoids_lookalikes() {
        let token = generate_token(2000);
        for c in ['0', 'O', '1', 'I', 'L'] {
            assert!(!token.contains(c), "found {c}");
        }
    }

    #[test]
    fn test_tokens_differ() {
        assert_ne!(generate_token(10), generate_token(10));
    }

    #[test]
    fn test_render_png() {
        let png = render_png("K7QH2MZP4X", 300).unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");

        let decoded = image::load_from_memory(&png).unwrap();
        assert!(decoded.width() >= 300);
        assert_eq!(decoded.width(), decoded.height());
    }

    #[test]
    fn test_render_svg() {
        let svg = render_svg("K7QH2MZP4X", 200).unwrap();
        assert!(svg.contains("<svg"));
        assert!(svg.contains("#000000"));
    }
}

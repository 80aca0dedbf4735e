// src/render.rs

//! Stock render callbacks.

use serde::{Deserialize, Serialize};

use crate::kms::MappedView;

/// What to draw into the scanout buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum RenderPattern {
    /// Red ramps left to right, blue top to bottom.
    #[default]
    Gradient,
    /// One colour, 0xRRGGBB.
    Solid { color: u32 },
}

pub fn draw_gradient(view: &mut MappedView<'_>) {
    let (width, height) = (view.width(), view.height());
    for y in 0..height {
        let blue = y * 255 / height;
        for x in 0..width {
            let red = x * 255 / width;
            view.put_pixel(x, y, (red << 16) | blue);
        }
    }
}

/// Fills every pixel, leaving row padding untouched.
pub fn fill_solid(view: &mut MappedView<'_>, color: u32) {
    let pixel = color.to_le_bytes();
    let row_bytes = view.width() as usize * 4;
    for y in 0..view.height() {
        for chunk in view.row_mut(y)[..row_bytes].chunks_exact_mut(4) {
            chunk.copy_from_slice(&pixel);
        }
    }
}

/// The callback for `pattern`.
pub fn renderer_for(pattern: RenderPattern) -> impl FnOnce(&mut MappedView<'_>) {
    move |view: &mut MappedView<'_>| match pattern {
        RenderPattern::Gradient => draw_gradient(view),
        RenderPattern::Solid { color } => fill_solid(view, color),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixel(bytes: &[u8], stride: usize, x: usize, y: usize) -> u32 {
        let at = y * stride + x * 4;
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn gradient_ramps_red_with_x_and_blue_with_y() {
        let mut backing = vec![0u8; 64 * 4];
        let mut view = MappedView::new(&mut backing, 4, 4, 64).unwrap();
        draw_gradient(&mut view);

        assert_eq!(pixel(&backing, 64, 0, 0), 0x000000);
        assert_eq!(pixel(&backing, 64, 2, 0), (127 << 16));
        assert_eq!(pixel(&backing, 64, 0, 3), 191);
        assert_eq!(pixel(&backing, 64, 3, 3), (191 << 16) | 191);
    }

    #[test]
    fn solid_fill_leaves_row_padding_alone() {
        let mut backing = vec![0xAAu8; 32 * 2];
        let mut view = MappedView::new(&mut backing, 3, 2, 32).unwrap();
        fill_solid(&mut view, 0x00336699);

        assert_eq!(pixel(&backing, 32, 2, 1), 0x00336699);
        assert!(backing[12..32].iter().all(|&b| b == 0xAA));
        assert!(backing[44..64].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn pattern_parses_from_json() {
        let solid: RenderPattern = serde_json::from_str(r#"{"kind":"solid","color":255}"#).unwrap();
        assert_eq!(solid, RenderPattern::Solid { color: 255 });
        let gradient: RenderPattern = serde_json::from_str(r#"{"kind":"gradient"}"#).unwrap();
        assert_eq!(gradient, RenderPattern::Gradient);
    }
}

//! Review renderings: character boxes on plate crops, plate boxes on the
//! full image. Output only feeds artifacts, never the returned data.

use crate::alphabet::Alphabet;
use ab_glyph::{FontVec, PxScale};
use anyhow::{Context, Result};
use common::plate_tasks::{BoundingBox, CharacterDetection};
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const CHAR_LABEL_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
const PLATE_LABEL_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

const CHAR_LABEL_SCALE: f32 = 14.0;
const PLATE_LABEL_SCALE: f32 = 20.0;

/// Draws detections for human review.
///
/// Labels need a font; without one only boxes are drawn.
pub struct Annotator {
    font: Option<FontVec>,
}

impl Annotator {
    /// Load the label font from `font_path`, or draw boxes only when `None`
    pub fn new(font_path: Option<&Path>) -> Result<Self> {
        let font = match font_path {
            Some(path) => {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("Failed to read font file: {}", path.display()))?;
                let font = FontVec::try_from_vec(bytes)
                    .map_err(|e| anyhow::anyhow!("Invalid font {}: {}", path.display(), e))?;
                Some(font)
            }
            None => None,
        };

        Ok(Self { font })
    }

    pub fn without_labels() -> Self {
        Self { font: None }
    }

    pub fn has_labels(&self) -> bool {
        self.font.is_some()
    }

    /// Copy of `crop` with each character's box and symbol
    pub fn annotate_characters(
        &self,
        crop: &DynamicImage,
        characters: &[CharacterDetection],
        alphabet: &Alphabet,
    ) -> RgbImage {
        let mut canvas = crop.to_rgb8();

        for ch in characters {
            draw_box(&mut canvas, &ch.bbox, 1);

            // unmapped ids were already rejected by assembly; skip the label
            if let (Some(font), Ok(symbol)) = (&self.font, alphabet.symbol(ch.class_id)) {
                let y = ch.bbox.y1 - CHAR_LABEL_SCALE as i32 - 2;
                draw_text_mut(
                    &mut canvas,
                    CHAR_LABEL_COLOR,
                    ch.bbox.x1,
                    y.max(0),
                    PxScale::from(CHAR_LABEL_SCALE),
                    font,
                    &symbol.to_string(),
                );
            }
        }

        canvas
    }

    /// Copy of `image` with each plate box and its confidence
    pub fn annotate_plates(&self, image: &DynamicImage, plates: &[(BoundingBox, f32)]) -> RgbImage {
        let mut canvas = image.to_rgb8();
        let thickness = (canvas.width().max(canvas.height()) / 400).max(2) as i32;

        for (bbox, confidence) in plates {
            draw_box(&mut canvas, bbox, thickness);

            if let Some(font) = &self.font {
                let y = bbox.y1 - PLATE_LABEL_SCALE as i32 - thickness;
                draw_text_mut(
                    &mut canvas,
                    PLATE_LABEL_COLOR,
                    bbox.x1,
                    y.max(0),
                    PxScale::from(PLATE_LABEL_SCALE),
                    font,
                    &format!("plate {:.2}", confidence),
                );
            }
        }

        canvas
    }
}

/// Hollow rectangle, `thickness` pixels wide, growing inward
fn draw_box(canvas: &mut RgbImage, bbox: &BoundingBox, thickness: i32) {
    for inset in 0..thickness {
        let width = bbox.width() - 2 * inset;
        let height = bbox.height() - 2 * inset;
        if width <= 0 || height <= 0 {
            break;
        }

        let rect = Rect::at(bbox.x1 + inset, bbox.y1 + inset).of_size(width as u32, height as u32);
        draw_hollow_rect_mut(canvas, rect, BOX_COLOR);
    }
}

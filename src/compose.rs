/// 叠加层合成 (Overlay compositing)
///
/// 把 OverlayDocument 的元素画到显示帧上: 矩形用 imageproc 空心矩形,
/// 文字用 ab_glyph 字体。未配置字体时只画矩形, 并只警告一次。
use crate::overlay::{OverlayDocument, OverlayElement, SHADOW_OFFSET_EM};
use ab_glyph::{Font, FontVec, PxScale, ScaleFont};
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct OverlayCompositor {
    font: Option<FontVec>,
    warned_no_font: AtomicBool,
}

impl OverlayCompositor {
    pub fn new(font: Option<FontVec>) -> Self {
        Self {
            font,
            warned_no_font: AtomicBool::new(false),
        }
    }

    /// 从 TTF/OTF 文件加载字体
    pub fn from_font_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read font {}", path.display()))?;
        let font = FontVec::try_from_vec(bytes)
            .with_context(|| format!("invalid font file {}", path.display()))?;
        Ok(Self::new(Some(font)))
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// 在帧上绘制文档; 文档尺寸与帧不同时按比例换算坐标
    pub fn compose(&self, image: &mut RgbImage, doc: &OverlayDocument) {
        let size = doc.size();
        if size.is_empty() {
            return;
        }
        let kx = image.width() as f32 / size.width as f32;
        let ky = image.height() as f32 / size.height as f32;

        for element in doc.elements() {
            match element {
                OverlayElement::Rect {
                    x,
                    y,
                    width,
                    height,
                    stroke,
                    stroke_width,
                } => {
                    let color = parse_color(stroke);
                    // 超过帧的宽高后再加粗也画不出新像素
                    let limit = image.width().max(image.height()).max(1) as f32;
                    let thickness = (stroke_width * kx.min(ky)).round().clamp(1.0, limit) as i32;
                    // 描边以几何边为中心, 向内外各扩展一半
                    let half = thickness / 2;
                    for i in 0..thickness {
                        let inset = (i - half) as f32;
                        let w = (width * kx - 2.0 * inset).round() as i32;
                        let h = (height * ky - 2.0 * inset).round() as i32;
                        if w <= 0 || h <= 0 {
                            break;
                        }
                        let rect = Rect::at((x * kx + inset).round() as i32, (y * ky + inset).round() as i32)
                            .of_size(w as u32, h as u32);
                        draw_hollow_rect_mut(image, rect, color);
                    }
                }
                OverlayElement::Text {
                    x,
                    y,
                    text,
                    font_size,
                } => {
                    let Some(font) = self.font.as_ref() else {
                        if !self.warned_no_font.swap(true, Ordering::Relaxed) {
                            tracing::warn!("no overlay font configured, text elements are skipped");
                        }
                        continue;
                    };
                    let px = font_size * ky;
                    if px <= 0.0 {
                        continue;
                    }
                    let scale = PxScale::from(px);
                    // SVG 的 y 是基线, imageproc 的 y 是文字顶部
                    let ascent = font.as_scaled(scale).ascent();
                    let left = x * kx;
                    let top = y * ky - ascent;
                    let shadow = SHADOW_OFFSET_EM * px;
                    draw_text_mut(
                        image,
                        Rgb([0, 0, 0]),
                        (left + shadow).round() as i32,
                        (top + shadow).round() as i32,
                        scale,
                        font,
                        text,
                    );
                    draw_text_mut(
                        image,
                        Rgb([255, 255, 255]),
                        left.round() as i32,
                        top.round() as i32,
                        scale,
                        font,
                        text,
                    );
                }
            }
        }
    }
}

/// SVG 颜色名或 #rrggbb; 无法识别时用白色
pub fn parse_color(s: &str) -> Rgb<u8> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix('#') {
        if hex.len() == 6 {
            if let Ok(v) = u32::from_str_radix(hex, 16) {
                return Rgb([(v >> 16) as u8, (v >> 8) as u8, v as u8]);
            }
        }
    }
    match s.to_ascii_lowercase().as_str() {
        "red" => Rgb([255, 0, 0]),
        "green" => Rgb([0, 128, 0]),
        "lime" => Rgb([0, 255, 0]),
        "blue" => Rgb([0, 0, 255]),
        "yellow" => Rgb([255, 255, 0]),
        "black" => Rgb([0, 0, 0]),
        "white" => Rgb([255, 255, 255]),
        _ => {
            tracing::debug!(color = s, "unknown stroke color");
            Rgb([255, 255, 255])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::OverlayRenderer;

    #[test]
    fn test_parse_color() {
        assert_eq!(parse_color("red"), Rgb([255, 0, 0]));
        assert_eq!(parse_color("#00ff80"), Rgb([0, 255, 128]));
        assert_eq!(parse_color("chartreuse-ish"), Rgb([255, 255, 255]));
    }

    #[test]
    fn test_rect_is_drawn_hollow() {
        let mut svg = OverlayRenderer::begin(64, 64);
        svg.add_rect(10.0, 10.0, 20.0, 20.0, "red", 1.0);
        let doc = svg.finish();

        let mut image = RgbImage::new(64, 64);
        OverlayCompositor::new(None).compose(&mut image, &doc);
        assert_eq!(*image.get_pixel(10, 10), Rgb([255, 0, 0]));
        assert_eq!(*image.get_pixel(29, 20), Rgb([255, 0, 0]));
        // 内部不填充
        assert_eq!(*image.get_pixel(20, 20), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_huge_stroke_is_bounded() {
        let mut svg = OverlayRenderer::begin(64, 64);
        svg.add_rect(10.0, 10.0, 20.0, 20.0, "red", 1.0e9);
        let doc = svg.finish();

        let mut image = RgbImage::new(64, 64);
        let started = std::time::Instant::now();
        OverlayCompositor::new(None).compose(&mut image, &doc);
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        assert_eq!(*image.get_pixel(0, 0), Rgb([255, 0, 0]));
        assert_eq!(*image.get_pixel(20, 20), Rgb([255, 0, 0]));
    }

    #[test]
    fn test_document_scaled_to_frame() {
        let mut svg = OverlayRenderer::begin(32, 32);
        svg.add_rect(5.0, 5.0, 10.0, 10.0, "blue", 1.0);
        let doc = svg.finish();

        let mut image = RgbImage::new(64, 64);
        OverlayCompositor::new(None).compose(&mut image, &doc);
        assert_eq!(*image.get_pixel(10, 10), Rgb([0, 0, 255]));
        assert_eq!(*image.get_pixel(5, 5), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_text_without_font_is_skipped() {
        let mut svg = OverlayRenderer::begin(16, 16);
        svg.add_text(2.0, 10.0, "hi", 8.0);
        let doc = svg.finish();

        let mut image = RgbImage::new(16, 16);
        let compositor = OverlayCompositor::new(None);
        compositor.compose(&mut image, &doc);
        assert!(image.pixels().all(|p| *p == Rgb([0, 0, 0])));
        assert!(!compositor.has_font());
    }
}

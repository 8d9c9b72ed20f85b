/// 检测客户端回调 (Detection client callback)
///
/// 检测框从张量坐标换算到源图像坐标后画成红框, 上方标注 "NN% label"。
use crate::frame::{CropBox, Frame, Size};
use crate::inference::{DetectedObject, LabelMap, ObjectDetector};
use crate::overlay::{OverlayDocument, OverlayRenderer};
use crate::status::StatusLine;
use crate::worker::FrameHandler;
use std::io::{self, Write};
use std::time::{Duration, Instant};

pub const DEFAULT_THRESHOLD: f32 = 0.75;
const FONT_SIZE: f32 = 20.0;

/// 画框样式
#[derive(Debug, Clone)]
pub struct BoxStyle {
    pub stroke: String,
    pub stroke_width: f32,
    pub font_size: f32,
}

impl Default for BoxStyle {
    fn default() -> Self {
        Self {
            stroke: "red".to_string(),
            stroke_width: 2.0,
            font_size: FONT_SIZE,
        }
    }
}

pub fn timing_line(elapsed: Duration) -> String {
    format!("Inference: {} ms", (elapsed.as_secs_f64() * 1000.0).round() as u64)
}

/// 生成检测叠加层; 非法框跳过
pub fn detection_overlay(
    source: Size,
    crop: CropBox,
    objects: &[DetectedObject],
    labels: &LabelMap,
    text_lines: &[String],
    style: &BoxStyle,
) -> OverlayDocument {
    let mut svg = OverlayRenderer::begin(source.width, source.height);
    for (n, line) in text_lines.iter().enumerate() {
        svg.add_text(10.0, (n + 1) as f32 * 20.0, line, style.font_size);
    }
    for obj in objects {
        if !obj.bbox.is_valid() {
            continue;
        }
        let (x, y) = crop.to_source(source, obj.bbox.xmin, obj.bbox.ymin);
        let (w, h) = crop.scale_to_source(source, obj.bbox.width(), obj.bbox.height());
        let percent = (100.0 * obj.score) as i32;
        let label = format!("{}% {}", percent, labels.name(obj.id));
        svg.add_text(x, y - 5.0, &label, style.font_size);
        svg.add_rect(x, y, w, h, &style.stroke, style.stroke_width);
    }
    svg.finish()
}

pub struct DetectHandler<D: ObjectDetector, W: Write + Send = io::Stdout> {
    detector: D,
    labels: LabelMap,
    top_k: usize,
    threshold: f32,
    style: BoxStyle,
    status: StatusLine<W>,
}

impl<D: ObjectDetector, W: Write + Send> DetectHandler<D, W> {
    pub fn new(
        detector: D,
        labels: LabelMap,
        top_k: usize,
        threshold: f32,
        style: BoxStyle,
        status: StatusLine<W>,
    ) -> Self {
        Self {
            detector,
            labels,
            top_k: top_k.max(1),
            threshold,
            style,
            status,
        }
    }
}

impl<D: ObjectDetector, W: Write + Send> FrameHandler for DetectHandler<D, W> {
    fn handle(
        &mut self,
        frame: &Frame,
        source: Size,
        crop: CropBox,
    ) -> anyhow::Result<Option<OverlayDocument>> {
        let start = Instant::now();
        self.detector.run(&frame.image)?;
        let mut objects = self.detector.objects(self.threshold);
        objects.truncate(self.top_k);
        let lines = vec![timing_line(start.elapsed())];
        self.status.update(&lines[0])?;
        Ok(Some(detection_overlay(
            source,
            crop,
            &objects,
            &self.labels,
            &lines,
            &self.style,
        )))
    }
}

impl<D: ObjectDetector, W: Write + Send> Drop for DetectHandler<D, W> {
    fn drop(&mut self) {
        let _ = self.status.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{BBox, Class, InferenceEngine};
    use crate::overlay::OverlayElement;
    use image::RgbImage;

    struct FixedDetector(Vec<DetectedObject>);

    impl InferenceEngine for FixedDetector {
        fn allocate(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        fn input_size(&self) -> Size {
            Size::new(224, 224)
        }
        fn run(&mut self, _image: &RgbImage) -> anyhow::Result<()> {
            Ok(())
        }
        fn classes(&self, _top_k: usize, _threshold: f32) -> Vec<Class> {
            Vec::new()
        }
    }

    impl ObjectDetector for FixedDetector {
        fn objects(&self, threshold: f32) -> Vec<DetectedObject> {
            self.0.iter().filter(|o| o.score >= threshold).copied().collect()
        }
    }

    fn crop() -> CropBox {
        CropBox {
            x: 0,
            y: 28,
            width: 224,
            height: 168,
        }
    }

    #[test]
    fn test_box_translated_to_source() {
        let objects = [DetectedObject {
            id: 1,
            score: 0.876,
            bbox: BBox {
                xmin: 22.4,
                ymin: 28.0 + 16.8,
                xmax: 22.4 + 44.8,
                ymax: 28.0 + 16.8 + 33.6,
            },
        }];
        let labels = LabelMap::parse("0 person\n1 bottle\n");
        let doc = detection_overlay(
            Size::new(640, 480),
            crop(),
            &objects,
            &labels,
            &[],
            &BoxStyle::default(),
        );
        let rect = doc
            .elements()
            .iter()
            .find_map(|e| match e {
                OverlayElement::Rect { x, y, width, height, stroke, stroke_width } => {
                    Some((*x, *y, *width, *height, stroke.clone(), *stroke_width))
                }
                _ => None,
            })
            .unwrap();
        assert!((rect.0 - 64.0).abs() < 1e-3);
        assert!((rect.1 - 48.0).abs() < 1e-3);
        assert!((rect.2 - 128.0).abs() < 1e-3);
        assert!((rect.3 - 96.0).abs() < 1e-3);
        assert_eq!(rect.4, "red");
        assert_eq!(rect.5, 2.0);
        assert!(doc.elements().iter().any(|e| matches!(
            e,
            OverlayElement::Text { text, y, .. } if text == "87% bottle" && (*y - 43.0).abs() < 1e-3
        )));
    }

    #[test]
    fn test_invalid_box_skipped() {
        let objects = [DetectedObject {
            id: 0,
            score: 0.9,
            bbox: BBox {
                xmin: 10.0,
                ymin: 10.0,
                xmax: 5.0,
                ymax: 20.0,
            },
        }];
        let doc = detection_overlay(
            Size::new(640, 480),
            crop(),
            &objects,
            &LabelMap::default(),
            &["Inference: 3 ms".to_string()],
            &BoxStyle::default(),
        );
        assert_eq!(doc.elements().len(), 1);
    }

    #[test]
    fn test_handler_applies_threshold_and_top_k() {
        let b = BBox {
            xmin: 10.0,
            ymin: 40.0,
            xmax: 20.0,
            ymax: 50.0,
        };
        let detector = FixedDetector(vec![
            DetectedObject { id: 0, score: 0.95, bbox: b },
            DetectedObject { id: 0, score: 0.80, bbox: b },
            DetectedObject { id: 0, score: 0.50, bbox: b },
        ]);
        let mut handler = DetectHandler::new(
            detector,
            LabelMap::default(),
            1,
            DEFAULT_THRESHOLD,
            BoxStyle::default(),
            StatusLine::new(Vec::new()),
        );
        let frame = Frame::new(RgbImage::new(224, 224), 1);
        let doc = handler
            .handle(&frame, Size::new(640, 480), crop())
            .unwrap()
            .unwrap();
        let rects = doc
            .elements()
            .iter()
            .filter(|e| matches!(e, OverlayElement::Rect { .. }))
            .count();
        assert_eq!(rects, 1);
        assert!(doc.markup().contains(">95% 0</text>"));
    }

    #[test]
    fn test_timing_line_rounds() {
        assert_eq!(timing_line(Duration::from_micros(12_600)), "Inference: 13 ms");
    }
}

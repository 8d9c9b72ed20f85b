/// ONNX Runtime 推理引擎 (ONNX Runtime engines)
///
/// 输入: NCHW float32, 像素归一化到 [0, 1]。
/// 分类输出为 logits 时做 softmax; 检测输出为 YOLOv8 的 [1, 4 + nc, N]。
use super::{
    non_max_suppression, softmax, top_classes, BBox, Class, DetectedObject, InferenceEngine,
    ObjectDetector,
};
use crate::error::InferenceError;
use crate::frame::Size;
use crate::pipeline::elements::Scaler;
use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use ort::session::Session;
use ort::value::Tensor;
use std::borrow::Cow;
use std::path::Path;

/// 检测候选框的最低置信度, objects() 再按用户阈值过滤
const CANDIDATE_FLOOR: f32 = 0.05;
const NMS_IOU: f32 = 0.45;

fn load_session(path: &Path) -> Result<(Session, String)> {
    let session = Session::builder()
        .context("failed to create ORT session builder")?
        .commit_from_file(path)
        .with_context(|| format!("failed to load ONNX model {}", path.display()))?;
    let input_name = session
        .inputs
        .first()
        .map(|input| input.name.clone())
        .ok_or_else(|| anyhow!("model {} has no inputs", path.display()))?;
    Ok((session, input_name))
}

/// 缩放到模型输入尺寸, 转 NCHW 张量
fn to_tensor(scaler: &mut Scaler, image: &RgbImage, size: Size) -> Result<ort::value::DynValue> {
    let resized: Cow<'_, RgbImage> = if image.dimensions() == (size.width, size.height) {
        Cow::Borrowed(image)
    } else {
        Cow::Owned(scaler.scale(image, size)?)
    };
    let raw = resized.as_raw();
    let plane = size.area();
    let mut data = vec![0f32; 3 * plane];
    for idx in 0..plane {
        data[idx] = raw[idx * 3] as f32 / 255.0; // R
        data[plane + idx] = raw[idx * 3 + 1] as f32 / 255.0; // G
        data[2 * plane + idx] = raw[idx * 3 + 2] as f32 / 255.0; // B
    }
    let shape = [1usize, 3, size.height as usize, size.width as usize];
    Ok(Tensor::from_array((shape, data.into_boxed_slice()))
        .context("failed to create input tensor")?
        .into_dyn())
}

/// 运行一次并取出第一个输出 (形状, 数据)
fn run_first_output(
    session: &mut Session,
    input_name: &str,
    tensor: ort::value::DynValue,
) -> Result<(Vec<usize>, Vec<f32>)> {
    let outputs = session
        .run(ort::inputs![input_name => tensor])
        .context("ONNX inference failed")?;
    let first = outputs
        .iter()
        .next()
        .ok_or_else(|| InferenceError::Engine("model produced no outputs".into()))?
        .1;
    let (shape, data) = first
        .try_extract_tensor::<f32>()
        .context("failed to extract output tensor")?;
    let dims = shape.iter().map(|&d| d.max(0) as usize).collect();
    Ok((dims, data.to_vec()))
}

/// 图像分类
pub struct OnnxClassifier {
    session: Session,
    input_name: String,
    size: Size,
    scaler: Scaler,
    scores: Vec<f32>,
}

impl OnnxClassifier {
    pub fn new(model: impl AsRef<Path>, size: Size) -> Result<Self> {
        let (session, input_name) = load_session(model.as_ref())?;
        tracing::info!(model = %model.as_ref().display(), input = %size, "classifier loaded");
        Ok(Self {
            session,
            input_name,
            size,
            scaler: Scaler::new(),
            scores: Vec::new(),
        })
    }
}

impl InferenceEngine for OnnxClassifier {
    fn allocate(&mut self) -> Result<()> {
        // 预热一次, 让 ORT 分配好内部缓冲
        let blank = RgbImage::new(self.size.width, self.size.height);
        self.run(&blank)?;
        self.scores.clear();
        Ok(())
    }

    fn input_size(&self) -> Size {
        self.size
    }

    fn run(&mut self, image: &RgbImage) -> Result<()> {
        let tensor = to_tensor(&mut self.scaler, image, self.size)?;
        let (_dims, data) = run_first_output(&mut self.session, &self.input_name, tensor)?;
        let is_probability = data.iter().all(|&v| (0.0..=1.0).contains(&v))
            && (data.iter().sum::<f32>() - 1.0).abs() < 1e-2;
        self.scores = if is_probability { data } else { softmax(&data) };
        Ok(())
    }

    fn classes(&self, top_k: usize, threshold: f32) -> Vec<Class> {
        top_classes(&self.scores, top_k, threshold)
    }
}

/// YOLOv8 目标检测
pub struct OnnxDetector {
    session: Session,
    input_name: String,
    size: Size,
    scaler: Scaler,
    objects: Vec<DetectedObject>,
}

impl OnnxDetector {
    pub fn new(model: impl AsRef<Path>, size: Size) -> Result<Self> {
        let (session, input_name) = load_session(model.as_ref())?;
        tracing::info!(model = %model.as_ref().display(), input = %size, "detector loaded");
        Ok(Self {
            session,
            input_name,
            size,
            scaler: Scaler::new(),
            objects: Vec::new(),
        })
    }
}

/// 解码 [1, 4 + nc, N] 输出, 坐标为输入张量像素
pub fn decode_yolov8(dims: &[usize], data: &[f32], floor: f32) -> Result<Vec<DetectedObject>> {
    let (rows, anchors) = match dims {
        [1, rows, anchors] => (*rows, *anchors),
        [rows, anchors] => (*rows, *anchors),
        _ => {
            return Err(
                InferenceError::Engine(format!("unexpected detector output shape {:?}", dims)).into(),
            )
        }
    };
    if rows <= 4 || data.len() < rows * anchors {
        return Err(InferenceError::Engine(format!("detector output too small: {:?}", dims)).into());
    }
    let nc = rows - 4;
    let mut objects = Vec::new();
    for i in 0..anchors {
        let (id, score) = (0..nc)
            .map(|c| (c, data[(4 + c) * anchors + i]))
            .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
        if score < floor {
            continue;
        }
        let cx = data[i];
        let cy = data[anchors + i];
        let w = data[2 * anchors + i];
        let h = data[3 * anchors + i];
        objects.push(DetectedObject {
            id,
            score,
            bbox: BBox {
                xmin: cx - w / 2.0,
                ymin: cy - h / 2.0,
                xmax: cx + w / 2.0,
                ymax: cy + h / 2.0,
            },
        });
    }
    non_max_suppression(&mut objects, NMS_IOU);
    Ok(objects)
}

impl InferenceEngine for OnnxDetector {
    fn allocate(&mut self) -> Result<()> {
        let blank = RgbImage::new(self.size.width, self.size.height);
        self.run(&blank)?;
        self.objects.clear();
        Ok(())
    }

    fn input_size(&self) -> Size {
        self.size
    }

    fn run(&mut self, image: &RgbImage) -> Result<()> {
        let tensor = to_tensor(&mut self.scaler, image, self.size)?;
        let (dims, data) = run_first_output(&mut self.session, &self.input_name, tensor)?;
        self.objects = decode_yolov8(&dims, &data, CANDIDATE_FLOOR)?;
        Ok(())
    }

    fn classes(&self, top_k: usize, threshold: f32) -> Vec<Class> {
        self.objects
            .iter()
            .filter(|o| o.score >= threshold)
            .take(top_k)
            .map(|o| Class {
                id: o.id,
                score: o.score,
            })
            .collect()
    }
}

impl ObjectDetector for OnnxDetector {
    fn objects(&self, threshold: f32) -> Vec<DetectedObject> {
        self.objects
            .iter()
            .filter(|o| o.score >= threshold)
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_yolov8() {
        // 2 类, 3 个锚点
        let anchors = 3;
        let mut data = vec![0f32; 6 * anchors];
        let mut set = |row: usize, i: usize, v: f32| data[row * anchors + i] = v;
        // 锚点 0: 类 1, 0.9
        set(0, 0, 50.0);
        set(1, 0, 50.0);
        set(2, 0, 20.0);
        set(3, 0, 10.0);
        set(5, 0, 0.9);
        // 锚点 1: 与 0 重叠, 分数低, 被 NMS 去掉
        set(0, 1, 51.0);
        set(1, 1, 50.0);
        set(2, 1, 20.0);
        set(3, 1, 10.0);
        set(5, 1, 0.6);
        // 锚点 2: 低于下限
        set(4, 2, 0.01);

        let objects = decode_yolov8(&[1, 6, anchors], &data, 0.05).unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].id, 1);
        assert_eq!(
            objects[0].bbox,
            BBox {
                xmin: 40.0,
                ymin: 45.0,
                xmax: 60.0,
                ymax: 55.0
            }
        );
    }

    #[test]
    fn test_decode_rejects_bad_shape() {
        assert!(decode_yolov8(&[1, 3], &[0.0; 3], 0.05).is_err());
        assert!(decode_yolov8(&[1, 2, 3, 4], &[], 0.05).is_err());
        let err = decode_yolov8(&[1, 84, 10], &[0.0; 8], 0.05).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InferenceError>(),
            Some(InferenceError::Engine(msg)) if msg.contains("too small")
        ));
    }
}

/// 显示分支输出 (Presentation sinks)
use crate::config::AUTO_RECORDING;
use crate::error::{PipelineError, Result};
use crate::pipeline::source::own_process_group;
use crate::pipeline::topology::Caps;
use image::RgbImage;
use parking_lot::Mutex;
use std::io::Write;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;

pub trait FrameSink: Send {
    fn write(&mut self, image: &RgbImage) -> Result<()>;

    fn release(&mut self) -> Result<()> {
        Ok(())
    }
}

/// 丢弃所有帧
#[derive(Debug, Default)]
pub struct NullSink {
    frames: u64,
}

impl FrameSink for NullSink {
    fn write(&mut self, _image: &RgbImage) -> Result<()> {
        self.frames += 1;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        tracing::debug!(frames = self.frames, "null sink released");
        Ok(())
    }
}

/// 把合成帧留在内存中, 供测试读取
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    frames: Arc<Mutex<Vec<RgbImage>>>,
    released: Arc<Mutex<bool>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<RgbImage> {
        self.frames.lock().clone()
    }

    pub fn is_released(&self) -> bool {
        *self.released.lock()
    }
}

impl FrameSink for MemorySink {
    fn write(&mut self, image: &RgbImage) -> Result<()> {
        self.frames.lock().push(image.clone());
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        *self.released.lock() = true;
        Ok(())
    }
}

/// 本地时间生成录像文件名, 如 classibin-20240101-120000.mp4
pub fn default_recording_name() -> String {
    format!(
        "classibin-{}.mp4",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    )
}

/// 录像目标: "auto" 换成带时间戳的默认文件名, 其余原样使用
pub fn recording_path(output: &str) -> String {
    if output == AUTO_RECORDING {
        default_recording_name()
    } else {
        output.to_string()
    }
}

/// 通过 ffmpeg 子进程重新编码合成帧
pub struct EncoderSink {
    child: Child,
    stdin: Option<ChildStdin>,
    output: String,
    frames: u64,
}

impl EncoderSink {
    pub fn open(ffmpeg_bin: &str, caps: Caps, output: &str) -> Result<Self> {
        let mut cmd = Command::new(ffmpeg_bin);
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-video_size")
            .arg(format!("{}x{}", caps.size.width, caps.size.height))
            .arg("-framerate")
            .arg(caps.framerate.to_string())
            .arg("-i")
            .arg("-")
            .arg("-pix_fmt")
            .arg("yuv420p")
            .arg(output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        let mut child = own_process_group(&mut cmd)
            .spawn()
            .map_err(|e| {
                PipelineError::construction(format!("failed to start encoder {}: {}", ffmpeg_bin, e))
            })?;
        let stdin = child.stdin.take();
        tracing::info!(output, "recording presentation branch");
        Ok(Self {
            child,
            stdin,
            output: output.to_string(),
            frames: 0,
        })
    }
}

impl FrameSink for EncoderSink {
    fn write(&mut self, image: &RgbImage) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| PipelineError::Sink("encoder already closed".into()))?;
        stdin
            .write_all(image.as_raw())
            .map_err(|e| PipelineError::Sink(format!("{}: {}", self.output, e)))?;
        self.frames += 1;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        // 关闭 stdin 让 ffmpeg 写完文件尾
        drop(self.stdin.take());
        let status = self.child.wait()?;
        tracing::info!(output = %self.output, frames = self.frames, ?status, "recording closed");
        if !status.success() {
            return Err(PipelineError::Sink(format!(
                "encoder exited with {}",
                status
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Size;

    #[test]
    fn test_memory_sink_shares_frames() {
        let sink = MemorySink::new();
        let mut writer: Box<dyn FrameSink> = Box::new(sink.clone());
        writer.write(&RgbImage::new(4, 4)).unwrap();
        writer.release().unwrap();
        assert_eq!(sink.frames().len(), 1);
        assert!(sink.is_released());
    }

    #[test]
    fn test_recording_name() {
        let name = default_recording_name();
        assert!(name.starts_with("classibin-"));
        assert!(name.ends_with(".mp4"));
    }

    #[test]
    fn test_recording_path() {
        let auto = recording_path(AUTO_RECORDING);
        assert!(auto.starts_with("classibin-") && auto.ends_with(".mp4"));
        assert_eq!(recording_path("rtmp://host/live"), "rtmp://host/live");
    }

    #[test]
    fn test_encoder_missing_binary() {
        let caps = Caps {
            size: Size::new(4, 4),
            framerate: 30,
        };
        assert!(EncoderSink::open("/nonexistent/ffmpeg-bin", caps, "out.mp4").is_err());
    }
}

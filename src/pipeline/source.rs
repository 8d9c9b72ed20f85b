/// 视频采集源 (Video sources)
///
/// ffmpeg 子进程输出 rawvideo rgb24, 构建时预读第一帧 (preroll):
/// 设备打不开或格式不支持时直接返回构建错误, 不重试。
use crate::error::{PipelineError, Result};
use crate::frame::{PixelFormat, RawFrame, Size};
use crate::pipeline::bus::{BusEvent, BusSender};
use crate::pipeline::topology::{Caps, SourceSpec};
use crate::telemetry::spawn_thread;
use parking_lot::Mutex;
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// 从任意线程打断阻塞中的 next_frame
pub type Interrupter = Arc<dyn Fn() + Send + Sync>;

pub trait FrameSource: Send {
    fn caps(&self) -> Caps;

    /// 下一帧; None 表示流结束
    fn next_frame(&mut self) -> Result<Option<RawFrame>>;

    fn interrupter(&self) -> Interrupter;

    /// 释放设备
    fn release(&mut self) -> Result<()>;
}

/// 子进程放进自己的进程组, 终端的 Ctrl+C 只送到本进程;
/// ffmpeg 只在 release() 时被结束
pub(crate) fn own_process_group(cmd: &mut Command) -> &mut Command {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    cmd
}

/// 按规格打开采集源
pub fn open_source(
    spec: &SourceSpec,
    caps: Caps,
    ffmpeg_bin: &str,
    frame_limit: Option<u64>,
    bus: Option<BusSender>,
) -> Result<Box<dyn FrameSource>> {
    match spec {
        SourceSpec::TestPattern => Ok(Box::new(TestPatternSource::new(caps, frame_limit))),
        SourceSpec::Device(path) => {
            if !path.exists() {
                return Err(PipelineError::construction(format!(
                    "device {} not found",
                    path.display()
                )));
            }
            Ok(Box::new(FfmpegSource::open(spec, caps, ffmpeg_bin, bus)?))
        }
        SourceSpec::Stream(_) => Ok(Box::new(FfmpegSource::open(spec, caps, ffmpeg_bin, bus)?)),
    }
}

pub struct FfmpegSource {
    caps: Caps,
    child: Arc<Mutex<Child>>,
    stdout: ChildStdout,
    preroll: Option<RawFrame>,
    stderr_thread: Option<JoinHandle<()>>,
    last_error: Arc<Mutex<Option<String>>>,
    interrupted: Arc<AtomicBool>,
}

impl FfmpegSource {
    pub fn open(
        spec: &SourceSpec,
        caps: Caps,
        ffmpeg_bin: &str,
        bus: Option<BusSender>,
    ) -> Result<Self> {
        let mut cmd = Command::new(ffmpeg_bin);
        cmd.arg("-hide_banner").arg("-loglevel").arg("warning");
        match spec {
            SourceSpec::Device(path) => {
                cmd.arg("-f")
                    .arg("video4linux2")
                    .arg("-video_size")
                    .arg(format!("{}x{}", caps.size.width, caps.size.height))
                    .arg("-framerate")
                    .arg(caps.framerate.to_string())
                    .arg("-i")
                    .arg(path);
            }
            SourceSpec::Stream(url) => {
                cmd.arg("-i")
                    .arg(url)
                    .arg("-vf")
                    .arg(format!(
                        "scale={}:{},fps={}",
                        caps.size.width, caps.size.height, caps.framerate
                    ));
            }
            SourceSpec::TestPattern => {
                return Err(PipelineError::construction(
                    "test pattern does not need ffmpeg",
                ))
            }
        }
        cmd.arg("-an")
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        own_process_group(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| {
            PipelineError::construction(format!("failed to start {}: {}", ffmpeg_bin, e))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::construction("ffmpeg stdout unavailable"))?;
        let stderr = child.stderr.take();

        let last_error = Arc::new(Mutex::new(None));
        let stderr_thread = match stderr {
            Some(stderr) => {
                let last_error = last_error.clone();
                Some(spawn_thread("ffmpeg-stderr", move || {
                    for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        if let Some(bus) = bus.as_ref() {
                            let _ = bus.send(BusEvent::Warning {
                                message: format!("ffmpeg: {}", line),
                            });
                        } else {
                            tracing::warn!("ffmpeg: {}", line);
                        }
                        *last_error.lock() = Some(line);
                    }
                })?)
            }
            None => None,
        };

        let mut source = Self {
            caps,
            child: Arc::new(Mutex::new(child)),
            stdout,
            preroll: None,
            stderr_thread,
            last_error,
            interrupted: Arc::new(AtomicBool::new(false)),
        };

        // preroll: 第一帧读不到即视为设备或格式不可用
        match source.read_frame() {
            Ok(Some(frame)) => {
                tracing::info!(source = %spec, caps = %caps.size, "source prerolled");
                source.preroll = Some(frame);
                Ok(source)
            }
            Ok(None) => {
                let _ = source.release();
                let detail = source
                    .last_error
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "no frames produced".into());
                Err(PipelineError::construction(format!(
                    "cannot open {} at {} @ {}fps: {}",
                    spec, caps.size, caps.framerate, detail
                )))
            }
            Err(e) => {
                let _ = source.release();
                Err(PipelineError::construction(format!(
                    "cannot open {}: {}",
                    spec, e
                )))
            }
        }
    }

    fn read_frame(&mut self) -> Result<Option<RawFrame>> {
        let len = RawFrame::expected_len(self.caps.size, PixelFormat::Rgb24);
        let mut data = vec![0u8; len];
        match self.stdout.read_exact(&mut data) {
            Ok(()) => Ok(Some(RawFrame {
                data,
                size: self.caps.size,
                format: PixelFormat::Rgb24,
            })),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(PipelineError::Source(e.to_string())),
        }
    }
}

impl FrameSource for FfmpegSource {
    fn caps(&self) -> Caps {
        self.caps
    }

    fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        if let Some(frame) = self.preroll.take() {
            return Ok(Some(frame));
        }
        if self.interrupted.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let frame = self.read_frame()?;
        if frame.is_none() && !self.interrupted.load(Ordering::SeqCst) {
            // 子进程异常退出是错误, 正常退出是流结束
            let status = self.child.lock().wait()?;
            if !status.success() {
                let detail = self
                    .last_error
                    .lock()
                    .clone()
                    .unwrap_or_else(|| status.to_string());
                return Err(PipelineError::Source(detail));
            }
        }
        Ok(frame)
    }

    fn interrupter(&self) -> Interrupter {
        let child = self.child.clone();
        let interrupted = self.interrupted.clone();
        Arc::new(move || {
            interrupted.store(true, Ordering::SeqCst);
            let _ = child.lock().kill();
        })
    }

    fn release(&mut self) -> Result<()> {
        {
            let mut child = self.child.lock();
            if child.try_wait()?.is_none() {
                let _ = child.kill();
            }
            let status = child.wait()?;
            tracing::debug!(?status, "ffmpeg source exited");
        }
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

/// 合成彩条测试源, 按帧率节拍输出; 可设帧数上限产生 EOS
pub struct TestPatternSource {
    caps: Caps,
    frame_limit: Option<u64>,
    produced: u64,
    paced: bool,
    next_due: Option<Instant>,
    stopped: Arc<AtomicBool>,
}

impl TestPatternSource {
    pub fn new(caps: Caps, frame_limit: Option<u64>) -> Self {
        Self {
            caps,
            frame_limit,
            produced: 0,
            paced: true,
            next_due: None,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 不按帧率等待, 尽快输出 (测试用)
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    fn render(&self) -> RawFrame {
        const BARS: [[u8; 3]; 8] = [
            [255, 255, 255],
            [255, 255, 0],
            [0, 255, 255],
            [0, 255, 0],
            [255, 0, 255],
            [255, 0, 0],
            [0, 0, 255],
            [0, 0, 0],
        ];
        let Size { width, height } = self.caps.size;
        let shift = self.produced as u32 % width.max(1);
        let mut data = Vec::with_capacity(RawFrame::expected_len(self.caps.size, PixelFormat::Rgb24));
        for _ in 0..height {
            for x in 0..width {
                let bar = (((x + shift) % width) as usize * BARS.len()) / width as usize;
                data.extend_from_slice(&BARS[bar]);
            }
        }
        RawFrame {
            data,
            size: self.caps.size,
            format: PixelFormat::Rgb24,
        }
    }
}

impl FrameSource for TestPatternSource {
    fn caps(&self) -> Caps {
        self.caps
    }

    fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(None);
        }
        if let Some(limit) = self.frame_limit {
            if self.produced >= limit {
                return Ok(None);
            }
        }
        if self.paced && self.caps.framerate > 0 {
            let period = Duration::from_secs_f64(1.0 / self.caps.framerate as f64);
            let now = Instant::now();
            let due = self.next_due.unwrap_or(now);
            if due > now {
                std::thread::sleep(due - now);
            }
            self.next_due = Some(due.max(now) + period);
        }
        let frame = self.render();
        self.produced += 1;
        Ok(Some(frame))
    }

    fn interrupter(&self) -> Interrupter {
        let stopped = self.stopped.clone();
        Arc::new(move || stopped.store(true, Ordering::SeqCst))
    }

    fn release(&mut self) -> Result<()> {
        tracing::debug!(frames = self.produced, "test pattern released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> Caps {
        Caps {
            size: Size::new(16, 8),
            framerate: 30,
        }
    }

    #[test]
    fn test_pattern_frame_limit_gives_eos() {
        let mut source = TestPatternSource::new(caps(), Some(3)).unpaced();
        for _ in 0..3 {
            let frame = source.next_frame().unwrap().unwrap();
            assert_eq!(frame.data.len(), 16 * 8 * 3);
        }
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_pattern_interrupt_stops() {
        let mut source = TestPatternSource::new(caps(), None).unpaced();
        assert!(source.next_frame().unwrap().is_some());
        (source.interrupter())();
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_missing_device_is_construction_error() {
        let spec = SourceSpec::Device("/dev/video-does-not-exist-42".into());
        let err = open_source(&spec, caps(), "ffmpeg", None, None).err().unwrap();
        assert!(matches!(err, PipelineError::Construction(_)));
    }

    #[test]
    fn test_missing_ffmpeg_is_construction_error() {
        let spec = SourceSpec::Stream("rtsp://127.0.0.1:1/none".into());
        let err = open_source(&spec, caps(), "/nonexistent/ffmpeg-bin", None, None)
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::Construction(_)));
    }

    /// 写一个假的 ffmpeg: 记录 "pid pgrp", 输出一帧后挂起
    #[cfg(target_os = "linux")]
    fn fake_ffmpeg(dir: &std::path::Path) -> (std::path::PathBuf, std::path::PathBuf) {
        use std::os::unix::fs::PermissionsExt;
        let ids = dir.join("ids.txt");
        let bin = dir.join("ffmpeg-fake");
        let script = format!(
            "#!/bin/sh\necho \"$$ $(cut -d' ' -f5 /proc/$$/stat)\" > {}\nhead -c {} /dev/zero\nexec sleep 5\n",
            ids.display(),
            16 * 8 * 3
        );
        std::fs::write(&bin, script).unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        (bin, ids)
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_ffmpeg_runs_in_own_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let (bin, ids) = fake_ffmpeg(dir.path());
        let spec = SourceSpec::Stream("udp://127.0.0.1:1".into());
        // 其他测试线程 fork 时可能短暂持有脚本的写句柄 (ETXTBSY)
        let mut opened = None;
        for _ in 0..20 {
            match FfmpegSource::open(&spec, caps(), bin.to_str().unwrap(), None) {
                Ok(source) => {
                    opened = Some(source);
                    break;
                }
                Err(_) => std::thread::sleep(Duration::from_millis(50)),
            }
        }
        let mut source = opened.unwrap();
        assert_eq!(source.next_frame().unwrap().unwrap().data.len(), 16 * 8 * 3);

        let text = std::fs::read_to_string(&ids).unwrap();
        let mut fields = text.split_whitespace();
        let pid = fields.next().unwrap().to_string();
        let pgrp = fields.next().unwrap().to_string();
        // 子进程是自己进程组的组长, 终端信号不会直接送到它
        assert_eq!(pid, pgrp);

        let started = Instant::now();
        source.release().unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}

/// 错误与停止原因 (Errors and stop reasons)
///
/// 构建期错误直接终止启动; 运行期总线错误触发 Stopping;
/// 单帧推理错误只记录日志, 工作线程继续运行。
use std::fmt;

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// 设备无法打开或格式不受支持 (不自动重试)
    #[error("pipeline construction failed: {0}")]
    Construction(String),

    /// 运行期总线上报的致命错误
    #[error("pipeline error: {message}")]
    Bus { message: String },

    #[error("source error: {0}")]
    Source(String),

    #[error("sink error: {0}")]
    Sink(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn construction(msg: impl Into<String>) -> Self {
        Self::Construction(msg.into())
    }
}

/// 单帧推理失败, 由 InferenceWorker 捕获后按 "无叠加" 处理
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("inference callback failed: {0:#}")]
    Callback(#[from] anyhow::Error),

    #[error("inference callback panicked: {0}")]
    Panicked(String),

    #[error("inference engine error: {0}")]
    Engine(String),
}

impl InferenceError {
    /// 把 panic 负载转成可读文本
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panicked(msg)
    }
}

/// 流水线停止原因, 不是错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndOfStream,
    Fatal(String),
    Interrupted,
}

impl StopReason {
    /// 进程退出码: EOS → 0, 致命错误 → 1, 中断 → 130
    pub fn exit_code(&self) -> i32 {
        match self {
            StopReason::EndOfStream => 0,
            StopReason::Fatal(_) => 1,
            StopReason::Interrupted => 130,
        }
    }

    /// 致命停止对应的总线错误, 其余停止原因不是错误
    pub fn to_error(&self) -> Option<PipelineError> {
        match self {
            StopReason::Fatal(message) => Some(PipelineError::Bus {
                message: message.clone(),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::EndOfStream => write!(f, "end of stream"),
            StopReason::Fatal(msg) => write!(f, "fatal: {}", msg),
            StopReason::Interrupted => write!(f, "interrupted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(StopReason::EndOfStream.exit_code(), 0);
        assert_eq!(StopReason::Fatal("boom".into()).exit_code(), 1);
        assert_eq!(StopReason::Interrupted.exit_code(), 130);
    }

    #[test]
    fn test_fatal_maps_to_bus_error() {
        let err = StopReason::Fatal("device unplugged".into()).to_error().unwrap();
        assert!(matches!(&err, PipelineError::Bus { message } if message == "device unplugged"));
        assert_eq!(err.to_string(), "pipeline error: device unplugged");
        assert!(StopReason::EndOfStream.to_error().is_none());
        assert!(StopReason::Interrupted.to_error().is_none());
    }

    #[test]
    fn test_panic_payload_text() {
        let err = std::panic::catch_unwind(|| panic!("bad tensor")).unwrap_err();
        let err = InferenceError::from_panic(err);
        assert_eq!(err.to_string(), "inference callback panicked: bad tensor");
    }
}

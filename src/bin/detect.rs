// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 实时目标检测叠加
///
/// cargo run --release --bin detect -- --model yolov8n.onnx --labels coco.txt --headless false --output out.mp4
use anyhow::Result;
use clap::Parser;
use classibin::client::{input_size, install_interrupt, run_client};
use classibin::detect::{BoxStyle, DetectHandler, DEFAULT_THRESHOLD};
use classibin::inference::onnx::OnnxDetector;
use classibin::inference::{InferenceEngine, LabelMap};
use classibin::pipeline::StopSignal;
use classibin::telemetry::init_logging;
use classibin::{Args, PipelineConfig, StatusLine};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const INPUT_SIZE: u32 = 640;

fn run(args: Args) -> Result<i32> {
    let config = PipelineConfig::resolve(&args)?;
    config.log_summary();

    let labels = match args.labels.as_ref() {
        Some(path) => LabelMap::from_file(path)?,
        None => LabelMap::default(),
    };
    let target = input_size(&config, INPUT_SIZE);
    let mut detector = OnnxDetector::new(&args.model, target)?;
    detector.allocate()?;

    let style = BoxStyle {
        stroke: config.box_stroke.clone(),
        stroke_width: config.box_stroke_width,
        font_size: config.font_size,
    };
    let handler = DetectHandler::new(
        detector,
        labels,
        args.top_k,
        args.threshold.unwrap_or(DEFAULT_THRESHOLD),
        style,
        StatusLine::stdout(),
    );

    let signal = StopSignal::new();
    install_interrupt(&signal)?;
    let reason = run_client(&args, &config, target, signal, handler)?;
    Ok(reason.exit_code())
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);
    let code = match run(args) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            1
        }
    };
    std::process::exit(code);
}

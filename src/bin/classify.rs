// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 实时分类 + 分拣
///
/// cargo run --release --bin classify -- --model recycle.onnx --labels recycle.txt --actuate
use anyhow::Result;
use clap::Parser;
use classibin::actuator::{Actuator, NullActuator, SortingActuator};
use classibin::classify::{ClassifyHandler, DEFAULT_THRESHOLD};
use classibin::client::{input_size, install_interrupt, run_client};
use classibin::inference::onnx::OnnxClassifier;
use classibin::inference::{InferenceEngine, LabelMap};
use classibin::pipeline::StopSignal;
use classibin::telemetry::init_logging;
use classibin::{Args, PipelineConfig, StatusLine};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const INPUT_SIZE: u32 = 224;

fn run(args: Args) -> Result<i32> {
    let config = PipelineConfig::resolve(&args)?;
    config.log_summary();

    let labels = match args.labels.as_ref() {
        Some(path) => LabelMap::from_file(path)?,
        None => LabelMap::default(),
    };
    let target = input_size(&config, INPUT_SIZE);
    let mut engine = OnnxClassifier::new(&args.model, target)?;
    engine.allocate()?;

    let actuator: Box<dyn Actuator> = if args.actuate {
        Box::new(SortingActuator::logging())
    } else {
        Box::new(NullActuator)
    };
    let handler = ClassifyHandler::new(
        engine,
        labels,
        args.top_k,
        args.threshold.unwrap_or(DEFAULT_THRESHOLD),
        StatusLine::stdout(),
        actuator,
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

mod annotate;
mod labels;
mod media;
mod reco;
mod source;
mod viewer;

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use opencv as cv;

use labels::{load_labels, LabelTable};
use media::OpenCvSink;
use reco::{Detector, SsdDetector};
use source::{CameraSource, FrameSource, HttpSource, SourceSpec};
use viewer::{Viewer, ViewerConfig};

/// Live camera viewer with object detection, snapshots and recording.
///
/// Keys: q/ESC quit, c capture, C capture annotated, r record,
/// R record annotated, s stop recording.
#[derive(Parser, Debug)]
#[command(name = "reco-cam", version)]
struct Args {
    /// File path of the .tflite model.
    #[arg(long, default_value = "./models/detect.tflite")]
    model: String,
    /// File path of the labels file.
    #[arg(long, default_value = "./models/coco_labels.txt")]
    labels: PathBuf,
    /// Score threshold for detected objects.
    #[arg(long, default_value_t = 0.55)]
    threshold: f32,
    /// Camera index or http(s) snapshot URL.
    #[arg(long, default_value = "0")]
    source: SourceSpec,
    /// Requested camera frame width.
    #[arg(long, default_value_t = 1280)]
    width: i32,
    /// Requested camera frame height.
    #[arg(long, default_value_t = 720)]
    height: i32,
    /// Model input width.
    #[arg(long, default_value_t = 300)]
    input_width: i32,
    /// Model input height.
    #[arg(long, default_value_t = 300)]
    input_height: i32,
    /// Subtracted from class ids when the model output counts the
    /// background class as 0.
    #[arg(long, default_value_t = 0)]
    class_offset: i32,
    /// Recording frame rate [default: 20, or 30 with --no-detect].
    #[arg(long)]
    fps: Option<f64>,
    /// Show the plain camera stream without running the model.
    #[arg(long)]
    no_detect: bool,
    /// Directory for snapshots and recordings.
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if !(0.0..=1.0).contains(&args.threshold) {
        bail!("threshold must be within [0, 1], got {}", args.threshold);
    }
    if !args.output_dir.is_dir() {
        bail!("output directory {} does not exist", args.output_dir.display());
    }

    let (detector, labels): (Option<Box<dyn Detector>>, LabelTable) = if args.no_detect {
        (None, LabelTable::default())
    } else {
        let labels = load_labels(&args.labels)?;
        if labels.is_empty() {
            log::warn!("labels file {} has no entries", args.labels.display());
        } else {
            log::info!("loaded {} labels from {}", labels.len(), args.labels.display());
        }
        let input_size = cv::core::Size::new(args.input_width, args.input_height);
        let detector: Box<dyn Detector> = Box::new(SsdDetector::new(
            &args.model,
            input_size,
            args.class_offset,
        )?);
        (Some(detector), labels)
    };

    let fps = args.fps.unwrap_or(if args.no_detect { 30. } else { 20. });
    let source: Box<dyn FrameSource> = match &args.source {
        SourceSpec::Camera(index) => Box::new(CameraSource::open(
            *index,
            cv::core::Size::new(args.width, args.height),
            30.,
        )?),
        SourceSpec::Http(url) => Box::new(HttpSource::new(url)?),
    };

    let mut viewer = Viewer::new(
        source,
        detector,
        labels,
        Box::new(OpenCvSink),
        ViewerConfig {
            threshold: args.threshold,
            fps,
            output_dir: args.output_dir,
        },
    );
    viewer.run().context("viewer stopped")
}

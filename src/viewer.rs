//! The capture/record loop.
//!
//! Each iteration reads a frame, optionally runs detection and annotates a
//! copy, shows it, then reacts to at most one keypress. Recording state lives
//! in [`LoopState`] so the key handling can be driven without a camera or a
//! window.

use std::{
    ops::ControlFlow,
    path::{Path, PathBuf},
    time::Instant,
};

use opencv::{self as cv, prelude::*};

use crate::annotate::{annotate_objects, draw_fps};
use crate::labels::LabelTable;
use crate::media::{MediaSink, VideoSink};
use crate::reco::Detector;
use crate::source::FrameSource;

const WINDOW: &str = "reco-cam";
const KEY_ESC: u8 = 27;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Quit,
    CaptureOriginal,
    CaptureAnnotated,
    RecordOriginal,
    RecordAnnotated,
    StopRecord,
    None,
}

impl Command {
    /// Maps a `wait_key` code; only the low byte is significant.
    pub fn from_key(key: i32) -> Self {
        if key < 0 {
            return Command::None;
        }
        match (key & 0xff) as u8 {
            b'q' | KEY_ESC => Command::Quit,
            b'c' => Command::CaptureOriginal,
            b'C' => Command::CaptureAnnotated,
            b'r' => Command::RecordOriginal,
            b'R' => Command::RecordAnnotated,
            b's' => Command::StopRecord,
            _ => Command::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordMode {
    #[default]
    Idle,
    RecordingOriginal,
    RecordingAnnotated,
}

/// Frames produced by one iteration. `annotated` is `None` when detection
/// is off.
pub struct Frames<'a> {
    pub original: &'a cv::core::Mat,
    pub annotated: Option<&'a cv::core::Mat>,
}

/// Record mode plus the single writer slot.
pub struct LoopState {
    mode: RecordMode,
    writer: Option<Box<dyn VideoSink>>,
    output_dir: PathBuf,
    fps: f64,
}

impl LoopState {
    pub fn new(output_dir: impl Into<PathBuf>, fps: f64) -> Self {
        LoopState {
            mode: RecordMode::Idle,
            writer: None,
            output_dir: output_dir.into(),
            fps,
        }
    }

    pub fn mode(&self) -> RecordMode {
        self.mode
    }

    /// Applies one command. `stem` names any file created.
    pub fn handle(
        &mut self,
        command: Command,
        frames: &Frames,
        stem: &str,
        sink: &mut dyn MediaSink,
    ) -> anyhow::Result<ControlFlow<()>> {
        match command {
            Command::Quit => {
                log::info!("quit");
                self.close()?;
                return Ok(ControlFlow::Break(()));
            }
            Command::CaptureOriginal => {
                let path = unique_path(&self.output_dir, stem, "png");
                sink.save_image(&path, frames.original)?;
                log::info!("capture (original) -> {}", path.display());
            }
            Command::CaptureAnnotated => match frames.annotated {
                Some(frame) => {
                    let path = unique_path(&self.output_dir, stem, "png");
                    sink.save_image(&path, frame)?;
                    log::info!("capture (detection) -> {}", path.display());
                }
                None => log::debug!("detection is off, ignoring annotated capture"),
            },
            Command::RecordOriginal => {
                self.start(RecordMode::RecordingOriginal, frames.original, stem, sink)?;
            }
            Command::RecordAnnotated => match frames.annotated {
                Some(frame) => self.start(RecordMode::RecordingAnnotated, frame, stem, sink)?,
                None => log::debug!("detection is off, ignoring annotated record"),
            },
            Command::StopRecord => {
                if self.mode != RecordMode::Idle {
                    log::info!("stop record");
                }
                self.close()?;
            }
            Command::None => {}
        }
        Ok(ControlFlow::Continue(()))
    }

    /// One iteration's key handling: apply `command`, then append this
    /// iteration's frame unless the command ended the loop.
    pub fn apply(
        &mut self,
        command: Command,
        frames: &Frames,
        stem: &str,
        sink: &mut dyn MediaSink,
    ) -> anyhow::Result<ControlFlow<()>> {
        if self.handle(command, frames, stem, sink)?.is_break() {
            return Ok(ControlFlow::Break(()));
        }
        self.record(frames)?;
        Ok(ControlFlow::Continue(()))
    }

    /// Appends the frame matching the current mode to the open writer.
    pub fn record(&mut self, frames: &Frames) -> anyhow::Result<()> {
        let frame = match self.mode {
            RecordMode::Idle => return Ok(()),
            RecordMode::RecordingOriginal => frames.original,
            RecordMode::RecordingAnnotated => match frames.annotated {
                Some(frame) => frame,
                None => return Ok(()),
            },
        };
        if let Some(writer) = self.writer.as_mut() {
            writer.write(frame)?;
        }
        Ok(())
    }

    /// Flushes and drops the writer, returning to idle.
    pub fn close(&mut self) -> anyhow::Result<()> {
        self.mode = RecordMode::Idle;
        match self.writer.take() {
            Some(mut writer) => writer.finish(),
            None => Ok(()),
        }
    }

    fn start(
        &mut self,
        mode: RecordMode,
        frame: &cv::core::Mat,
        stem: &str,
        sink: &mut dyn MediaSink,
    ) -> anyhow::Result<()> {
        // one writer at a time
        self.close()?;
        let path = unique_path(&self.output_dir, stem, "avi");
        let writer = sink.open_video(&path, self.fps, frame.size()?)?;
        self.writer = Some(writer);
        self.mode = mode;
        match mode {
            RecordMode::RecordingAnnotated => {
                log::info!("start record (detection) -> {}", path.display())
            }
            _ => log::info!("start record (original) -> {}", path.display()),
        }
        Ok(())
    }
}

/// `<DD_HH-MM-SS>` name for snapshots and recordings.
pub fn timestamp_stem(now: &chrono::NaiveDateTime) -> String {
    now.format("%d_%H-%M-%S").to_string()
}

/// `dir/stem.ext`, or `dir/stem-N.ext` for the first free N.
pub fn unique_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let path = dir.join(format!("{}.{}", stem, ext));
    if !path.exists() {
        return path;
    }
    let mut n = 1;
    loop {
        let path = dir.join(format!("{}-{}.{}", stem, n, ext));
        if !path.exists() {
            return path;
        }
        n += 1;
    }
}

pub struct ViewerConfig {
    pub threshold: f32,
    pub fps: f64,
    pub output_dir: PathBuf,
}

pub struct Viewer {
    source: Box<dyn FrameSource>,
    detector: Option<Box<dyn Detector>>,
    labels: LabelTable,
    sink: Box<dyn MediaSink>,
    state: LoopState,
    threshold: f32,
}

impl Viewer {
    pub fn new(
        source: Box<dyn FrameSource>,
        detector: Option<Box<dyn Detector>>,
        labels: LabelTable,
        sink: Box<dyn MediaSink>,
        config: ViewerConfig,
    ) -> Self {
        Viewer {
            source,
            detector,
            labels,
            sink,
            state: LoopState::new(config.output_dir, config.fps),
            threshold: config.threshold,
        }
    }

    /// Runs until a quit key or an error. The writer and the source are
    /// released either way.
    pub fn run(&mut self) -> anyhow::Result<()> {
        cv::highgui::named_window(WINDOW, cv::highgui::WINDOW_AUTOSIZE)?;

        let result = loop {
            match self.step() {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        if self.state.mode() != RecordMode::Idle {
            log::info!("closing open recording");
        }
        let closed = self.state.close();
        let released = self.source.release();
        let destroyed = cv::highgui::destroy_all_windows();
        result?;
        closed?;
        released?;
        destroyed?;
        Ok(())
    }

    fn step(&mut self) -> anyhow::Result<ControlFlow<()>> {
        let mut image = cv::core::Mat::default();
        self.source.read(&mut image)?;

        let annotated = match &self.detector {
            Some(detector) => Some(detect_and_annotate(
                detector.as_ref(),
                &self.labels,
                self.threshold,
                &image,
            )?),
            None => None,
        };

        cv::highgui::imshow(WINDOW, annotated.as_ref().unwrap_or(&image))?;
        let key = cv::highgui::wait_key(1)?;

        let stem = timestamp_stem(&chrono::Local::now().naive_local());
        let frames = Frames {
            original: &image,
            annotated: annotated.as_ref(),
        };
        self.state
            .apply(Command::from_key(key), &frames, &stem, self.sink.as_mut())
    }
}

/// Resizes `image` to the model input, runs detection and returns an
/// annotated copy with the FPS overlay. `image` is left untouched.
pub fn detect_and_annotate(
    detector: &dyn Detector,
    labels: &LabelTable,
    threshold: f32,
    image: &cv::core::Mat,
) -> anyhow::Result<cv::core::Mat> {
    let mut frame = image.try_clone()?;
    let mut resized = cv::core::Mat::default();
    cv::imgproc::resize(
        image,
        &mut resized,
        detector.input_size(),
        0.,
        0.,
        cv::imgproc::INTER_LINEAR,
    )?;

    let start = Instant::now();
    let detections = detector.detect_objects(&resized, threshold)?;
    annotate_objects(&mut frame, &detections, labels)?;
    let elapsed = start.elapsed().as_secs_f64();
    log::debug!("{} detections in {:.1} ms", detections.len(), elapsed * 1000.);

    if elapsed > 0. {
        draw_fps(&mut frame, 1. / elapsed)?;
    }
    Ok(frame)
}

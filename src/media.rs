use std::path::Path;

use anyhow::{bail, Context};
use opencv::{self as cv, prelude::*};

/// Open video file that frames are appended to.
pub trait VideoSink {
    fn write(&mut self, frame: &cv::core::Mat) -> anyhow::Result<()>;

    /// Flushes and closes the file.
    fn finish(&mut self) -> anyhow::Result<()>;
}

/// Writes snapshots and opens recordings.
pub trait MediaSink {
    fn save_image(&mut self, path: &Path, frame: &cv::core::Mat) -> anyhow::Result<()>;

    fn open_video(
        &mut self,
        path: &Path,
        fps: f64,
        frame_size: cv::core::Size,
    ) -> anyhow::Result<Box<dyn VideoSink>>;
}

/// PNG snapshots and XVID `.avi` recordings through OpenCV.
#[derive(Debug, Default)]
pub struct OpenCvSink;

impl MediaSink for OpenCvSink {
    fn save_image(&mut self, path: &Path, frame: &cv::core::Mat) -> anyhow::Result<()> {
        let file = path_str(path)?;
        if !cv::imgcodecs::imwrite(file, frame, &cv::core::Vector::<i32>::new())? {
            bail!("failed to write image {}", file);
        }
        Ok(())
    }

    fn open_video(
        &mut self,
        path: &Path,
        fps: f64,
        frame_size: cv::core::Size,
    ) -> anyhow::Result<Box<dyn VideoSink>> {
        let file = path_str(path)?;
        let fourcc = cv::videoio::VideoWriter::fourcc('X', 'V', 'I', 'D')?;
        let writer = cv::videoio::VideoWriter::new(file, fourcc, fps, frame_size, true)
            .with_context(|| format!("failed to create video writer {}", file))?;
        if !writer.is_opened()? {
            bail!("video writer for {} did not open", file);
        }
        Ok(Box::new(OpenCvVideo { writer }))
    }
}

struct OpenCvVideo {
    writer: cv::videoio::VideoWriter,
}

impl VideoSink for OpenCvVideo {
    fn write(&mut self, frame: &cv::core::Mat) -> anyhow::Result<()> {
        self.writer.write(frame)?;
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.writer.release()?;
        Ok(())
    }
}

fn path_str(path: &Path) -> anyhow::Result<&str> {
    path.to_str()
        .with_context(|| format!("path {} is not valid UTF-8", path.display()))
}

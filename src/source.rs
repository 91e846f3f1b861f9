use anyhow::{bail, Context};
use opencv::{self as cv, prelude::*};

/// Where frames come from.
pub trait FrameSource {
    /// Reads the next frame into `frame`. An empty frame is an error.
    fn read(&mut self, frame: &mut cv::core::Mat) -> anyhow::Result<()>;

    fn release(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Local USB/V4L camera.
pub struct CameraSource {
    capture: cv::videoio::VideoCapture,
}

impl CameraSource {
    pub fn open(index: i32, frame_size: cv::core::Size, fps: f64) -> anyhow::Result<Self> {
        let mut capture = cv::videoio::VideoCapture::new(index, cv::videoio::CAP_ANY)
            .with_context(|| format!("failed to open camera {}", index))?;
        if !capture.is_opened()? {
            bail!("no camera at index {}", index);
        }

        capture.set(cv::videoio::CAP_PROP_FRAME_WIDTH, frame_size.width as f64)?;
        capture.set(cv::videoio::CAP_PROP_FRAME_HEIGHT, frame_size.height as f64)?;
        capture.set(cv::videoio::CAP_PROP_FPS, fps)?;

        let width = capture.get(cv::videoio::CAP_PROP_FRAME_WIDTH)? as i32;
        let height = capture.get(cv::videoio::CAP_PROP_FRAME_HEIGHT)? as i32;
        if width != frame_size.width || height != frame_size.height {
            log::warn!(
                "camera {} runs at {}x{} instead of the requested {}x{}",
                index,
                width,
                height,
                frame_size.width,
                frame_size.height
            );
        } else {
            log::info!("camera {} opened at {}x{}", index, width, height);
        }

        Ok(CameraSource { capture })
    }
}

impl FrameSource for CameraSource {
    fn read(&mut self, frame: &mut cv::core::Mat) -> anyhow::Result<()> {
        if !self.capture.read(frame)? || frame.empty() {
            bail!("camera returned no frame");
        }
        Ok(())
    }

    fn release(&mut self) -> anyhow::Result<()> {
        self.capture.release()?;
        Ok(())
    }
}

/// Camera that serves a JPEG snapshot per GET, e.g. an ESP32-CAM.
pub struct HttpSource {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpSource {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder().build()?;
        log::info!("reading frames from {}", url);
        Ok(HttpSource {
            client,
            url: url.to_string(),
        })
    }

    fn get_image_as_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let resp = self.client.get(&self.url).send()?.error_for_status()?;
        Ok(resp.bytes()?.into())
    }
}

impl FrameSource for HttpSource {
    fn read(&mut self, frame: &mut cv::core::Mat) -> anyhow::Result<()> {
        let image_stream: cv::core::Vector<u8> = self
            .get_image_as_bytes()
            .with_context(|| format!("failed to fetch frame from {}", self.url))?
            .into();
        *frame = cv::imgcodecs::imdecode(&image_stream, cv::imgcodecs::IMREAD_COLOR)?;
        if frame.empty() {
            bail!("{} did not return a decodable image", self.url);
        }
        Ok(())
    }
}

/// Camera index or HTTP snapshot URL, as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    Camera(i32),
    Http(String),
}

impl std::str::FromStr for SourceSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with("http://") || s.starts_with("https://") {
            return Ok(SourceSpec::Http(s.to_string()));
        }
        s.parse::<i32>()
            .map(SourceSpec::Camera)
            .map_err(|_| format!("expected a camera index or http(s) url, got {:?}", s))
    }
}

//! USB camera capture through V4L2.
//!
//! The device is asked for RGB24 first, then YUYV, then MJPEG; whatever it
//! accepts is converted to an RGB [`Frame`] per capture. A failed read closes
//! the stream and the next call reopens the device once the backoff expires,
//! so the loop only ever sees a skipped frame.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;
use std::time::{Duration, Instant};

use super::SourceStats;
use crate::config::CameraSettings;
use crate::frame::Frame;

const STREAM_BUFFERS: u32 = 4;
const REOPEN_BACKOFF: Duration = Duration::from_secs(2);
const MIN_STALL: Duration = Duration::from_secs(2);

/// Pixel layouts this source can turn into RGB frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelLayout {
    Rgb24,
    Yuyv,
    Mjpeg,
}

impl PixelLayout {
    /// Negotiation order: cheapest conversion first.
    pub const PREFERENCE: [PixelLayout; 3] = [Self::Rgb24, Self::Yuyv, Self::Mjpeg];

    pub fn fourcc(self) -> [u8; 4] {
        match self {
            Self::Rgb24 => *b"RGB3",
            Self::Yuyv => *b"YUYV",
            Self::Mjpeg => *b"MJPG",
        }
    }

    pub fn from_fourcc(code: [u8; 4]) -> Option<Self> {
        Self::PREFERENCE.into_iter().find(|l| l.fourcc() == code)
    }

    /// Convert one captured buffer into an RGB frame.
    pub fn to_frame(self, buf: &[u8], width: u32, height: u32) -> Result<Frame> {
        let pixels = (width as usize) * (height as usize);
        match self {
            Self::Rgb24 => {
                let data = buf
                    .get(..pixels * 3)
                    .ok_or_else(|| short_buffer(buf.len(), pixels * 3))?;
                Frame::from_rgb(data.to_vec(), width, height)
            }
            Self::Yuyv => {
                let data = buf
                    .get(..pixels * 2)
                    .ok_or_else(|| short_buffer(buf.len(), pixels * 2))?;
                Frame::from_rgb(yuyv_to_rgb(data), width, height)
            }
            Self::Mjpeg => Frame::decode(buf).context("decode MJPEG capture"),
        }
    }
}

fn short_buffer(got: usize, want: usize) -> anyhow::Error {
    anyhow!("short capture buffer: {} bytes, expected {}", got, want)
}

/// BT.601 limited-range YUYV (4:2:2) to packed RGB24.
pub fn yuyv_to_rgb(yuyv: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(yuyv.len() / 2 * 3);
    for quad in yuyv.chunks_exact(4) {
        let (u, v) = (quad[1] as i32 - 128, quad[3] as i32 - 128);
        for y in [quad[0], quad[2]] {
            let c = 298 * (y as i32 - 16);
            rgb.push(clamp_channel((c + 409 * v + 128) >> 8));
            rgb.push(clamp_channel((c - 100 * u - 208 * v + 128) >> 8));
            rgb.push(clamp_channel((c + 516 * u + 128) >> 8));
        }
    }
    rgb
}

fn clamp_channel(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

#[self_referencing]
struct OpenStream {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

/// Negotiated capture parameters of an open device.
#[derive(Clone, Copy, Debug)]
struct Negotiated {
    layout: PixelLayout,
    width: u32,
    height: u32,
}

pub struct V4l2Source {
    settings: CameraSettings,
    stream: Option<OpenStream>,
    negotiated: Option<Negotiated>,
    captured: u64,
    last_capture: Option<Instant>,
    reopen_at: Option<Instant>,
}

impl V4l2Source {
    pub fn new(settings: CameraSettings) -> Self {
        Self {
            settings,
            stream: None,
            negotiated: None,
            captured: 0,
            last_capture: None,
            reopen_at: None,
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        let (stream, negotiated) = self.open()?;
        log::info!(
            "camera: {} streaming {:?} {}x{}",
            self.settings.url,
            negotiated.layout,
            negotiated.width,
            negotiated.height
        );
        self.stream = Some(stream);
        self.negotiated = Some(negotiated);
        self.reopen_at = None;
        Ok(())
    }

    fn open(&self) -> Result<(OpenStream, Negotiated)> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let url = &self.settings.url;
        let mut device =
            v4l::Device::with_path(url).with_context(|| format!("open camera {}", url))?;
        let negotiated = negotiate(&mut device, &self.settings)?;

        if self.settings.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.settings.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("camera: {} ignored fps request: {}", url, err);
            }
        }

        let stream = OpenStreamTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, STREAM_BUFFERS)
                    .context("map capture buffers")
            },
        }
        .try_build()?;
        Ok((stream, negotiated))
    }

    pub fn next_frame(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        if self.stream.is_none() {
            self.reopen()?;
        }
        let (Some(stream), Some(negotiated)) = (self.stream.as_mut(), self.negotiated) else {
            return Err(anyhow!("camera {} is not open", self.settings.url));
        };

        let captured = stream.with_mut(|fields| {
            let (buf, _meta) = fields.stream.next()?;
            Ok::<_, std::io::Error>(
                negotiated
                    .layout
                    .to_frame(buf, negotiated.width, negotiated.height),
            )
        });
        match captured {
            Ok(Ok(frame)) => {
                self.captured += 1;
                self.last_capture = Some(Instant::now());
                Ok(frame)
            }
            // A bad buffer is one lost frame; the stream itself is fine.
            Ok(Err(err)) => Err(err),
            Err(err) => {
                log::warn!("camera: {} read failed, closing stream: {}", self.settings.url, err);
                self.stream = None;
                self.reopen_at = Some(Instant::now() + REOPEN_BACKOFF);
                Err(anyhow::Error::new(err).context("camera read"))
            }
        }
    }

    fn reopen(&mut self) -> Result<()> {
        if let Some(at) = self.reopen_at {
            if Instant::now() < at {
                return Err(anyhow!("camera {} reopen pending", self.settings.url));
            }
        }
        self.connect().map_err(|err| {
            self.reopen_at = Some(Instant::now() + REOPEN_BACKOFF);
            err
        })
    }

    /// Open, and delivering frames within a few frame periods.
    pub fn is_healthy(&self) -> bool {
        if self.stream.is_none() {
            return false;
        }
        self.last_capture
            .map(|at| at.elapsed() <= self.stall_limit())
            .unwrap_or(true)
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.captured,
            url: self.settings.url.clone(),
        }
    }

    fn stall_limit(&self) -> Duration {
        match self.settings.target_fps {
            0 => MIN_STALL,
            fps => (Duration::from_secs(5) / fps).max(MIN_STALL),
        }
    }
}

/// Ask for each supported layout in turn and keep the first the driver
/// actually applies.
fn negotiate(device: &mut v4l::Device, settings: &CameraSettings) -> Result<Negotiated> {
    use v4l::video::Capture;

    let mut requested = device.format().context("read camera format")?;
    requested.width = settings.width;
    requested.height = settings.height;
    for layout in PixelLayout::PREFERENCE {
        requested.fourcc = v4l::FourCC::new(&layout.fourcc());
        match device.set_format(&requested) {
            Ok(applied) if PixelLayout::from_fourcc(applied.fourcc.repr) == Some(layout) => {
                return Ok(Negotiated {
                    layout,
                    width: applied.width,
                    height: applied.height,
                });
            }
            Ok(applied) => log::debug!("camera: asked for {:?}, got {}", layout, applied.fourcc),
            Err(err) => log::debug!("camera: {:?} rejected: {}", layout, err),
        }
    }
    Err(anyhow!(
        "camera {} offers none of RGB3, YUYV or MJPG",
        settings.url
    ))
}

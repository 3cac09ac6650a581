//! V4L2 camera backend. Each connection gets its own capture thread that owns
//! the device, since mmap streams cannot move between threads.

use std::collections::HashMap;
use std::sync::mpsc as std_mpsc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::{DynamicImage, ImageBuffer, Rgb};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use crate::device::DeviceConfig;
use crate::driver::{ConnectionHandle, DeviceDriver};
use crate::error::DriverError;
use crate::frame::{Frame, Payload};

struct Camera {
    stream: Stream<'static>,
    width: u32,
    height: u32,
    fourcc: FourCC,
}

impl Camera {
    fn open(path: &str) -> Result<Self> {
        let dev = Device::with_path(path).context("open camera")?;
        let mut fmt = dev.format().context("get format")?;
        // Prefer RGB, fallback to YUYV, else accept existing format
        let desired = Format::new(fmt.width, fmt.height, FourCC::new(b"RGB3"));
        fmt = dev.set_format(&desired).unwrap_or(fmt);
        if fmt.fourcc != FourCC::new(b"RGB3") {
            let yuyv = Format::new(fmt.width, fmt.height, FourCC::new(b"YUYV"));
            fmt = dev.set_format(&yuyv).unwrap_or(fmt);
        }
        let stream = Stream::with_buffers(&dev, Type::VideoCapture, 4).context("stream")?;
        Ok(Self {
            stream,
            width: fmt.width,
            height: fmt.height,
            fourcc: fmt.fourcc,
        })
    }

    fn frame(&mut self) -> Result<ImageBuffer<Rgb<u8>, Vec<u8>>> {
        let (data, meta) = self.stream.next().context("capture frame")?;
        log::trace!(
            "v4l frame {}x{} fourcc={:?} seq={} len={}",
            self.width,
            self.height,
            self.fourcc,
            meta.sequence,
            data.len()
        );
        let buf = match self.fourcc {
            f if f == FourCC::new(b"RGB3") => data.to_vec(),
            f if f == FourCC::new(b"YUYV") => yuyv_to_rgb(self.width, self.height, data)?,
            f if f == FourCC::new(b"GREY") => grey_to_rgb(self.width, self.height, data)?,
            other => anyhow::bail!("unsupported pixel format {:?}", other),
        };
        let expected = (self.width * self.height * 3) as usize;
        if buf.len() < expected {
            anyhow::bail!("buffer too small: got {}, expected {}", buf.len(), expected);
        }
        ImageBuffer::from_raw(self.width, self.height, buf)
            .ok_or_else(|| anyhow::anyhow!("failed to build image buffer"))
    }
}

fn yuyv_to_rgb(width: u32, height: u32, data: &[u8]) -> Result<Vec<u8>> {
    let expected = (width * height * 2) as usize;
    if data.len() < expected {
        anyhow::bail!("short YUYV buffer");
    }
    let mut out = Vec::with_capacity((width * height * 3) as usize);
    for chunk in data[..expected].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0] as f32, chunk[2] as f32] {
            out.push(clamp(y + 1.402 * v));
            out.push(clamp(y - 0.344136 * u - 0.714136 * v));
            out.push(clamp(y + 1.772 * u));
        }
    }
    Ok(out)
}

fn clamp(v: f32) -> u8 {
    v.clamp(0.0, 255.0) as u8
}

fn grey_to_rgb(width: u32, height: u32, data: &[u8]) -> Result<Vec<u8>> {
    let expected = (width * height) as usize;
    if data.len() < expected {
        anyhow::bail!("short GREY buffer");
    }
    Ok(data[..expected].iter().flat_map(|&y| [y, y, y]).collect())
}

/// Converts an RGB capture to a luma frame with brightness and a contrast-based quality.
fn to_frame(device_id: &str, rgb: ImageBuffer<Rgb<u8>, Vec<u8>>) -> Frame {
    let luma = DynamicImage::ImageRgb8(rgb).to_luma8();
    let (width, height) = luma.dimensions();
    let pixels = luma.into_raw();
    let n = pixels.len().max(1) as f32;
    let mean = pixels.iter().map(|&p| p as f32).sum::<f32>() / n;
    let var = pixels.iter().map(|&p| (p as f32 - mean).powi(2)).sum::<f32>() / n;
    let quality = (var.sqrt() / 64.0).clamp(0.0, 1.0);
    Frame::new(
        device_id,
        quality,
        Payload::Image {
            width,
            height,
            luma: pixels,
        },
    )
    .with_brightness(mean / 255.0)
}

type Request = oneshot::Sender<Result<Frame>>;

fn capture_thread(
    path: String,
    device_id: String,
    ready: oneshot::Sender<Result<(), String>>,
    requests: std_mpsc::Receiver<Request>,
) {
    let mut camera = match Camera::open(&path) {
        Ok(camera) => {
            let _ = ready.send(Ok(()));
            camera
        }
        Err(err) => {
            let _ = ready.send(Err(format!("{err:#}")));
            return;
        }
    };
    while let Ok(reply) = requests.recv() {
        let _ = reply.send(camera.frame().map(|rgb| to_frame(&device_id, rgb)));
    }
    log::debug!("v4l capture thread for {} closed", device_id);
}

/// Drives V4L2 cameras; the device endpoint is the video node path.
#[derive(Default)]
pub struct V4lDriver {
    connections: Mutex<HashMap<u64, std_mpsc::Sender<Request>>>,
}

impl V4lDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceDriver for V4lDriver {
    async fn connect(&self, config: &DeviceConfig) -> Result<ConnectionHandle, DriverError> {
        let path = if config.endpoint.is_empty() {
            "/dev/video0".to_string()
        } else {
            config.endpoint.clone()
        };
        let connect_err = |message: String| DriverError::Connect {
            endpoint: path.clone(),
            message,
        };

        let (tx, rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let thread_path = path.clone();
        let device_id = config.id.clone();
        std::thread::Builder::new()
            .name(format!("v4l-{}", config.id))
            .spawn(move || capture_thread(thread_path, device_id, ready_tx, rx))
            .map_err(|e| connect_err(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(message)) => return Err(connect_err(message)),
            Err(_) => return Err(connect_err("capture thread exited".into())),
        }

        let handle = ConnectionHandle::allocate(&config.id);
        self.connections.lock().insert(handle.id, tx);
        Ok(handle)
    }

    async fn capture_frame(&self, handle: &ConnectionHandle) -> Result<Frame, DriverError> {
        let disconnected = DriverError::Disconnected { handle: handle.id };
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let connections = self.connections.lock();
            let tx = connections.get(&handle.id).ok_or(disconnected.clone())?;
            tx.send(reply_tx).map_err(|_| disconnected.clone())?;
        }
        reply_rx
            .await
            .map_err(|_| disconnected)?
            .map_err(|e| DriverError::Capture(format!("{e:#}")))
    }

    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<(), DriverError> {
        // dropping the sender ends the capture thread
        match self.connections.lock().remove(&handle.id) {
            Some(_) => Ok(()),
            None => Err(DriverError::Disconnected { handle: handle.id }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuyv_grey_pixels_stay_grey() {
        let rgb = yuyv_to_rgb(2, 1, &[100, 128, 200, 128]).unwrap();
        assert_eq!(rgb, vec![100, 100, 100, 200, 200, 200]);
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert!(yuyv_to_rgb(4, 4, &[0; 8]).is_err());
        assert!(grey_to_rgb(4, 4, &[0; 8]).is_err());
    }

    #[test]
    fn rgb_capture_becomes_luma_frame() {
        let rgb = ImageBuffer::from_raw(2, 1, vec![0, 0, 0, 255, 255, 255]).unwrap();
        let frame = to_frame("cam-1", rgb);
        assert_eq!(frame.descriptors.brightness.map(|b| (b * 100.0).round()), Some(50.0));
        assert!(matches!(frame.payload, Payload::Image { width: 2, height: 1, .. }));
    }
}

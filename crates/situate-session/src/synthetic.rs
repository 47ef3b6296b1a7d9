//! Test-pattern capture device.
//!
//! Generates a moving gradient, a tilted depth ramp, a gentle IMU wobble and
//! a head orbiting the world anchor, at a fixed frame rate. Useful for
//! exercising a capture server without sensors attached.

use crate::capture_client::{CaptureDevice, CaptureSink};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use situate_core::StreamDescriptor;
use situate_transport::{DepthFrame, ImageFrame, ImuSample, Pose};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SyntheticDevice {
    fps: f64,
    width: u32,
    height: u32,
    /// Stop after this many frames; run until disposed when `None`.
    frames: Option<u64>,
    extra_streams: Vec<StreamDescriptor>,
}

impl SyntheticDevice {
    pub fn new(fps: f64) -> Self {
        Self {
            fps: if fps > 0.0 { fps } else { 30.0 },
            width: 64,
            height: 48,
            frames: None,
            extra_streams: Vec::new(),
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width.max(1);
        self.height = height.max(1);
        self
    }

    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frames = Some(frames);
        self
    }

    /// Advertise an additional text stream; a status line is posted on it
    /// every frame.
    pub fn with_extra_stream(mut self, stream: StreamDescriptor) -> Self {
        self.extra_streams.push(stream);
        self
    }

    fn image(&self, frame: u64) -> ImageFrame {
        let (w, h) = (self.width, self.height);
        let shift = (frame % 256) as u32;
        let mut data = Vec::with_capacity((w * h * 4) as usize);
        for y in 0..h {
            for x in 0..w {
                let r = ((x * 255 / w + shift) % 256) as u8;
                let g = ((y * 255 / h) % 256) as u8;
                data.extend_from_slice(&[0, g, r, 255]);
            }
        }
        ImageFrame {
            width: w,
            height: h,
            encoding: "bgra8".to_string(),
            data,
        }
    }

    fn depth(&self, frame: u64) -> DepthFrame {
        let (w, h) = (self.width / 2, self.height / 2);
        let base = 1_000 + (frame % 100) as u16 * 10;
        let data = (0..h)
            .flat_map(|y| (0..w).map(move |x| base + (x + y) as u16))
            .collect();
        DepthFrame {
            width: w,
            height: h,
            data,
        }
    }

    fn imu(t: f64) -> ImuSample {
        ImuSample {
            acceleration: [0.05 * t.sin(), -9.81, 0.05 * t.cos()],
            angular_velocity: [0.0, 0.3 * (0.5 * t).sin(), 0.0],
        }
    }

    fn head(anchor: Option<Pose>, t: f64) -> Pose {
        let origin = anchor.map_or([0.0; 3], |a| a.position);
        let (half_sin, half_cos) = (t * 0.25).sin_cos();
        Pose {
            position: [origin[0] + t.cos(), origin[1] + 1.6, origin[2] + t.sin()],
            orientation: [half_cos, 0.0, half_sin, 0.0],
        }
    }
}

impl CaptureDevice for SyntheticDevice {
    fn locate_world_anchor(&self) -> BoxFuture<'static, anyhow::Result<Pose>> {
        async {
            Ok(Pose {
                position: [0.0; 3],
                orientation: [1.0, 0.0, 0.0, 0.0],
            })
        }
        .boxed()
    }

    fn calibrate_cameras(&self) -> BoxFuture<'static, anyhow::Result<()>> {
        async { Ok(()) }.boxed()
    }

    fn capture(&self, sink: CaptureSink) -> BoxFuture<'static, anyhow::Result<()>> {
        let device = self.clone();
        async move {
            let period = Duration::from_secs_f64(1.0 / device.fps);
            let mut ticker = tokio::time::interval(period);
            let mut frame = 0u64;
            loop {
                if device.frames.is_some_and(|limit| frame >= limit) {
                    return Ok(());
                }
                ticker.tick().await;
                let t = frame as f64 / device.fps;

                sink.post_video(&device.image(frame)).await?;
                sink.post_depth(&device.depth(frame)).await?;
                sink.post_imu(&Self::imu(t)).await?;
                sink.post_head(&Self::head(sink.anchor(), t)).await?;
                for stream in &device.extra_streams {
                    sink.post_text(&stream.name, &format!("frame {frame}")).await?;
                }
                frame += 1;
            }
        }
        .boxed()
    }

    fn extra_streams(&self) -> Vec<StreamDescriptor> {
        self.extra_streams.clone()
    }
}

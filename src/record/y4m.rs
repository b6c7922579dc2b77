//! YUV4MPEG2 writer.
//!
//! Lossless intermediate that needs no external tools. Layout per source
//! format:
//! - RGB24/BGR24 → planar 4:4:4 (BT.601 studio range)
//! - YUYV → planar 4:2:2 (repacked, no conversion)
//! - GRAY8 → mono

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use super::{ensure_parent, EncoderBackend, EncoderRequest, EncoderStream};
use crate::error::EncoderError;
use crate::frame::{Frame, PixelFormat};

/// Opens [`Y4mStream`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct Y4mEncoder;

impl EncoderBackend for Y4mEncoder {
    fn open(&self, request: &EncoderRequest) -> Result<Box<dyn EncoderStream>, EncoderError> {
        Ok(Box::new(Y4mStream::create(request)?))
    }
}

pub struct Y4mStream {
    path: PathBuf,
    out: BufWriter<File>,
    width: u32,
    height: u32,
    format: PixelFormat,
    planes: Vec<u8>,
}

impl Y4mStream {
    pub fn create(request: &EncoderRequest) -> Result<Self, EncoderError> {
        let path = request.path.clone();
        if request.width == 0 || request.height == 0 {
            return Err(EncoderError::open(&path, "frame size must be non-zero"));
        }
        if request.pixel_format == PixelFormat::Yuyv && request.width % 2 != 0 {
            return Err(EncoderError::open(&path, "YUYV frames need an even width"));
        }
        ensure_parent(&path)?;
        let file = File::create(&path)
            .map_err(|err| EncoderError::open(&path, format!("create file: {}", err)))?;
        let mut out = BufWriter::new(file);

        let (num, den) = fps_ratio(request.fps);
        let header = format!(
            "YUV4MPEG2 W{} H{} F{}:{} Ip A1:1 {}\n",
            request.width,
            request.height,
            num,
            den,
            colorspace(request.pixel_format)
        );
        out.write_all(header.as_bytes())
            .map_err(|err| EncoderError::open(&path, format!("write header: {}", err)))?;

        Ok(Self {
            path,
            out,
            width: request.width,
            height: request.height,
            format: request.pixel_format,
            planes: Vec::new(),
        })
    }

    fn convert(&mut self, pixels: &[u8]) {
        self.planes.clear();
        let pixel_count = self.width as usize * self.height as usize;
        match self.format {
            PixelFormat::Gray8 => self.planes.extend_from_slice(pixels),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => {
                self.planes.resize(pixel_count * 3, 0);
                let (y, rest) = self.planes.split_at_mut(pixel_count);
                let (u, v) = rest.split_at_mut(pixel_count);
                let bgr = self.format == PixelFormat::Bgr24;
                for (i, px) in pixels.chunks_exact(3).enumerate() {
                    let (r, g, b) = if bgr {
                        (px[2], px[1], px[0])
                    } else {
                        (px[0], px[1], px[2])
                    };
                    let (yy, uu, vv) = rgb_to_yuv(r, g, b);
                    y[i] = yy;
                    u[i] = uu;
                    v[i] = vv;
                }
            }
            PixelFormat::Yuyv => {
                let chroma = pixel_count / 2;
                self.planes.resize(pixel_count + chroma * 2, 0);
                let (y, rest) = self.planes.split_at_mut(pixel_count);
                let (u, v) = rest.split_at_mut(chroma);
                for (i, quad) in pixels.chunks_exact(4).enumerate() {
                    y[i * 2] = quad[0];
                    u[i] = quad[1];
                    y[i * 2 + 1] = quad[2];
                    v[i] = quad[3];
                }
            }
        }
    }
}

impl EncoderStream for Y4mStream {
    fn write(&mut self, frame: &Frame) -> Result<(), EncoderError> {
        if frame.dimensions() != (self.width, self.height) || frame.format != self.format {
            return Err(EncoderError::write(
                &self.path,
                format!(
                    "frame is {}x{} {:?}, stream expects {}x{} {:?}",
                    frame.width, frame.height, frame.format, self.width, self.height, self.format
                ),
            ));
        }
        let expected = self.format.frame_len(self.width, self.height);
        if frame.pixels().len() < expected {
            return Err(EncoderError::write(
                &self.path,
                format!("short frame: {} of {} bytes", frame.pixels().len(), expected),
            ));
        }
        self.convert(&frame.pixels()[..expected]);
        self.out
            .write_all(b"FRAME\n")
            .and_then(|_| self.out.write_all(&self.planes))
            .map_err(|err| EncoderError::write(&self.path, err.to_string()))
    }

    fn finish(self: Box<Self>) -> Result<(), EncoderError> {
        let Self { path, mut out, .. } = *self;
        out.flush()
            .and_then(|_| out.get_ref().sync_all())
            .map_err(|err| EncoderError::finish(&path, err.to_string()))
    }
}

fn colorspace(format: PixelFormat) -> &'static str {
    match format {
        PixelFormat::Rgb24 | PixelFormat::Bgr24 => "C444",
        PixelFormat::Yuyv => "C422",
        PixelFormat::Gray8 => "Cmono",
    }
}

/// BT.601 studio-range conversion.
fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (i32::from(r), i32::from(g), i32::from(b));
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (clamp(y), clamp(u), clamp(v))
}

fn clamp(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// Frame rate as a reduced ratio with millihertz precision.
fn fps_ratio(fps: f64) -> (u64, u64) {
    if !fps.is_finite() || fps <= 0.0 {
        return (30, 1);
    }
    let mut num = (fps * 1000.0).round() as u64;
    let mut den = 1000u64;
    let divisor = gcd(num, den);
    if divisor > 1 {
        num /= divisor;
        den /= divisor;
    }
    (num.max(1), den)
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CapturedFrame, DeviceId, LatestFrameCell};
    use crate::record::OutputFormat;

    fn request(dir: &std::path::Path, format: PixelFormat) -> EncoderRequest {
        EncoderRequest {
            path: dir.join("s1").join("cam0_s1.y4m"),
            format: OutputFormat::Y4m,
            width: 2,
            height: 2,
            fps: 25.0,
            pixel_format: format,
        }
    }

    #[test]
    fn writes_header_and_planar_frames() {
        let dir = tempfile::tempdir().expect("tempdir");
        let req = request(dir.path(), PixelFormat::Rgb24);
        let mut stream = Y4mEncoder.open(&req).expect("open");

        let cell = LatestFrameCell::new(DeviceId(0));
        let white = cell.publish(CapturedFrame::new(vec![255; 12], 2, 2, PixelFormat::Rgb24));
        stream.write(&white).expect("write");
        stream.write(&white).expect("write");
        stream.finish().expect("finish");

        let bytes = std::fs::read(&req.path).expect("read back");
        let header = b"YUV4MPEG2 W2 H2 F25:1 Ip A1:1 C444\n";
        assert!(bytes.starts_with(header));
        let frame_len = 6 + 12;
        assert_eq!(bytes.len(), header.len() + 2 * frame_len);
        let planes = &bytes[header.len() + 6..header.len() + frame_len];
        assert_eq!(&planes[..4], &[235, 235, 235, 235]);
        assert_eq!(&planes[4..], &[128; 8]);
    }

    #[test]
    fn yuyv_is_repacked_to_422() {
        let dir = tempfile::tempdir().expect("tempdir");
        let req = request(dir.path(), PixelFormat::Yuyv);
        let mut stream = Y4mEncoder.open(&req).expect("open");
        let cell = LatestFrameCell::new(DeviceId(0));
        let frame = cell.publish(CapturedFrame::new(
            vec![1, 2, 3, 4, 5, 6, 7, 8],
            2,
            2,
            PixelFormat::Yuyv,
        ));
        stream.write(&frame).expect("write");
        stream.finish().expect("finish");

        let bytes = std::fs::read(&req.path).expect("read back");
        let body = &bytes[bytes.len() - 8..];
        assert_eq!(body, &[1, 3, 5, 7, 2, 6, 4, 8]);
    }

    #[test]
    fn size_change_is_a_write_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let req = request(dir.path(), PixelFormat::Gray8);
        let mut stream = Y4mEncoder.open(&req).expect("open");
        let cell = LatestFrameCell::new(DeviceId(0));
        let wrong = cell.publish(CapturedFrame::new(vec![0; 9], 3, 3, PixelFormat::Gray8));
        assert!(matches!(
            stream.write(&wrong),
            Err(EncoderError::Write { .. })
        ));
    }

    #[test]
    fn fractional_rates_are_reduced() {
        assert_eq!(fps_ratio(30.0), (30, 1));
        assert_eq!(fps_ratio(29.97), (2997, 100));
        assert_eq!(fps_ratio(12.5), (25, 2));
        assert_eq!(fps_ratio(0.0), (30, 1));
    }
}

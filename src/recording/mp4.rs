//! H.264 (openh264) into MP4 (muxide).

use super::{RecordingSettings, RecordingStats, VideoWriter, VideoWriterFactory};
use crate::errors::CameraError;
use crate::types::{CameraFrame, PixelFormat};
use muxide::api::{Metadata, Muxer, MuxerBuilder, VideoCodec};
use openh264::encoder::{Encoder, FrameType};
use openh264::formats::YUVBuffer;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// openh264 encoder for fixed-size RGB frames.
pub struct H264Encoder {
    encoder: Encoder,
    width: u32,
    height: u32,
    frame_count: u64,
}

/// Annex B access unit.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub is_keyframe: bool,
}

impl H264Encoder {
    /// Rate control uses the encoder defaults.
    pub fn new(width: u32, height: u32) -> Result<Self, CameraError> {
        let encoder = Encoder::new()
            .map_err(|e| CameraError::CaptureFailed(format!("H.264 encoder: {e}")))?;
        Ok(Self {
            encoder,
            width,
            height,
            frame_count: 0,
        })
    }

    pub fn encode_rgb(&mut self, rgb: &[u8]) -> Result<EncodedFrame, CameraError> {
        let expected = self.width as usize * self.height as usize * 3;
        if rgb.len() != expected {
            return Err(CameraError::CaptureFailed(format!(
                "frame holds {} bytes, {}x{} RGB needs {}",
                rgb.len(),
                self.width,
                self.height,
                expected
            )));
        }

        let yuv = YUVBuffer::from_vec(
            rgb_to_yuv420(rgb, self.width, self.height),
            self.width as usize,
            self.height as usize,
        );
        let bitstream = self
            .encoder
            .encode(&yuv)
            .map_err(|e| CameraError::CaptureFailed(format!("H.264 encode: {e}")))?;
        self.frame_count += 1;

        Ok(EncodedFrame {
            is_keyframe: matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I),
            data: bitstream.to_vec(),
        })
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

/// BT.601 RGB24 to planar YUV 4:2:0.
fn rgb_to_yuv420(rgb: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let y_size = w * h;
    let uv_size = (w / 2) * (h / 2);
    let mut yuv = vec![0u8; y_size + uv_size * 2];

    let (y_plane, uv_planes) = yuv.split_at_mut(y_size);
    let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);

    for y in 0..h {
        for x in 0..w {
            let i = (y * w + x) * 3;
            let (r, g, b) = (rgb[i] as i32, rgb[i + 1] as i32, rgb[i + 2] as i32);
            y_plane[y * w + x] = (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8;

            if y % 2 == 0 && x % 2 == 0 {
                let uv = (y / 2) * (w / 2) + x / 2;
                u_plane[uv] = (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128).clamp(0, 255) as u8;
                v_plane[uv] = (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128).clamp(0, 255) as u8;
            }
        }
    }
    yuv
}

/// Writes one MP4 file.
pub struct Mp4VideoWriter {
    encoder: H264Encoder,
    muxer: Muxer<BufWriter<File>>,
    settings: RecordingSettings,
    path: PathBuf,
    frames: u64,
    skipped: u64,
}

impl Mp4VideoWriter {
    pub fn create(path: &Path, settings: &RecordingSettings) -> Result<Self, CameraError> {
        settings.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;

        let muxer = MuxerBuilder::new(BufWriter::new(file))
            .video(VideoCodec::H264, settings.width, settings.height, settings.fps)
            .with_fast_start(settings.fast_start)
            .with_metadata(Metadata::new().with_current_time())
            .build()
            .map_err(|e| CameraError::CaptureFailed(format!("MP4 muxer: {e}")))?;

        log::debug!(
            "Recording {}x{}@{} to {}",
            settings.width,
            settings.height,
            settings.fps,
            path.display()
        );
        Ok(Self {
            encoder: H264Encoder::new(settings.width, settings.height)?,
            muxer,
            settings: settings.clone(),
            path: path.to_path_buf(),
            frames: 0,
            skipped: 0,
        })
    }
}

impl VideoWriter for Mp4VideoWriter {
    fn write_frame(&mut self, frame: &CameraFrame) -> Result<(), CameraError> {
        if frame.pixel_format != PixelFormat::Rgb24 {
            return Err(CameraError::ConfigurationNotSupported(format!(
                "cannot record {} frames",
                frame.pixel_format
            )));
        }
        if (frame.width, frame.height) != (self.settings.width, self.settings.height) {
            return Err(CameraError::CaptureFailed(format!(
                "frame is {}x{}, recording is {}x{}",
                frame.width, frame.height, self.settings.width, self.settings.height
            )));
        }

        let encoded = self.encoder.encode_rgb(&frame.data)?;
        // The encoder may buffer a frame and emit nothing for it.
        if encoded.data.is_empty() {
            self.skipped += 1;
            return Ok(());
        }

        let pts = self.frames as f64 / self.settings.fps;
        self.muxer
            .write_video(pts, &encoded.data, encoded.is_keyframe)
            .map_err(|e| CameraError::CaptureFailed(format!("MP4 write: {e}")))?;
        self.frames += 1;
        Ok(())
    }

    fn frame_count(&self) -> u64 {
        self.frames
    }

    fn finish(self: Box<Self>) -> Result<RecordingStats, CameraError> {
        let stats = self
            .muxer
            .finish_with_stats()
            .map_err(|e| CameraError::CaptureFailed(format!("MP4 finalize: {e}")))?;
        log::info!(
            "Recording {} finished: {} frames, {} bytes",
            self.path.display(),
            stats.video_frames,
            stats.bytes_written
        );
        Ok(RecordingStats {
            path: self.path,
            video_frames: stats.video_frames,
            skipped_frames: self.skipped,
            duration_secs: stats.duration_secs,
            bytes_written: stats.bytes_written,
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Mp4WriterFactory;

impl VideoWriterFactory for Mp4WriterFactory {
    fn create(
        &self,
        path: &Path,
        settings: &RecordingSettings,
    ) -> Result<Box<dyn VideoWriter>, CameraError> {
        Ok(Box::new(Mp4VideoWriter::create(path, settings)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::synthetic_video_frame;

    #[test]
    fn test_rgb_to_yuv420_size() {
        let rgb = vec![128u8; 64 * 48 * 3];
        assert_eq!(rgb_to_yuv420(&rgb, 64, 48).len(), 64 * 48 * 3 / 2);
    }

    #[test]
    fn test_first_frame_is_keyframe() {
        let mut encoder = H264Encoder::new(64, 48).unwrap();
        let encoded = encoder.encode_rgb(&vec![100u8; 64 * 48 * 3]).unwrap();
        assert!(encoded.is_keyframe);
        assert!(
            encoded.data.starts_with(&[0, 0, 0, 1]) || encoded.data.starts_with(&[0, 0, 1])
        );
    }

    #[test]
    fn test_mp4_file_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        let settings = RecordingSettings::new(64, 48, 15.0);
        let mut writer: Box<dyn VideoWriter> =
            Box::new(Mp4VideoWriter::create(&path, &settings).unwrap());

        for seq in 0..15 {
            writer.write_frame(&synthetic_video_frame(seq, 64, 48)).unwrap();
        }
        let stats = writer.finish().unwrap();

        assert_eq!(stats.video_frames + stats.skipped_frames, 15);
        assert!(stats.bytes_written > 0);
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn test_mismatched_frame_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let settings = RecordingSettings::new(64, 48, 15.0);
        let mut writer = Mp4VideoWriter::create(&dir.path().join("clip.mp4"), &settings).unwrap();
        assert!(writer.write_frame(&synthetic_video_frame(0, 32, 24)).is_err());
    }
}

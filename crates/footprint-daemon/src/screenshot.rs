use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use footprint_core::capture::{CaptureError, ScreenCapturer, ScreenshotSink};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::ingest::IngestMessage;

/// Hands capture requests to the worker without waiting on it.
pub struct ChannelScreenshotSink {
    tx: mpsc::Sender<PathBuf>,
}

impl ChannelScreenshotSink {
    pub fn new(tx: mpsc::Sender<PathBuf>) -> Self {
        Self { tx }
    }
}

impl ScreenshotSink for ChannelScreenshotSink {
    fn request(&mut self, path: PathBuf) {
        match self.tx.try_send(path) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(path)) => {
                debug!(path = %path.display(), "screenshot worker busy, dropping request");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("screenshot worker is gone");
            }
        }
    }
}

/// Run captures off the ingest task. Failures go back to the recorder so a
/// full disk can stop capture.
pub fn spawn_screenshot_worker(
    capturer: Arc<dyn ScreenCapturer>,
    mut rx: mpsc::Receiver<PathBuf>,
    feedback: mpsc::Sender<IngestMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(path) = rx.recv().await {
            let capturer = capturer.clone();
            let dest = path.clone();
            let result =
                tokio::task::spawn_blocking(move || capturer.capture_screenshot(&dest)).await;
            match result {
                Ok(Ok(())) => debug!(path = %path.display(), "screenshot saved"),
                Ok(Err(e)) => {
                    if feedback.send(IngestMessage::ScreenshotFailed(e)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "screenshot task panicked"),
            }
        }
        debug!("screenshot worker stopped");
    })
}

/// Runs an external grabber (e.g. `grim {path}`) into a temporary PNG and
/// re-encodes it as JPEG at the requested path.
pub struct CommandCapturer {
    argv: Vec<String>,
    quality: u8,
}

impl CommandCapturer {
    pub fn new(argv: Vec<String>, quality: u8) -> Self {
        Self {
            argv,
            quality: quality.clamp(1, 100),
        }
    }
}

impl ScreenCapturer for CommandCapturer {
    fn name(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("none")
    }

    fn capture_screenshot(&self, dest: &Path) -> Result<(), CaptureError> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(CaptureError::Backend("no screenshot command configured".into()));
        };
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let raw = dest.with_extension("png");
        let raw_str = raw.to_string_lossy();
        let args: Vec<String> = args.iter().map(|a| a.replace("{path}", &raw_str)).collect();

        let output = Command::new(program)
            .args(&args)
            .output()
            .map_err(CaptureError::from_io)?;
        if !output.status.success() {
            let _ = fs::remove_file(&raw);
            return Err(CaptureError::Backend(format!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let encoded = save_jpeg(&raw, dest, self.quality);
        let _ = fs::remove_file(&raw);
        encoded
    }
}

/// Decode `src` and write it to `dest` as JPEG.
pub fn save_jpeg(src: &Path, dest: &Path, quality: u8) -> Result<(), CaptureError> {
    let image = image::open(src).map_err(image_error)?;
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());

    let mut writer = BufWriter::new(fs::File::create(dest)?);
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut writer, quality))
        .map_err(image_error)?;
    writer.flush()?;
    Ok(())
}

fn image_error(err: ImageError) -> CaptureError {
    match err {
        ImageError::IoError(io) => CaptureError::from_io(io),
        other => CaptureError::Backend(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn save_jpeg_reencodes_png() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("raw.png");
        let mut img = RgbaImage::new(16, 8);
        for pixel in img.pixels_mut() {
            *pixel = Rgba([200, 40, 40, 255]);
        }
        img.save(&src).unwrap();

        let dest = dir.path().join("shot.jpg");
        save_jpeg(&src, &dest, 70).unwrap();

        let back = image::open(&dest).unwrap();
        assert_eq!((back.width(), back.height()), (16, 8));
    }

    #[test]
    fn missing_source_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = save_jpeg(&dir.path().join("nope.png"), &dir.path().join("out.jpg"), 70)
            .unwrap_err();
        assert!(matches!(err, CaptureError::Io(_)));
    }

    #[test]
    fn empty_command_is_rejected() {
        let capturer = CommandCapturer::new(vec![], 70);
        assert_eq!(capturer.name(), "none");
        let dir = tempfile::tempdir().unwrap();
        let err = capturer.capture_screenshot(&dir.path().join("x.jpg")).unwrap_err();
        assert!(matches!(err, CaptureError::Backend(_)));
    }

    #[tokio::test]
    async fn full_sink_drops_requests() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut sink = ChannelScreenshotSink::new(tx);
        sink.request(PathBuf::from("/tmp/a.jpg"));
        sink.request(PathBuf::from("/tmp/b.jpg"));
        assert_eq!(rx.recv().await, Some(PathBuf::from("/tmp/a.jpg")));
        assert!(rx.try_recv().is_err());
    }
}

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use anyhow::Context as _;

use crate::{
    core::PixelBuffer,
    encode::{EncodeJob, bridge::ProcessBridge},
    error::{EncodeError, StickerResult},
};

/// Shared palette with a reserved transparent slot, re-applied to every frame.
pub const PALETTE_FILTER: &str = "split[v1][v2];[v1]palettegen=reserve_transparent=1[palette];[v2][palette]paletteuse=alpha_threshold=128";

/// Shared palette without a transparent slot.
pub const OPAQUE_PALETTE_FILTER: &str =
    "split[v1][v2];[v1]palettegen=reserve_transparent=0[palette];[v2][palette]paletteuse";

pub fn palette_filter(transparent: bool) -> &'static str {
    if transparent {
        PALETTE_FILTER
    } else {
        OPAQUE_PALETTE_FILTER
    }
}

/// Frame-sequence mode: numbered PNGs at `rate` through `filter` into a looping GIF.
pub fn frame_sequence_args(rate: u32, pattern: &Path, filter: &str, dst: &Path) -> Vec<OsString> {
    vec![
        "-r".into(),
        rate.to_string().into(),
        "-i".into(),
        pattern.into(),
        "-vf".into(),
        filter.into(),
        "-loop".into(),
        "0".into(),
        dst.into(),
    ]
}

/// Direct-transcode mode: scale to fit `max_dimension`, force even sides, palettize.
pub fn transcode_args(src: &Path, max_dimension: u32, dst: &Path) -> Vec<OsString> {
    let filter = format!(
        "format=rgba,scale='min({max_dimension},iw)':'min({max_dimension},ih)':force_original_aspect_ratio=decrease,scale=trunc(iw/2)*2:trunc(ih/2)*2,{PALETTE_FILTER}"
    );
    vec![
        "-vcodec".into(),
        "libvpx-vp9".into(),
        "-i".into(),
        src.into(),
        "-vf".into(),
        filter.into(),
        "-loop".into(),
        "0".into(),
        dst.into(),
    ]
}

/// Preview mode: first decoded frame as RGBA PNG.
pub fn preview_args(src: &Path, dst: &Path) -> Vec<OsString> {
    vec![
        "-vcodec".into(),
        "libvpx-vp9".into(),
        "-i".into(),
        src.into(),
        "-vframes".into(),
        "1".into(),
        "-pix_fmt".into(),
        "rgba".into(),
        dst.into(),
    ]
}

/// Output size produced by the [`transcode_args`] filter chain.
///
/// Fits the input inside `min(max, w) x min(max, h)` keeping its aspect ratio, then
/// truncates both sides to even values.
pub fn scaled_dimensions(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (0, 0);
    }
    let box_w = u64::from(max_dimension.min(width));
    let box_h = u64::from(max_dimension.min(height));
    let (w, h) = (u64::from(width), u64::from(height));
    // Nearest-rounded rescale, as the scale filter computes it.
    let rescale = |a: u64, b: u64, c: u64| (a * b + c / 2) / c;
    let out_w = rescale(box_h, w, h).min(box_w);
    let out_h = rescale(box_w, h, w).min(box_h);
    let even = |v: u64| (v / 2 * 2) as u32;
    (even(out_w), even(out_h))
}

pub fn ensure_parent_dir(path: &Path) -> StickerResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory '{}'", parent.display()))?;
    }
    Ok(())
}

fn remove_stale(path: &Path) -> StickerResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "removed stale output");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Move a finished output into place, copying when `staged` and `dst` sit on different
/// filesystems.
fn publish(staged: &Path, dst: &Path) -> StickerResult<()> {
    if std::fs::rename(staged, dst).is_ok() {
        return Ok(());
    }
    std::fs::copy(staged, dst).with_context(|| {
        format!(
            "failed to move '{}' to '{}'",
            staged.display(),
            dst.display()
        )
    })?;
    std::fs::remove_file(staged).ok();
    Ok(())
}

/// GIF encoder that buffers frames as numbered PNGs and palettizes them with ffmpeg.
#[derive(Debug)]
pub struct FfmpegGifEncoder {
    dst: PathBuf,
    rate: u32,
    max_dimension: Option<u32>,
    transparent: bool,
    preview: bool,
    tmp: Option<tempfile::TempDir>,
    next_frame: u64,
    bridge: ProcessBridge,
}

impl FfmpegGifEncoder {
    pub fn new(job: &EncodeJob, bridge: ProcessBridge) -> StickerResult<Self> {
        job.validate()?;
        let tmp = tempfile::Builder::new()
            .prefix("sticker-gif-")
            .tempdir()
            .context("failed to create encoder working directory")?;
        Ok(Self {
            dst: job.dst.clone(),
            rate: job.fps,
            max_dimension: job.max_dimension,
            transparent: job.transparent,
            preview: true,
            tmp: Some(tmp),
            next_frame: 0,
            bridge,
        })
    }

    /// Whether [`Self::transcode_video`] extracts a preview frame first. On by default.
    pub fn with_preview(mut self, preview: bool) -> Self {
        self.preview = preview;
        self
    }

    fn workdir(&self) -> StickerResult<&Path> {
        self.tmp
            .as_ref()
            .map(tempfile::TempDir::path)
            .ok_or_else(|| EncodeError::Finalized.into())
    }

    pub fn frames_written(&self) -> u64 {
        self.next_frame
    }

    pub fn start(&mut self) -> StickerResult<()> {
        self.workdir()?;
        ensure_parent_dir(&self.dst)?;
        remove_stale(&self.dst)
    }

    /// Write the next frame as `<n>.png`.
    pub fn add_frame(&mut self, buffer: PixelBuffer) -> StickerResult<()> {
        let path = self.workdir()?.join(format!("{}.png", self.next_frame));
        let img = buffer.into_rgba_image()?;
        img.save_with_format(&path, image::ImageFormat::Png)
            .with_context(|| format!("failed to write frame '{}'", path.display()))?;
        self.next_frame += 1;
        Ok(())
    }

    /// Run ffmpeg into the working directory and move the result to the destination only
    /// once it succeeded, so a failed run never leaves a partial file behind.
    fn run_staged(&self, args: impl FnOnce(&Path) -> Vec<OsString>) -> StickerResult<PathBuf> {
        let staged = self.workdir()?.join("output.gif");
        std::fs::remove_file(&staged).ok();
        self.bridge.execute(&args(&staged))?;
        publish(&staged, &self.dst)?;
        Ok(self.dst.clone())
    }

    /// Palettize the buffered frames into the destination GIF.
    #[tracing::instrument(skip(self), fields(dst = %self.dst.display(), frames = self.next_frame))]
    pub fn process(&mut self) -> StickerResult<PathBuf> {
        let pattern = self.workdir()?.join("%d.png");
        let palette = palette_filter(self.transparent);
        let filter = match self.max_dimension {
            // Downscale in front of the palette graph.
            Some(max) => format!(
                "scale='min({max},iw)':'min({max},ih)':force_original_aspect_ratio=decrease,{palette}"
            ),
            None => palette.to_owned(),
        };
        self.run_staged(|out| frame_sequence_args(self.rate, &pattern, &filter, out))
    }

    /// Convert WebM bytes straight to GIF, handing the first frame to `preview` if one
    /// could be extracted. Preview extraction is skipped when disabled with
    /// [`Self::with_preview`].
    #[tracing::instrument(skip(self, bytes, preview), fields(bytes = bytes.len(), dst = %self.dst.display()))]
    pub fn transcode_video<F>(
        &mut self,
        bytes: &[u8],
        max_dimension: u32,
        preview: F,
    ) -> StickerResult<PathBuf>
    where
        F: FnOnce(&Path) -> StickerResult<()>,
    {
        let dir = self.workdir()?.to_path_buf();
        let webm = tempfile::Builder::new()
            .prefix("webm")
            .suffix(".webm")
            .tempfile_in(&dir)
            .context("failed to create temporary container file")?;
        std::fs::write(webm.path(), bytes)
            .with_context(|| format!("failed to write '{}'", webm.path().display()))?;

        if self.preview {
            let preview_path = tempfile::Builder::new()
                .prefix("preview")
                .suffix(".png")
                .tempfile_in(&dir)
                .context("failed to reserve preview path")?
                .into_temp_path();
            // ffmpeg must create the preview itself so an empty placeholder is not mistaken for it.
            std::fs::remove_file(&preview_path).ok();
            self.bridge
                .execute(&preview_args(webm.path(), &preview_path))?;
            if preview_path.exists() {
                preview(&preview_path)?;
            } else {
                tracing::debug!("preview extraction produced no file");
            }
        }

        self.run_staged(|out| transcode_args(webm.path(), max_dimension, out))
    }

    /// Drop the working directory. Later calls fail with [`EncodeError::Finalized`].
    pub fn end(&mut self) {
        if let Some(tmp) = self.tmp.take()
            && let Err(e) = tmp.close()
        {
            tracing::debug!(error = %e, "failed to remove encoder working directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(args: &[OsString]) -> String {
        args.iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn frame_sequence_command_shape() {
        let args = frame_sequence_args(
            10,
            Path::new("/tmp/x/%d.png"),
            palette_filter(true),
            Path::new("/out/a.gif"),
        );
        assert_eq!(
            joined(&args),
            format!("-r 10 -i /tmp/x/%d.png -vf {PALETTE_FILTER} -loop 0 /out/a.gif")
        );
        assert!(palette_filter(false).contains("reserve_transparent=0"));
        assert!(!palette_filter(false).contains("alpha_threshold"));
    }

    #[test]
    fn transcode_command_scales_then_palettizes() {
        let args = transcode_args(Path::new("in.webm"), 512, Path::new("out.gif"));
        let vf = args[5].to_string_lossy().into_owned();
        assert!(vf.starts_with("format=rgba,scale='min(512,iw)':'min(512,ih)'"));
        assert!(vf.contains("scale=trunc(iw/2)*2:trunc(ih/2)*2,split[v1][v2]"));
        assert_eq!(joined(&args[..4]), "-vcodec libvpx-vp9 -i in.webm");
        assert_eq!(joined(&args[6..]), "-loop 0 out.gif");
    }

    #[test]
    fn preview_command_extracts_one_rgba_frame() {
        let args = preview_args(Path::new("in.webm"), Path::new("p.png"));
        assert_eq!(
            joined(&args),
            "-vcodec libvpx-vp9 -i in.webm -vframes 1 -pix_fmt rgba p.png"
        );
    }

    #[test]
    fn scaling_respects_cap_and_parity() {
        let cases = [
            ((1024, 1024), 512, (512, 512)),
            ((512, 1024), 512, (256, 512)),
            ((1000, 300), 512, (512, 154)),
            ((301, 199), 512, (300, 198)),
        ];
        for ((w, h), max, expected) in cases {
            let (sw, sh) = scaled_dimensions(w, h, max);
            assert_eq!((sw, sh), expected, "{w}x{h} capped at {max}");
            assert!(sw <= max && sh <= max);
            assert_eq!(sw % 2, 0);
            assert_eq!(sh % 2, 0);
        }
    }

    #[test]
    fn publish_replaces_destination_and_clears_staging() {
        let work = tempfile::tempdir().unwrap();
        let staged = work.path().join("output.gif");
        let dst = work.path().join("final.gif");
        std::fs::write(&staged, b"GIF89a").unwrap();
        std::fs::write(&dst, b"old").unwrap();
        publish(&staged, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"GIF89a");
        assert!(!staged.exists());
        assert!(publish(&staged, &dst).is_err());
    }

    #[test]
    fn finalized_encoder_rejects_frames() {
        let job = EncodeJob::new(std::env::temp_dir().join("unused.gif"), 10);
        let mut enc = FfmpegGifEncoder::new(&job, ProcessBridge::default()).unwrap();
        enc.end();
        let err = enc.add_frame(PixelBuffer::new(2, 2)).unwrap_err();
        assert!(matches!(
            err,
            crate::error::StickerError::Encode(EncodeError::Finalized)
        ));
    }
}

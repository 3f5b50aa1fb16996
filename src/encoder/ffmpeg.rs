// ffmpeg-backed encoder
//
// Probes the source with ffprobe, then writes the target format to a temp
// file next to the destination and renames it into place. Binaries come from
// MIGRATOR_FFMPEG_PATH / MIGRATOR_FFPROBE_PATH, then the directory of the
// running executable, then PATH.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use super::{compression_ratio, is_animated, target_dimensions, Dimensions, EncodeError, EncodeOptions, EncodeStats, Encoder};
use crate::constants::TEMP_FILE_PREFIX;
use crate::settings::TargetFormat;

#[derive(Debug, Deserialize)]
struct FFprobeOutput {
    streams: Option<Vec<FFprobeStream>>,
}

#[derive(Debug, Deserialize)]
struct FFprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Ffmpeg,
    Ffprobe,
}

impl Tool {
    pub fn name(self) -> &'static str {
        match self {
            Tool::Ffmpeg => "ffmpeg",
            Tool::Ffprobe => "ffprobe",
        }
    }

    fn env_key(self) -> &'static str {
        match self {
            Tool::Ffmpeg => "MIGRATOR_FFMPEG_PATH",
            Tool::Ffprobe => "MIGRATOR_FFPROBE_PATH",
        }
    }

    pub fn locate(self) -> PathBuf {
        let beside_exe = env::current_exe().ok().and_then(|exe| exe.parent().map(Path::to_path_buf));
        locate(self.name(), env::var_os(self.env_key()).map(PathBuf::from), beside_exe.as_deref())
    }
}

fn locate(name: &str, configured: Option<PathBuf>, beside_exe: Option<&Path>) -> PathBuf {
    if let Some(path) = configured.filter(|p| p.is_file()) {
        return path;
    }
    let file_name = if cfg!(windows) { format!("{}.exe", name) } else { name.to_string() };
    beside_exe
        .map(|dir| dir.join(&file_name))
        .filter(|p| p.is_file())
        .unwrap_or_else(|| PathBuf::from(name))
}

#[derive(Debug, Clone, Default)]
pub struct FfmpegEncoder {
    ffmpeg: Option<PathBuf>,
    ffprobe: Option<PathBuf>,
}

impl FfmpegEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use explicit binaries instead of the resolved ones.
    pub fn with_tools(ffmpeg: PathBuf, ffprobe: PathBuf) -> Self {
        Self { ffmpeg: Some(ffmpeg), ffprobe: Some(ffprobe) }
    }

    fn ffmpeg(&self) -> PathBuf {
        self.ffmpeg.clone().unwrap_or_else(|| Tool::Ffmpeg.locate())
    }

    fn ffprobe(&self) -> PathBuf {
        self.ffprobe.clone().unwrap_or_else(|| Tool::Ffprobe.locate())
    }

    /// Fails naming the first binary that does not answer `-version`.
    pub fn check_tools(&self) -> Result<(), EncodeError> {
        for (tool, path) in [(Tool::Ffmpeg, self.ffmpeg()), (Tool::Ffprobe, self.ffprobe())] {
            let runs = Command::new(&path)
                .arg("-version")
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false);
            if !runs {
                return Err(EncodeError::EncodeFailed(format!(
                    "{} not found at {} (set {})",
                    tool.name(),
                    path.display(),
                    tool.env_key()
                )));
            }
        }
        Ok(())
    }

    /// Read pixel dimensions of the first video stream.
    pub fn probe_dimensions(&self, path: &Path) -> Result<Dimensions, EncodeError> {
        let output = Command::new(self.ffprobe())
            .args(["-v", "quiet", "-print_format", "json", "-show_streams"])
            .arg(path)
            .output()
            .map_err(|e| EncodeError::DecodeFailed(format!("failed to run ffprobe: {}", e)))?;

        if !output.status.success() {
            return Err(EncodeError::DecodeFailed(format!(
                "ffprobe could not read {}",
                path.display()
            )));
        }

        let parsed: FFprobeOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| EncodeError::DecodeFailed(format!("unreadable ffprobe output: {}", e)))?;

        parsed
            .streams
            .unwrap_or_default()
            .into_iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .and_then(|s| Some(Dimensions::new(s.width?, s.height?)))
            .ok_or_else(|| EncodeError::DecodeFailed(format!("{} has no image stream", path.display())))
    }
}

/// libaom CRF (0 best .. 63 worst) from a 1..100 quality.
fn avif_crf(quality: u8) -> u32 {
    ((100 - quality.min(100) as u32) * 63) / 100
}

fn codec_args(format: TargetFormat, quality: u8, animated: bool) -> Vec<String> {
    match format {
        TargetFormat::Webp => {
            let codec = if animated { "libwebp_anim" } else { "libwebp" };
            let mut args = vec![
                "-c:v".to_string(), codec.to_string(),
                "-quality".to_string(), quality.to_string(),
                "-compression_level".to_string(), "4".to_string(),
            ];
            if animated {
                args.extend(["-loop".to_string(), "0".to_string()]);
            }
            args.extend(["-f".to_string(), "webp".to_string()]);
            args
        }
        TargetFormat::Avif => vec![
            "-c:v".to_string(), "libaom-av1".to_string(),
            "-crf".to_string(), avif_crf(quality).to_string(),
            "-b:v".to_string(), "0".to_string(),
            "-still-picture".to_string(), if animated { "0" } else { "1" }.to_string(),
            "-f".to_string(), "avif".to_string(),
        ],
    }
}

fn temp_path_for(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    dest.with_file_name(format!("{}{}", TEMP_FILE_PREFIX, name))
}

impl Encoder for FfmpegEncoder {
    fn encode(&self, source: &Path, dest: &Path, options: &EncodeOptions) -> Result<EncodeStats, EncodeError> {
        let original_bytes = std::fs::metadata(source)
            .map_err(|_| EncodeError::SourceMissing(source.display().to_string()))?
            .len();

        let animated = is_animated(source)
            .map_err(|e| EncodeError::DecodeFailed(format!("{}: {}", source.display(), e)))?;
        if animated && options.skip_animated {
            return Err(EncodeError::AnimatedRefused(source.display().to_string()));
        }

        let original_dims = self.probe_dimensions(source)?;
        let (new_dims, resized) = target_dimensions(original_dims, options);

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EncodeError::EncodeFailed(format!("cannot create {}: {}", parent.display(), e)))?;
        }

        let tmp_path = temp_path_for(dest);

        let mut cmd = Command::new(self.ffmpeg());
        cmd.args(["-y", "-v", "error", "-i"]).arg(source);
        if resized {
            cmd.args(["-vf", &format!("scale={}:{}", new_dims.width, new_dims.height)]);
        }
        if !animated {
            cmd.args(["-frames:v", "1"]);
        }
        cmd.args(codec_args(options.format, options.quality, animated));
        cmd.arg(&tmp_path);

        let output = cmd
            .output()
            .map_err(|e| EncodeError::EncodeFailed(format!("failed to run ffmpeg: {}", e)))?;

        if !output.status.success() {
            let _ = std::fs::remove_file(&tmp_path);
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EncodeError::EncodeFailed(format!("ffmpeg failed: {}", stderr.trim())));
        }

        let new_bytes = std::fs::metadata(&tmp_path).map(|m| m.len()).unwrap_or(0);
        if new_bytes == 0 {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(EncodeError::EncodeFailed("encoder produced an empty file".to_string()));
        }

        std::fs::rename(&tmp_path, dest)
            .map_err(|e| EncodeError::EncodeFailed(format!("cannot move output into place: {}", e)))?;

        Ok(EncodeStats {
            original_bytes,
            new_bytes,
            original_dims,
            new_dims,
            quality_applied: options.quality,
            resized,
            compression_ratio: compression_ratio(original_bytes, new_bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avif_crf_mapping() {
        assert_eq!(avif_crf(100), 0);
        assert_eq!(avif_crf(1), 62);
        assert_eq!(avif_crf(50), 31);
    }

    #[test]
    fn test_codec_args_webp() {
        let args = codec_args(TargetFormat::Webp, 80, false);
        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "libwebp"));
        assert!(args.windows(2).any(|w| w[0] == "-quality" && w[1] == "80"));
        assert_eq!(args.last().map(String::as_str), Some("webp"));
    }

    #[test]
    fn test_temp_path_is_sibling() {
        let tmp = temp_path_for(Path::new("/uploads/2024/01/pic.webp"));
        assert_eq!(tmp, PathBuf::from(format!("/uploads/2024/01/{}pic.webp", TEMP_FILE_PREFIX)));
    }

    #[test]
    fn test_locate_order() {
        let tmp = tempfile::TempDir::new().unwrap();
        let configured = tmp.path().join("custom-ffmpeg");
        std::fs::write(&configured, b"").unwrap();
        let bundled = tmp.path().join(if cfg!(windows) { "ffmpeg.exe" } else { "ffmpeg" });
        std::fs::write(&bundled, b"").unwrap();

        assert_eq!(locate("ffmpeg", Some(configured.clone()), Some(tmp.path())), configured);
        assert_eq!(locate("ffmpeg", Some(tmp.path().join("gone")), Some(tmp.path())), bundled);
        assert_eq!(locate("ffmpeg", None, None), PathBuf::from("ffmpeg"));
        assert_eq!(locate("ffprobe", None, Some(tmp.path())), PathBuf::from("ffprobe"));
    }

    #[test]
    fn test_check_tools_names_missing_binary() {
        let encoder = FfmpegEncoder::with_tools(PathBuf::from("/nonexistent/ffmpeg"), PathBuf::from("ffprobe"));
        let err = encoder.check_tools().unwrap_err();
        assert!(err.to_string().contains("MIGRATOR_FFMPEG_PATH"));
    }

    #[test]
    fn test_missing_source() {
        let encoder = FfmpegEncoder::with_tools(PathBuf::from("ffmpeg"), PathBuf::from("ffprobe"));
        let options = EncodeOptions {
            format: TargetFormat::Webp,
            quality: 80,
            max_width: 0,
            max_height: 0,
            preserve_dimensions: true,
            skip_animated: true,
        };
        let err = encoder
            .encode(Path::new("/nonexistent/pic.jpg"), Path::new("/nonexistent/pic.webp"), &options)
            .unwrap_err();
        assert!(matches!(err, EncodeError::SourceMissing(_)));
    }
}

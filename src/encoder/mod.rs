// Encoder capability
//
// The engine does not ship a codec. It asks an `Encoder` to turn one file
// into the target format and reports back what happened. `convert_item`
// drives the encoder over a media item's master file and every declared
// size variant and returns the resulting artifact.

pub mod animation;
pub mod ffmpeg;

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{MigratorError, Result};
use crate::settings::{Settings, TargetFormat};
use crate::store::{MediaMeta, SizeVariant, UploadDir};

pub use animation::is_animated;
pub use ffmpeg::FfmpegEncoder;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("source missing: {0}")]
    SourceMissing(String),

    #[error("decode failed: {0}")]
    DecodeFailed(String),

    #[error("encode failed: {0}")]
    EncodeFailed(String),

    #[error("animated image refused: {0}")]
    AnimatedRefused(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeOptions {
    pub format: TargetFormat,
    pub quality: u8,
    pub max_width: u32,
    pub max_height: u32,
    pub preserve_dimensions: bool,
    pub skip_animated: bool,
}

impl EncodeOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            format: settings.target_format,
            quality: settings.quality,
            max_width: settings.max_width,
            max_height: settings.max_height,
            preserve_dimensions: settings.preserve_dimensions,
            skip_animated: settings.skip_animated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeStats {
    pub original_bytes: u64,
    pub new_bytes: u64,
    pub original_dims: Dimensions,
    pub new_dims: Dimensions,
    pub quality_applied: u8,
    pub resized: bool,
    /// new_bytes / original_bytes
    pub compression_ratio: f64,
}

/// Re-encodes one image file.
pub trait Encoder {
    fn encode(&self, source: &Path, dest: &Path, options: &EncodeOptions) -> std::result::Result<EncodeStats, EncodeError>;
}

/// Largest size with the same aspect ratio that fits within the limits.
/// A zero limit leaves that axis unconstrained; never upscales.
pub fn fit_within(original: Dimensions, max_width: u32, max_height: u32) -> Dimensions {
    if original.width == 0 || original.height == 0 {
        return original;
    }

    let mut scale = 1.0_f64;
    if max_width > 0 && original.width > max_width {
        scale = scale.min(max_width as f64 / original.width as f64);
    }
    if max_height > 0 && original.height > max_height {
        scale = scale.min(max_height as f64 / original.height as f64);
    }
    if scale >= 1.0 {
        return original;
    }

    let clamp = |value: f64, limit: u32| {
        let v = (value.round() as u32).max(1);
        if limit > 0 { v.min(limit) } else { v }
    };
    Dimensions::new(
        clamp(original.width as f64 * scale, max_width),
        clamp(original.height as f64 * scale, max_height),
    )
}

/// Output dimensions for the given options and whether they differ from the source.
pub fn target_dimensions(original: Dimensions, options: &EncodeOptions) -> (Dimensions, bool) {
    if options.preserve_dimensions || (options.max_width == 0 && options.max_height == 0) {
        return (original, false);
    }
    let fitted = fit_within(original, options.max_width, options.max_height);
    (fitted, fitted != original)
}

pub fn compression_ratio(original_bytes: u64, new_bytes: u64) -> f64 {
    if original_bytes == 0 {
        return 0.0;
    }
    new_bytes as f64 / original_bytes as f64
}

/// Replace the extension of the last path segment, keeping the basename.
pub fn with_extension(path: &str, extension: &str) -> String {
    let name_start = path.rfind('/').map(|i| i + 1).unwrap_or(0);
    let name = &path[name_start..];
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}{}.{}", &path[..name_start], &name[..dot], extension),
        _ => format!("{}.{}", path, extension),
    }
}

/// On-disk result of converting one item.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionArtifact {
    pub new_meta: MediaMeta,
    pub master_stats: EncodeStats,
    /// Relative paths of every file written (master first).
    pub written: Vec<String>,
    /// Bytes of all converted sources, variants included.
    pub total_original_bytes: u64,
    pub total_new_bytes: u64,
}

/// Convert the master and every declared size variant of an item.
///
/// Variants are converted from their own files so their dimensions match
/// what the host declared; a variant whose file is gone is re-derived from
/// the master, fitted to the declared dimensions. On any failure the files
/// written so far are removed.
pub fn convert_item(
    encoder: &dyn Encoder,
    uploads: &UploadDir,
    meta: &MediaMeta,
    options: &EncodeOptions,
) -> Result<ConversionArtifact> {
    let ext = options.format.extension();
    let new_file = with_extension(&meta.file, ext);
    if new_file == meta.file {
        return Err(EncodeError::EncodeFailed(format!("{} already has the target extension", meta.file)).into());
    }

    let source = uploads.resolve(&meta.file)?;
    let dest = uploads.resolve(&new_file)?;
    let master_stats = encoder.encode(&source, &dest, options)?;

    let mut written = vec![new_file.clone()];
    let mut total_original_bytes = master_stats.original_bytes;
    let mut total_new_bytes = master_stats.new_bytes;
    let mut sizes = std::collections::BTreeMap::new();
    // Output path -> the source it was converted from
    let mut produced_from = std::collections::BTreeMap::from([(new_file.clone(), meta.file.clone())]);

    let variant_options = EncodeOptions {
        preserve_dimensions: true,
        skip_animated: false,
        ..options.clone()
    };

    for (name, variant) in &meta.sizes {
        let old_rel = meta.variant_path(variant);
        let new_name = with_extension(&variant.file, ext);
        let new_rel = format!("{}{}", meta.dir_prefix(), new_name);

        // Never overwrite output converted from a different source. The
        // clash is left in the metadata for the URL map to reject.
        if let Some(from) = produced_from.get(&new_rel) {
            if *from != old_rel {
                log::warn!(
                    "Size '{}' of {} would overwrite {} (converted from {}); not encoded",
                    name,
                    meta.file,
                    new_rel,
                    from
                );
                sizes.insert(
                    name.clone(),
                    SizeVariant { file: new_name, width: variant.width, height: variant.height },
                );
                continue;
            }
        }

        let result = uploads.resolve(&old_rel).and_then(|old_path| {
            let new_path = uploads.resolve(&new_rel)?;
            let stats = if old_path.exists() {
                encoder.encode(&old_path, &new_path, &variant_options)?
            } else {
                let derive_options = EncodeOptions {
                    preserve_dimensions: false,
                    skip_animated: false,
                    max_width: variant.width,
                    max_height: variant.height,
                    ..options.clone()
                };
                encoder.encode(&source, &new_path, &derive_options)?
            };
            Ok(stats)
        });

        match result {
            Ok(stats) => {
                if !written.contains(&new_rel) {
                    written.push(new_rel.clone());
                }
                produced_from.insert(new_rel.clone(), old_rel.clone());
                total_original_bytes += stats.original_bytes;
                total_new_bytes += stats.new_bytes;
                sizes.insert(
                    name.clone(),
                    SizeVariant {
                        file: new_name,
                        width: stats.new_dims.width,
                        height: stats.new_dims.height,
                    },
                );
            }
            Err(e) => {
                remove_written(uploads, &written);
                return Err(match e {
                    MigratorError::Encode(inner) => MigratorError::Encode(EncodeError::EncodeFailed(
                        format!("size '{}': {}", name, inner),
                    )),
                    other => other,
                });
            }
        }
    }

    Ok(ConversionArtifact {
        new_meta: MediaMeta {
            file: new_file,
            width: master_stats.new_dims.width,
            height: master_stats.new_dims.height,
            sizes,
        },
        master_stats,
        written,
        total_original_bytes,
        total_new_bytes,
    })
}

/// Best-effort removal of converted files.
pub fn remove_written(uploads: &UploadDir, written: &[String]) {
    for rel in written {
        if let Ok(path) = uploads.resolve(rel) {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    log::warn!("Could not remove {}: {}", path.display(), e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_within_preserves_aspect() {
        let d = fit_within(Dimensions::new(4000, 3000), 2000, 0);
        assert_eq!(d, Dimensions::new(2000, 1500));

        let d = fit_within(Dimensions::new(4000, 3000), 2000, 1000);
        assert_eq!(d, Dimensions::new(1333, 1000));

        let d = fit_within(Dimensions::new(3000, 4000), 0, 2000);
        assert_eq!(d, Dimensions::new(1500, 2000));
    }

    #[test]
    fn test_fit_within_never_upscales() {
        let d = fit_within(Dimensions::new(800, 600), 2000, 2000);
        assert_eq!(d, Dimensions::new(800, 600));
        let d = fit_within(Dimensions::new(800, 600), 0, 0);
        assert_eq!(d, Dimensions::new(800, 600));
    }

    #[test]
    fn test_target_dimensions_respects_preserve() {
        let mut options = EncodeOptions {
            format: TargetFormat::Webp,
            quality: 80,
            max_width: 400,
            max_height: 0,
            preserve_dimensions: true,
            skip_animated: true,
        };
        assert_eq!(target_dimensions(Dimensions::new(800, 600), &options), (Dimensions::new(800, 600), false));

        options.preserve_dimensions = false;
        assert_eq!(target_dimensions(Dimensions::new(800, 600), &options), (Dimensions::new(400, 300), true));
    }

    #[test]
    fn test_with_extension() {
        assert_eq!(with_extension("2024/01/pic.jpg", "webp"), "2024/01/pic.webp");
        assert_eq!(with_extension("pic-150x150.jpeg", "avif"), "pic-150x150.avif");
        assert_eq!(with_extension("2024/01/my.photo.png", "webp"), "2024/01/my.photo.webp");
        assert_eq!(with_extension("2024/01/noext", "webp"), "2024/01/noext.webp");
        assert_eq!(with_extension("dir.v2/file", "webp"), "dir.v2/file.webp");
    }

    #[test]
    fn test_compression_ratio() {
        assert_eq!(compression_ratio(0, 10), 0.0);
        assert!((compression_ratio(200, 50) - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_variant_never_overwrites_master_output() {
        use crate::testutil::{image_bytes, FakeEncoder, Fixture};

        let fx = Fixture::new();
        fx.write_file("2024/01/pic.jpg", &image_bytes(800, 600));
        fx.write_file("2024/01/pic.png", &image_bytes(300, 200));
        let mut meta = MediaMeta { file: "2024/01/pic.jpg".to_string(), width: 800, height: 600, ..Default::default() };
        meta.sizes.insert("medium".to_string(), SizeVariant { file: "pic.png".to_string(), width: 300, height: 200 });
        let options = EncodeOptions {
            format: TargetFormat::Webp,
            quality: 80,
            max_width: 0,
            max_height: 0,
            preserve_dimensions: false,
            skip_animated: true,
        };

        let artifact = convert_item(&FakeEncoder::default(), &fx.uploads, &meta, &options).unwrap();
        assert_eq!(artifact.written, vec!["2024/01/pic.webp".to_string()]);
        assert_eq!(std::fs::read_to_string(fx.root().join("2024/01/pic.webp")).unwrap(), "WEBP 800x600");
        assert_eq!(artifact.new_meta.sizes["medium"].file, "pic.webp");
    }
}

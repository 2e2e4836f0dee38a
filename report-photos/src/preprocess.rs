//! Client-side shrinking of oversized photos before they enter the queue.

use crate::config::ImageLimits;
use crate::model::PhotoFile;
use anyhow::{Context, Result};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GenericImageView};

pub fn needs_compression(file: &PhotoFile, threshold: u64) -> bool {
    file.len() as u64 > threshold
}

/// Re-encode `file` within `limits`. Falls back to the original bytes when the
/// payload is not a decodable image or the result would not be smaller.
pub async fn shrink(file: PhotoFile, limits: ImageLimits) -> PhotoFile {
    let original = file.clone();
    let joined = tokio::task::spawn_blocking(move || reencode(&file, &limits)).await;
    match joined {
        Ok(Ok(smaller)) if smaller.len() < original.len() => {
            tracing::debug!(name = %original.name, before = original.len(), after = smaller.len(), "photo re-encoded");
            smaller
        }
        Ok(Ok(_)) => {
            tracing::debug!(name = %original.name, "re-encode did not shrink photo; keeping original");
            original
        }
        Ok(Err(e)) => {
            tracing::warn!(name = %original.name, error = %e, "local compression failed; uploading original");
            original
        }
        Err(e) => {
            tracing::warn!(name = %original.name, error = %e, "compression task panicked; uploading original");
            original
        }
    }
}

fn reencode(file: &PhotoFile, limits: &ImageLimits) -> Result<PhotoFile> {
    let mut img = image::load_from_memory(&file.bytes).context("decoding photo")?;
    if let Some(tag) = extract_exif_orientation(&file.bytes) {
        img = apply_exif_orientation(img, tag);
    }
    img = downscale_to_limits(img, limits);
    let quality = limits.jpeg_quality.unwrap_or(82).clamp(1, 100);
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(&img.to_rgb8())
        .context("encoding jpeg")?;
    Ok(PhotoFile {
        name: jpeg_name(&file.name),
        content_type: mime::IMAGE_JPEG.essence_str().to_string(),
        bytes: Bytes::from(out),
    })
}

fn jpeg_name(name: &str) -> String {
    let stem = match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    };
    format!("{stem}.jpg")
}

/// EXIF orientation (1,3,6,8) if present.
fn extract_exif_orientation(bytes: &[u8]) -> Option<u16> {
    let mut cursor = std::io::Cursor::new(bytes);
    let reader = exif::Reader::new().read_from_container(&mut cursor).ok()?;
    let field = reader.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
    field.value.get_uint(0).and_then(|v| u16::try_from(v).ok())
}

/// Re-encoding drops EXIF, so bake the orientation into the pixels.
fn apply_exif_orientation(img: DynamicImage, tag: u16) -> DynamicImage {
    match tag {
        3 => img.rotate180(),
        6 => img.rotate90(),
        8 => img.rotate270(),
        // mirrored variants (2,4,5,7) are rare on phone cameras
        _ => img,
    }
}

fn downscale_to_limits(img: DynamicImage, limits: &ImageLimits) -> DynamicImage {
    if limits.max_width.is_none() && limits.max_height.is_none() {
        return img;
    }
    let (w, h) = img.dimensions();
    let mw = limits.max_width.unwrap_or(w);
    let mh = limits.max_height.unwrap_or(h);
    if w <= mw && h <= mh {
        return img;
    }
    // resize preserves aspect ratio and fits inside the box
    img.resize(mw, mh, image::imageops::FilterType::CatmullRom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};

    fn png_bytes(w: u32, h: u32) -> Bytes {
        let mut img = RgbImage::new(w, h);
        for (x, y, px) in img.enumerate_pixels_mut() {
            *px = image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x * y) % 256) as u8]);
        }
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        Bytes::from(out)
    }

    #[test]
    fn threshold_is_exclusive() {
        let f = PhotoFile::new("a.jpg", None, Bytes::from(vec![0u8; 10]));
        assert!(!needs_compression(&f, 10));
        assert!(needs_compression(&f, 9));
    }

    #[tokio::test]
    async fn shrinks_large_png_to_bounded_jpeg() {
        let file = PhotoFile::new("meter.png", None, png_bytes(400, 200));
        let limits = ImageLimits {
            max_width: Some(100),
            max_height: Some(100),
            jpeg_quality: Some(60),
        };
        let out = shrink(file.clone(), limits).await;
        assert!(out.len() < file.len());
        assert_eq!(out.name, "meter.jpg");
        assert_eq!(out.content_type, "image/jpeg");
        let decoded = image::load_from_memory(&out.bytes).unwrap();
        assert_eq!(decoded.dimensions(), (100, 50));
    }

    #[tokio::test]
    async fn undecodable_payload_is_kept() {
        let file = PhotoFile::new("scan.jpg", None, Bytes::from(vec![0u8; 4096]));
        let out = shrink(file.clone(), ImageLimits::default()).await;
        assert_eq!(out.bytes, file.bytes);
        assert_eq!(out.name, "scan.jpg");
    }

    #[test]
    fn downscale_leaves_small_images_alone() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(50, 40));
        let out = downscale_to_limits(img, &ImageLimits::default());
        assert_eq!(out.dimensions(), (50, 40));
    }

    #[test]
    fn jpeg_name_swaps_extension() {
        assert_eq!(jpeg_name("IMG_001.HEIC"), "IMG_001.jpg");
        assert_eq!(jpeg_name("noext"), "noext.jpg");
        assert_eq!(jpeg_name(".hidden"), ".hidden.jpg");
    }
}

//! Wire encoding of multipart payloads

use bytes::Bytes;
use image::{codecs::jpeg::JpegEncoder, ImageFormat};
use tracing::warn;

use crate::config::WireFormat;

const DEFAULT_CONTENT_TYPE: &str = "image/png";

/// Content type and bytes to send for a stored payload.
///
/// PNG passes stored bytes through, labelled with their sniffed type. JPEG
/// re-encodes on a blocking thread unless the bytes already are JPEG; a
/// failed re-encode falls back to the stored bytes.
pub async fn prepare(payload: Bytes, format: WireFormat, quality: u8) -> (&'static str, Bytes) {
    if payload.is_empty() {
        return (content_type_for(format), payload);
    }

    let detected = image::guess_format(&payload).ok();
    let stored_type = detected.map_or(DEFAULT_CONTENT_TYPE, mime_type);

    match format {
        WireFormat::Png => (stored_type, payload),
        WireFormat::Jpeg if detected == Some(ImageFormat::Jpeg) => ("image/jpeg", payload),
        WireFormat::Jpeg => {
            let source = payload.clone();
            match tokio::task::spawn_blocking(move || encode_jpeg(&source, quality)).await {
                Ok(Ok(jpeg)) => ("image/jpeg", jpeg),
                Ok(Err(e)) => {
                    warn!("JPEG re-encode failed, sending stored frame: {}", e);
                    (stored_type, payload)
                }
                Err(e) => {
                    warn!("JPEG re-encode task failed: {}", e);
                    (stored_type, payload)
                }
            }
        }
    }
}

fn content_type_for(format: WireFormat) -> &'static str {
    match format {
        WireFormat::Png => DEFAULT_CONTENT_TYPE,
        WireFormat::Jpeg => "image/jpeg",
    }
}

fn mime_type(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "image/jpeg",
        ImageFormat::Gif => "image/gif",
        ImageFormat::WebP => "image/webp",
        ImageFormat::Bmp => "image/bmp",
        _ => DEFAULT_CONTENT_TYPE,
    }
}

fn encode_jpeg(source: &[u8], quality: u8) -> Result<Bytes, image::ImageError> {
    let image = image::load_from_memory(source)?.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality).encode_image(&image)?;
    Ok(Bytes::from(out))
}

use std::{pin::pin, time::Duration};

use futures::StreamExt;
use image::{
    DynamicImage, ExtendedColorType, ImageEncoder, Rgb, RgbImage, Rgba,
    codecs::png::{CompressionType, FilterType, PngEncoder},
};
use tracing::debug;

use crate::relay::{FetchDest, RelayError, browser_headers, build_content_disposition};

const MAX_THUMBNAIL_BYTES: usize = 25 * 1024 * 1024;

pub struct PngThumbnail {
    pub filename: String,
    pub content_disposition: String,
    pub data: Vec<u8>,
}

/// Downloads an image of any supported encoding and re-encodes it as an
/// opaque RGB PNG. Every failure, including the fetch itself, is reported as
/// [`RelayError::Conversion`].
pub async fn fetch_and_convert_to_png(
    client: &reqwest::Client,
    source_url: &str,
    filename: &str,
    timeout: Duration,
) -> Result<PngThumbnail, RelayError> {
    let response = client
        .get(source_url)
        .headers(browser_headers(FetchDest::Image))
        .timeout(timeout)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(conversion_failure)?;

    let payload = read_capped(response, MAX_THUMBNAIL_BYTES).await?;

    let data = tokio::task::spawn_blocking(move || encode_opaque_png(&payload))
        .await
        .map_err(conversion_failure)?
        .map_err(conversion_failure)?;

    let filename = png_filename(filename);
    debug!("Converted thumbnail {} ({} bytes)", filename, data.len());

    Ok(PngThumbnail {
        content_disposition: build_content_disposition(&filename),
        filename,
        data,
    })
}

/// Buffers the response body, giving up as soon as it grows past `limit`
/// bytes. A declared `Content-Length` over the limit fails before any read.
async fn read_capped(response: reqwest::Response, limit: usize) -> Result<Vec<u8>, RelayError> {
    let too_large = || RelayError::Conversion(format!("image is larger than {limit} bytes"));

    if response
        .content_length()
        .is_some_and(|length| length > limit as u64)
    {
        return Err(too_large());
    }

    let mut payload = Vec::new();
    let mut chunks = pin!(response.bytes_stream());
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(conversion_failure)?;
        if payload.len() + chunk.len() > limit {
            return Err(too_large());
        }
        payload.extend_from_slice(&chunk);
    }
    Ok(payload)
}

pub fn encode_opaque_png(payload: &[u8]) -> Result<Vec<u8>, image::ImageError> {
    let decoded = image::load_from_memory(payload)?;
    let flattened = flatten_onto_white(&decoded);

    let mut buffer = Vec::new();
    PngEncoder::new_with_quality(&mut buffer, CompressionType::Best, FilterType::Adaptive)
        .write_image(
            flattened.as_raw(),
            flattened.width(),
            flattened.height(),
            ExtendedColorType::Rgb8,
        )?;
    Ok(buffer)
}

/// Composites images with an alpha channel onto white using that channel as
/// the mask. Palette images are expanded by the decoders, so a transparent
/// palette entry arrives here as alpha.
fn flatten_onto_white(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }

    let rgba = image.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let Rgba([red, green, blue, alpha]) = *rgba.get_pixel(x, y);
        Rgb([
            over_white(red, alpha),
            over_white(green, alpha),
            over_white(blue, alpha),
        ])
    })
}

fn over_white(channel: u8, alpha: u8) -> u8 {
    let (channel, alpha) = (u32::from(channel), u32::from(alpha));
    ((channel * alpha + 255 * (255 - alpha) + 127) / 255) as u8
}

/// Forces a `.png` extension, replacing whatever the caller declared.
pub fn png_filename(filename: &str) -> String {
    if filename.ends_with(".png") {
        return filename.to_string();
    }

    match filename.rsplit_once('.') {
        Some((stem, _)) => format!("{stem}.png"),
        None => format!("{filename}.png"),
    }
}

fn conversion_failure(error: impl std::fmt::Display) -> RelayError {
    RelayError::Conversion(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve;
    use axum::{
        Router,
        body::{Body, Bytes},
        http::StatusCode,
        routing::get,
    };
    use image::{ColorType, GrayAlphaImage, ImageFormat, LumaA, RgbaImage};
    use std::io::{self, Cursor};

    fn encode(image: DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, format).unwrap();
        buffer.into_inner()
    }

    /// Chunked body with no `Content-Length` that never ends on its own.
    fn endless_body() -> Body {
        Body::from_stream(futures::stream::repeat_with(|| {
            Ok::<_, io::Error>(Bytes::from(vec![0u8; 1024 * 1024]))
        }))
    }

    fn half_transparent() -> DynamicImage {
        let mut image = RgbaImage::from_pixel(4, 2, Rgba([200, 10, 10, 255]));
        for x in 0..4 {
            image.put_pixel(x, 1, Rgba([0, 0, 0, 0]));
        }
        DynamicImage::ImageRgba8(image)
    }

    #[test]
    fn transparent_pixels_become_white() {
        let png = encode_opaque_png(&encode(half_transparent(), ImageFormat::Png)).unwrap();
        let decoded = image::load_from_memory_with_format(&png, ImageFormat::Png).unwrap();

        assert_eq!(decoded.color(), ColorType::Rgb8);
        let rgb = decoded.to_rgb8();
        assert_eq!(*rgb.get_pixel(0, 0), Rgb([200, 10, 10]));
        assert_eq!(*rgb.get_pixel(3, 1), Rgb([255, 255, 255]));
    }

    #[test]
    fn transparent_palette_index_becomes_white() {
        let gif = encode(half_transparent(), ImageFormat::Gif);
        let source = image::load_from_memory_with_format(&gif, ImageFormat::Gif).unwrap();
        assert!(source.color().has_alpha());

        let png = encode_opaque_png(&gif).unwrap();
        let decoded = image::load_from_memory_with_format(&png, ImageFormat::Png).unwrap();

        assert_eq!(decoded.color(), ColorType::Rgb8);
        let rgb = decoded.to_rgb8();
        assert_eq!(*rgb.get_pixel(1, 0), Rgb([200, 10, 10]));
        for x in 0..4 {
            assert_eq!(*rgb.get_pixel(x, 1), Rgb([255, 255, 255]));
        }
    }

    #[test]
    fn gray_alpha_is_flattened_onto_white() {
        let mut gray = GrayAlphaImage::from_pixel(3, 1, LumaA([100, 255]));
        gray.put_pixel(1, 0, LumaA([100, 0]));
        gray.put_pixel(2, 0, LumaA([0, 128]));
        let png = encode_opaque_png(&encode(DynamicImage::ImageLumaA8(gray), ImageFormat::Png))
            .unwrap();
        let decoded = image::load_from_memory(&png).unwrap();

        assert_eq!(decoded.color(), ColorType::Rgb8);
        let rgb = decoded.to_rgb8();
        assert_eq!(*rgb.get_pixel(0, 0), Rgb([100, 100, 100]));
        assert_eq!(*rgb.get_pixel(1, 0), Rgb([255, 255, 255]));
        assert_eq!(*rgb.get_pixel(2, 0), Rgb([127, 127, 127]));
    }

    #[test]
    fn partial_alpha_is_blended() {
        assert_eq!(over_white(0, 128), 127);
        assert_eq!(over_white(90, 255), 90);
        assert_eq!(over_white(90, 0), 255);
    }

    #[test]
    fn opaque_rgb_pixels_survive_reencoding() {
        let source = RgbImage::from_fn(5, 3, |x, y| Rgb([x as u8 * 40, y as u8 * 80, 17]));
        let bmp = encode(DynamicImage::ImageRgb8(source.clone()), ImageFormat::Bmp);

        let png = encode_opaque_png(&bmp).unwrap();
        let decoded = image::load_from_memory_with_format(&png, ImageFormat::Png).unwrap();
        assert_eq!(decoded.to_rgb8(), source);
    }

    #[test]
    fn grayscale_is_widened_to_rgb() {
        let gray = DynamicImage::ImageLuma8(image::GrayImage::from_pixel(2, 2, image::Luma([90])));
        let png = encode_opaque_png(&encode(gray, ImageFormat::Png)).unwrap();
        let decoded = image::load_from_memory(&png).unwrap();

        assert_eq!(decoded.color(), ColorType::Rgb8);
        assert_eq!(*decoded.to_rgb8().get_pixel(1, 1), Rgb([90, 90, 90]));
    }

    #[test]
    fn tiff_and_ico_sources_are_converted() {
        for format in [ImageFormat::Tiff, ImageFormat::Ico] {
            let png = encode_opaque_png(&encode(half_transparent(), format)).unwrap();
            let rgb = image::load_from_memory(&png).unwrap().to_rgb8();

            assert_eq!(*rgb.get_pixel(0, 0), Rgb([200, 10, 10]), "{format:?}");
            assert_eq!(*rgb.get_pixel(0, 1), Rgb([255, 255, 255]), "{format:?}");
        }
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(encode_opaque_png(b"definitely not an image").is_err());
    }

    #[test]
    fn extension_is_forced_to_png() {
        assert_eq!(png_filename("cover.jpeg"), "cover.png");
        assert_eq!(png_filename("a.b.webp"), "a.b.png");
        assert_eq!(png_filename("thumbnail.png"), "thumbnail.png");
        assert_eq!(png_filename("noext"), "noext.png");
    }

    #[tokio::test]
    async fn fetches_and_converts_remote_image() {
        let payload = encode(half_transparent(), ImageFormat::Png);
        let router = Router::new()
            .route(
                "/c.webp",
                get(move || {
                    let payload = payload.clone();
                    async move { payload }
                }),
            )
            .route("/gone", get(|| async { StatusCode::NOT_FOUND }));
        let base = serve(router).await;
        let client = reqwest::Client::new();
        let timeout = Duration::from_secs(5);

        let thumbnail =
            fetch_and_convert_to_png(&client, &format!("{base}/c.webp"), "7301.webp", timeout)
                .await
                .unwrap();
        assert_eq!(thumbnail.filename, "7301.png");
        assert!(thumbnail.content_disposition.contains("filename=\"7301.png\""));
        let decoded = image::load_from_memory(&thumbnail.data).unwrap();
        assert_eq!(decoded.color(), ColorType::Rgb8);

        let missing =
            fetch_and_convert_to_png(&client, &format!("{base}/gone"), "x.jpg", timeout).await;
        assert!(matches!(missing, Err(RelayError::Conversion(_))));
    }

    #[tokio::test]
    async fn body_is_capped_while_streaming() {
        let router = Router::new()
            .route("/endless", get(|| async { endless_body() }))
            .route("/small", get(|| async { vec![1u8; 3000] }));
        let base = serve(router).await;
        let client = reqwest::Client::new();

        let response = client.get(format!("{base}/endless")).send().await.unwrap();
        assert!(response.content_length().is_none());
        let capped = tokio::time::timeout(
            Duration::from_secs(10),
            read_capped(response, 3 * 1024 * 1024),
        )
        .await
        .unwrap();
        assert!(
            matches!(capped, Err(RelayError::Conversion(reason)) if reason.contains("larger than"))
        );

        let response = client.get(format!("{base}/small")).send().await.unwrap();
        assert_eq!(read_capped(response, 3000).await.unwrap().len(), 3000);

        let response = client.get(format!("{base}/small")).send().await.unwrap();
        assert!(matches!(
            read_capped(response, 2999).await,
            Err(RelayError::Conversion(_))
        ));
    }

    #[tokio::test]
    async fn oversized_chunked_image_is_refused() {
        let router = Router::new().route("/huge.jpg", get(|| async { endless_body() }));
        let base = serve(router).await;

        let result = fetch_and_convert_to_png(
            &reqwest::Client::new(),
            &format!("{base}/huge.jpg"),
            "huge.jpg",
            Duration::from_secs(30),
        )
        .await;
        assert!(
            matches!(result, Err(RelayError::Conversion(reason)) if reason.contains("larger than"))
        );
    }
}

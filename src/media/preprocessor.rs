use std::io::Cursor;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::queue::SourceFile;

/// 压缩降尺寸的下限，避免字节上限过小导致无限缩图
const MIN_COMPRESS_DIMENSION: u32 = 64;

#[derive(Error, Debug)]
pub enum PreprocessError {
    /// 文件本身无法解码（损坏或编解码器不支持），重试无意义
    #[error("image decode failed: {0}")]
    Decode(String),

    #[error("image encode failed: {0}")]
    Encode(String),

    /// 瞬时资源不足，可重试
    #[error("resource limit during processing: {0}")]
    Resource(String),
}

/// 预处理配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PreprocessConfig {
    /// 关闭后所有文件原样透传
    pub enabled: bool,
    /// 压缩产物长边上限（像素）
    pub max_dimension: u32,
    /// 压缩产物字节上限，优先级高于质量
    pub max_bytes: usize,
    /// JPEG 起始质量
    pub quality: u8,
    /// 缩略图长边上限（像素）
    pub thumbnail_dimension: u32,
    /// 缩略图 JPEG 质量
    pub thumbnail_quality: u8,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_dimension: 1920,
            max_bytes: 1024 * 1024, // 1MB
            quality: 80,
            thumbnail_dimension: 300,
            thumbnail_quality: 75,
        }
    }
}

/// 解码得到的图片元信息
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: f64,
    pub size_bytes: u64,
    pub format: String,
}

/// 一个预处理产物：字节 + 内容类型 + 元信息
#[derive(Debug, Clone)]
pub struct ProcessedMedia {
    pub data: Bytes,
    pub content_type: String,
    pub metadata: ImageMetadata,
}

/// 预处理结果；非图片输入三项都为 None（原样透传）
#[derive(Debug, Clone, Default)]
pub struct PreprocessOutput {
    /// 源图元信息
    pub source: Option<ImageMetadata>,
    /// 压缩产物
    pub processed: Option<ProcessedMedia>,
    /// 缩略图，固定 JPEG
    pub thumbnail: Option<ProcessedMedia>,
}

impl PreprocessOutput {
    pub fn is_passthrough(&self) -> bool {
        self.processed.is_none() && self.thumbnail.is_none()
    }
}

/// 图片预处理器：压缩 + 缩略图，纯转换，不做网络 IO
///
/// 解码编码都是 CPU 密集操作，异步环境下通过 `spawn_blocking` 调用。
pub struct MediaPreprocessor {
    config: PreprocessConfig,
}

impl MediaPreprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    /// 支持的位图格式
    pub fn is_supported_image(content_type: &str) -> bool {
        matches!(
            content_type,
            "image/jpeg" | "image/jpg" | "image/png" | "image/webp" | "image/gif"
        )
    }

    /// 预处理入口：不支持的类型原样透传，永远不报错
    pub fn process(&self, file: &SourceFile) -> Result<PreprocessOutput, PreprocessError> {
        if !self.config.enabled || !Self::is_supported_image(&file.content_type) {
            return Ok(PreprocessOutput::default());
        }

        let reader = ImageReader::new(Cursor::new(file.data.as_ref()))
            .with_guessed_format()
            .map_err(|err| PreprocessError::Decode(err.to_string()))?;
        let format = reader
            .format()
            .map(|f| format!("{f:?}"))
            .unwrap_or_else(|| "unknown".to_string());
        let img = reader
            .decode()
            .map_err(|err| PreprocessError::Decode(err.to_string()))?;

        let (width, height) = img.dimensions();
        let source = ImageMetadata {
            width,
            height,
            aspect_ratio: width as f64 / height.max(1) as f64,
            size_bytes: file.size(),
            format,
        };

        tracing::debug!(
            name = %file.name,
            width,
            height,
            format = %source.format,
            "preprocessing image"
        );

        let processed = self.compress(&img)?;
        let thumbnail = self.thumbnail(&img)?;

        Ok(PreprocessOutput {
            source: Some(source),
            processed: Some(processed),
            thumbnail: Some(thumbnail),
        })
    }

    /// 压缩：先按长边上限缩放，再沿质量阶梯下探；
    /// 仍超出字节上限时按 0.7 比例继续降尺寸（尺寸/字节约束优先于质量）
    fn compress(&self, img: &DynamicImage) -> Result<ProcessedMedia, PreprocessError> {
        let mut qualities = vec![self.config.quality];
        for q in [60u8, 45, 30] {
            if q < *qualities.last().unwrap_or(&0) {
                qualities.push(q);
            }
        }

        let mut current = fit_within(img, self.config.max_dimension, FilterType::Lanczos3);
        loop {
            let mut encoded = Vec::new();
            for &quality in &qualities {
                encoded = encode_jpeg(&current, quality)?;
                if encoded.len() <= self.config.max_bytes {
                    return Ok(jpeg_media(encoded, &current));
                }
            }

            let (w, h) = current.dimensions();
            if w.max(h) <= MIN_COMPRESS_DIMENSION {
                // 尺寸已到下限，接受最后一次编码结果
                return Ok(jpeg_media(encoded, &current));
            }
            current = current.resize(
                (w * 7 / 10).max(1),
                (h * 7 / 10).max(1),
                FilterType::Lanczos3,
            );
        }
    }

    /// 缩略图：固定重编码为 JPEG，下游处理可预期
    fn thumbnail(&self, img: &DynamicImage) -> Result<ProcessedMedia, PreprocessError> {
        let thumb = fit_within(img, self.config.thumbnail_dimension, FilterType::Triangle);
        let encoded = encode_jpeg(&thumb, self.config.thumbnail_quality)?;
        Ok(jpeg_media(encoded, &thumb))
    }
}

/// 长边超过 cap 时等比缩放到界内，不放大小图
fn fit_within(img: &DynamicImage, cap: u32, filter: FilterType) -> DynamicImage {
    let (w, h) = img.dimensions();
    if w.max(h) <= cap {
        img.clone()
    } else {
        img.resize(cap, cap, filter)
    }
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, PreprocessError> {
    let mut buffer = Vec::new();
    let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut buffer), quality);
    // JPEG 不带 alpha 通道，先转 RGB
    img.to_rgb8()
        .write_with_encoder(encoder)
        .map_err(|err| PreprocessError::Encode(err.to_string()))?;
    Ok(buffer)
}

fn jpeg_media(encoded: Vec<u8>, img: &DynamicImage) -> ProcessedMedia {
    let (width, height) = img.dimensions();
    ProcessedMedia {
        metadata: ImageMetadata {
            width,
            height,
            aspect_ratio: width as f64 / height.max(1) as f64,
            size_bytes: encoded.len() as u64,
            format: "Jpeg".to_string(),
        },
        content_type: "image/jpeg".to_string(),
        data: Bytes::from(encoded),
    }
}

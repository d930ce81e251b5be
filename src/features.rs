//! Typed request payloads for the preset features.
//!
//! These are conveniences for building well-formed requests. The call path
//! only ever sees them as JSON objects, so any other `Serialize` type (or a
//! plain `serde_json::Value`) works just as well.
//!
//! Every field is optional and omitted from the wire when unset; workers
//! apply their own defaults.

use serde::{Deserialize, Serialize};

/// Lifecycle of a video job as reported by the video workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    Queueing,
    Processing,
    Rendering,
    Completed,
    Failed,
}

/// Transformation mode of a video-lite job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VideoMode {
    #[serde(rename = "fusion")]
    Fusion,
    #[serde(rename = "hugging")]
    Hugging,
    /// Image to video.
    #[default]
    #[serde(rename = "i2v")]
    ImageToVideo,
    /// Image to video, premium pipeline.
    #[serde(rename = "i2vp")]
    ImageToVideoPremium,
    #[serde(rename = "kissing")]
    Kissing,
    #[serde(rename = "muscle")]
    Muscle,
    #[serde(rename = "passionateKissing")]
    PassionateKissing,
    /// Text to GIF.
    #[serde(rename = "t2g")]
    TextToGif,
}

/// Video generation request (`video-lite` preset).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoLiteRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_status: Option<VideoStatus>,

    /// Primary input reference. Its file name ends up in the output path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<VideoMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub morph_files: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub positive_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background_prompt: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance_scale: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_size: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_image_caption: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_frame_interpolation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_swapface: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_inpaint: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upscaler_x_times: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub lora_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_options: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_assistant: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

/// Image-to-image request (`image2image` preset).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image2ImageRequest {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// Image combination request (`combineImages` preset). All fields required.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombineImageRequest {
    pub file: String,
    pub another_file: String,
    pub style_combine_background: String,
    pub prompt: String,
}

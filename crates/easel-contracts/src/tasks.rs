use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Image-to-image strength used by "variations" of a previous result.
pub const VARIATIONS_STRENGTH: f64 = 0.5;

/// Object-store bucket a result lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageCategory {
    Generated,
    Uploaded,
    Edited,
}

impl ImageCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageCategory::Generated => "generated",
            ImageCategory::Uploaded => "uploaded",
            ImageCategory::Edited => "edited",
        }
    }
}

impl fmt::Display for ImageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a backend needs to run one operation. Images travel as paths;
/// raw bytes never cross this boundary so the task stays audit-safe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum ImageTask {
    TextToImage {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        negative_prompt: Option<String>,
        aspect_ratio: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        style_preset: Option<String>,
    },
    StyleTransfer {
        init_image: PathBuf,
        style_image: PathBuf,
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        negative_prompt: Option<String>,
        style_strength: f64,
        composition_fidelity: f64,
        change_strength: f64,
    },
    StyleGuide {
        style_image: PathBuf,
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        negative_prompt: Option<String>,
        aspect_ratio: String,
        fidelity: f64,
    },
    Sketch {
        sketch_image: PathBuf,
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        negative_prompt: Option<String>,
        control_strength: f64,
    },
    Inpaint {
        image: PathBuf,
        mask: PathBuf,
        prompt: String,
    },
    Upscale {
        image: PathBuf,
    },
    RemoveBackground {
        image: PathBuf,
    },
    Variations {
        image: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        strength: f64,
    },
}

impl ImageTask {
    pub fn kind(&self) -> &'static str {
        match self {
            ImageTask::TextToImage { .. } => "text_to_image",
            ImageTask::StyleTransfer { .. } => "style_transfer",
            ImageTask::StyleGuide { .. } => "style_guide",
            ImageTask::Sketch { .. } => "sketch",
            ImageTask::Inpaint { .. } => "inpaint",
            ImageTask::Upscale { .. } => "upscale",
            ImageTask::RemoveBackground { .. } => "remove_background",
            ImageTask::Variations { .. } => "variations",
        }
    }

    pub fn prompt(&self) -> Option<&str> {
        match self {
            ImageTask::TextToImage { prompt, .. }
            | ImageTask::StyleTransfer { prompt, .. }
            | ImageTask::StyleGuide { prompt, .. }
            | ImageTask::Sketch { prompt, .. }
            | ImageTask::Inpaint { prompt, .. } => Some(prompt),
            ImageTask::Variations { prompt, .. } => prompt.as_deref(),
            ImageTask::Upscale { .. } | ImageTask::RemoveBackground { .. } => None,
        }
    }

    pub fn prompt_mut(&mut self) -> Option<&mut String> {
        match self {
            ImageTask::TextToImage { prompt, .. }
            | ImageTask::StyleTransfer { prompt, .. }
            | ImageTask::StyleGuide { prompt, .. }
            | ImageTask::Sketch { prompt, .. }
            | ImageTask::Inpaint { prompt, .. } => Some(prompt),
            ImageTask::Variations { prompt, .. } => prompt.as_mut(),
            ImageTask::Upscale { .. } | ImageTask::RemoveBackground { .. } => None,
        }
    }

    /// Tasks whose output alpha channel carries meaning; watermarking
    /// would destroy it.
    pub fn preserves_alpha(&self) -> bool {
        matches!(self, ImageTask::RemoveBackground { .. })
    }

    /// Default bucket for this task's output.
    pub fn category(&self) -> ImageCategory {
        match self {
            ImageTask::TextToImage { .. }
            | ImageTask::StyleTransfer { .. }
            | ImageTask::StyleGuide { .. }
            | ImageTask::Sketch { .. } => ImageCategory::Generated,
            ImageTask::Inpaint { .. }
            | ImageTask::Upscale { .. }
            | ImageTask::RemoveBackground { .. }
            | ImageTask::Variations { .. } => ImageCategory::Edited,
        }
    }
}

/// Prompt tweak behind "more like this": the saved prompt reruns with an
/// explicit nudge away from the previous composition.
pub fn perturb_prompt(prompt: &str) -> String {
    format!("{prompt}, variation, different composition")
}

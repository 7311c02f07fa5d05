use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use easel_contracts::events::AuditLog;
use easel_contracts::history::{GenerationHistory, NewEntry};
use easel_contracts::ledger::{Debit, QuotaLedger};
use easel_contracts::session::{SavedParams, SessionStore};
use easel_contracts::tasks::{ImageCategory, ImageTask};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// Ceiling for one image-generation round trip; upscales are the slowest.
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(90);
const RELAY_TIMEOUT: Duration = Duration::from_secs(10);
/// Unclaimed masks are garbage-collected after this long.
pub const MASK_TTL: Duration = Duration::from_secs(3600);

const TRANSLATOR_MODEL: &str = "gpt-4o";

const WATERMARK_SCALE: f64 = 0.8;
const WATERMARK_ALPHA: u8 = 178;
const WATERMARK_INSET: u32 = 25;

#[derive(Debug, Clone)]
pub struct ProviderImage {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: String,
    pub task: ImageTask,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider}: {env_var} not set")]
    MissingCredentials {
        provider: &'static str,
        env_var: &'static str,
    },
    #[error("{provider} cannot run {task}")]
    Unsupported {
        provider: String,
        task: &'static str,
    },
    #[error("{provider} request failed ({status}): {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("request rejected by the content filter")]
    ContentFiltered,
    #[error("{provider} request timed out")]
    Timeout { provider: &'static str },
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{0}")]
    Decode(String),
    #[error("image encode failed: {0}")]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn supports(&self, task: &ImageTask) -> bool;
    fn generate(&self, request: &ProviderRequest) -> Result<ProviderImage, ProviderError>;
}

#[derive(Default)]
pub struct ImageProviderRegistry {
    providers: BTreeMap<String, Box<dyn ImageProvider>>,
}

impl ImageProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub fn default_provider_registry() -> ImageProviderRegistry {
    let mut registry = ImageProviderRegistry::new();
    registry.register(StabilityProvider::new());
    registry.register(OpenAiImageProvider::new());
    registry.register(DryrunProvider);
    registry
}

/// Offline backend: paints a flat canvas whose color is derived from the
/// prompt, so distinct prompts stay distinguishable in manual runs.
struct DryrunProvider;

impl ImageProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn supports(&self, _task: &ImageTask) -> bool {
        true
    }

    fn generate(&self, request: &ProviderRequest) -> Result<ProviderImage, ProviderError> {
        let (width, height) = dryrun_dims(&request.task);
        let label = request
            .task
            .prompt()
            .map(str::to_string)
            .unwrap_or_else(|| request.task.kind().to_string());
        let (r, g, b) = color_from_prompt(&label, 0);
        let mut canvas = RgbaImage::new(width, height);
        for pixel in canvas.pixels_mut() {
            *pixel = Rgba([r, g, b, 255]);
        }
        encode_png(&DynamicImage::ImageRgba8(canvas))
    }
}

fn dryrun_dims(task: &ImageTask) -> (u32, u32) {
    match task {
        ImageTask::TextToImage { aspect_ratio, .. }
        | ImageTask::StyleGuide { aspect_ratio, .. } => dims_for_aspect(aspect_ratio),
        ImageTask::StyleTransfer { init_image, .. } => source_dims(init_image),
        ImageTask::Sketch { sketch_image, .. } => source_dims(sketch_image),
        ImageTask::Upscale { image } => {
            let (width, height) = source_dims(image);
            (width.saturating_mul(2), height.saturating_mul(2))
        }
        ImageTask::Inpaint { image, .. }
        | ImageTask::RemoveBackground { image }
        | ImageTask::Variations { image, .. } => source_dims(image),
    }
}

fn source_dims(path: &Path) -> (u32, u32) {
    image::image_dimensions(path).unwrap_or((1024, 1024))
}

struct StabilityProvider {
    api_base: String,
    http: HttpClient,
}

impl StabilityProvider {
    fn new() -> Self {
        Self {
            api_base: env::var("STABILITY_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://api.stability.ai".to_string()),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("STABILITY_API_KEY")
    }

    fn endpoint(&self, tail: &str) -> String {
        format!("{}/v2beta/stable-image/{tail}", self.api_base)
    }

    fn request_parts(
        &self,
        request: &ProviderRequest,
    ) -> Result<(String, MultipartForm), ProviderError> {
        match &request.task {
            ImageTask::TextToImage {
                prompt,
                negative_prompt,
                aspect_ratio,
                style_preset,
            } => {
                let mut form = MultipartForm::new()
                    .text("prompt", prompt.clone())
                    .text("model", request.model.clone())
                    .text("aspect_ratio", aspect_ratio.clone())
                    .text("output_format", "png");
                if let Some(style) = non_empty(style_preset) {
                    if style != "none" {
                        form = form.text("style_preset", style);
                    }
                }
                if let Some(negative) = non_empty(negative_prompt) {
                    form = form.text("negative_prompt", negative);
                }
                Ok((self.endpoint("generate/sd3"), form))
            }
            ImageTask::StyleTransfer {
                init_image,
                style_image,
                prompt,
                negative_prompt,
                style_strength,
                composition_fidelity,
                change_strength,
            } => {
                let mut form = MultipartForm::new()
                    .part("image", image_part(init_image, "image.png")?)
                    .part("style_image", image_part(style_image, "style.png")?)
                    .text("prompt", prompt.clone())
                    .text("output_format", "png")
                    .text("style_strength", style_strength.to_string())
                    .text("composition_fidelity", composition_fidelity.to_string())
                    .text("change_strength", change_strength.to_string())
                    .text("seed", "0");
                if let Some(negative) = non_empty(negative_prompt) {
                    form = form.text("negative_prompt", negative);
                }
                Ok((self.endpoint("control/style"), form))
            }
            ImageTask::StyleGuide {
                style_image,
                prompt,
                negative_prompt,
                aspect_ratio,
                fidelity,
            } => {
                let mut form = MultipartForm::new()
                    .part("image", image_part(style_image, "image.png")?)
                    .text("prompt", prompt.clone())
                    .text("aspect_ratio", aspect_ratio.clone())
                    .text("fidelity", fidelity.to_string())
                    .text("output_format", "png");
                if let Some(negative) = non_empty(negative_prompt) {
                    form = form.text("negative_prompt", negative);
                }
                Ok((self.endpoint("control/style"), form))
            }
            ImageTask::Sketch {
                sketch_image,
                prompt,
                negative_prompt,
                control_strength,
            } => {
                let mut form = MultipartForm::new()
                    .part("image", image_part(sketch_image, "image.png")?)
                    .text("prompt", prompt.clone())
                    .text("control_strength", control_strength.to_string())
                    .text("output_format", "png");
                if let Some(negative) = non_empty(negative_prompt) {
                    form = form.text("negative_prompt", negative);
                }
                Ok((self.endpoint("control/sketch"), form))
            }
            ImageTask::Inpaint {
                image,
                mask,
                prompt,
            } => {
                let form = MultipartForm::new()
                    .part("image", image_part(image, "image.png")?)
                    .part("mask", image_part(mask, "mask.png")?)
                    .text("prompt", prompt.clone())
                    .text("output_format", "png");
                Ok((self.endpoint("edit/inpaint"), form))
            }
            ImageTask::Upscale { image } => {
                let form = MultipartForm::new()
                    .part("image", image_part(image, "image.png")?)
                    .text("output_format", "png");
                Ok((self.endpoint("upscale/conservative"), form))
            }
            ImageTask::RemoveBackground { image } => {
                let form = MultipartForm::new()
                    .part("image", image_part(image, "image.png")?)
                    .text("output_format", "png");
                Ok((self.endpoint("edit/remove-background"), form))
            }
            ImageTask::Variations {
                image,
                prompt,
                strength,
            } => {
                let prompt = prompt
                    .clone()
                    .unwrap_or_else(|| "variation of this image, slightly different".to_string());
                let form = MultipartForm::new()
                    .part("image", image_part(image, "image.png")?)
                    .text("prompt", prompt)
                    .text("mode", "image-to-image")
                    .text("strength", strength.to_string())
                    .text("model", request.model.clone())
                    .text("output_format", "png");
                Ok((self.endpoint("generate/sd3"), form))
            }
        }
    }
}

impl ImageProvider for StabilityProvider {
    fn name(&self) -> &str {
        "stability"
    }

    fn supports(&self, _task: &ImageTask) -> bool {
        true
    }

    fn generate(&self, request: &ProviderRequest) -> Result<ProviderImage, ProviderError> {
        let Some(api_key) = Self::api_key() else {
            return Err(ProviderError::MissingCredentials {
                provider: "stability",
                env_var: "STABILITY_API_KEY",
            });
        };
        let (endpoint, form) = self.request_parts(request)?;
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&api_key)
            .header("Accept", "image/*")
            .timeout(PROVIDER_TIMEOUT)
            .multipart(form)
            .send()
            .map_err(|err| classify_transport("stability", err))?;
        read_image_response("stability", response)
    }
}

struct OpenAiImageProvider {
    api_base: String,
    http: HttpClient,
}

impl OpenAiImageProvider {
    fn new() -> Self {
        Self {
            api_base: env::var("OPENAI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("OPENAI_API_KEY")
    }
}

impl ImageProvider for OpenAiImageProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn supports(&self, task: &ImageTask) -> bool {
        matches!(task, ImageTask::TextToImage { .. })
    }

    fn generate(&self, request: &ProviderRequest) -> Result<ProviderImage, ProviderError> {
        let ImageTask::TextToImage {
            prompt,
            aspect_ratio,
            ..
        } = &request.task
        else {
            return Err(ProviderError::Unsupported {
                provider: "openai".to_string(),
                task: request.task.kind(),
            });
        };
        let Some(api_key) = Self::api_key() else {
            return Err(ProviderError::MissingCredentials {
                provider: "openai",
                env_var: "OPENAI_API_KEY",
            });
        };

        let endpoint = format!("{}/images/generations", self.api_base);
        let payload = json!({
            "model": request.model,
            "prompt": prompt,
            "n": 1,
            "size": openai_size_for_aspect(aspect_ratio),
            "quality": "standard",
            "response_format": "b64_json",
        });
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&api_key)
            .timeout(PROVIDER_TIMEOUT)
            .json(&payload)
            .send()
            .map_err(|err| classify_transport("openai", err))?;
        let payload = json_or_http_error("openai", response)?;
        let first = payload
            .get("data")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .ok_or_else(|| ProviderError::Decode("OpenAI response returned no images".to_string()))?;

        if let Some(b64) = first.get("b64_json").and_then(Value::as_str) {
            let bytes = BASE64
                .decode(b64.as_bytes())
                .map_err(|err| ProviderError::Decode(format!("OpenAI image base64: {err}")))?;
            return Ok(ProviderImage {
                bytes,
                mime_type: Some("image/png".to_string()),
            });
        }
        if let Some(url) = first.get("url").and_then(Value::as_str) {
            let response = self
                .http
                .get(url)
                .timeout(PROVIDER_TIMEOUT)
                .send()
                .map_err(|err| classify_transport("openai", err))?;
            return read_image_response("openai", response);
        }
        Err(ProviderError::Decode(
            "OpenAI response carries neither b64_json nor url".to_string(),
        ))
    }
}

fn classify_transport(provider: &'static str, err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout { provider }
    } else {
        ProviderError::Transport(err)
    }
}

fn read_image_response(
    provider: &str,
    response: HttpResponse,
) -> Result<ProviderImage, ProviderError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(ProviderError::Http {
            provider: provider.to_string(),
            status: status.as_u16(),
            body: truncate_text(&body, 512),
        });
    }

    let filtered = response
        .headers()
        .get("finish-reason")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("CONTENT_FILTERED"))
        .unwrap_or(false);
    if filtered {
        return Err(ProviderError::ContentFiltered);
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    if content_type.starts_with("image/") {
        let bytes = response.bytes().map_err(ProviderError::Transport)?.to_vec();
        return Ok(ProviderImage {
            bytes,
            mime_type: Some(content_type),
        });
    }

    let payload: Value = response.json().map_err(ProviderError::Transport)?;
    decode_json_image(provider, &payload)
}

fn decode_json_image(provider: &str, payload: &Value) -> Result<ProviderImage, ProviderError> {
    let image_b64 = payload
        .get("image")
        .or_else(|| payload.get("base64"))
        .or_else(|| {
            payload
                .get("artifacts")
                .and_then(Value::as_array)
                .and_then(|rows| rows.first())
                .and_then(Value::as_object)
                .and_then(|row| row.get("base64"))
        })
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            ProviderError::Decode(format!("{provider} JSON response missing image bytes"))
        })?;
    let bytes = BASE64
        .decode(image_b64.as_bytes())
        .map_err(|err| ProviderError::Decode(format!("{provider} image base64: {err}")))?;
    Ok(ProviderImage {
        bytes,
        mime_type: Some("image/png".to_string()),
    })
}

fn json_or_http_error(provider: &str, response: HttpResponse) -> Result<Value, ProviderError> {
    let status = response.status();
    let body = response.text().unwrap_or_default();
    if !status.is_success() {
        return Err(ProviderError::Http {
            provider: provider.to_string(),
            status: status.as_u16(),
            body: truncate_text(&body, 512),
        });
    }
    serde_json::from_str(&body)
        .map_err(|err| ProviderError::Decode(format!("{provider} returned invalid JSON: {err}")))
}

fn image_part(path: &Path, file_name: &'static str) -> Result<MultipartPart, ProviderError> {
    let bytes = fs::read(path)?;
    let part = MultipartPart::bytes(bytes)
        .file_name(file_name)
        .mime_str("image/png")?;
    Ok(part)
}

/// Prompts reach the vendors in English. Anything already ASCII skips the
/// round trip; every failure mode falls back to the untranslated prompt so
/// translation can never block a generation.
pub struct PromptTranslator {
    api_base: String,
    http: HttpClient,
}

impl PromptTranslator {
    pub fn new() -> Self {
        Self {
            api_base: env::var("OPENAI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            http: HttpClient::new(),
        }
    }

    pub fn translate(&self, prompt: &str) -> String {
        if prompt.is_ascii() {
            return prompt.to_string();
        }
        let Some(api_key) = non_empty_env("OPENAI_API_KEY") else {
            return prompt.to_string();
        };
        match self.request_translation(prompt, &api_key) {
            Ok(translated) if !translated.is_empty() => translated,
            _ => prompt.to_string(),
        }
    }

    fn request_translation(&self, prompt: &str, api_key: &str) -> Result<String> {
        let endpoint = format!("{}/chat/completions", self.api_base);
        let payload = json!({
            "model": TRANSLATOR_MODEL,
            "messages": [
                {
                    "role": "system",
                    "content": "You are a professional translator. \
                        Translate the following text to English. \
                        If the text is already in English, return it as is. \
                        Respond ONLY with the translation, nothing else.",
                },
                { "role": "user", "content": prompt },
            ],
            "temperature": 0.3,
            "max_tokens": 500,
        });
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .timeout(RELAY_TIMEOUT)
            .json(&payload)
            .send()
            .context("translation request failed")?;
        let status = response.status();
        let body = response.text().unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!(
                "translation failed ({}): {}",
                status.as_u16(),
                truncate_text(&body, 512)
            );
        }
        let payload: Value = serde_json::from_str(&body).context("translation response JSON")?;
        let translated = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        Ok(translated.to_string())
    }
}

impl Default for PromptTranslator {
    fn default() -> Self {
        Self::new()
    }
}

/// Corner stamp applied to every delivered image. The stamp file is
/// optional; without one, or for outputs whose alpha channel matters, the
/// bytes pass through untouched.
pub struct Watermark {
    stamp: Option<RgbaImage>,
}

impl Watermark {
    pub fn load(path: impl AsRef<Path>) -> Self {
        let stamp = image::open(path.as_ref()).ok().map(|img| img.to_rgba8());
        Self { stamp }
    }

    pub fn disabled() -> Self {
        Self { stamp: None }
    }

    pub fn apply(&self, bytes: &[u8], task: &ImageTask) -> Vec<u8> {
        let Some(stamp) = &self.stamp else {
            return bytes.to_vec();
        };
        if task.preserves_alpha() {
            return bytes.to_vec();
        }
        match composite_stamp(stamp, bytes) {
            Ok(stamped) => stamped,
            Err(_) => bytes.to_vec(),
        }
    }
}

fn composite_stamp(stamp: &RgbaImage, bytes: &[u8]) -> Result<Vec<u8>> {
    let mut base = image::load_from_memory(bytes)?.to_rgba8();
    let (base_width, base_height) = base.dimensions();

    let scaled_width = (stamp.width() as f64 * WATERMARK_SCALE) as u32;
    let scaled_height = (stamp.height() as f64 * WATERMARK_SCALE) as u32;
    if scaled_width == 0 || scaled_height == 0 {
        anyhow::bail!("watermark stamp degenerates at 80% scale");
    }
    if scaled_width + WATERMARK_INSET > base_width || scaled_height + WATERMARK_INSET > base_height
    {
        anyhow::bail!("image smaller than the watermark stamp");
    }

    let mut scaled =
        image::imageops::resize(stamp, scaled_width, scaled_height, FilterType::Lanczos3);
    for pixel in scaled.pixels_mut() {
        if pixel[3] > 0 {
            pixel[3] = WATERMARK_ALPHA;
        }
    }

    let x = (base_width - scaled_width - WATERMARK_INSET) as i64;
    let y = (base_height - scaled_height - WATERMARK_INSET) as i64;
    image::imageops::overlay(&mut base, &scaled, x, y);

    let flattened = DynamicImage::ImageRgba8(base).to_rgb8();
    let mut cursor = Cursor::new(Vec::new());
    flattened.write_to(&mut cursor, ImageFormat::Png)?;
    Ok(cursor.into_inner())
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredObject {
    pub locator: String,
    pub path: PathBuf,
}

pub trait ObjectStore: Send + Sync {
    fn put(&self, owner: u64, category: ImageCategory, bytes: &[u8]) -> Result<StoredObject>;
    fn list(&self, owner: u64, category: ImageCategory) -> Result<Vec<PathBuf>>;
    fn delete(&self, locator: &str) -> Result<bool>;
}

/// Local filesystem bucket: `<root>/<owner>/<category>/<uuid>.png`.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ObjectStore for FsObjectStore {
    fn put(&self, owner: u64, category: ImageCategory, bytes: &[u8]) -> Result<StoredObject> {
        let file_name = format!("{}.png", Uuid::new_v4().simple());
        let locator = format!("{owner}/{}/{file_name}", category.as_str());
        let path = self
            .root
            .join(owner.to_string())
            .join(category.as_str())
            .join(&file_name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(StoredObject { locator, path })
    }

    fn list(&self, owner: u64, category: ImageCategory) -> Result<Vec<PathBuf>> {
        let dir = self.root.join(owner.to_string()).join(category.as_str());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed reading {}", dir.display()))
            }
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn delete(&self, locator: &str) -> Result<bool> {
        let path = self.root.join(locator);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("failed deleting {}", path.display())),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("mask not found")]
    NotFound,
    #[error("no pending mask for this user")]
    NoPending,
    #[error("mask relay unreachable: {0}")]
    Unreachable(String),
    #[error("mask relay request failed ({status}): {body}")]
    Http { status: u16, body: String },
    #[error("mask payload invalid: {0}")]
    Decode(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One finished mask as the editor hands it over: a base64 data URL plus
/// the dimensions of the image it was drawn over, which the editor may have
/// downscaled for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskRecord {
    pub user_id: Option<u64>,
    pub mask: String,
    #[serde(default)]
    pub original_width: Option<u32>,
    #[serde(default)]
    pub original_height: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayHealth {
    pub status: String,
    pub masks_count: usize,
}

pub trait MaskRelay: Send + Sync {
    fn upload_mask(&self, record: MaskRecord) -> Result<String, RelayError>;
    /// Consumes the mask: a second fetch for the same id reports NotFound.
    fn fetch_mask(&self, mask_id: &str) -> Result<MaskRecord, RelayError>;
    fn register_pending(&self, user_id: u64, mask_id: &str) -> Result<(), RelayError>;
    /// Consumes the pending marker for the user.
    fn fetch_pending(&self, user_id: u64) -> Result<String, RelayError>;
    fn health(&self) -> Result<RelayHealth, RelayError>;
}

struct StoredMask {
    record: MaskRecord,
    created: Instant,
}

/// In-process relay state. Backs the relay server binary and stands in for
/// it in tests; the single-use and TTL rules live here in one place.
pub struct MemoryMaskRelay {
    ttl: Duration,
    masks: Mutex<HashMap<String, StoredMask>>,
    pending: Mutex<HashMap<u64, String>>,
}

impl MemoryMaskRelay {
    pub fn new() -> Self {
        Self::with_ttl(MASK_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            masks: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn sweep_expired(&self) {
        let mut masks = self.masks.lock().unwrap_or_else(PoisonError::into_inner);
        let ttl = self.ttl;
        masks.retain(|_, stored| stored.created.elapsed() < ttl);
    }
}

impl Default for MemoryMaskRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MaskRelay for MemoryMaskRelay {
    fn upload_mask(&self, record: MaskRecord) -> Result<String, RelayError> {
        self.sweep_expired();
        let mask_id = Uuid::new_v4().to_string();
        let mut masks = self.masks.lock().unwrap_or_else(PoisonError::into_inner);
        masks.insert(
            mask_id.clone(),
            StoredMask {
                record,
                created: Instant::now(),
            },
        );
        Ok(mask_id)
    }

    fn fetch_mask(&self, mask_id: &str) -> Result<MaskRecord, RelayError> {
        self.sweep_expired();
        let mut masks = self.masks.lock().unwrap_or_else(PoisonError::into_inner);
        masks
            .remove(mask_id)
            .map(|stored| stored.record)
            .ok_or(RelayError::NotFound)
    }

    fn register_pending(&self, user_id: u64, mask_id: &str) -> Result<(), RelayError> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.insert(user_id, mask_id.to_string());
        Ok(())
    }

    fn fetch_pending(&self, user_id: u64) -> Result<String, RelayError> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.remove(&user_id).ok_or(RelayError::NoPending)
    }

    fn health(&self) -> Result<RelayHealth, RelayError> {
        self.sweep_expired();
        let masks = self.masks.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(RelayHealth {
            status: "ok".to_string(),
            masks_count: masks.len(),
        })
    }
}

/// Client for a relay server running elsewhere, speaking the same wire
/// shapes the in-memory relay stores.
pub struct HttpMaskRelay {
    base_url: String,
    http: HttpClient,
}

impl HttpMaskRelay {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            http: HttpClient::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn relay_transport(err: reqwest::Error) -> RelayError {
    RelayError::Unreachable(err.to_string())
}

fn relay_json(response: HttpResponse) -> Result<Value, RelayError> {
    let status = response.status();
    let body = response.text().unwrap_or_default();
    if !status.is_success() {
        return Err(RelayError::Http {
            status: status.as_u16(),
            body: truncate_text(&body, 512),
        });
    }
    serde_json::from_str(&body).map_err(|err| RelayError::Decode(err.to_string()))
}

impl MaskRelay for HttpMaskRelay {
    fn upload_mask(&self, record: MaskRecord) -> Result<String, RelayError> {
        let response = self
            .http
            .post(format!("{}/upload_mask", self.base_url))
            .timeout(RELAY_TIMEOUT)
            .json(&record)
            .send()
            .map_err(relay_transport)?;
        let payload = relay_json(response)?;
        payload
            .get("mask_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RelayError::Decode("upload response missing mask_id".to_string()))
    }

    fn fetch_mask(&self, mask_id: &str) -> Result<MaskRecord, RelayError> {
        let response = self
            .http
            .get(format!("{}/get_mask/{mask_id}", self.base_url))
            .timeout(RELAY_TIMEOUT)
            .send()
            .map_err(relay_transport)?;
        if response.status().as_u16() == 404 {
            return Err(RelayError::NotFound);
        }
        let payload = relay_json(response)?;
        serde_json::from_value(payload).map_err(|err| RelayError::Decode(err.to_string()))
    }

    fn register_pending(&self, user_id: u64, mask_id: &str) -> Result<(), RelayError> {
        let response = self
            .http
            .post(format!("{}/send_mask_id", self.base_url))
            .timeout(RELAY_TIMEOUT)
            .json(&json!({ "user_id": user_id, "mask_id": mask_id }))
            .send()
            .map_err(relay_transport)?;
        relay_json(response).map(|_| ())
    }

    fn fetch_pending(&self, user_id: u64) -> Result<String, RelayError> {
        let response = self
            .http
            .get(format!("{}/get_pending_mask/{user_id}", self.base_url))
            .timeout(RELAY_TIMEOUT)
            .send()
            .map_err(relay_transport)?;
        if response.status().as_u16() == 404 {
            return Err(RelayError::NoPending);
        }
        let payload = relay_json(response)?;
        payload
            .get("mask_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RelayError::Decode("pending response missing mask_id".to_string()))
    }

    fn health(&self) -> Result<RelayHealth, RelayError> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .timeout(RELAY_TIMEOUT)
            .send()
            .map_err(relay_transport)?;
        let payload = relay_json(response)?;
        serde_json::from_value(payload).map_err(|err| RelayError::Decode(err.to_string()))
    }
}

/// How an inpaint hand-off begins. When the relay is down the wizard must
/// not enter its wait state, so the caller gets an explicit fallback signal
/// instead of an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffStart {
    Editor { url: String },
    ManualFallback,
}

/// Coordinates the mask hand-off between the chat surface and the external
/// mask editor, via a relay both sides can reach.
pub struct MaskBroker<R: MaskRelay> {
    relay: R,
    editor_url: String,
}

impl<R: MaskRelay> MaskBroker<R> {
    pub fn new(relay: R, editor_url: &str) -> Self {
        Self {
            relay,
            editor_url: editor_url.trim().trim_end_matches('/').to_string(),
        }
    }

    pub fn begin_handoff(&self, user_id: u64) -> HandoffStart {
        match self.relay.health() {
            Ok(_) => HandoffStart::Editor {
                url: format!("{}?user_id={user_id}", self.editor_url),
            },
            Err(_) => HandoffStart::ManualFallback,
        }
    }

    /// Pull path: claims the user's pending mask id, then the mask itself.
    pub fn resolve_pending(&self, user_id: u64, dest_dir: &Path) -> Result<PathBuf, RelayError> {
        let mask_id = self.relay.fetch_pending(user_id)?;
        self.fetch_by_id(&mask_id, dest_dir)
    }

    /// Push path: the user pasted a mask id by hand.
    pub fn fetch_by_id(&self, mask_id: &str, dest_dir: &Path) -> Result<PathBuf, RelayError> {
        let record = self.relay.fetch_mask(mask_id)?;
        let bytes = decode_mask_payload(&record.mask)?;
        let bytes = match (record.original_width, record.original_height) {
            (Some(width), Some(height)) if width > 0 && height > 0 => {
                resample_mask(&bytes, width, height)?
            }
            _ => bytes,
        };
        fs::create_dir_all(dest_dir)?;
        let path = dest_dir.join(format!("mask-{}.png", Uuid::new_v4().simple()));
        fs::write(&path, bytes)?;
        Ok(path)
    }
}

fn decode_mask_payload(mask: &str) -> Result<Vec<u8>, RelayError> {
    let b64 = mask.split_once(',').map(|(_, tail)| tail).unwrap_or(mask);
    BASE64
        .decode(b64.trim().as_bytes())
        .map_err(|err| RelayError::Decode(err.to_string()))
}

/// Manual fallback: a mask sent as a regular image, bypassing the relay.
/// It still gets resampled to the source image's dimensions before use.
pub fn prepare_manual_mask(
    mask_path: &Path,
    source_image: &Path,
    dest_dir: &Path,
) -> Result<PathBuf> {
    let (width, height) = image::image_dimensions(source_image)
        .with_context(|| format!("unreadable image {}", source_image.display()))?;
    let bytes =
        fs::read(mask_path).with_context(|| format!("unreadable mask {}", mask_path.display()))?;
    let resampled = resample_mask(&bytes, width, height)
        .map_err(|err| anyhow::anyhow!("mask decode failed: {err}"))?;
    fs::create_dir_all(dest_dir)?;
    let path = dest_dir.join(format!("mask-{}.png", Uuid::new_v4().simple()));
    fs::write(&path, resampled)?;
    Ok(path)
}

/// The editor draws over a display-sized copy; the vendor API needs the
/// mask at the source image's exact dimensions.
fn resample_mask(bytes: &[u8], width: u32, height: u32) -> Result<Vec<u8>, RelayError> {
    let mask = image::load_from_memory(bytes).map_err(|err| RelayError::Decode(err.to_string()))?;
    let resized = mask.resize_exact(width, height, FilterType::Lanczos3);
    let mut cursor = Cursor::new(Vec::new());
    resized
        .write_to(&mut cursor, ImageFormat::Png)
        .map_err(|err| RelayError::Decode(err.to_string()))?;
    Ok(cursor.into_inner())
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub provider: String,
    pub model: String,
    pub task: ImageTask,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("free generation limit reached ({used} used)")]
    QuotaExceeded { used: u64 },
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
    #[error("{provider} cannot run {task}")]
    UnsupportedTask {
        provider: String,
        task: &'static str,
    },
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug)]
pub struct DispatchOutcome {
    /// Watermarked file delivered to the user; also becomes the session's
    /// last image so chained edits operate on what the user saw.
    pub image_path: PathBuf,
    pub stored: Option<StoredObject>,
    /// Set when the durable write failed; delivery proceeds regardless.
    pub persist_error: Option<String>,
    /// None when a concurrent action spent the last credit first; the
    /// image is still delivered, only this debit is skipped.
    pub remaining: Option<u64>,
    pub first_generation: bool,
    pub rewarded_referrer: Option<u64>,
    pub session_updated: bool,
    pub history_entry: Option<String>,
}

/// One generation from quota gate to session update. Step order is load
/// bearing: nothing is debited or written until the provider succeeds, and
/// the debit lands before the session update so a stale epoch can only skip
/// the session write, never the charge.
pub struct GenerationPipeline {
    pub providers: ImageProviderRegistry,
    pub translator: PromptTranslator,
    pub watermark: Watermark,
    pub store: Box<dyn ObjectStore>,
    pub ledger: Arc<QuotaLedger>,
    pub sessions: Arc<SessionStore>,
    pub history: Arc<GenerationHistory>,
    pub audit: AuditLog,
    pub scratch_dir: PathBuf,
}

impl GenerationPipeline {
    pub fn dispatch(
        &self,
        user_id: u64,
        epoch: u64,
        request: &GenerationRequest,
    ) -> Result<DispatchOutcome, DispatchError> {
        let status = self.ledger.can_generate(user_id)?;
        if !status.allowed {
            self.audit.record(
                "quota_blocked",
                map_object(json!({ "user_id": user_id, "used": status.used })),
            );
            return Err(DispatchError::QuotaExceeded { used: status.used });
        }

        let provider = self
            .providers
            .get(&request.provider)
            .ok_or_else(|| DispatchError::UnknownProvider(request.provider.clone()))?;
        if !provider.supports(&request.task) {
            return Err(DispatchError::UnsupportedTask {
                provider: request.provider.clone(),
                task: request.task.kind(),
            });
        }

        let original_prompt = request.task.prompt().map(str::to_string);
        let mut task = request.task.clone();
        if let Some(prompt) = task.prompt_mut() {
            *prompt = self.translator.translate(prompt);
        }
        let final_prompt = task.prompt().map(str::to_string);

        let provider_request = ProviderRequest {
            model: request.model.clone(),
            task,
        };
        let image = match provider.generate(&provider_request) {
            Ok(image) => image,
            Err(err) => {
                self.audit.record(
                    "generation_failed",
                    map_object(json!({
                        "user_id": user_id,
                        "provider": request.provider,
                        "task": provider_request.task.kind(),
                        "error": truncate_text(&err.to_string(), 512),
                    })),
                );
                return Err(DispatchError::Provider(err));
            }
        };
        let task = provider_request.task;

        let delivered = self.watermark.apply(&image.bytes, &task);

        fs::create_dir_all(&self.scratch_dir)
            .with_context(|| format!("failed creating {}", self.scratch_dir.display()))?;
        let stamp = chrono::Utc::now().timestamp_millis();
        let short = Uuid::new_v4().simple().to_string();
        let image_path = self
            .scratch_dir
            .join(format!("{user_id}-{stamp}-{}.png", &short[..8]));
        fs::write(&image_path, &delivered)
            .with_context(|| format!("failed to write {}", image_path.display()))?;

        let (stored, persist_error) = match self.store.put(user_id, task.category(), &delivered) {
            Ok(object) => (Some(object), None),
            Err(err) => {
                let reason = truncate_text(&format!("{err:#}"), 512);
                self.audit.record(
                    "persist_failed",
                    map_object(json!({ "user_id": user_id, "error": reason })),
                );
                (None, Some(reason))
            }
        };

        let history_entry = {
            let entry = NewEntry {
                task: task.kind().to_string(),
                prompt: original_prompt.clone().unwrap_or_default(),
                final_prompt: final_prompt.filter(|value| Some(value) != original_prompt.as_ref()),
                provider: request.provider.clone(),
                model: request.model.clone(),
                format: task_format(&task),
                style: task_style(&task),
                negative_prompt: task_negative(&task),
                locator: stored.as_ref().map(|object| object.locator.clone()),
                path: image_path.clone(),
            };
            match self.history.add(user_id, entry) {
                Ok(row) => Some(row.id),
                Err(err) => {
                    self.audit.record(
                        "history_error",
                        map_object(json!({
                            "user_id": user_id,
                            "error": truncate_text(&format!("{err:#}"), 512),
                        })),
                    );
                    None
                }
            }
        };

        let debit = self.ledger.use_generation(user_id)?;
        let (remaining, first_generation, rewarded_referrer) = match debit {
            Debit::Applied {
                remaining,
                first_generation,
                rewarded_referrer,
                ..
            } => (Some(remaining), first_generation, rewarded_referrer),
            Debit::Exhausted { used } => {
                self.audit.record(
                    "debit_skipped",
                    map_object(json!({ "user_id": user_id, "used": used })),
                );
                (None, false, None)
            }
        };

        let saved_params = saved_params_for(&task, request, original_prompt.as_deref());
        let session_updated = self.sessions.apply_if_current(user_id, epoch, |session| {
            session.last_image = Some(image_path.clone());
            if let Some(params) = saved_params.clone() {
                session.saved_params = Some(params);
            }
        });

        self.audit.record(
            "generation_complete",
            map_object(json!({
                "user_id": user_id,
                "provider": request.provider,
                "model": request.model,
                "task": task.kind(),
                "remaining": remaining,
                "locator": stored.as_ref().map(|object| object.locator.clone()),
                "session_updated": session_updated,
            })),
        );

        Ok(DispatchOutcome {
            image_path,
            stored,
            persist_error,
            remaining,
            first_generation,
            rewarded_referrer,
            session_updated,
            history_entry,
        })
    }
}

/// Reload and "more like this" only make sense for plain text generations,
/// so only those refresh the snapshot.
fn saved_params_for(
    task: &ImageTask,
    request: &GenerationRequest,
    original_prompt: Option<&str>,
) -> Option<SavedParams> {
    match task {
        ImageTask::TextToImage {
            negative_prompt,
            aspect_ratio,
            style_preset,
            ..
        } => Some(SavedParams {
            prompt: original_prompt.unwrap_or_default().to_string(),
            provider: request.provider.clone(),
            model: request.model.clone(),
            format: aspect_ratio.clone(),
            style: style_preset.clone(),
            negative_prompt: negative_prompt.clone(),
        }),
        _ => None,
    }
}

fn task_format(task: &ImageTask) -> Option<String> {
    match task {
        ImageTask::TextToImage { aspect_ratio, .. }
        | ImageTask::StyleGuide { aspect_ratio, .. } => Some(aspect_ratio.clone()),
        _ => None,
    }
}

fn task_style(task: &ImageTask) -> Option<String> {
    match task {
        ImageTask::TextToImage { style_preset, .. } => style_preset.clone(),
        _ => None,
    }
}

fn task_negative(task: &ImageTask) -> Option<String> {
    match task {
        ImageTask::TextToImage {
            negative_prompt, ..
        }
        | ImageTask::StyleTransfer {
            negative_prompt, ..
        }
        | ImageTask::StyleGuide {
            negative_prompt, ..
        }
        | ImageTask::Sketch {
            negative_prompt, ..
        } => negative_prompt.clone(),
        _ => None,
    }
}

fn aspect_components(ratio: &str) -> Option<(f64, f64)> {
    let (left, right) = ratio.trim().split_once(':')?;
    let width: f64 = left.trim().parse().ok()?;
    let height: f64 = right.trim().parse().ok()?;
    if width <= 0.0 || height <= 0.0 {
        return None;
    }
    Some((width, height))
}

fn dims_for_aspect(ratio: &str) -> (u32, u32) {
    let Some((width, height)) = aspect_components(ratio) else {
        return (1024, 1024);
    };
    if width >= height {
        let scaled = (1024.0 * height / width).round() as u32;
        (1024, snap_multiple(scaled.max(64), 64))
    } else {
        let scaled = (1024.0 * width / height).round() as u32;
        (snap_multiple(scaled.max(64), 64), 1024)
    }
}

fn snap_multiple(value: u32, multiple: u32) -> u32 {
    if multiple <= 1 {
        return value.max(1);
    }
    let rounded = ((value as f64 / multiple as f64).round() as u32) * multiple;
    rounded.max(multiple)
}

fn openai_size_for_aspect(ratio: &str) -> &'static str {
    let Some((width, height)) = aspect_components(ratio) else {
        return "1024x1024";
    };
    let target = width / height;
    let candidates = [
        ("1024x1024", 1.0),
        ("1792x1024", 1792.0 / 1024.0),
        ("1024x1792", 1024.0 / 1792.0),
    ];
    let mut best = "1024x1024";
    let mut best_delta = f64::MAX;
    for (name, value) in candidates {
        let delta = (target - value).abs();
        if delta < best_delta {
            best_delta = delta;
            best = name;
        }
    }
    best
}

fn encode_png(image: &DynamicImage) -> Result<ProviderImage, ProviderError> {
    let mut cursor = Cursor::new(Vec::new());
    image.write_to(&mut cursor, ImageFormat::Png)?;
    Ok(ProviderImage {
        bytes: cursor.into_inner(),
        mime_type: Some("image/png".to_string()),
    })
}

fn color_from_prompt(prompt: &str, seed: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

pub fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

use std::env;
use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use glimpse_contracts::analysis::{parse_result, StoredResult};
use glimpse_contracts::cache::{commit, CacheIndex, ResultStore};
use glimpse_contracts::diagnostics::{DiagnosticLog, DiagnosticPayload};
use glimpse_contracts::keys::{content_key, fast_key, model_signature};
use glimpse_contracts::mirror::{MirrorStore, DEFAULT_MAX_BYTES, DEFAULT_MAX_FILES};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::RgbImage;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "qwen2.5vl:3b";
pub const DEFAULT_TIMEOUT_SECS: u64 = 180;
pub const DEFAULT_JPEG_QUALITY: u8 = 85;
pub const DEFAULT_SNAP_MULTIPLE: u32 = 32;
pub const DEFAULT_SNAP_MIN: u32 = 64;
pub const DEFAULT_BATCH_SIZE: u32 = 128;
pub const DEFAULT_BATCH_MIN: u32 = 16;
pub const DEFAULT_MAX_CONTEXT: u32 = 8192;
const DEFAULT_TEMPERATURE: f64 = 0.2;

/// Scale ladder for quality mode: one retry at a still-large size.
pub const QUALITY_SCALES: [f64; 2] = [0.90, 0.75];
/// Scale ladder for normal mode: start small, step down 10% per retry.
pub const NORMAL_SCALES: [f64; 4] = [0.60, 0.50, 0.40, 0.30];

const SYSTEM_PROMPT: &str = "Output STRICT JSON only.";

const TEMPLATE_LEAK_MARKERS: [&str; 5] = [
    "<|im_start|>",
    "<|im_end|>",
    "<|assistant|>",
    "<|user|>",
    "<|system|>",
];

/// The two request shapes a local model server may expose. A shape-mismatch
/// response on one triggers a single retry against the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointShape {
    Chat,
    Generate,
}

impl EndpointShape {
    pub fn path(self) -> &'static str {
        match self {
            EndpointShape::Chat => "/api/chat",
            EndpointShape::Generate => "/api/generate",
        }
    }

    pub fn alternate(self) -> Self {
        match self {
            EndpointShape::Chat => EndpointShape::Generate,
            EndpointShape::Generate => EndpointShape::Chat,
        }
    }

    fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "chat" => Some(EndpointShape::Chat),
            "generate" => Some(EndpointShape::Generate),
            _ => None,
        }
    }
}

/// Engine configuration, constructed once per process and passed by
/// reference; there is no hidden global backend handle.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub base_url: String,
    pub default_model: String,
    pub timeout: Duration,
    pub preferred_shape: EndpointShape,
    pub jpeg_quality: u8,
    pub snap_multiple: u32,
    pub snap_min: u32,
    /// Default `num_batch` sent to the backend; 0 disables the batch axis.
    pub batch_size: u32,
    pub batch_min: u32,
    pub max_context: u32,
    pub temperature: f64,
    pub mirror_max_files: usize,
    pub mirror_max_bytes: u64,
    pub debug_capture_dir: Option<PathBuf>,
    pub verbose: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            preferred_shape: EndpointShape::Chat,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            snap_multiple: DEFAULT_SNAP_MULTIPLE,
            snap_min: DEFAULT_SNAP_MIN,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_min: DEFAULT_BATCH_MIN,
            max_context: DEFAULT_MAX_CONTEXT,
            temperature: DEFAULT_TEMPERATURE,
            mirror_max_files: DEFAULT_MAX_FILES,
            mirror_max_bytes: DEFAULT_MAX_BYTES,
            debug_capture_dir: None,
            verbose: false,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with the `GLIMPSE_*` environment surface:
    /// `BASE_URL`, `DEFAULT_MODEL`, `TIMEOUT_SECS`, `ENDPOINT`
    /// (`chat`/`generate`), `JPEG_QUALITY`, `SNAP_MULTIPLE`, `SNAP_MIN`,
    /// `NUM_BATCH`, `BATCH_MIN`, `MAX_CONTEXT`, `MIRROR_MAX_FILES`,
    /// `MIRROR_MAX_BYTES`, `DEBUG_CAPTURE` (directory path), `VERBOSE`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = non_empty_env("GLIMPSE_BASE_URL") {
            config.base_url = value.trim_end_matches('/').to_string();
        }
        if let Some(value) = non_empty_env("GLIMPSE_DEFAULT_MODEL") {
            config.default_model = value;
        }
        if let Some(value) = env_u64("GLIMPSE_TIMEOUT_SECS") {
            config.timeout = Duration::from_secs(value.max(1));
        }
        if let Some(shape) = non_empty_env("GLIMPSE_ENDPOINT").and_then(|v| EndpointShape::parse(&v))
        {
            config.preferred_shape = shape;
        }
        if let Some(value) = env_u64("GLIMPSE_JPEG_QUALITY") {
            config.jpeg_quality = value.min(u8::MAX as u64) as u8;
        }
        if let Some(value) = env_u64("GLIMPSE_SNAP_MULTIPLE") {
            config.snap_multiple = value.max(1) as u32;
        }
        if let Some(value) = env_u64("GLIMPSE_SNAP_MIN") {
            config.snap_min = value.max(1) as u32;
        }
        if let Some(value) = env_u64("GLIMPSE_NUM_BATCH") {
            config.batch_size = value as u32;
        }
        if let Some(value) = env_u64("GLIMPSE_BATCH_MIN") {
            config.batch_min = value.max(1) as u32;
        }
        if let Some(value) = env_u64("GLIMPSE_MAX_CONTEXT") {
            config.max_context = value.max(1) as u32;
        }
        if let Some(value) = env_u64("GLIMPSE_MIRROR_MAX_FILES") {
            config.mirror_max_files = value as usize;
        }
        if let Some(value) = env_u64("GLIMPSE_MIRROR_MAX_BYTES") {
            config.mirror_max_bytes = value;
        }
        if let Some(value) = non_empty_env("GLIMPSE_DEBUG_CAPTURE") {
            config.debug_capture_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = non_empty_env("GLIMPSE_VERBOSE") {
            config.verbose = value == "1";
        }
        config
    }
}

pub fn scale_ladder(quality_mode: bool) -> &'static [f64] {
    if quality_mode {
        &QUALITY_SCALES
    } else {
        &NORMAL_SCALES
    }
}

// ---------------------------------------------------------------------------
// Image codec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PreparedImages {
    /// Base64-encoded JPEG payloads, one per source, in input order.
    pub payloads: Vec<String>,
    pub dimensions: Vec<(u32, u32)>,
}

/// Downscales, snaps and JPEG-encodes every image for one attempt. Decode
/// or resize failures surface as errors so the caller can move to the next
/// ladder entry instead of aborting the request.
pub fn prepare_images(
    paths: &[PathBuf],
    scale: f64,
    config: &EngineConfig,
    debug_prefix: Option<&str>,
) -> Result<PreparedImages> {
    let mut payloads = Vec::with_capacity(paths.len());
    let mut dimensions = Vec::with_capacity(paths.len());

    for (idx, path) in paths.iter().enumerate() {
        let decoded = image::open(path)
            .with_context(|| format!("failed to decode {}", path.display()))?
            .to_rgb8();
        let resized = resize_and_snap(decoded, scale, config.snap_multiple, config.snap_min);
        let (width, height) = resized.dimensions();
        let bytes = encode_jpeg(&resized, config.jpeg_quality)?;

        if let (Some(dir), Some(prefix)) = (&config.debug_capture_dir, debug_prefix) {
            let stem = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            let capture = dir.join(format!("{prefix}__{stem}__i{idx}__{width}x{height}.jpg"));
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            fs::write(&capture, &bytes)
                .with_context(|| format!("failed to write {}", capture.display()))?;
        }

        payloads.push(BASE64.encode(&bytes));
        dimensions.push((width, height));
    }

    Ok(PreparedImages {
        payloads,
        dimensions,
    })
}

fn resize_and_snap(image: RgbImage, scale: f64, snap_multiple: u32, snap_min: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image;
    }
    let scale = scale.clamp(0.01, 1.0);
    let scaled_w = scaled_dimension(width, scale);
    let scaled_h = scaled_dimension(height, scale);
    let target_w = snap_dimension(scaled_w, snap_multiple, snap_min);
    let target_h = snap_dimension(scaled_h, snap_multiple, snap_min);
    if (target_w, target_h) == (width, height) {
        return image;
    }
    image::imageops::resize(&image, target_w, target_h, FilterType::Lanczos3)
}

fn scaled_dimension(dim: u32, scale: f64) -> u32 {
    ((dim as f64 * scale) as u32).max(1)
}

/// Rounds a dimension down to the nearest multiple, with a floor, without
/// ever exceeding the pre-snap value. Odd sizes can trip backend tiling
/// assertions; snapped ones do not.
pub fn snap_dimension(dim: u32, multiple: u32, floor: u32) -> u32 {
    let multiple = multiple.max(1);
    let floor = floor.max(1);
    let snapped = if dim <= floor {
        floor
    } else {
        ((dim / multiple) * multiple).max(floor)
    };
    snapped.min(dim).max(1)
}

fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let quality = quality.clamp(30, 95);
    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality);
    encoder
        .encode_image(image)
        .context("JPEG encoding failed")?;
    Ok(bytes)
}

// ---------------------------------------------------------------------------
// Output validation and context selection
// ---------------------------------------------------------------------------

/// Structural check only: an answer is unusable when it is empty or when
/// the backend leaked its prompt template instead of answering, a failure
/// mode correlated with resource pressure at larger scales.
pub fn is_usable(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    !TEMPLATE_LEAK_MARKERS
        .iter()
        .any(|marker| trimmed.contains(marker))
}

/// Context budget from the largest prepared image. Small inputs get the
/// small budget; anything else gets 8192 capped by the configured ceiling,
/// which keeps 8 GiB-class GPUs out of OOM territory.
pub fn pick_context(dimensions: &[(u32, u32)], max_context: u32) -> u32 {
    let Some(max_w) = dimensions.iter().map(|(w, _)| *w).max() else {
        return 4096;
    };
    let max_h = dimensions.iter().map(|(_, h)| *h).max().unwrap_or(0);
    if max_w < 1000 && max_h < 1000 {
        return 4096;
    }
    8192.min(max_context.max(1))
}

// ---------------------------------------------------------------------------
// Backend call and failure classification
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum CallFailure {
    /// The endpoint shape does not match what the server expects; retry
    /// once against the alternate shape.
    ShapeMismatch(anyhow::Error),
    /// Transient transport trouble: timeout, refused connection, 5xx.
    Retriable(anyhow::Error),
    /// The backend rejected the request for good; do not retry.
    Fatal(anyhow::Error),
}

#[derive(Debug)]
struct CallSuccess {
    content: String,
    latency: Duration,
    done_reason: Option<String>,
    prompt_eval_count: Option<u64>,
    eval_count: Option<u64>,
}

fn looks_like_schema_rejection(body: &str) -> bool {
    let lowered = body.to_ascii_lowercase();
    ["schema", "unknown field", "cannot unmarshal", "invalid request"]
        .iter()
        .any(|marker| lowered.contains(marker))
}

fn build_payload(
    shape: EndpointShape,
    model: &str,
    prompt: &str,
    images: &[String],
    context: u32,
    batch: u32,
    temperature: f64,
) -> Value {
    let mut options = Map::new();
    options.insert("num_ctx".to_string(), json!(context));
    options.insert("temperature".to_string(), json!(temperature));
    if batch > 0 {
        options.insert("num_batch".to_string(), json!(batch));
    }
    match shape {
        EndpointShape::Chat => json!({
            "model": model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt, "images": images},
            ],
            "options": options,
            "stream": false,
        }),
        EndpointShape::Generate => json!({
            "model": model,
            "system": SYSTEM_PROMPT,
            "prompt": prompt,
            "images": images,
            "options": options,
            "stream": false,
        }),
    }
}

fn extract_content(shape: EndpointShape, data: &Value) -> String {
    let content = match shape {
        EndpointShape::Chat => data.pointer("/message/content"),
        EndpointShape::Generate => data.get("response"),
    };
    content.and_then(Value::as_str).unwrap_or_default().to_string()
}

// ---------------------------------------------------------------------------
// Adaptive inference client
// ---------------------------------------------------------------------------

/// Blocking client for one local vision model server. Each `chat_with_images`
/// call walks the scale ladder, halving the batch size on transient failures
/// and swapping the endpoint shape at most once per attempt, until one
/// configuration produces a usable answer or every option is exhausted.
pub struct InferenceClient {
    config: EngineConfig,
    http: HttpClient,
    diagnostics: DiagnosticLog,
}

impl InferenceClient {
    pub fn new(config: EngineConfig, diagnostics: DiagnosticLog) -> Self {
        Self {
            config,
            http: HttpClient::new(),
            diagnostics,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn chat_with_images(
        &self,
        prompt: &str,
        image_paths: &[PathBuf],
        model: Option<&str>,
        explicit_context: Option<u32>,
        quality_mode: bool,
    ) -> Result<String> {
        if image_paths.is_empty() {
            bail!("no inference attempts were made: no images supplied");
        }

        let model_name = model
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(&self.config.default_model)
            .to_string();
        let ladder = scale_ladder(quality_mode);
        self.log(format!(
            "[glimpse] model={model_name} base_url={} images={} timeout={}s",
            self.config.base_url,
            image_paths.len(),
            self.config.timeout.as_secs(),
        ));

        let mut last_err: Option<anyhow::Error> = None;

        for (offset, &scale) in ladder.iter().enumerate() {
            let attempt = offset + 1;
            let debug_prefix = self.config.debug_capture_dir.as_ref().map(|_| {
                format!("att{attempt:02}__scale{:03}", (scale * 100.0).round() as u32)
            });

            let prepared = match prepare_images(
                image_paths,
                scale,
                &self.config,
                debug_prefix.as_deref(),
            ) {
                Ok(prepared) => prepared,
                Err(err) => {
                    self.log(format!("[glimpse] image preparation failed: {err:#}"));
                    last_err =
                        Some(err.context(format!("image preparation failed at scale {scale:.2}")));
                    continue;
                }
            };

            let context = explicit_context
                .filter(|value| *value > 0)
                .unwrap_or_else(|| pick_context(&prepared.dimensions, self.config.max_context));
            self.log(format!(
                "[glimpse] attempt {attempt}/{} scale={scale:.2} sizes={:?} num_ctx={context}",
                ladder.len(),
                prepared.dimensions,
            ));

            let mut batch = self.config.batch_size;
            loop {
                match self.call_with_shape_fallback(
                    &model_name,
                    prompt,
                    &prepared.payloads,
                    context,
                    batch,
                ) {
                    Ok(success) => {
                        if is_usable(&success.content) {
                            return Ok(success.content);
                        }
                        let mut payload = DiagnosticPayload::new();
                        payload.insert("scale".to_string(), json!(scale));
                        payload.insert("batch".to_string(), json!(batch));
                        payload.insert("model".to_string(), json!(model_name));
                        payload.insert("body".to_string(), json!(success.content));
                        if let Err(err) = self.diagnostics.emit("unusable_output", payload) {
                            self.log(format!("[glimpse] diagnostic log write failed: {err:#}"));
                        }
                        self.log(
                            "[glimpse] output unusable (empty/template leak); retrying smaller"
                                .to_string(),
                        );
                        last_err = Some(anyhow!(
                            "backend returned unusable output at scale {scale:.2} batch {batch}: {:?}",
                            truncate_text(&success.content, 200),
                        ));
                        break;
                    }
                    Err(CallFailure::Retriable(err)) => {
                        self.log(format!("[glimpse] retriable failure: {err:#}"));
                        last_err = Some(err.context(format!(
                            "retriable backend failure at scale {scale:.2} batch {batch}"
                        )));
                        if batch > self.config.batch_min {
                            batch = (batch / 2).max(self.config.batch_min);
                            self.log(format!("[glimpse] halving num_batch to {batch}"));
                            continue;
                        }
                        break;
                    }
                    Err(CallFailure::Fatal(err) | CallFailure::ShapeMismatch(err)) => {
                        return Err(err.context(format!(
                            "backend rejected request at scale {scale:.2} batch {batch}"
                        )));
                    }
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| anyhow!("no inference attempts were made: empty scale ladder")))
    }

    /// Preferred shape first; on a shape-mismatch signal, exactly one retry
    /// against the alternate shape. Both shapes rejecting the request is
    /// fatal, never a ping-pong.
    fn call_with_shape_fallback(
        &self,
        model: &str,
        prompt: &str,
        images: &[String],
        context: u32,
        batch: u32,
    ) -> std::result::Result<CallSuccess, CallFailure> {
        let preferred = self.config.preferred_shape;
        match self.call_backend(preferred, model, prompt, images, context, batch) {
            Err(CallFailure::ShapeMismatch(err)) => {
                let alternate = preferred.alternate();
                self.log(format!(
                    "[glimpse] {} rejected the request shape; retrying via {}: {err:#}",
                    preferred.path(),
                    alternate.path(),
                ));
                match self.call_backend(alternate, model, prompt, images, context, batch) {
                    Err(CallFailure::ShapeMismatch(err)) => Err(CallFailure::Fatal(
                        err.context("both endpoint shapes rejected the request"),
                    )),
                    other => other,
                }
            }
            other => other,
        }
    }

    fn call_backend(
        &self,
        shape: EndpointShape,
        model: &str,
        prompt: &str,
        images: &[String],
        context: u32,
        batch: u32,
    ) -> std::result::Result<CallSuccess, CallFailure> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), shape.path());
        let payload = build_payload(
            shape,
            model,
            prompt,
            images,
            context,
            batch,
            self.config.temperature,
        );

        let started = Instant::now();
        let response = self
            .http
            .post(&url)
            .timeout(self.config.timeout)
            .json(&payload)
            .send()
            .map_err(|err| {
                let retriable = err.is_timeout() || err.is_connect() || err.is_request();
                let wrapped =
                    anyhow::Error::new(err).context(format!("request to {url} failed"));
                if retriable {
                    CallFailure::Retriable(wrapped)
                } else {
                    CallFailure::Fatal(wrapped)
                }
            })?;

        let status = response.status().as_u16();
        let body = response.text().map_err(|err| {
            CallFailure::Retriable(
                anyhow::Error::new(err).context(format!("{url} response body read failed")),
            )
        })?;

        if !(200..300).contains(&status) {
            let err = anyhow!(
                "{} returned {status}: {}",
                shape.path(),
                truncate_text(&body, 512)
            );
            return Err(
                if status == 404 || (status == 400 && looks_like_schema_rejection(&body)) {
                    CallFailure::ShapeMismatch(err)
                } else if status >= 500 {
                    CallFailure::Retriable(err)
                } else {
                    CallFailure::Fatal(err)
                },
            );
        }

        let data: Value = serde_json::from_str(&body).map_err(|err| {
            CallFailure::Fatal(
                anyhow::Error::new(err)
                    .context(format!("{} returned an invalid JSON body", shape.path())),
            )
        })?;
        let latency = started.elapsed();
        let success = CallSuccess {
            content: extract_content(shape, &data),
            latency,
            done_reason: data
                .get("done_reason")
                .and_then(Value::as_str)
                .map(str::to_string),
            prompt_eval_count: data.get("prompt_eval_count").and_then(Value::as_u64),
            eval_count: data.get("eval_count").and_then(Value::as_u64),
        };
        self.log(format!(
            "[glimpse] {} ok ({} ms) done_reason={:?} prompt_eval={:?} eval={:?}",
            shape.path(),
            success.latency.as_millis(),
            success.done_reason,
            success.prompt_eval_count,
            success.eval_count,
        ));
        Ok(success)
    }

    fn log(&self, message: String) {
        if self.config.verbose {
            eprintln!("{message}");
        }
    }
}

// ---------------------------------------------------------------------------
// Cache-orchestrating analyzer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AnalyzeRequest {
    pub prompt: String,
    pub image_paths: Vec<PathBuf>,
    pub model: Option<String>,
    pub context: Option<u32>,
    pub quality: bool,
    pub force_new: bool,
}

#[derive(Debug, Clone)]
pub struct AnalyzeOutcome {
    pub result: StoredResult,
    pub cached: bool,
}

/// Ties the caches and the adaptive client together: fast-key lookup first
/// (stat only), then mirror + content-key lookup, then a live inference
/// run. Only validated successes are ever committed; a failed ladder leaves
/// the caches untouched.
pub struct Analyzer {
    config: EngineConfig,
    client: InferenceClient,
    index: CacheIndex,
    results: ResultStore,
    mirror: MirrorStore,
    diagnostics: DiagnosticLog,
}

impl Analyzer {
    /// `root` holds everything durable: `cache/index.json`, one result file
    /// per content key under `cache/`, mirrored images under `mirror/`, and
    /// `diagnostics.jsonl`.
    pub fn new(config: EngineConfig, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let diagnostics = DiagnosticLog::new(root.join("diagnostics.jsonl"));
        Self {
            client: InferenceClient::new(config.clone(), diagnostics.clone()),
            index: CacheIndex::new(root.join("cache").join("index.json")),
            results: ResultStore::new(root.join("cache")),
            mirror: MirrorStore::new(root.join("mirror")),
            diagnostics,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &DiagnosticLog {
        &self.diagnostics
    }

    pub fn analyze(&self, request: &AnalyzeRequest) -> Result<AnalyzeOutcome> {
        if request.image_paths.is_empty() {
            bail!("no images to analyze");
        }

        let model_sig = model_signature(request.model.as_deref(), request.context);
        let fk = fast_key(&request.image_paths, &request.prompt, &model_sig)?;

        if !request.force_new {
            if let Some(ck) = self.index.lookup(&fk) {
                if let Some(result) = self.results.load(&ck) {
                    return Ok(AnalyzeOutcome {
                        result,
                        cached: true,
                    });
                }
            }
        }

        let mirrored = self.mirror.ensure_mirrored(&request.image_paths)?;
        self.mirror
            .prune(self.config.mirror_max_files, self.config.mirror_max_bytes)?;
        let ck = content_key(&mirrored, &request.prompt, &model_sig);

        if !request.force_new {
            if let Some(result) = self.results.load(&ck) {
                self.warn_on_cache_error(self.index.insert(&fk, &ck));
                return Ok(AnalyzeOutcome {
                    result,
                    cached: true,
                });
            }
        }

        let spinner = Spinner::start("glimpse thinking", self.config.verbose);
        let raw = self.client.chat_with_images(
            &request.prompt,
            &mirrored,
            request.model.as_deref(),
            request.context,
            request.quality,
        );
        drop(spinner);
        let raw = raw?;

        let result = parse_result(&raw);
        self.warn_on_cache_error(commit(&self.index, &self.results, &fk, &ck, &result));

        Ok(AnalyzeOutcome {
            result,
            cached: false,
        })
    }

    // The caller already has a valid answer; a cache write failure is a
    // warning, not a call failure.
    fn warn_on_cache_error(&self, outcome: Result<()>) {
        if let Err(err) = outcome {
            eprintln!("[glimpse] warning: cache write failed: {err:#}");
            let mut payload = DiagnosticPayload::new();
            payload.insert("error".to_string(), json!(format!("{err:#}")));
            let _ = self.diagnostics.emit("cache_write_failed", payload);
        }
    }
}

// ---------------------------------------------------------------------------
// Progress spinner
// ---------------------------------------------------------------------------

/// Cosmetic stderr spinner on a background thread. Carries nothing but a
/// stop flag and is joined on every exit path, including early returns.
pub struct Spinner {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Spinner {
    pub fn start(label: &str, enabled: bool) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = if enabled {
            let stop_flag = Arc::clone(&stop);
            let label = label.to_string();
            Some(thread::spawn(move || {
                let frames = ['|', '/', '-', '\\'];
                let mut idx = 0usize;
                while !stop_flag.load(Ordering::Relaxed) {
                    eprint!("\r[{label}] {}", frames[idx % frames.len()]);
                    let _ = std::io::stderr().flush();
                    idx += 1;
                    thread::sleep(Duration::from_millis(100));
                }
                eprintln!("\r[{label}] done   ");
            }))
        } else {
            None
        };
        Self { stop, handle }
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

// ---------------------------------------------------------------------------
// Small helpers
// ---------------------------------------------------------------------------

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    non_empty_env(key).and_then(|value| value.parse().ok())
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

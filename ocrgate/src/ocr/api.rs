use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::config::VendorSettings;
use crate::error::{OcrError, Result};

use super::backend::OcrBackend;
use super::cache::HandleCache;
use super::confidence::VISION_ESTIMATED_CONFIDENCE;
use super::types::{
    CapabilitySummary, Detection, DetectionKind, ImageFormat, NormalizedImage, OutputFormat,
    ProbeResult, Recognition, RecognitionOptions,
};
use super::IMAGE_TEXT_SEPARATOR;

/// Upper bound most vision endpoints accept for one inline image.
const MAX_INLINE_IMAGE_BYTES: usize = 20 * 1024 * 1024;

const MAX_RETRIES: u32 = 3;

/// Hosted vision-language endpoints speaking the chat-completions dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VisionVendor {
    OpenAi,
    Mistral,
    DeepSeek,
}

impl VisionVendor {
    pub fn name(&self) -> &'static str {
        match self {
            VisionVendor::OpenAi => "openai",
            VisionVendor::Mistral => "mistral",
            VisionVendor::DeepSeek => "deepseek",
        }
    }

    fn display_name(&self) -> &'static str {
        match self {
            VisionVendor::OpenAi => "OpenAI Vision",
            VisionVendor::Mistral => "Mistral OCR",
            VisionVendor::DeepSeek => "DeepSeek OCR",
        }
    }

    fn key_var(&self) -> &'static str {
        match self {
            VisionVendor::OpenAi => "OPENAI_API_KEY",
            VisionVendor::Mistral => "MISTRAL_API_KEY",
            VisionVendor::DeepSeek => "DEEPSEEK_API_KEY",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            VisionVendor::OpenAi => "https://api.openai.com/v1",
            VisionVendor::Mistral => "https://api.mistral.ai/v1",
            VisionVendor::DeepSeek => "https://api.deepseek.com/v1",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            VisionVendor::OpenAi => "gpt-4o",
            VisionVendor::Mistral => "pixtral-12b-2409",
            VisionVendor::DeepSeek => "deepseek-vl",
        }
    }

    /// Encodings the endpoint takes inline; anything else is re-encoded as PNG.
    fn accepted_formats(&self) -> &'static [ImageFormat] {
        &[
            ImageFormat::Png,
            ImageFormat::Jpeg,
            ImageFormat::Gif,
            ImageFormat::Webp,
        ]
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: Vec<ContentPart>,
}

/// One segment of a user message.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

#[derive(Clone, Debug)]
pub struct VisionChatClient {
    vendor: VisionVendor,
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl VisionChatClient {
    pub fn new(vendor: VisionVendor, settings: &VendorSettings) -> Result<Self> {
        let api_key = settings.api_key.clone().ok_or_else(|| {
            OcrError::dependency(
                vendor.name(),
                format!(
                    "API key required for {} ({} not set)",
                    vendor.display_name(),
                    vendor.key_var()
                ),
            )
        })?;

        let base_url = settings
            .base_url
            .clone()
            .unwrap_or_else(|| vendor.default_base_url().to_string());

        let model = settings
            .model
            .clone()
            .unwrap_or_else(|| vendor.default_model().to_string());

        let client = Client::builder().build().map_err(|e| {
            OcrError::dependency(vendor.name(), format!("Failed to create HTTP client: {e}"))
        })?;

        Ok(Self {
            vendor,
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send one image with an instruction and return the model's reply.
    /// `timeout` bounds each HTTP request.
    pub async fn extract_text(
        &self,
        data_url: String,
        instruction: String,
        timeout: Duration,
    ) -> Result<String> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: vec![
                    ContentPart::Text { text: instruction },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url: data_url },
                    },
                ],
            }],
            max_tokens: 4096,
        };

        self.make_request(&request, timeout).await
    }

    async fn make_request(&self, request: &ChatRequest, timeout: Duration) -> Result<String> {
        let provider = self.vendor.name();
        let mut retries = 0;

        loop {
            let response = self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(&self.api_key)
                .timeout(timeout)
                .json(request)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let chat_response: ChatResponse = resp.json().await.map_err(|e| {
                            OcrError::processing(provider, format!("Failed to parse response: {e}"))
                        })?;

                        return chat_response
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.message.content)
                            .ok_or_else(|| OcrError::processing(provider, "No response from API"));
                    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        retries += 1;
                        if retries >= MAX_RETRIES {
                            return Err(OcrError::processing(
                                provider,
                                format!("API request failed after {MAX_RETRIES} retries: {status}"),
                            )
                            .with_details(json!({ "status": status.as_u16() })));
                        }
                        debug!(provider, %status, retries, "Retrying vision request");
                        tokio::time::sleep(backoff_delay(retries)).await;
                    } else {
                        let body = resp.text().await.unwrap_or_default();
                        let details = json!({ "status": status.as_u16(), "body": body });
                        let message = format!("API request failed: {status}");
                        let auth_failure =
                            status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN;
                        return Err(if auth_failure {
                            OcrError::dependency(provider, message).with_details(details)
                        } else {
                            OcrError::processing(provider, message).with_details(details)
                        });
                    }
                }
                Err(e) => {
                    retries += 1;
                    if retries >= MAX_RETRIES {
                        return Err(OcrError::processing(
                            provider,
                            format!("API request failed after {MAX_RETRIES} retries: {e}"),
                        ));
                    }
                    tokio::time::sleep(backoff_delay(retries)).await;
                }
            }
        }
    }
}

fn backoff_delay(retries: u32) -> Duration {
    Duration::from_millis(100 * 2_u64.pow(retries))
}

fn instruction(options: &RecognitionOptions) -> String {
    let languages = options.languages().join(", ");
    let hint = if languages.is_empty() {
        String::new()
    } else {
        format!(" The text is expected to be in: {languages}.")
    };

    match options.output {
        OutputFormat::Text => format!(
            "Extract all text from this image. Return only the extracted text \
             without any explanations or formatting.{hint}"
        ),
        OutputFormat::Structured => format!(
            "Transcribe all text from this image in reading order, one line of the \
             image per line of output. Prefix headings with '# '. Return only the \
             transcription.{hint}"
        ),
    }
}

/// Turn a model reply into text plus line detections.
///
/// Plain text keeps the reply as-is apart from surrounding whitespace. Only
/// structured output, where the prompt asks for `# ` markers, strips them and
/// tags those lines as headings.
fn parse_reply(reply: &str, image_index: usize, output: OutputFormat) -> (String, Vec<Detection>) {
    if output == OutputFormat::Text {
        let detections = reply
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| Detection::new(line, image_index).with_kind(DetectionKind::Line))
            .collect();
        return (reply.trim().to_string(), detections);
    }

    let mut lines = Vec::new();
    let mut detections = Vec::new();

    for raw in reply.lines() {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        let (text, kind) = match trimmed.strip_prefix('#') {
            Some(rest) => (rest.trim_start_matches('#').trim(), DetectionKind::Heading),
            None => (trimmed, DetectionKind::Line),
        };
        if text.is_empty() {
            continue;
        }
        lines.push(text.to_string());
        detections.push(Detection::new(text, image_index).with_kind(kind));
    }

    (lines.join("\n"), detections)
}

/// OCR backend backed by a hosted vision model.
pub struct VisionBackend {
    vendor: VisionVendor,
    settings: VendorSettings,
    clients: HandleCache<VisionVendor, VisionChatClient>,
}

impl VisionBackend {
    pub fn new(vendor: VisionVendor, settings: VendorSettings) -> Self {
        Self {
            vendor,
            settings,
            clients: HandleCache::new(),
        }
    }

    pub fn vendor(&self) -> VisionVendor {
        self.vendor
    }

    async fn client(&self) -> Result<VisionChatClient> {
        let vendor = self.vendor;
        let settings = &self.settings;
        self.clients
            .get_or_try_init(vendor, || async move {
                let client = VisionChatClient::new(vendor, settings)?;
                info!(
                    provider = vendor.name(),
                    model = client.model(),
                    "Vision OCR client initialized"
                );
                Ok(client)
            })
            .await
    }

    fn data_url(&self, image: &NormalizedImage) -> Result<String> {
        let provider = self.vendor.name();
        let format = image.format();
        let bytes = image
            .encoded()
            .map_err(|e| OcrError::processing(provider, e))?;

        if bytes.len() > MAX_INLINE_IMAGE_BYTES {
            return Err(OcrError::processing(
                provider,
                format!(
                    "image {} is {} bytes, limit is {MAX_INLINE_IMAGE_BYTES}",
                    image.index,
                    bytes.len()
                ),
            ));
        }

        if self.vendor.accepted_formats().contains(&format) {
            return image
                .to_data_url()
                .map_err(|e| OcrError::processing(provider, e));
        }

        let png = image::load_from_memory(&bytes)
            .map_err(|e| OcrError::processing(provider, format!("Failed to decode image: {e}")))
            .and_then(|img| {
                let mut out = Vec::new();
                img.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
                    .map_err(|e| {
                        OcrError::processing(provider, format!("Failed to encode image: {e}"))
                    })?;
                Ok(out)
            })?;

        Ok(format!("data:image/png;base64,{}", STANDARD.encode(png)))
    }
}

#[async_trait]
impl OcrBackend for VisionBackend {
    fn name(&self) -> &str {
        self.vendor.name()
    }

    async fn recognize(
        &self,
        images: &[NormalizedImage],
        options: &RecognitionOptions,
    ) -> Result<Recognition> {
        let client = self.client().await?;
        let prompt = instruction(options);

        let mut texts = Vec::with_capacity(images.len());
        let mut detections = Vec::new();

        for image in images {
            let data_url = self.data_url(image)?;
            let reply = client
                .extract_text(data_url, prompt.clone(), options.timeout)
                .await?;
            let (text, mut found) = parse_reply(&reply, image.index, options.output);
            texts.push(text);
            detections.append(&mut found);
        }

        Ok(Recognition {
            text: texts.join(IMAGE_TEXT_SEPARATOR),
            detections,
            estimated_confidence: Some(VISION_ESTIMATED_CONFIDENCE),
        })
    }

    async fn probe(&self) -> ProbeResult {
        let base_url = self
            .settings
            .base_url
            .clone()
            .unwrap_or_else(|| self.vendor.default_base_url().to_string());
        let model = self
            .settings
            .model
            .clone()
            .unwrap_or_else(|| self.vendor.default_model().to_string());

        let result = match &self.settings.api_key {
            Some(_) => ProbeResult::available(),
            None => ProbeResult::unavailable(format!("{} not set", self.vendor.key_var())),
        };

        result
            .with_detail("base_url", base_url)
            .with_detail("model", model)
            .with_detail("cached_clients", self.clients.len())
    }

    async fn capabilities(&self) -> CapabilitySummary {
        CapabilitySummary {
            languages: self.supported_languages(),
            formats: ImageFormat::ALL.to_vec(),
            max_image_bytes: Some(MAX_INLINE_IMAGE_BYTES),
            bounding_boxes: false,
            native_confidence: false,
        }
    }

    fn supported_languages(&self) -> Vec<String> {
        Vec::new()
    }

    async fn cleanup(&self) -> Result<()> {
        let released = self.clients.clear();
        if !released.is_empty() {
            debug!(
                provider = self.vendor.name(),
                count = released.len(),
                "Released vision clients"
            );
        }
        Ok(())
    }
}

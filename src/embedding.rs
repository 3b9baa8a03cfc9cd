//! Text embeddings for prose answers.
//!
//! The engine never owns a model: it is handed an [`Encoder`] and keeps its
//! own cache of vectors keyed by answer id. Vectors computed during a scan are
//! queued so the store can persist them next to the scores they fed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::QuestionnaireAnswer;

/// Turns text into a vector. Must be side-effect free; callers cache results.
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

/// Deterministic feature-hashing encoder over word unigrams and bigrams.
///
/// Han and other non-ASCII letters count as one token each, since those
/// answers are rarely space separated.
#[derive(Debug, Clone)]
pub struct HashingEncoder {
    dim: usize,
}

impl HashingEncoder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let tokens = tokenize(text);
        let mut vector = vec![0.0f32; self.dim];

        let bigrams = tokens.windows(2).map(|pair| format!("{} {}", pair[0], pair[1]));
        for token in tokens.iter().cloned().chain(bigrams) {
            let hash = fnv1a(token.as_bytes());
            let slot = (hash % self.dim as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for value in vector.iter_mut() {
                *value /= norm;
            }
        }
        vector
    }
}

impl Default for HashingEncoder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Encoder for HashingEncoder {
    async fn encode(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(self.embed(text))
    }
}

fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            word.push(ch.to_ascii_lowercase());
            continue;
        }
        if !word.is_empty() {
            tokens.push(std::mem::take(&mut word));
        }
        if ch.is_alphanumeric() {
            tokens.push(ch.to_lowercase().collect());
        }
    }
    if !word.is_empty() {
        tokens.push(word);
    }
    tokens
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Client for an OpenAI-style `/embeddings` endpoint.
#[derive(Debug, Clone)]
pub struct HttpEncoder {
    client: reqwest::Client,
    url: String,
    model: String,
    max_attempts: u32,
    backoff: Duration,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl HttpEncoder {
    pub fn new(url: impl Into<String>, model: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build embedding HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
            model: model.into(),
            max_attempts: 3,
            backoff: Duration::from_millis(250),
        })
    }

    pub fn with_retries(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    async fn attempt(&self, text: &str) -> Result<Vec<f32>, (bool, anyhow::Error)> {
        let response = self
            .client
            .post(&self.url)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: text,
            })
            .send()
            .await
            .map_err(|err| (true, anyhow::Error::new(err)))?;

        let status = response.status();
        if !status.is_success() {
            let retryable = status.is_server_error() || status.as_u16() == 429;
            return Err((retryable, anyhow::anyhow!("embedding endpoint returned {status}")));
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|err| (false, anyhow::Error::new(err)))?;
        body.data
            .into_iter()
            .next()
            .map(|datum| datum.embedding)
            .ok_or_else(|| (false, anyhow::anyhow!("embedding response had no data")))
    }
}

#[async_trait]
impl Encoder for HttpEncoder {
    async fn encode(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut delay = self.backoff;
        for attempt in 1..=self.max_attempts {
            match self.attempt(text).await {
                Ok(vector) => return Ok(vector),
                Err((true, err)) if attempt < self.max_attempts => {
                    warn!("embedding attempt {attempt} failed, retrying in {delay:?}: {err:#}");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err((_, err)) => return Err(err.context(format!("embedding failed after {attempt} attempt(s)"))),
            }
        }
        bail!("embedding encoder configured with zero attempts")
    }
}

/// Per-scan cache of answer embeddings with a queue of vectors not yet persisted.
pub struct EmbeddingCache {
    encoder: Arc<dyn Encoder>,
    vectors: HashMap<i64, Arc<[f32]>>,
    fresh: Vec<(i64, Vec<f32>)>,
}

impl EmbeddingCache {
    pub fn new(encoder: Arc<dyn Encoder>) -> Self {
        Self {
            encoder,
            vectors: HashMap::new(),
            fresh: Vec::new(),
        }
    }

    /// Registers vectors already stored on the answers.
    pub fn preload<'a>(&mut self, answers: impl IntoIterator<Item = &'a QuestionnaireAnswer>) {
        for answer in answers {
            if let Some(vector) = &answer.embedding {
                self.vectors.insert(answer.id, Arc::from(vector.as_slice()));
            }
        }
    }

    pub async fn vector(&mut self, answer: &QuestionnaireAnswer) -> anyhow::Result<Arc<[f32]>> {
        if let Some(vector) = self.vectors.get(&answer.id) {
            return Ok(Arc::clone(vector));
        }

        debug!("encoding answer {} for item {}", answer.id, answer.item_id);
        let vector = self
            .encoder
            .encode(&answer.answer)
            .await
            .with_context(|| format!("encoding answer {}", answer.id))?;
        let shared: Arc<[f32]> = Arc::from(vector.as_slice());
        self.vectors.insert(answer.id, Arc::clone(&shared));
        self.fresh.push((answer.id, vector));
        Ok(shared)
    }

    /// Drains vectors computed since the last call.
    pub fn take_fresh(&mut self) -> Vec<(i64, Vec<f32>)> {
        std::mem::take(&mut self.fresh)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::scoring::cosine_similarity;

    /// Counts calls and delegates to the hashing encoder.
    #[derive(Default)]
    pub(crate) struct CountingEncoder {
        pub calls: AtomicUsize,
        inner: HashingEncoder,
    }

    #[async_trait]
    impl Encoder for CountingEncoder {
        async fn encode(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if text.contains("<fail>") {
                bail!("encoder refused input");
            }
            Ok(self.inner.embed(text))
        }
    }

    fn prose(id: i64, text: &str) -> QuestionnaireAnswer {
        QuestionnaireAnswer {
            id,
            student_id: id,
            item_id: "hobby".to_string(),
            answer: text.to_string(),
            weight: 1.0,
            embedding: None,
        }
    }

    #[test]
    fn hashing_is_deterministic_and_normalized() {
        let encoder = HashingEncoder::new(64);
        let a = encoder.embed("Quiet evenings, early to bed");
        let b = encoder.embed("quiet evenings early to bed");
        assert_eq!(a, b);
        let norm = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn similar_text_scores_higher() {
        let encoder = HashingEncoder::default();
        let base = encoder.embed("I enjoy reading books and quiet evenings");
        let close = encoder.embed("I enjoy reading books");
        let far = encoder.embed("loud parties every weekend");
        let close_sim = cosine_similarity(&base, &close).unwrap();
        let far_sim = cosine_similarity(&base, &far).unwrap_or(0.0);
        assert!(close_sim > far_sim);
    }

    #[test]
    fn han_characters_tokenize_individually() {
        assert_eq!(tokenize("喜欢安静 ok"), vec!["喜", "欢", "安", "静", "ok"]);
    }

    #[tokio::test]
    async fn cache_encodes_once_and_queues_fresh() {
        let encoder = Arc::new(CountingEncoder::default());
        let mut cache = EmbeddingCache::new(encoder.clone());
        let answer = prose(1, "board games");

        cache.vector(&answer).await.unwrap();
        cache.vector(&answer).await.unwrap();
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 1);

        let fresh = cache.take_fresh();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].0, 1);
        assert!(cache.take_fresh().is_empty());
    }

    #[tokio::test]
    async fn preloaded_vectors_skip_the_encoder() {
        let encoder = Arc::new(CountingEncoder::default());
        let mut cache = EmbeddingCache::new(encoder.clone());
        let mut answer = prose(7, "cooking");
        answer.embedding = Some(vec![0.5, 0.5]);
        cache.preload([&answer]);

        let vector = cache.vector(&answer).await.unwrap();
        assert_eq!(&*vector, &[0.5, 0.5]);
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 0);
        assert!(cache.take_fresh().is_empty());
    }

    fn http_encoder(server: &wiremock::MockServer) -> HttpEncoder {
        HttpEncoder::new(format!("{}/embeddings", server.uri()), "test-model")
            .unwrap()
            .with_retries(3, Duration::from_millis(1))
    }

    fn embedding_body(vector: &[f32]) -> serde_json::Value {
        serde_json::json!({ "data": [{ "embedding": vector }] })
    }

    #[tokio::test]
    async fn http_encoder_retries_server_errors() {
        use wiremock::matchers::{body_partial_json, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(body_partial_json(serde_json::json!({ "model": "test-model", "input": "quiet" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(embedding_body(&[0.6, 0.8])))
            .expect(1)
            .mount(&server)
            .await;

        let vector = http_encoder(&server).encode("quiet").await.unwrap();

        assert_eq!(vector, vec![0.6, 0.8]);
    }

    #[tokio::test]
    async fn http_encoder_gives_up_after_max_attempts() {
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(wiremock::matchers::method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .expect(2)
            .mount(&server)
            .await;

        let encoder = http_encoder(&server).with_retries(2, Duration::from_millis(1));
        let err = encoder.encode("quiet").await.unwrap_err();

        assert!(format!("{err:#}").contains("after 2 attempt(s)"));
    }

    #[tokio::test]
    async fn http_encoder_does_not_retry_client_errors() {
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(wiremock::matchers::method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let err = http_encoder(&server).encode("quiet").await.unwrap_err();

        assert!(format!("{err:#}").contains("400"));
    }

    #[tokio::test]
    async fn http_encoder_rejects_empty_data() {
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(wiremock::matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "data": [] })))
            .expect(1)
            .mount(&server)
            .await;

        let err = http_encoder(&server).encode("quiet").await.unwrap_err();

        assert!(format!("{err:#}").contains("no data"));
    }
}

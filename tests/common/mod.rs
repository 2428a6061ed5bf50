// Shared helpers for integration tests

use serde_json::{Value, json};
use wiremock::{Request, Respond, ResponseTemplate};

pub const TEST_DIMENSION: u32 = 64;
pub const KEYWORDS: [&str; 3] = ["pricing", "security", "onboarding"];

pub fn init_test_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init()
        .ok(); // Ignore error if already initialized
}

/// Keyword counts in the first slots, zero elsewhere
pub fn keyword_vector(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    let mut vector = vec![0.0; TEST_DIMENSION as usize];
    for (slot, keyword) in KEYWORDS.iter().enumerate() {
        vector[slot] = 0.1 + lower.matches(keyword).count() as f32;
    }
    vector
}

/// Answers Voyage embedding requests with one keyword vector per input
pub struct KeywordEmbeddings;

impl Respond for KeywordEmbeddings {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = request
            .body_json()
            .expect("embedding request should be JSON");
        let data: Vec<Value> = body["input"]
            .as_array()
            .expect("embedding request should carry an input array")
            .iter()
            .enumerate()
            .map(|(index, text)| {
                json!({
                    "object": "embedding",
                    "embedding": keyword_vector(text.as_str().unwrap_or_default()),
                    "index": index,
                })
            })
            .collect();

        ResponseTemplate::new(200).set_body_json(json!({
            "object": "list",
            "data": data,
            "model": body["model"],
            "usage": { "total_tokens": 42 },
        }))
    }
}

//! Scripted in-memory LLM and embedder doubles for stage tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use postforge_llm::{CompletionRequest, Embedder, LlmClient};
use postforge_shared::{PostforgeError, Result};

struct Route {
    marker: String,
    responses: VecDeque<String>,
}

/// Answers each request by the first route whose marker appears in the
/// system prompt. Queued responses are consumed in order; the last one repeats.
#[derive(Default)]
pub struct ScriptedLlm {
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, marker: &str, response: impl Into<String>) -> Self {
        {
            let mut routes = self.routes.lock().expect("routes lock");
            match routes.iter_mut().find(|r| r.marker == marker) {
                Some(route) => route.responses.push_back(response.into()),
                None => routes.push(Route {
                    marker: marker.to_string(),
                    responses: VecDeque::from([response.into()]),
                }),
            }
        }
        self
    }

    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Calls whose system prompt contains `marker`.
    pub fn calls_to(&self, marker: &str) -> Vec<CompletionRequest> {
        self.calls()
            .into_iter()
            .filter(|c| c.system.contains(marker))
            .collect()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        self.calls.lock().expect("calls lock").push(request.clone());

        let mut routes = self.routes.lock().expect("routes lock");
        let route = routes
            .iter_mut()
            .find(|r| request.system.contains(&r.marker))
            .ok_or_else(|| {
                PostforgeError::Llm(format!(
                    "no scripted response for system prompt: {}",
                    request.system.chars().take(60).collect::<String>()
                ))
            })?;

        if route.responses.len() > 1 {
            Ok(route.responses.pop_front().unwrap_or_default())
        } else {
            Ok(route.responses.front().cloned().unwrap_or_default())
        }
    }
}

/// Returns a fixed vector for texts containing a pattern, else the default.
pub struct ScriptedEmbedder {
    patterns: Vec<(String, Vec<f32>)>,
    default: Vec<f32>,
    failing: bool,
    calls: Mutex<Vec<String>>,
}

impl ScriptedEmbedder {
    pub fn new(default: Vec<f32>) -> Self {
        Self {
            patterns: Vec::new(),
            default,
            failing: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// An embedder whose every call fails.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn on(mut self, pattern: &str, vector: Vec<f32>) -> Self {
        self.patterns.push((pattern.to_string(), vector));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl Embedder for ScriptedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.lock().expect("calls lock").push(text.to_string());
        if self.failing {
            return Err(PostforgeError::Llm("embedding service unavailable".into()));
        }
        Ok(self
            .patterns
            .iter()
            .find(|(p, _)| text.contains(p.as_str()))
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| self.default.clone()))
    }
}

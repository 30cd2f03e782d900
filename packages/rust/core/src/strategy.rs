//! Stage 2: post type, tone, channel and product-search intent.
//!
//! The model proposes a [`StrategyDraft`]; [`apply_rules`] then enforces the
//! calendar's constraints in code, so the prompt rules are advisory only.

use postforge_llm::{CompletionRequest, LlmClient};
use postforge_shared::{Channel, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::json_repair::{CheckedRecord, StageSchema, parse_with_retry};
use crate::theme::{ProductStrategy, ThemeDescriptor};
use crate::topic;
use crate::topic_engine::TopicStrategy;

/// System prompt for the strategy stage. Test doubles route on "estratega de contenido".
pub const STRATEGY_SYSTEM: &str = "Eres el estratega de contenido de una tienda de insumos \
     agrícolas. Decides el tipo de post, el tono, el canal y si hace falta un producto. \
     Respondes solo con JSON.";

const MAX_RECENT_CHANNELS: usize = 5;

const STRATEGY_SCHEMA: StageSchema = StageSchema {
    stage: "strategy engine",
    hint: "Required schema: {\"post_type\": string, \"tone\": string, \"channel\": string, \
           \"search_needed\": boolean, \"preferred_category\": string, \"search_keywords\": string}",
    snippet_chars: 500,
    max_tokens: 512,
};

const POST_TYPES: &str = "Infografías, Memes/tips rápidos, Kits, Promoción puntual, Tutorial \
     corto, Caso de éxito, Antes / Después, FAQ / Mitos, Pro Tip, Checklist operativo, Sabías \
     que..., Recordatorio de servicio";

const TONES: &str = "Motivational, Promotional, Technical, Educational, Problem-Solving, \
     Seasonal, Humorous, Informative, Inspirational, Nostalgic, Reflective, Personal, Storytelling";

/// Raw strategy as the model returned it.
#[derive(Debug, Clone, Deserialize)]
pub struct StrategyDraft {
    pub post_type: String,
    #[serde(default)]
    pub tone: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub search_needed: bool,
    #[serde(default)]
    pub preferred_category: Option<String>,
    #[serde(default)]
    pub search_keywords: Option<String>,
}

impl CheckedRecord for StrategyDraft {
    fn check(&self) -> std::result::Result<(), String> {
        if self.post_type.trim().is_empty() {
            return Err("post_type must not be empty".into());
        }
        Ok(())
    }
}

/// Strategy after the calendar rules were applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentStrategy {
    pub post_type: String,
    pub tone: String,
    pub channel: Channel,
    pub search_needed: bool,
    pub preferred_category: Option<String>,
    pub search_keywords: String,
}

/// Inputs for one strategy decision.
#[derive(Debug, Clone)]
pub struct StrategyRequest<'a> {
    pub theme: &'a ThemeDescriptor,
    pub topic: &'a TopicStrategy,
    /// Most recent first.
    pub recent_channels: &'a [Channel],
    pub forced_channel: Option<Channel>,
    pub variety_hint: Option<&'a str>,
}

/// Enforce channel, post type and product-search rules on a draft.
pub fn apply_rules(draft: StrategyDraft, request: &StrategyRequest<'_>) -> ContentStrategy {
    let theme = request.theme;

    let channel = match request.forced_channel {
        Some(forced) => forced,
        None => draft.channel.parse().unwrap_or_else(|_| {
            let fallback = Channel::ALL
                .into_iter()
                .find(|c| !request.recent_channels.contains(c))
                .unwrap_or(Channel::FbPost);
            warn!(proposed = %draft.channel, %fallback, "unknown channel, using fallback");
            fallback
        }),
    };

    let post_type = theme
        .forced_post_type
        .clone()
        .unwrap_or_else(|| draft.post_type.trim().to_string());

    let tone = match draft.tone.trim() {
        "" => theme.primary_tone.clone(),
        t => t.to_string(),
    };

    let search_needed = match theme.product_strategy {
        ProductStrategy::Required => true,
        ProductStrategy::EducationalOnly => false,
        ProductStrategy::Flexible => draft.search_needed,
    };

    let preferred_category = draft
        .preferred_category
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());

    let search_keywords = match draft.search_keywords.as_deref().map(str::trim) {
        Some(k) if !k.is_empty() => k.to_string(),
        _ => keyword_fallback(&request.topic.topic),
    };

    ContentStrategy {
        post_type,
        tone,
        channel,
        search_needed,
        preferred_category,
        search_keywords,
    }
}

/// The solution half of a topic, or the whole normalized topic when it has none.
fn keyword_fallback(topic_text: &str) -> String {
    let parts = topic::split(topic_text);
    if parts.solution.is_empty() {
        parts.problem
    } else {
        parts.solution
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct StrategyEngine<'a> {
    llm: &'a dyn LlmClient,
    temperature: f32,
}

impl<'a> StrategyEngine<'a> {
    pub fn new(llm: &'a dyn LlmClient, temperature: f32) -> Self {
        Self { llm, temperature }
    }

    #[instrument(skip_all, fields(topic = %request.topic.topic))]
    pub async fn decide(&self, request: &StrategyRequest<'_>) -> Result<ContentStrategy> {
        let prompt = build_prompt(request);
        debug!(prompt_chars = prompt.len(), "strategy prompt built");

        let completion = CompletionRequest::new(STRATEGY_SYSTEM, prompt)
            .with_temperature(self.temperature)
            .with_max_tokens(STRATEGY_SCHEMA.max_tokens);
        let raw = self.llm.complete(completion).await?;
        let draft: StrategyDraft = parse_with_retry(self.llm, &raw, &STRATEGY_SCHEMA).await?;

        let strategy = apply_rules(draft, request);
        info!(
            post_type = %strategy.post_type,
            channel = %strategy.channel,
            search_needed = strategy.search_needed,
            "strategy decided"
        );
        Ok(strategy)
    }
}

/// Assemble the strategy prompt.
pub fn build_prompt(request: &StrategyRequest<'_>) -> String {
    let theme = request.theme;
    let topic = request.topic;
    let mut prompt = format!(
        "Decide la estrategia de contenido para este tema.\n\n\
         TEMA IDENTIFICADO: {topic_text}\nPROBLEMA: {problem}\nÁNGULO: {angle}\nAUDIENCIA: {audience}\n\n\
         PLAN SEMANAL:\nDía: {day}\nTema del día: {label}\nTono principal: {tone} (alternativas: {alts})\n\
         Tipos de post recomendados (en orden): {types}\n\n",
        topic_text = topic.topic,
        problem = topic.problem_identified,
        angle = topic.angle,
        audience = topic.target_audience,
        day = theme.day_name,
        label = theme.theme_label,
        tone = theme.primary_tone,
        alts = theme.alternative_tones.join(", "),
        types = theme.recommended_post_types.join(", "),
    );

    if let Some(forced) = &theme.forced_post_type {
        prompt.push_str(&format!("📅 Fecha especial: el tipo de post es \"{forced}\".\n\n"));
    }

    if request.recent_channels.is_empty() {
        prompt.push_str("No hay canales recientes.\n\n");
    } else {
        prompt.push_str("CANALES USADOS RECIENTEMENTE:\n");
        for channel in request.recent_channels.iter().take(MAX_RECENT_CHANNELS) {
            prompt.push_str(&format!("- {channel}\n"));
        }
        prompt.push_str("\n⚠️ Elige un canal DIFERENTE a los recientes.\n\n");
    }

    if let Some(hint) = request.variety_hint.filter(|h| !h.trim().is_empty()) {
        prompt.push_str(&format!("ANÁLISIS DE VARIEDAD:\n{hint}\n\n"));
    }

    prompt.push_str("REGLAS PARA ESTE DÍA:\n");
    prompt.push_str(match theme.product_strategy {
        ProductStrategy::Required => {
            "💸 DÍA DE PROMOCIONES: search_needed es SIEMPRE true. Indica preferred_category y \
             search_keywords para encontrar el producto.\n\n"
        }
        ProductStrategy::EducationalOnly => {
            "📚 DÍA EDUCATIVO: search_needed es false. Enfócate en educar, informar o inspirar.\n\n"
        }
        ProductStrategy::Flexible => {
            "🔧 DÍA FLEXIBLE: search_needed = true solo si el tema pide un producto concreto.\n\n"
        }
    });

    let channels: Vec<&str> = Channel::ALL.iter().map(|c| c.as_str()).collect();
    prompt.push_str(&format!(
        "TIPOS DE POST DISPONIBLES: {POST_TYPES}\nTONOS DISPONIBLES: {TONES}\n\
         CANALES DISPONIBLES: {}\n\n\
         RESPONDE SOLO CON JSON (sin markdown):\n\
         {{\"post_type\": \"...\", \"tone\": \"...\", \"channel\": \"...\", \"search_needed\": true, \
         \"preferred_category\": \"...\", \"search_keywords\": \"...\"}}",
        channels.join(", ")
    ));
    prompt
}

//! Stage 1: pick the topic for a calendar slot.
//!
//! The model proposes a [`TopicStrategy`]; the record goes through the shared
//! JSON layer and then through a format check driven by the day's
//! [`TopicFormat`]. A format failure gets exactly one corrective follow-up.

use chrono::{Datelike, NaiveDate};
use postforge_llm::{CompletionRequest, LlmClient};
use postforge_shared::{PostforgeError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::json_repair::{CheckedRecord, StageSchema, parse_with_retry};
use crate::theme::{SEASONAL_CONTEXT, Sector, ThemeDescriptor, TopicFormat, season_note};
use crate::topic;

/// System prompt for the topic stage. Test doubles route on "estratega de temas".
pub const TOPIC_SYSTEM: &str = "Eres el estratega de temas de una tienda de insumos agrícolas, \
     forestales y ganaderos en Durango, México. Identificas problemas reales de productores \
     comerciales y los conviertes en temas concretos para redes sociales. Respondes solo con JSON.";

const TOPIC_TEMPERATURE: f32 = 1.0;
const MAX_RECENT_TOPICS: usize = 10;
const PLAIN_TITLE_CHARS: std::ops::RangeInclusive<usize> = 10..=150;

const TOPIC_SCHEMA: StageSchema = StageSchema {
    stage: "topic engine",
    hint: "Required schema: {\"topic\": string, \"problem_identified\": string, \"angle\": string, \
           \"urgency_level\": \"high|medium|low\", \"target_audience\": \
           \"plant|animal|forestry|general\"}",
    snippet_chars: 500,
    max_tokens: 1024,
};

/// Output of the topic stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicStrategy {
    pub topic: String,
    #[serde(default)]
    pub problem_identified: String,
    #[serde(default)]
    pub angle: String,
    #[serde(default = "default_urgency")]
    pub urgency_level: String,
    #[serde(default = "default_audience")]
    pub target_audience: String,
}

fn default_urgency() -> String {
    "medium".into()
}

fn default_audience() -> String {
    "general".into()
}

impl CheckedRecord for TopicStrategy {
    fn check(&self) -> std::result::Result<(), String> {
        if self.topic.trim().is_empty() {
            return Err("topic must not be empty".into());
        }
        Ok(())
    }
}

/// A candidate the dedup engine turned down earlier in this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedTopic {
    pub topic: String,
    pub reason: String,
}

/// Inputs for one topic generation.
#[derive(Debug, Clone)]
pub struct TopicRequest<'a> {
    pub date: NaiveDate,
    pub theme: &'a ThemeDescriptor,
    /// Newest first; only the first few are shown to the model.
    pub recent_topics: &'a [String],
    pub suggested_topic: Option<&'a str>,
    pub rejected: &'a [RejectedTopic],
    /// Advisory text from the variety analysis.
    pub variety_hint: Option<&'a str>,
}

/// Check `topic` against the day's format policy.
pub fn check_format(topic_text: &str, format: TopicFormat) -> std::result::Result<(), String> {
    match format {
        TopicFormat::ErrorDamageSolution => {
            topic::validate(topic_text)?;
            let parts = topic::separator_count(topic_text) + 1;
            if parts != 3 {
                return Err(format!(
                    "expected exactly 3 parts 'Error → Daño → Solución', got {parts}"
                ));
            }
            Ok(())
        }
        TopicFormat::PlainTitle => {
            if topic::separator_count(topic_text) > 0 {
                return Err("a plain title must not contain '→'".into());
            }
            let len = topic_text.trim().chars().count();
            if !PLAIN_TITLE_CHARS.contains(&len) {
                return Err(format!(
                    "title length {len} outside {}-{} characters",
                    PLAIN_TITLE_CHARS.start(),
                    PLAIN_TITLE_CHARS.end()
                ));
            }
            Ok(())
        }
    }
}

fn format_rule(format: TopicFormat) -> &'static str {
    match format {
        TopicFormat::ErrorDamageSolution => {
            "El tema DEBE tener exactamente tres partes separadas por '→': \
             \"Error específico → Daño medible (números, %) → Técnica concreta\""
        }
        TopicFormat::PlainTitle => {
            "El tema DEBE ser un título descriptivo de 10 a 150 caracteres, SIN el símbolo '→'"
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct TopicEngine<'a> {
    llm: &'a dyn LlmClient,
}

impl<'a> TopicEngine<'a> {
    pub fn new(llm: &'a dyn LlmClient) -> Self {
        Self { llm }
    }

    /// Generate a topic that satisfies the day's format, or fail with `TopicFormat`.
    #[instrument(skip_all, fields(date = %request.date, day = %request.theme.day_name))]
    pub async fn generate(&self, request: &TopicRequest<'_>) -> Result<TopicStrategy> {
        let format = request.theme.topic_format;
        let prompt = build_prompt(request);
        debug!(prompt_chars = prompt.len(), "topic prompt built");

        let first = self.ask(prompt.clone()).await?;
        let error = match check_format(&first.topic, format) {
            Ok(()) => {
                info!(topic = %first.topic, angle = %first.angle, "topic generated");
                return Ok(first);
            }
            Err(e) => e,
        };

        warn!(topic = %first.topic, error = %error, "topic format rejected, requesting correction");
        let corrective = format!(
            "{prompt}\n\n⚠️ CORRECCIÓN: tu respuesta anterior propuso el tema \"{topic}\", que no \
             cumple la regla de formato ({error}). {rule}. Genera un tema nuevo que sí la cumpla.\n\
             RESPONDE SOLO CON JSON.",
            topic = first.topic,
            rule = format_rule(format),
        );
        let second = self.ask(corrective).await?;
        match check_format(&second.topic, format) {
            Ok(()) => {
                info!(topic = %second.topic, "topic generated after correction");
                Ok(second)
            }
            Err(e) => Err(PostforgeError::topic_format(format!("'{}': {e}", second.topic))),
        }
    }

    async fn ask(&self, prompt: String) -> Result<TopicStrategy> {
        let request = CompletionRequest::new(TOPIC_SYSTEM, prompt)
            .with_temperature(TOPIC_TEMPERATURE)
            .with_max_tokens(TOPIC_SCHEMA.max_tokens);
        let raw = self.llm.complete(request).await?;
        parse_with_retry(self.llm, &raw, &TOPIC_SCHEMA).await
    }
}

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

/// Assemble the topic prompt for `request`.
pub fn build_prompt(request: &TopicRequest<'_>) -> String {
    let theme = request.theme;
    let mut prompt = format!(
        "Identifica un problema agrícola real para productores comerciales.\n\n\
         FECHA: {date}\nDÍA DE LA SEMANA: {day}\nTEMA DEL DÍA: {label}\nTIPO DE CONTENIDO: {content}\n\
         GUÍA: {guidance}\n\n",
        date = request.date,
        day = theme.day_name,
        label = theme.theme_label,
        content = theme.content_type,
        guidance = theme.guidance,
    );

    if let Some(special) = &theme.special_date {
        prompt.push_str(&format!(
            "📅 FECHA ESPECIAL: {}. El tema debe conectar esta fecha con el productor.\n\n",
            special.name
        ));
    }

    if request.recent_topics.is_empty() {
        prompt.push_str("No hay temas recientes; puedes elegir cualquier tema relevante.\n\n");
    } else {
        prompt.push_str("TEMAS RECIENTES (ELIGE ALGO DIFERENTE):\n");
        for recent in request.recent_topics.iter().take(MAX_RECENT_TOPICS) {
            prompt.push_str(&format!("- {recent}\n"));
        }
        prompt.push_str(
            "\n⚠️ Tu tema DEBE ser completamente diferente a los temas recientes. Puedes elegir \
             cualquier área: producción, postcosecha, comercialización, maquinaria, agua, \
             ganadería, forestal, energía, financiamiento.\n\n",
        );
    }

    if !request.rejected.is_empty() {
        prompt.push_str("⛔ TEMAS YA RECHAZADOS EN ESTA GENERACIÓN (NO los repitas ni los parafrasees):\n");
        for rejected in request.rejected {
            prompt.push_str(&format!("- \"{}\" ({})\n", rejected.topic, rejected.reason));
        }
        prompt.push('\n');
    }

    if let Some(hint) = request.variety_hint.filter(|h| !h.trim().is_empty()) {
        prompt.push_str(&format!("ANÁLISIS DE VARIEDAD:\n{hint}\n\n"));
    }

    if theme.day_name == "Friday" {
        prompt.push_str(&format!(
            "CONTEXTO ESTACIONAL DURANGO:\n{SEASONAL_CONTEXT}\nTEMPORADA ACTUAL: {}\n\n",
            season_note(request.date.month())
        ));
    }

    if let Some(sector) = theme.sector {
        prompt.push_str(&sector_brief(sector));
        prompt.push('\n');
    }

    if theme.second_post {
        prompt.push_str(RANCH_LIFE_BRIEF);
        prompt.push('\n');
    }

    if let Some(suggested) = request.suggested_topic.filter(|s| !s.trim().is_empty()) {
        prompt.push_str(&format!(
            "💡 TEMA SUGERIDO POR EL USUARIO: {suggested}\nÚsalo como base, adaptado al formato requerido.\n\n"
        ));
    }

    prompt.push_str(&format!("FORMATO: {}\n", format_rule(theme.topic_format)));
    prompt.push_str(match theme.topic_format {
        TopicFormat::ErrorDamageSolution => {
            "Ejemplos correctos:\n\
             - \"Almacenar grano sin secar → Pierdes 20% por hongos → Secado a 14% de humedad\"\n\
             - \"No calibrar sembradora → Desperdicias 30% de semilla → Calibración anual en campo\"\n\
             No uses preguntas ni títulos clickbait.\n\n"
        }
        TopicFormat::PlainTitle => {
            "Ejemplos incorrectos para este día:\n\
             - \"No fertilizar → Pierdes 40% → Programa de fertilización\" (formato de martes/jueves)\n\
             - \"¿Sabías que...?\" (clickbait)\n\
             - \"La importancia de...\" (demasiado general)\n\n"
        }
    });

    prompt.push_str(
        "RESPONDE SOLO CON JSON (sin markdown):\n\
         {\"topic\": \"...\", \"problem_identified\": \"...\", \"angle\": \"...\", \
         \"urgency_level\": \"high|medium|low\", \"target_audience\": \"plant|animal|forestry|general\"}",
    );
    prompt
}

fn sector_brief(sector: Sector) -> String {
    let context = match sector {
        Sector::Forestry => {
            "Durango tiene ~4 millones de hectáreas de uso forestal y lidera el aserrado \
             nacional. Riesgo de incendios de enero a junio (crítico abril-junio). Problemas \
             prioritarios: prevención de incendios, supervivencia en reforestación, agua para \
             viveros, plagas en pino y encino, bajo valor agregado."
        }
        Sector::Plant => {
            "79% de la superficie es de temporal; cultivos principales frijol, maíz forrajero y \
             alfalfa. El costo de insumos es el problema #1 (94.9% de productores). Problemas \
             prioritarios: riesgo de sequía, rendimiento de frijol, agricultura protegida, \
             fertilidad del suelo, riego de forrajes."
        }
        Sector::Animal => {
            "~1.58 millones de cabezas y tercer lugar nacional en leche; el sistema \
             forraje-ganado es integrado. Problemas prioritarios: costo de alimentación, estrés \
             térmico, sistemas de agua para ganado, manejo de estiércol, salud preventiva."
        }
    };
    let examples: Vec<String> = sector.examples().iter().map(|e| format!("\"{e}\"")).collect();
    format!(
        "{} POST SECTORIAL {}. {context}\nEjemplos: {}\n",
        sector.emoji(),
        sector.display_name().to_uppercase(),
        examples.join(", ")
    )
}

const RANCH_LIFE_BRIEF: &str = "🌾 POST \"LA VIDA EN EL RANCHO\": literatura emocional rural, no \
     motivación tradicional, no humor, no venta, no tecnología. Elige UN pilar: fe (sembrar sin \
     garantías), sacrificio sin reconocimiento, legado generacional o melancolía rural. El tema es \
     una frase corta y poética.\n\
     Ejemplos: \"Padres que enseñaron sin palabras\", \"Sembrar hoy para que otros coman mañana\"\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedLlm;
    use crate::theme::{resolve_theme, second_post_theme};

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("valid date")
    }

    fn request<'a>(theme: &'a ThemeDescriptor, recent: &'a [String]) -> TopicRequest<'a> {
        TopicRequest {
            date: theme.date,
            theme,
            recent_topics: recent,
            suggested_topic: None,
            rejected: &[],
            variety_hint: None,
        }
    }

    const GOOD_TUESDAY: &str = r#"{"topic": "Riego por gravedad → Pierdes 40% de agua → Cintilla de goteo calibrada", "problem_identified": "desperdicio de agua", "angle": "riego", "urgency_level": "high", "target_audience": "plant"}"#;

    #[test]
    fn format_check_per_day() {
        let three = "Riego por gravedad → Pierdes 40% de agua → Cintilla de goteo";
        assert!(check_format(three, TopicFormat::ErrorDamageSolution).is_ok());
        assert!(check_format("Riego manual gasta tiempo → Automatizar con temporizador", TopicFormat::ErrorDamageSolution).is_err());
        assert!(check_format(three, TopicFormat::PlainTitle).is_err());
        assert!(check_format("Guía de fertilización por etapa", TopicFormat::PlainTitle).is_ok());
        assert!(check_format("Corto", TopicFormat::PlainTitle).is_err());
        assert!(check_format(&"x".repeat(151), TopicFormat::PlainTitle).is_err());
    }

    #[test]
    fn prompt_carries_day_specific_briefs() {
        let friday = resolve_theme(date("2026-03-13"));
        let prompt = build_prompt(&request(&friday, &[]));
        assert!(prompt.contains("CONTEXTO ESTACIONAL DURANGO"));
        assert!(prompt.contains("SIN el símbolo"));

        let saturday = resolve_theme(date("2026-03-14"));
        assert!(build_prompt(&request(&saturday, &[])).contains("GANADERÍA"));

        let ranch = second_post_theme(date("2026-03-09")).expect("monday");
        assert!(build_prompt(&request(&ranch, &[])).contains("LA VIDA EN EL RANCHO"));

        let tuesday = resolve_theme(date("2026-03-10"));
        let prompt = build_prompt(&request(&tuesday, &[]));
        assert!(prompt.contains("exactamente tres partes"));
        assert!(!prompt.contains("CONTEXTO ESTACIONAL"));
    }

    #[test]
    fn sector_brief_lists_sector_examples() {
        for sector in [Sector::Forestry, Sector::Plant, Sector::Animal] {
            let brief = sector_brief(sector);
            assert!(brief.starts_with(sector.emoji()));
            for example in sector.examples() {
                assert!(brief.contains(example), "{example} missing from brief");
            }
        }
    }

    #[test]
    fn prompt_lists_at_most_ten_recent_and_all_rejected() {
        let theme = resolve_theme(date("2026-03-10"));
        let recent: Vec<String> = (0..15).map(|i| format!("tema reciente {i:02}")).collect();
        let rejected = vec![RejectedTopic {
            topic: "Tema repetido → daño → solución".into(),
            reason: "tema idéntico".into(),
        }];
        let mut req = request(&theme, &recent);
        req.rejected = &rejected;
        let prompt = build_prompt(&req);
        assert!(prompt.contains("tema reciente 09"));
        assert!(!prompt.contains("tema reciente 10"));
        assert!(prompt.contains("Tema repetido → daño → solución"));
    }

    #[tokio::test]
    async fn valid_topic_needs_one_call() {
        let llm = ScriptedLlm::new().on("estratega de temas", GOOD_TUESDAY);
        let theme = resolve_theme(date("2026-03-10"));
        let topic = TopicEngine::new(&llm)
            .generate(&request(&theme, &[]))
            .await
            .expect("topic");
        assert_eq!(topic.angle, "riego");
        assert_eq!(llm.calls().len(), 1);
        assert_eq!(llm.calls()[0].temperature, TOPIC_TEMPERATURE);
    }

    #[tokio::test]
    async fn one_corrective_call_fixes_format() {
        let llm = ScriptedLlm::new()
            .on("estratega de temas", r#"{"topic": "Mejora tu riego este martes"}"#)
            .on("estratega de temas", GOOD_TUESDAY);
        let theme = resolve_theme(date("2026-03-10"));
        let topic = TopicEngine::new(&llm)
            .generate(&request(&theme, &[]))
            .await
            .expect("topic after correction");
        assert!(topic.topic.starts_with("Riego por gravedad"));

        let calls = llm.calls_to("estratega de temas");
        assert_eq!(calls.len(), 2);
        assert!(calls[1].prompt.contains("Mejora tu riego este martes"));
        assert!(calls[1].prompt.contains("CORRECCIÓN"));
    }

    #[tokio::test]
    async fn second_format_failure_is_fatal() {
        let llm = ScriptedLlm::new().on(
            "estratega de temas",
            r#"{"topic": "Riego → goteo → más → cosas"}"#,
        );
        let theme = resolve_theme(date("2026-03-12"));
        let err = TopicEngine::new(&llm)
            .generate(&request(&theme, &[]))
            .await
            .expect_err("format failure");
        assert!(matches!(err, PostforgeError::TopicFormat { .. }));
        assert_eq!(llm.calls().len(), 2);
    }

    #[tokio::test]
    async fn plain_day_rejects_arrow_topics() {
        let llm = ScriptedLlm::new()
            .on("estratega de temas", GOOD_TUESDAY)
            .on("estratega de temas", r#"{"topic": "Guía de fertilización nitrogenada por etapa"}"#);
        let theme = resolve_theme(date("2026-03-11"));
        let topic = TopicEngine::new(&llm)
            .generate(&request(&theme, &[]))
            .await
            .expect("topic");
        assert_eq!(topic.topic, "Guía de fertilización nitrogenada por etapa");
        assert_eq!(topic.urgency_level, "medium");
    }
}

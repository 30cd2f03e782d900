//! Stage 3: render the caption and creative for the chosen channel.
//!
//! One LLM call, parsed into a [`ContentResponse`] through the shared JSON
//! layer. Channel constraints are then enforced in code by [`finalize`].

use postforge_llm::{CompletionRequest, LlmClient};
use postforge_shared::{BrandConfig, Channel, ProductSnapshot, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::json_repair::{CheckedRecord, StageSchema, parse_with_retry, truncate_chars};
use crate::strategy::ContentStrategy;
use crate::theme::ThemeDescriptor;
use crate::topic_engine::TopicStrategy;

/// System prompt for the content stage. Test doubles route on "redactor de contenido".
pub const CONTENT_SYSTEM: &str = "Eres el redactor de contenido y director creativo de una \
     tienda de insumos agrícolas en Durango. Escribes captions en español de México y prompts de \
     imagen detallados. Respondes solo con JSON.";

const CONTENT_SCHEMA: StageSchema = StageSchema {
    stage: "content engine",
    hint: "Required schema: {\"caption\": string (non-empty), \"image_prompt\": string \
           (mandatory), \"carousel_slides\": [string] (optional), \"cta\": string, \
           \"suggested_hashtags\": [string], \"channel\": string, \"needs_music\": boolean, \
           \"posting_time\": \"HH:MM\", \"notes\": string}",
    snippet_chars: 2000,
    max_tokens: 3072,
};

const CONTENT_RULES: &[&str] = &[
    "Números concretos con contexto: 'hasta $X dependiendo de...', 'pérdidas que pueden llegar a X% en condiciones típicas'",
    "Beneficios comparativos, no absolutos: 'ahorro vs riego por surco'",
    "No exagerar especificaciones del producto; usar lenguaje preciso",
    "Solución = contexto + producto, no solo producto (práctica correcta + producto)",
    "Producto como componente central de la solución, no único héroe",
];

// ---------------------------------------------------------------------------
// Structure detection
// ---------------------------------------------------------------------------

/// Visual layout template for the image prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StructureKind {
    ComparativeCuriosity,
    ComparativeEducational,
    Tutorial,
    SystemDiagram,
    QuickGuide3,
    StepPath4,
    CircularList5,
    IndicatorSections3,
    Lunar4Columns,
    CuriosityDriven,
}

impl StructureKind {
    pub fn guide(&self) -> &'static str {
        match self {
            Self::ComparativeCuriosity => {
                "ESTRUCTURA: Comparativa curiosa (situación común → insinuación de solución). \
                 Diseño 50/50 en tonos tierra, una frase intrigante por lado, sin cifras ni tablas \
                 en la imagen; los datos van en el caption."
            }
            Self::ComparativeEducational => {
                "ESTRUCTURA: Comparativa educativa (Opción A ↔ Opción B). Diseño limpio 50/50, \
                 2-3 características con iconos por lado, tono neutral e informativo."
            }
            Self::Tutorial => {
                "ESTRUCTURA: Tutorial paso a paso. Título superior, 4-6 pasos numerados con \
                 ilustración y medida técnica, sección inferior de tips."
            }
            Self::SystemDiagram => {
                "ESTRUCTURA: Diagrama de sistema. Vista superior del sistema en campo de Durango y \
                 vista en corte con flujos por color y dimensiones etiquetadas."
            }
            Self::QuickGuide3 => {
                "ESTRUCTURA: Guía rápida diagnóstica en 3 paneles; cada panel con subtítulo, \
                 ilustración y 1-2 síntomas con su manejo."
            }
            Self::StepPath4 => {
                "ESTRUCTURA: Proceso en 4 pasos, cuadrantes unidos por un camino; número, título, \
                 texto corto e icono por paso."
            }
            Self::CircularList5 => {
                "ESTRUCTURA: Lista circular de 5 ítems alrededor de un título central; cada ítem \
                 con nombre y 1-2 tips."
            }
            Self::IndicatorSections3 => {
                "ESTRUCTURA: 3 secciones por indicador; problema, 2 plantas indicadoras y solución \
                 corta en cada una."
            }
            Self::Lunar4Columns => {
                "ESTRUCTURA: 4 columnas lunares (nueva, creciente, llena, menguante) con icono y \
                 actividades."
            }
            Self::CuriosityDriven => {
                "ESTRUCTURA: Visual simple centrado en curiosidad. Imagen fuerte con una frase \
                 intrigante de máximo 15 palabras, un apoyo visual y pie con contacto. Sin paneles \
                 densos ni tablas."
            }
        }
    }
}

/// Pick a layout by sniffing the topic and post type.
pub fn detect_structure(topic: &str, post_type: &str, day_name: &str) -> StructureKind {
    let topic = topic.to_lowercase();
    let post_type = post_type.to_lowercase();
    let has = |keys: &[&str]| keys.iter().any(|k| topic.contains(k));

    if has(&["compar", " vs ", "tradicional"]) {
        if day_name == "Thursday" {
            StructureKind::ComparativeCuriosity
        } else {
            StructureKind::ComparativeEducational
        }
    } else if has(&["paso", "cómo", "instalación"]) || post_type.contains("tutorial") {
        StructureKind::Tutorial
    } else if has(&["sistema", "diagrama"]) {
        StructureKind::SystemDiagram
    } else if has(&["hongo", "virus", "plaga", "diagnóstico"]) {
        StructureKind::QuickGuide3
    } else if has(&["planifica", "pasos"]) {
        StructureKind::StepPath4
    } else if has(&["los 5", "5 errores"]) {
        StructureKind::CircularList5
    } else if has(&["indicador"]) {
        StructureKind::IndicatorSections3
    } else if has(&["luna"]) {
        StructureKind::Lunar4Columns
    } else {
        StructureKind::CuriosityDriven
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Creative output as the model returned it.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentResponse {
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub image_prompt: Option<String>,
    #[serde(default)]
    pub carousel_slides: Option<Vec<String>>,
    #[serde(default)]
    pub cta: Option<String>,
    #[serde(default)]
    pub suggested_hashtags: Vec<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub needs_music: bool,
    #[serde(default)]
    pub posting_time: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl ContentResponse {
    fn slides(&self) -> impl Iterator<Item = &String> {
        self.carousel_slides
            .iter()
            .flatten()
            .filter(|s| !s.trim().is_empty())
    }
}

impl CheckedRecord for ContentResponse {
    fn check(&self) -> std::result::Result<(), String> {
        if self.caption.trim().is_empty() {
            return Err("caption must not be empty".into());
        }
        let has_prompt = self
            .image_prompt
            .as_deref()
            .is_some_and(|p| !p.trim().is_empty());
        if !has_prompt && self.slides().next().is_none() {
            return Err("image_prompt is mandatory (or provide carousel_slides)".into());
        }
        Ok(())
    }
}

/// Creative output after channel constraints were applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedContent {
    pub caption: String,
    pub image_prompt: String,
    pub carousel_slides: Vec<String>,
    pub cta: Option<String>,
    pub hashtags: Vec<String>,
    pub needs_music: bool,
    pub posting_time: Option<String>,
    pub notes: Option<String>,
    pub structure: StructureKind,
}

/// Enforce the channel's constraints on a parsed response.
pub fn finalize(response: ContentResponse, channel: Channel, structure: StructureKind) -> RenderedContent {
    let format = channel.format();

    let mut slides: Vec<String> = response.slides().cloned().collect();
    if let Some((_, max)) = format.carousel_slides {
        slides.truncate(max);
    }

    let image_prompt = response
        .image_prompt
        .filter(|p| !p.trim().is_empty())
        .or_else(|| slides.first().cloned())
        .unwrap_or_default();

    let caption = truncate_chars(response.caption.trim(), format.caption_max_chars).to_string();

    let hashtags = response
        .suggested_hashtags
        .iter()
        .map(|h| h.trim().trim_start_matches('#'))
        .filter(|h| !h.is_empty())
        .map(|h| format!("#{h}"))
        .collect();

    RenderedContent {
        caption,
        image_prompt,
        carousel_slides: slides,
        cta: response.cta.filter(|c| !c.trim().is_empty()),
        hashtags,
        needs_music: response.needs_music || format.needs_music,
        posting_time: response.posting_time.filter(|t| !t.trim().is_empty()),
        notes: response.notes.filter(|n| !n.trim().is_empty()),
        structure,
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Inputs for one content render.
#[derive(Debug, Clone)]
pub struct ContentRequest<'a> {
    pub theme: &'a ThemeDescriptor,
    pub topic: &'a TopicStrategy,
    pub strategy: &'a ContentStrategy,
    pub product: Option<&'a ProductSnapshot>,
    pub brand: &'a BrandConfig,
}

pub struct ContentEngine<'a> {
    llm: &'a dyn LlmClient,
    temperature: f32,
}

impl<'a> ContentEngine<'a> {
    pub fn new(llm: &'a dyn LlmClient, temperature: f32) -> Self {
        Self { llm, temperature }
    }

    #[instrument(skip_all, fields(channel = %request.strategy.channel))]
    pub async fn render(&self, request: &ContentRequest<'_>) -> Result<RenderedContent> {
        let structure = detect_structure(
            &request.topic.topic,
            &request.strategy.post_type,
            &request.theme.day_name,
        );
        let prompt = build_prompt(request, structure);
        debug!(prompt_chars = prompt.len(), structure = ?structure, "content prompt built");

        let completion = CompletionRequest::new(CONTENT_SYSTEM, prompt)
            .with_temperature(self.temperature)
            .with_max_tokens(CONTENT_SCHEMA.max_tokens);
        let raw = self.llm.complete(completion).await?;
        let response: ContentResponse = parse_with_retry(self.llm, &raw, &CONTENT_SCHEMA).await?;

        let rendered = finalize(response, request.strategy.channel, structure);
        info!(
            caption_chars = rendered.caption.chars().count(),
            slides = rendered.carousel_slides.len(),
            hashtags = rendered.hashtags.len(),
            "content rendered"
        );
        Ok(rendered)
    }
}

/// Assemble the content prompt.
pub fn build_prompt(request: &ContentRequest<'_>, structure: StructureKind) -> String {
    let channel = request.strategy.channel;
    let format = channel.format();
    let mut prompt = format!(
        "Genera contenido para este post.\n\n\
         TEMA: {topic}\nPROBLEMA: {problem}\n\n\
         ESTRATEGIA:\n- Tipo de post: {post_type}\n- Tono: {tone}\n- Canal: {channel}\n\n",
        topic = request.topic.topic,
        problem = request.topic.problem_identified,
        post_type = request.strategy.post_type,
        tone = request.strategy.tone,
    );

    let product = request.product.filter(|_| !request.theme.second_post);
    if let Some(product) = product {
        prompt.push_str(&format!(
            "PRODUCTO SELECCIONADO:\n- Nombre: {}\n- Categoría: {}\n",
            product.name, product.category
        ));
        if !product.specs.is_empty() {
            let specs: Vec<&str> = product.specs.iter().take(3).map(String::as_str).collect();
            prompt.push_str(&format!("- Características: {}\n", specs.join(", ")));
        }
        prompt.push('\n');
    }

    prompt.push_str(&format!(
        "FORMATO PARA {channel}:\n- Aspecto: {}\n- Caption máx: {} caracteres\n- Prioridad: {:?}\n",
        format.aspect_ratio, format.caption_max_chars, format.priority
    ));
    if format.needs_music {
        prompt.push_str(&format!(
            "- Música: OBLIGATORIO ({})\n",
            format.music_style.unwrap_or("trending")
        ));
    }
    if let Some((min, max)) = format.carousel_slides {
        prompt.push_str(&format!("- Carrusel: {min} a {max} slides\n"));
    }
    prompt.push_str(&format!("- Nota: {}\n\n", format.notes));

    prompt.push_str(if channel.is_terse() {
        "DENSIDAD DEL CAPTION: corto y autoexplicativo; el visual comunica todo.\n\n"
    } else {
        "DENSIDAD DEL CAPTION: largo y explicativo. Hook corto, explicación completa, pasos o \
         datos reales y CTA. Un hook breve más una explicación completa funciona mejor que \
         saturar la imagen de datos.\n\n"
    });

    prompt.push_str("REGLAS DE CONTENIDO:\n");
    for (i, rule) in CONTENT_RULES.iter().enumerate() {
        prompt.push_str(&format!("{}. {rule}\n", i + 1));
    }

    let brand = request.brand;
    prompt.push_str(&format!(
        "\nCONTACTO (para CTA):\n- Marca: {}\n- Web: {}\n- WhatsApp: {}\n- Redes: {}\n- Email: {}\n- Ubicación: {}\n\n",
        brand.name, brand.web, brand.whatsapp, brand.social, brand.email, brand.location
    ));

    prompt.push_str(&format!(
        "INSTRUCCIONES DE IMAGEN:\n{}\n{}\nIncluye el logo de {} y el contacto en el pie de la imagen.\n\n",
        structure.guide(),
        day_style(request.theme),
        brand.name
    ));

    if request.theme.second_post {
        prompt.push_str(RANCH_LIFE_WRITING);
    }

    prompt.push_str(&format!(
        "RESPONDE SOLO CON JSON (sin markdown):\n\
         {{\"caption\": \"...\", \"image_prompt\": \"prompt detallado (OBLIGATORIO)\", \
         \"carousel_slides\": [\"...\"], \"cta\": \"...\", \"suggested_hashtags\": [\"#...\"], \
         \"channel\": \"{channel}\", \"needs_music\": {}, \"posting_time\": \"HH:MM\", \"notes\": \"...\"}}",
        format.needs_music
    ));
    prompt
}

fn day_style(theme: &ThemeDescriptor) -> &'static str {
    if theme.second_post {
        return "ESTILO: foto auténtica del rancho (manos trabajando, campo al amanecer, \
                herramientas viejas), sin texto superpuesto ni productos.";
    }
    match theme.day_name.as_str() {
        "Monday" => "ESTILO LUNES: inspiracional, tonos cálidos, paisaje con buena luz y frase destacada.",
        "Tuesday" => {
            "ESTILO MARTES: producto en uso real en campo, apariencia orgánica; sin precios, \
             badges de oferta ni diseño de flyer."
        }
        "Wednesday" => "ESTILO MIÉRCOLES: infografía didáctica y limpia, pasos numerados e iconos legibles.",
        "Thursday" => "ESTILO JUEVES: problema y solución claros, antes y después o caso real.",
        "Friday" => "ESTILO VIERNES: estacional, clima y calendario de Durango, colores de la temporada.",
        "Saturday" => "ESTILO SÁBADO: imágenes del sector del día con su vocabulario y su entorno.",
        _ => "ESTILO DOMINGO: innovación y datos, gráficos simples y visual moderno.",
    }
}

const RANCH_LIFE_WRITING: &str = "TU TAREA - POST DE \"LA VIDA EN EL RANCHO\":\n\
     Literatura emocional rural en 5 pasos: escena rural concreta, significado emocional, \
     sacrificio, universalizar (\"solo quien vive del campo entiende\"), cierre suave.\n\
     Líneas cortas, ritmo casi poético. NO vendas, NO menciones productos ni tecnología, sin CTA \
     comercial. Hashtags simples: #ElCampo #VidaRural #Rancho\n\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedLlm;
    use crate::theme::{resolve_theme, second_post_theme};
    use chrono::NaiveDate;
    use postforge_shared::PostforgeError;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("valid date")
    }

    fn response(caption: &str, image_prompt: Option<&str>, slides: Option<Vec<&str>>) -> ContentResponse {
        ContentResponse {
            caption: caption.into(),
            image_prompt: image_prompt.map(str::to_string),
            carousel_slides: slides.map(|s| s.into_iter().map(str::to_string).collect()),
            cta: Some("Escríbenos".into()),
            suggested_hashtags: vec!["riego".into(), "#campo".into(), " ".into()],
            channel: None,
            needs_music: false,
            posting_time: Some("19:00".into()),
            notes: None,
        }
    }

    fn topic(text: &str) -> TopicStrategy {
        TopicStrategy {
            topic: text.into(),
            problem_identified: "pérdida de agua".into(),
            angle: "riego".into(),
            urgency_level: "high".into(),
            target_audience: "plant".into(),
        }
    }

    fn strategy(channel: Channel) -> ContentStrategy {
        ContentStrategy {
            post_type: "Infografías".into(),
            tone: "Educational".into(),
            channel,
            search_needed: true,
            preferred_category: None,
            search_keywords: "cintilla".into(),
        }
    }

    fn snapshot() -> ProductSnapshot {
        ProductSnapshot {
            id: "p1".into(),
            name: "Cintilla calibre 8000".into(),
            sku: "CT-8000".into(),
            category: "Riego".into(),
            price: 1250.0,
            in_stock: true,
            specs: vec!["16mm".into()],
        }
    }

    #[test]
    fn structure_detection() {
        assert_eq!(detect_structure("Riego tradicional vs goteo", "", "Thursday"), StructureKind::ComparativeCuriosity);
        assert_eq!(detect_structure("Riego tradicional vs goteo", "", "Wednesday"), StructureKind::ComparativeEducational);
        assert_eq!(detect_structure("Cómo instalar cintilla", "", "Wednesday"), StructureKind::Tutorial);
        assert_eq!(detect_structure("Riego de alfalfa", "Tutorial corto", "Friday"), StructureKind::Tutorial);
        assert_eq!(detect_structure("Sistema de captación de lluvia", "", "Sunday"), StructureKind::SystemDiagram);
        assert_eq!(detect_structure("Hongo o virus en jitomate", "", "Saturday"), StructureKind::QuickGuide3);
        assert_eq!(detect_structure("Planifica tu temporal", "", "Friday"), StructureKind::StepPath4);
        assert_eq!(detect_structure("Los 5 errores del vivero", "", "Saturday"), StructureKind::CircularList5);
        assert_eq!(detect_structure("Plantas indicadoras de suelo ácido", "", "Sunday"), StructureKind::IndicatorSections3);
        assert_eq!(detect_structure("Siembra con la luna", "", "Monday"), StructureKind::Lunar4Columns);
        assert_eq!(detect_structure("Drones agrícolas en 2026", "", "Sunday"), StructureKind::CuriosityDriven);
    }

    #[test]
    fn check_requires_caption_and_some_prompt() {
        assert!(response("", Some("p"), None).check().is_err());
        assert!(response("c", None, None).check().is_err());
        assert!(response("c", Some("  "), Some(vec![" "])).check().is_err());
        assert!(response("c", None, Some(vec!["slide 1"])).check().is_ok());
    }

    #[test]
    fn first_slide_becomes_image_prompt() {
        let rendered = finalize(
            response("c", None, Some(vec!["slide 1", "slide 2"])),
            Channel::FbPost,
            StructureKind::CuriosityDriven,
        );
        assert_eq!(rendered.image_prompt, "slide 1");
        assert_eq!(rendered.carousel_slides.len(), 2);
        assert_eq!(rendered.hashtags, vec!["#riego", "#campo"]);
    }

    #[test]
    fn tiktok_caps_slides_and_forces_music() {
        let rendered = finalize(
            response("c", Some("main"), Some(vec!["1", "2", "3", "4", "5"])),
            Channel::Tiktok,
            StructureKind::CuriosityDriven,
        );
        assert_eq!(rendered.carousel_slides, vec!["1", "2", "3"]);
        assert_eq!(rendered.image_prompt, "main");
        assert!(rendered.needs_music);
    }

    #[test]
    fn caption_truncated_at_char_boundary() {
        let long = "ñ".repeat(80);
        let rendered = finalize(response(&long, Some("p"), None), Channel::WaStatus, StructureKind::CuriosityDriven);
        assert_eq!(rendered.caption.chars().count(), 50);
        assert!(rendered.needs_music);
    }

    #[test]
    fn ranch_life_prompt_omits_product() {
        let theme = second_post_theme(date("2026-03-09")).expect("monday");
        let t = topic("Padres que enseñaron sin palabras");
        let s = strategy(Channel::FbPost);
        let product = snapshot();
        let brand = BrandConfig::default();
        let request = ContentRequest {
            theme: &theme,
            topic: &t,
            strategy: &s,
            product: Some(&product),
            brand: &brand,
        };
        let prompt = build_prompt(&request, StructureKind::CuriosityDriven);
        assert!(prompt.contains("LA VIDA EN EL RANCHO"));
        assert!(!prompt.contains("Cintilla calibre 8000"));
        assert!(prompt.contains("largo y explicativo"));
    }

    #[tokio::test]
    async fn render_parses_and_enforces_channel() {
        let llm = ScriptedLlm::new().on(
            "redactor de contenido",
            r##"{"caption": "Riego eficiente", "carousel_slides": ["Slide A", "Slide B", "Slide C", "Slide D"], "suggested_hashtags": ["#riego"], "needs_music": false, "posting_time": "18:30"}"##,
        );
        let theme = resolve_theme(date("2026-03-10"));
        let t = topic("Riego por gravedad → Pierdes 40% de agua → Cintilla de goteo");
        let s = strategy(Channel::Tiktok);
        let product = snapshot();
        let brand = BrandConfig::default();
        let request = ContentRequest {
            theme: &theme,
            topic: &t,
            strategy: &s,
            product: Some(&product),
            brand: &brand,
        };

        let rendered = ContentEngine::new(&llm, 0.7).render(&request).await.expect("render");
        assert_eq!(rendered.image_prompt, "Slide A");
        assert_eq!(rendered.carousel_slides.len(), 3);
        assert!(rendered.needs_music);

        let prompt = &llm.calls()[0].prompt;
        assert!(prompt.contains("Cintilla calibre 8000"));
        assert!(prompt.contains("677-119-7737"));
        assert!(prompt.contains("corto y autoexplicativo"));
    }

    #[tokio::test]
    async fn missing_image_prompt_is_schema_error() {
        let llm = ScriptedLlm::new()
            .on("redactor de contenido", r#"{"caption": "x"}"#)
            .on("JSON formatter", r#"{"caption": "x", "notes": "still nothing"}"#);
        let theme = resolve_theme(date("2026-03-11"));
        let t = topic("Guía de fertilización por etapa");
        let s = strategy(Channel::FbPost);
        let brand = BrandConfig::default();
        let request = ContentRequest {
            theme: &theme,
            topic: &t,
            strategy: &s,
            product: None,
            brand: &brand,
        };
        let err = ContentEngine::new(&llm, 0.7)
            .render(&request)
            .await
            .expect_err("no prompt");
        assert!(matches!(err, PostforgeError::Schema { ref stage, .. } if stage == "content engine"));
    }
}

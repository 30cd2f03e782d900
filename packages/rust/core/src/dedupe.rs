//! Topic deduplication and variety analysis over recent history.
//!
//! Conflicts are control flow, not errors: [`DedupEngine::check`] returns a
//! [`DedupVerdict`] and the pipeline decides whether to regenerate.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{Duration, NaiveDate};
use postforge_shared::{Channel, DedupConfig, Post, PostId, Result};
use postforge_storage::Storage;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::topic;

/// Subject stems that must not dominate recent history, with their block thresholds.
pub const OVER_FOCUS_THRESHOLDS: &[(&str, usize)] = &[
    ("calefacc", 2),
    ("helada", 3),
    ("mantenimiento", 3),
    ("invernader", 5),
];

const PROMO_MARKERS: &[&str] = &["promo", "venta", "promoción"];

/// Words longer than four characters that say nothing about the subject.
const KEYWORD_STOPLIST: &[&str] = &[
    "problema", "solución", "estos", "estas", "sobre", "cuando", "desde", "entre", "porque",
    "hasta", "donde", "tiene", "tienes", "puedes", "puede", "hacer", "mejor", "mejora", "menos",
    "todos", "todas", "tiempo", "forma", "cómo", "nuestro", "nuestra",
];

/// Soft-check window for the problem half of a topic.
const SOFT_SCAN_LIMIT: u32 = 200;

// ---------------------------------------------------------------------------
// Verdicts
// ---------------------------------------------------------------------------

/// Outcome of checking one candidate topic against history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupVerdict {
    Clear,
    /// Same topic hash inside the hard window.
    HardConflict {
        existing_id: PostId,
        existing_date: NaiveDate,
    },
    /// Same problem half with a different solution inside the soft window.
    SoftConflict { existing_id: PostId, problem: String },
    /// The candidate touches a subject already over-represented in history.
    OverFocused { subject: String, count: usize },
}

impl DedupVerdict {
    pub fn is_clear(&self) -> bool {
        matches!(self, Self::Clear)
    }

    /// Soft and subject conflicts make a candidate usable as a last resort.
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::SoftConflict { .. } | Self::OverFocused { .. })
    }

    /// One-line reason used in exclusion hints and logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Clear => "sin conflicto".into(),
            Self::HardConflict { existing_date, .. } => {
                format!("tema idéntico ya publicado para {existing_date}")
            }
            Self::SoftConflict { problem, .. } => {
                format!("mismo problema ('{problem}') con otra solución hace pocos días")
            }
            Self::OverFocused { subject, count } => {
                format!("el tema '{subject}' ya apareció {count} veces recientemente")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runs the hard, subject and soft checks for candidate topics.
pub struct DedupEngine<'a> {
    storage: &'a Storage,
    config: &'a DedupConfig,
}

impl<'a> DedupEngine<'a> {
    pub fn new(storage: &'a Storage, config: &'a DedupConfig) -> Self {
        Self { storage, config }
    }

    /// Check `candidate` for `date`. `over_focused` comes from [`analyze_variety`].
    #[instrument(skip_all, fields(topic = candidate, %date))]
    pub async fn check(
        &self,
        candidate: &str,
        date: NaiveDate,
        over_focused: &[OverFocus],
    ) -> Result<DedupVerdict> {
        let topic_hash = topic::hash(candidate);
        if let Some(conflict) = self
            .storage
            .find_hash_conflict(&topic_hash, date, self.config.hard_window_days, None)
            .await?
        {
            return Ok(DedupVerdict::HardConflict {
                existing_id: conflict.post_id,
                existing_date: conflict.date_for,
            });
        }

        if let Some(verdict) = subject_conflict(candidate, over_focused) {
            return Ok(verdict);
        }

        let window = Duration::days(self.config.soft_window_days);
        let nearby = self
            .storage
            .posts_in_date_range(date - window, date + window, SOFT_SCAN_LIMIT)
            .await?;
        let verdict = soft_conflict(candidate, &nearby, self.config.min_problem_chars)
            .unwrap_or(DedupVerdict::Clear);
        debug!(verdict = ?verdict, "dedup check");
        Ok(verdict)
    }
}

/// Same normalized problem half with a different solution.
///
/// `posts` must already be restricted to the soft window. Skipped when the
/// candidate's problem half is shorter than `min_problem_chars`.
pub fn soft_conflict(candidate: &str, posts: &[Post], min_problem_chars: usize) -> Option<DedupVerdict> {
    let parts = topic::split(candidate);
    if parts.problem.chars().count() < min_problem_chars {
        return None;
    }

    posts.iter().find_map(|post| {
        if post.topic.trim().is_empty() {
            return None;
        }
        let existing = topic::split(&post.topic);
        (existing.problem == parts.problem && existing.solution != parts.solution).then(|| {
            DedupVerdict::SoftConflict {
                existing_id: post.id.clone(),
                problem: parts.problem.clone(),
            }
        })
    })
}

/// The first over-focused subject the candidate touches.
pub fn subject_conflict(candidate: &str, over_focused: &[OverFocus]) -> Option<DedupVerdict> {
    let lowered = candidate.to_lowercase();
    over_focused
        .iter()
        .find(|f| lowered.contains(f.subject))
        .map(|f| DedupVerdict::OverFocused {
            subject: f.subject.to_string(),
            count: f.count,
        })
}

/// Posts with `date_for` in `[date - days_back, date]`, newest generation first.
pub async fn fetch_recent_posts(
    storage: &Storage,
    date: NaiveDate,
    days_back: i64,
    limit: u32,
) -> Result<Vec<Post>> {
    storage
        .posts_in_date_range(date - Duration::days(days_back), date, limit)
        .await
}

// ---------------------------------------------------------------------------
// Exclusion sets
// ---------------------------------------------------------------------------

/// Recent usage reported by the caller, merged into the history-derived sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DedupContext {
    #[serde(default)]
    pub recent_product_ids: Vec<String>,
    #[serde(default)]
    pub recent_categories: Vec<String>,
}

/// Items already chosen earlier in the same generation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchUsage {
    #[serde(default)]
    pub product_ids: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
}

impl BatchUsage {
    pub fn record(&mut self, product_id: &str, category: &str) {
        self.product_ids.push(product_id.to_string());
        self.categories.push(category.to_string());
    }
}

/// Everything recent history says to avoid.
#[derive(Debug, Clone, Default)]
pub struct DedupSets {
    pub recent_product_ids: HashSet<String>,
    /// Lowercased category → times used.
    pub recent_categories: HashMap<String, usize>,
    /// Most recent first, without repeats.
    pub recent_channels: Vec<Channel>,
    pub recent_topics: Vec<String>,
    pub recent_keywords: BTreeSet<String>,
    pub batch_ids: HashSet<String>,
    pub batch_categories: HashSet<String>,
}

impl DedupSets {
    /// Recent and batch ids together.
    pub fn excluded_ids(&self) -> HashSet<String> {
        self.recent_product_ids
            .union(&self.batch_ids)
            .cloned()
            .collect()
    }

    /// Category counts over recent history plus one per batch category.
    pub fn category_usage(&self) -> HashMap<String, usize> {
        let mut usage = self.recent_categories.clone();
        for category in &self.batch_categories {
            *usage.entry(category.clone()).or_default() += 1;
        }
        usage
    }
}

/// Build the exclusion sets from history, caller context and the current run.
pub fn extract_dedup_sets(posts: &[Post], context: &DedupContext, batch: &BatchUsage) -> DedupSets {
    let mut sets = DedupSets::default();

    for post in posts {
        if let Some(id) = &post.selected_product_id {
            sets.recent_product_ids.insert(id.clone());
        }
        if !sets.recent_channels.contains(&post.channel) {
            sets.recent_channels.push(post.channel);
        }
        if !post.topic.trim().is_empty() {
            sets.recent_topics.push(post.topic.clone());
            sets.recent_keywords.extend(topic_keywords(&post.topic));
        }

        let products = post
            .formatted_content
            .get("products")
            .and_then(|p| p.as_array());
        for product in products.into_iter().flatten() {
            if let Some(id) = json_id(product.get("id")) {
                sets.recent_product_ids.insert(id);
            }
            if let Some(category) = product.get("category").and_then(|c| c.as_str()) {
                *sets
                    .recent_categories
                    .entry(category.to_lowercase())
                    .or_default() += 1;
            }
        }
    }

    sets.recent_product_ids
        .extend(context.recent_product_ids.iter().cloned());
    for category in &context.recent_categories {
        *sets
            .recent_categories
            .entry(category.to_lowercase())
            .or_default() += 1;
    }

    sets.batch_ids.extend(batch.product_ids.iter().cloned());
    sets.batch_categories
        .extend(batch.categories.iter().map(|c| c.to_lowercase()));
    sets
}

/// Ids may be stored as strings or numbers.
fn json_id(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Subject words of a topic: longer than four characters, stoplist removed.
pub fn topic_keywords(topic: &str) -> Vec<String> {
    topic
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 4 && !KEYWORD_STOPLIST.contains(w))
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Variety metrics
// ---------------------------------------------------------------------------

/// A subject stem at or above its recurrence threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverFocus {
    pub subject: &'static str,
    pub count: usize,
}

/// Repetition signals fed back into prompts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VarietyMetrics {
    /// Lowercased post type → count.
    pub type_counts: BTreeMap<String, usize>,
    pub most_common_type: Option<(String, usize)>,
    /// Set when the two most recent posts share a type.
    pub last_two_same_type: Option<String>,
    pub channel_counts: BTreeMap<String, usize>,
    pub promo_count: usize,
    pub total_recent: usize,
    pub penalize_promo: bool,
    pub over_focused: Vec<OverFocus>,
}

/// Analyze `posts` (newest first) plus summaries generated earlier in this run.
pub fn analyze_variety(posts: &[Post], batch_history: &[String]) -> VarietyMetrics {
    let mut metrics = VarietyMetrics::default();

    let types: Vec<String> = posts
        .iter()
        .map(|p| p.post_type.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    for t in &types {
        *metrics.type_counts.entry(t.clone()).or_default() += 1;
    }
    for post in posts {
        *metrics
            .channel_counts
            .entry(post.channel.as_str().to_string())
            .or_default() += 1;
    }

    metrics.most_common_type = metrics
        .type_counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(t, n)| (t.clone(), *n));

    if let [first, second, ..] = types.as_slice() {
        if first == second {
            metrics.last_two_same_type = Some(first.clone());
        }
    }

    let db_promos = types.iter().filter(|t| is_promotional(t)).count();
    let batch_promos = batch_history.iter().filter(|h| is_promotional(h)).count();
    metrics.promo_count = db_promos + batch_promos;
    metrics.total_recent = types.len() + batch_history.len();

    let last_two_promo = types.len() >= 2 && types[..2].iter().all(|t| is_promotional(t));
    let fraction = if metrics.total_recent == 0 {
        0.0
    } else {
        metrics.promo_count as f64 / metrics.total_recent as f64
    };
    metrics.penalize_promo = fraction > 0.2 || last_two_promo;

    let topics: Vec<String> = posts.iter().map(|p| p.topic.to_lowercase()).collect();
    metrics.over_focused = OVER_FOCUS_THRESHOLDS
        .iter()
        .filter_map(|&(subject, threshold)| {
            let count = topics.iter().filter(|t| t.contains(subject)).count();
            (count >= threshold).then_some(OverFocus { subject, count })
        })
        .collect();

    metrics
}

fn is_promotional(text: &str) -> bool {
    let lowered = text.to_lowercase();
    PROMO_MARKERS.iter().any(|m| lowered.contains(m))
}

impl VarietyMetrics {
    pub fn type_repetition(&self) -> bool {
        self.most_common_type.as_ref().is_some_and(|(_, n)| *n >= 2)
            || self.last_two_same_type.is_some()
    }

    /// Advisory text for the topic and strategy prompts.
    pub fn to_prompt(&self) -> String {
        let mut out = String::new();

        if let Some((t, n)) = &self.most_common_type {
            if *n >= 2 && self.total_recent >= 2 {
                out.push_str(&format!(
                    "⛔ ALERTA: El tipo '{t}' se ha usado {n} veces recientemente. ELIGE UN TIPO DIFERENTE hoy.\n"
                ));
            }
        }
        if let Some(t) = &self.last_two_same_type {
            out.push_str(&format!(
                "⛔ ALERTA: Los últimos 2 posts fueron del tipo '{t}'. No uses este tipo hoy.\n"
            ));
        }
        if self.penalize_promo {
            out.push_str(&format!(
                "⚠️ {} de {} posts recientes fueron promocionales. Prioriza contenido educativo o de valor.\n",
                self.promo_count, self.total_recent
            ));
        }
        for focus in &self.over_focused {
            out.push_str(&format!(
                "⛔ PROHIBIDO: ya hay {} posts recientes sobre '{}'. Elige un tema completamente diferente.\n",
                focus.count, focus.subject
            ));
        }
        if !self.channel_counts.is_empty() {
            let channels: Vec<String> = self
                .channel_counts
                .iter()
                .map(|(c, n)| format!("{c} ({n})"))
                .collect();
            out.push_str(&format!("Canales recientes: {}\n", channels.join(", ")));
        }

        if out.is_empty() {
            "Sin señales de repetición en el historial reciente.".into()
        } else {
            out
        }
    }
}

/// One line per recent post for prompts, followed by batch summaries.
pub fn history_summary(posts: &[Post], batch_history: &[String]) -> String {
    let mut lines: Vec<String> = posts
        .iter()
        .map(|p| {
            let mut parts = Vec::new();
            if !p.post_type.is_empty() {
                parts.push(format!("Tipo: {}", p.post_type));
            }
            parts.push(format!("Canal: {}", p.channel));
            let topic = if p.topic.is_empty() { "Sin tema" } else { &p.topic };
            parts.push(format!("Tema: {topic}"));
            if let Some(id) = &p.selected_product_id {
                parts.push(format!("Producto ID: {id}"));
            }
            parts.join(" | ")
        })
        .collect();
    lines.extend(batch_history.iter().cloned());

    if lines.is_empty() {
        "Sin historial previo.".into()
    } else {
        format!("- {}", lines.join("\n- "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use postforge_shared::PostStatus;
    use uuid::Uuid;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("valid date")
    }

    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("pf_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn post(topic_text: &str, date_for: &str, post_type: &str) -> Post {
        Post {
            id: PostId::new(),
            external_id: None,
            date_for: date(date_for),
            created_at: Utc::now(),
            channel: Channel::FbPost,
            post_type: post_type.into(),
            content_tone: String::new(),
            topic: topic_text.into(),
            topic_hash: topic::hash(topic_text),
            problem_identified: String::new(),
            caption: "c".into(),
            image_prompt: "p".into(),
            carousel_slides: Vec::new(),
            needs_music: false,
            posting_time: None,
            cta: None,
            hashtags: Vec::new(),
            selected_product_id: None,
            formatted_content: serde_json::Value::Null,
            status: PostStatus::Draft,
            user_feedback: None,
            possibly_duplicate: false,
        }
    }

    #[tokio::test]
    async fn hard_window_five_days_rejected_eleven_accepted() {
        let storage = test_storage().await;
        let config = DedupConfig::default();
        let existing = post("Riego por gravedad → Pierdes 40% de agua → Cintilla", "2026-03-01", "Tip");
        let stored = storage
            .save_post_checked(&existing, config.hard_window_days)
            .await
            .expect("seed");

        let engine = DedupEngine::new(&storage, &config);
        let near = engine
            .check("riego por gravedad -> pierdes 40% de agua -> cintilla", date("2026-03-06"), &[])
            .await
            .expect("check");
        assert_eq!(
            near,
            DedupVerdict::HardConflict {
                existing_id: stored.id.clone(),
                existing_date: date("2026-03-01"),
            }
        );

        let far = engine
            .check(&existing.topic, date("2026-03-12"), &[])
            .await
            .expect("check");
        assert!(far.is_clear());
    }

    #[tokio::test]
    async fn soft_window_two_days_conflicts_four_days_does_not() {
        let storage = test_storage().await;
        let config = DedupConfig::default();
        let existing = post("riego manual pierde agua → goteo", "2026-03-10", "Tip");
        storage
            .save_post_checked(&existing, config.hard_window_days)
            .await
            .expect("seed");

        let engine = DedupEngine::new(&storage, &config);
        let candidate = "riego manual pierde agua → aspersión";

        let close = engine.check(candidate, date("2026-03-12"), &[]).await.expect("check");
        assert!(matches!(close, DedupVerdict::SoftConflict { .. }));
        assert!(close.is_soft());

        let apart = engine.check(candidate, date("2026-03-14"), &[]).await.expect("check");
        assert!(apart.is_clear());
    }

    #[test]
    fn soft_check_skips_short_problems() {
        let history = vec![post("riego → goteo", "2026-03-10", "Tip")];
        assert_eq!(soft_conflict("riego → aspersión", &history, 10), None);
    }

    #[test]
    fn soft_check_allows_same_solution() {
        let history = vec![post("riego manual pierde agua → goteo", "2026-03-10", "Tip")];
        assert_eq!(soft_conflict("Riego manual pierde agua -> Goteo", &history, 10), None);
    }

    #[test]
    fn dedup_sets_merge_history_context_and_batch() {
        let mut p1 = post("Cintilla de goteo para maíz forrajero", "2026-03-10", "Tip");
        p1.selected_product_id = Some("a".into());
        p1.formatted_content = serde_json::json!({
            "products": [{"id": "b", "category": "Riego"}, {"id": 7, "category": "riego"}]
        });
        let mut p2 = post("Bebederos para ganado", "2026-03-09", "Tip");
        p2.channel = Channel::Tiktok;

        let context = DedupContext {
            recent_product_ids: vec!["c".into()],
            recent_categories: vec!["RIEGO".into()],
        };
        let mut batch = BatchUsage::default();
        batch.record("d", "Mallas");

        let sets = extract_dedup_sets(&[p1, p2], &context, &batch);
        for id in ["a", "b", "7", "c"] {
            assert!(sets.recent_product_ids.contains(id), "missing {id}");
        }
        assert_eq!(sets.recent_categories.get("riego"), Some(&3));
        assert_eq!(sets.recent_channels, vec![Channel::FbPost, Channel::Tiktok]);
        assert!(sets.recent_keywords.contains("cintilla"));
        assert!(sets.recent_keywords.contains("forrajero"));
        assert!(!sets.recent_keywords.contains("para"));
        assert!(sets.excluded_ids().contains("d"));
        assert_eq!(sets.category_usage().get("mallas"), Some(&1));
    }

    #[test]
    fn variety_flags_repeated_types_and_promos() {
        let posts = vec![
            post("a", "2026-03-10", "Promoción puntual"),
            post("b", "2026-03-09", "Promoción puntual"),
            post("c", "2026-03-08", "Tutorial corto"),
        ];
        let metrics = analyze_variety(&posts, &[]);
        assert_eq!(metrics.most_common_type, Some(("promoción puntual".into(), 2)));
        assert_eq!(metrics.last_two_same_type.as_deref(), Some("promoción puntual"));
        assert!(metrics.type_repetition());
        assert!(metrics.penalize_promo);
        assert!(metrics.to_prompt().contains("promoción puntual"));
    }

    #[test]
    fn batch_history_counts_toward_promo_fraction() {
        let posts: Vec<Post> = (0..5)
            .map(|i| post(&format!("t{i}"), "2026-03-10", "Tutorial corto"))
            .collect();
        let quiet = analyze_variety(&posts, &[]);
        assert!(!quiet.penalize_promo);

        let batch = vec!["Tipo: Promoción puntual | Tema: x".to_string(), "venta de kits".into()];
        let noisy = analyze_variety(&posts, &batch);
        assert_eq!(noisy.promo_count, 2);
        assert!(noisy.penalize_promo);
    }

    #[test]
    fn over_focus_blocks_candidate_subject() {
        let posts = vec![
            post("Calefacción en invernadero", "2026-03-10", "Tip"),
            post("Costos de calefacción", "2026-03-09", "Tip"),
            post("Heladas tardías", "2026-03-08", "Tip"),
        ];
        let metrics = analyze_variety(&posts, &[]);
        assert_eq!(
            metrics.over_focused,
            vec![OverFocus { subject: "calefacc", count: 2 }]
        );

        let verdict = subject_conflict("Calefacción solar para viveros", &metrics.over_focused);
        assert!(matches!(verdict, Some(DedupVerdict::OverFocused { ref subject, .. }) if subject == "calefacc"));
        assert_eq!(subject_conflict("Heladas y mantas térmicas", &metrics.over_focused), None);
    }

    #[test]
    fn history_summary_lists_posts_then_batch() {
        let mut p = post("Riego por goteo", "2026-03-10", "Tip");
        p.selected_product_id = Some("42".into());
        let summary = history_summary(&[p], &["Tipo: Kits | Tema: mallas".into()]);
        assert!(summary.starts_with("- Tipo: Tip | Canal: fb-post | Tema: Riego por goteo | Producto ID: 42"));
        assert!(summary.ends_with("Tema: mallas"));
        assert_eq!(history_summary(&[], &[]), "Sin historial previo.");
    }
}

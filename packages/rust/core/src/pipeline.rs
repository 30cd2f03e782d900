//! Generation pipeline and boundary operations.
//!
//! Theme → Topic → Dedup → Strategy → Product → Content → persist, strictly
//! in that order. Nothing is written until the last step, so a failure at
//! any stage leaves storage untouched.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use postforge_llm::{Embedder, LlmClient};
use postforge_shared::{
    AppConfig, CatalogItem, Channel, Post, PostId, PostStatus, PostforgeError, Result,
};
use postforge_storage::Storage;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::content_engine::{ContentEngine, ContentRequest};
use crate::dedupe::{
    BatchUsage, DedupContext, DedupEngine, OverFocus, analyze_variety, extract_dedup_sets,
    fetch_recent_posts, history_summary,
};
use crate::products::{ProductSelector, SelectedProduct};
use crate::rate_limit::{Action, RateLimiter};
use crate::strategy::{StrategyEngine, StrategyRequest};
use crate::theme::{ThemeDescriptor, resolve_theme, second_post_theme};
use crate::topic;
use crate::topic_engine::{RejectedTopic, TopicEngine, TopicRequest, TopicStrategy};

/// Caller key used when none is supplied.
pub const LOCAL_CALLER: &str = "local";

// ---------------------------------------------------------------------------
// Request / outcome
// ---------------------------------------------------------------------------

/// Input for one generation.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub date: NaiveDate,
    pub suggested_topic: Option<String>,
    pub forced_channel: Option<Channel>,
    /// Monday's ranch-life slot.
    pub second_post: bool,
    pub dedup_context: DedupContext,
    pub batch_usage: BatchUsage,
    /// Summaries of posts generated earlier in the same run.
    pub batch_history: Vec<String>,
    pub caller_key: String,
    pub persist: bool,
}

impl GenerateRequest {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            suggested_topic: None,
            forced_channel: None,
            second_post: false,
            dedup_context: DedupContext::default(),
            batch_usage: BatchUsage::default(),
            batch_history: Vec::new(),
            caller_key: LOCAL_CALLER.to_string(),
            persist: true,
        }
    }
}

/// Result of a generation.
#[derive(Debug, Clone)]
pub struct GenerateOutcome {
    pub post: Post,
    pub persisted: bool,
    /// Topic generations used, including the accepted one.
    pub attempts: u32,
    /// Candidates turned down by the dedup engine, in order.
    pub rejected: Vec<RejectedTopic>,
    pub product: Option<SelectedProduct>,
}

impl GenerateOutcome {
    /// One-line summary suitable for `GenerateRequest::batch_history`.
    pub fn batch_summary(&self) -> String {
        let mut line = format!(
            "Tipo: {} | Canal: {} | Tema: {}",
            self.post.post_type, self.post.channel, self.post.topic
        );
        if let Some(product) = &self.product {
            line.push_str(&format!(" | Producto ID: {}", product.id));
        }
        line
    }
}

struct TopicChoice {
    topic: TopicStrategy,
    attempts: u32,
    rejected: Vec<RejectedTopic>,
    possibly_duplicate: bool,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Owns the collaborators every boundary operation needs.
pub struct PostService {
    storage: Storage,
    llm: Arc<dyn LlmClient>,
    embedder: Option<Arc<dyn Embedder>>,
    config: AppConfig,
    limiter: RateLimiter,
}

impl PostService {
    pub fn new(
        storage: Storage,
        llm: Arc<dyn LlmClient>,
        embedder: Option<Arc<dyn Embedder>>,
        config: AppConfig,
    ) -> Self {
        let limiter = RateLimiter::new(&config.rate_limit);
        Self {
            storage,
            llm,
            embedder,
            config,
            limiter,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Run the full pipeline for one post.
    #[instrument(skip_all, fields(date = %request.date, second_post = request.second_post))]
    pub async fn generate(&self, request: GenerateRequest) -> Result<GenerateOutcome> {
        self.limiter.check(&request.caller_key, Action::Generate)?;

        let theme = if request.second_post {
            second_post_theme(request.date).ok_or_else(|| {
                PostforgeError::validation(format!(
                    "second post is only scheduled on Mondays, {} is not one",
                    request.date
                ))
            })?
        } else {
            resolve_theme(request.date)
        };
        info!(theme = %theme.theme_label, "theme resolved");

        let dedup = &self.config.dedup;
        let recent = fetch_recent_posts(
            &self.storage,
            request.date,
            dedup.history_days,
            dedup.history_limit,
        )
        .await?;
        let variety = analyze_variety(&recent, &request.batch_history);
        let sets = extract_dedup_sets(&recent, &request.dedup_context, &request.batch_usage);
        let variety_hint = variety.to_prompt();
        let topic_hint = if sets.recent_keywords.is_empty() {
            variety_hint.clone()
        } else {
            let keywords: Vec<&str> = sets.recent_keywords.iter().map(String::as_str).collect();
            format!(
                "{variety_hint}\nPalabras clave ya usadas (evítalas): {}\n",
                keywords.join(", ")
            )
        };
        let strategy_hint = format!(
            "{variety_hint}\nHISTORIAL RECIENTE:\n{}\n",
            history_summary(&recent, &request.batch_history)
        );

        let choice = self
            .choose_topic(&request, &theme, &sets.recent_topics, &topic_hint, &variety.over_focused)
            .await?;

        let strategy = StrategyEngine::new(self.llm.as_ref(), self.config.llm.temperature)
            .decide(&StrategyRequest {
                theme: &theme,
                topic: &choice.topic,
                recent_channels: &sets.recent_channels,
                forced_channel: request.forced_channel,
                variety_hint: Some(&strategy_hint),
            })
            .await?;

        let product = if strategy.search_needed && !theme.second_post {
            ProductSelector::new(
                &self.storage,
                self.embedder.as_deref(),
                &self.config.products,
            )
            .select(
                &strategy.search_keywords,
                strategy.preferred_category.as_deref(),
                &sets,
            )
            .await?
        } else {
            None
        };

        let content = ContentEngine::new(self.llm.as_ref(), self.config.llm.temperature)
            .render(&ContentRequest {
                theme: &theme,
                topic: &choice.topic,
                strategy: &strategy,
                product: product.as_ref().map(|p| &p.snapshot),
                brand: &self.config.brand,
            })
            .await?;

        let products: Vec<serde_json::Value> = product
            .iter()
            .map(|p| {
                json!({
                    "id": p.id,
                    "category": p.category,
                    "name": p.snapshot.name,
                    "sku": p.snapshot.sku,
                    "price": p.snapshot.price,
                    "in_stock": p.snapshot.in_stock,
                    "reused": p.reused,
                    "source": p.source,
                })
            })
            .collect();

        let post = Post {
            id: PostId::new(),
            external_id: None,
            date_for: request.date,
            created_at: Utc::now(),
            channel: strategy.channel,
            post_type: strategy.post_type.clone(),
            content_tone: strategy.tone.clone(),
            topic_hash: topic::hash(&choice.topic.topic),
            topic: choice.topic.topic.clone(),
            problem_identified: choice.topic.problem_identified.clone(),
            caption: content.caption,
            image_prompt: content.image_prompt,
            carousel_slides: content.carousel_slides,
            needs_music: content.needs_music,
            posting_time: content.posting_time,
            cta: content.cta,
            hashtags: content.hashtags,
            selected_product_id: product.as_ref().map(|p| p.id.clone()),
            formatted_content: json!({
                "products": products,
                "theme": theme,
                "strategy": strategy,
                "topic": choice.topic,
                "structure": content.structure,
                "notes": content.notes,
            }),
            status: PostStatus::Draft,
            user_feedback: None,
            possibly_duplicate: choice.possibly_duplicate,
        };

        let (post, persisted) = if request.persist && !post.possibly_duplicate {
            (self.store(post).await?, true)
        } else {
            (post, false)
        };
        info!(
            post_id = %post.id,
            topic_hash = %post.topic_hash,
            channel = %post.channel,
            attempts = choice.attempts,
            persisted,
            "post generated"
        );

        Ok(GenerateOutcome {
            post,
            persisted,
            attempts: choice.attempts,
            rejected: choice.rejected,
            product,
        })
    }

    /// Topic generation with dedup-driven regeneration.
    async fn choose_topic(
        &self,
        request: &GenerateRequest,
        theme: &ThemeDescriptor,
        recent_topics: &[String],
        hint: &str,
        over_focused: &[OverFocus],
    ) -> Result<TopicChoice> {
        let engine = TopicEngine::new(self.llm.as_ref());
        let checker = DedupEngine::new(&self.storage, &self.config.dedup);
        let max_attempts = self.config.dedup.max_attempts.max(1);

        let mut rejected: Vec<RejectedTopic> = Vec::new();
        let mut best_soft: Option<TopicStrategy> = None;
        let mut last: Option<TopicStrategy> = None;

        for attempt in 1..=max_attempts {
            // The suggestion only seeds the first attempt.
            let suggested = (attempt == 1)
                .then_some(request.suggested_topic.as_deref())
                .flatten();
            let candidate = engine
                .generate(&TopicRequest {
                    date: request.date,
                    theme,
                    recent_topics,
                    suggested_topic: suggested,
                    rejected: &rejected,
                    variety_hint: Some(hint),
                })
                .await?;

            let verdict = checker.check(&candidate.topic, request.date, over_focused).await?;
            if verdict.is_clear() {
                return Ok(TopicChoice {
                    topic: candidate,
                    attempts: attempt,
                    rejected,
                    possibly_duplicate: false,
                });
            }

            warn!(
                attempt,
                topic = %candidate.topic,
                reason = %verdict.describe(),
                "topic rejected by dedup, regenerating"
            );
            rejected.push(RejectedTopic {
                topic: candidate.topic.clone(),
                reason: verdict.describe(),
            });
            if verdict.is_soft() {
                best_soft = Some(candidate.clone());
            }
            last = Some(candidate);
        }

        let topic = best_soft
            .or(last)
            .ok_or_else(|| PostforgeError::validation("no topic candidate was generated"))?;
        warn!(
            topic = %topic.topic,
            attempts = max_attempts,
            "dedup attempts exhausted, returning best candidate for review"
        );
        Ok(TopicChoice {
            topic,
            attempts: max_attempts,
            rejected,
            possibly_duplicate: true,
        })
    }

    /// Persist a post, upserting on `external_id`. Fails with
    /// `DuplicateTopic` when the hard window is violated.
    #[instrument(skip_all, fields(post_id = %post.id, caller = caller_key))]
    pub async fn save(&self, post: Post, caller_key: &str) -> Result<Post> {
        self.limiter.check(caller_key, Action::Save)?;
        self.store(post).await
    }

    async fn store(&self, mut post: Post) -> Result<Post> {
        if post.topic.trim().is_empty() {
            return Err(PostforgeError::validation("post topic must not be empty"));
        }
        if post.image_prompt.trim().is_empty() {
            return Err(PostforgeError::validation("post image_prompt must not be empty"));
        }
        post.topic_hash = topic::hash(&post.topic);
        self.storage
            .save_post_checked(&post, self.config.dedup.hard_window_days)
            .await
    }

    pub async fn update_status(
        &self,
        id: &PostId,
        status: PostStatus,
        feedback: Option<&str>,
    ) -> Result<Post> {
        let post = self.storage.update_post_status(id, status, feedback).await?;
        info!(post_id = %id, status = status.as_str(), "post status updated");
        Ok(post)
    }

    /// Posts with `date_for` in `[from, to]`, newest generation first.
    pub async fn list_recent(&self, from: NaiveDate, to: NaiveDate, limit: u32) -> Result<Vec<Post>> {
        if from > to {
            return Err(PostforgeError::validation(format!(
                "invalid range: {from} is after {to}"
            )));
        }
        self.storage.posts_in_date_range(from, to, limit).await
    }

    /// Upsert catalog items. Returns how many were written.
    pub async fn import_catalog(&self, items: &[CatalogItem]) -> Result<usize> {
        for item in items {
            if item.id.trim().is_empty() || item.name.trim().is_empty() {
                return Err(PostforgeError::validation(format!(
                    "catalog item needs an id and a name: {:?}",
                    item.id
                )));
            }
        }
        for item in items {
            self.storage.upsert_catalog_item(item).await?;
        }
        info!(count = items.len(), "catalog imported");
        Ok(items.len())
    }
}

//! Core domain types for Postforge posts and catalog items.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// PostId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for post identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(pub Uuid);

impl PostId {
    /// Generate a new time-sortable post identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for PostId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PostId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// A delivery surface. Each one carries its own [`ChannelFormat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    WaStatus,
    WaBroadcast,
    WaMessage,
    FbPost,
    IgPost,
    FbReel,
    IgReel,
    FbStory,
    IgStory,
    Tiktok,
}

/// What carries the message on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatPriority {
    /// The image or video must say everything; caption is minimal.
    Visual,
    Balanced,
    /// Conversational text carries the message.
    Text,
}

/// Static format constraints for a channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelFormat {
    pub aspect_ratio: &'static str,
    pub caption_max_chars: usize,
    pub needs_music: bool,
    pub music_style: Option<&'static str>,
    pub priority: FormatPriority,
    /// Disappears after 24h.
    pub ephemeral: bool,
    /// Inclusive slide bounds when the channel is rendered as a carousel.
    pub carousel_slides: Option<(usize, usize)>,
    pub notes: &'static str,
}

impl Channel {
    /// Every channel, in prompt order.
    pub const ALL: [Channel; 10] = [
        Channel::FbPost,
        Channel::IgPost,
        Channel::Tiktok,
        Channel::WaStatus,
        Channel::FbReel,
        Channel::IgReel,
        Channel::WaBroadcast,
        Channel::WaMessage,
        Channel::FbStory,
        Channel::IgStory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaStatus => "wa-status",
            Self::WaBroadcast => "wa-broadcast",
            Self::WaMessage => "wa-message",
            Self::FbPost => "fb-post",
            Self::IgPost => "ig-post",
            Self::FbReel => "fb-reel",
            Self::IgReel => "ig-reel",
            Self::FbStory => "fb-story",
            Self::IgStory => "ig-story",
            Self::Tiktok => "tiktok",
        }
    }

    /// Format constraints for this channel.
    pub fn format(&self) -> ChannelFormat {
        match self {
            Self::WaStatus => ChannelFormat {
                aspect_ratio: "9:16",
                caption_max_chars: 50,
                needs_music: true,
                music_style: Some("corridos mexicanos, regional"),
                priority: FormatPriority::Visual,
                ephemeral: true,
                carousel_slides: None,
                notes: "El contenido visual debe comunicar TODO. Caption mínimo o vacío.",
            },
            Self::WaBroadcast => ChannelFormat {
                aspect_ratio: "1:1",
                caption_max_chars: 200,
                needs_music: false,
                music_style: None,
                priority: FormatPriority::Balanced,
                ephemeral: false,
                carousel_slides: None,
                notes: "Caption corto pero informativo.",
            },
            Self::WaMessage => ChannelFormat {
                aspect_ratio: "1:1",
                caption_max_chars: 500,
                needs_music: false,
                music_style: None,
                priority: FormatPriority::Text,
                ephemeral: false,
                carousel_slides: None,
                notes: "Texto conversacional, personal.",
            },
            Self::FbPost | Self::IgPost => ChannelFormat {
                aspect_ratio: "1:1",
                caption_max_chars: 2000,
                needs_music: false,
                music_style: None,
                priority: FormatPriority::Balanced,
                ephemeral: false,
                carousel_slides: Some((2, 10)),
                notes: "Caption largo permitido. Ideal para infografías y carruseles educativos.",
            },
            Self::FbReel | Self::IgReel => ChannelFormat {
                aspect_ratio: "9:16",
                caption_max_chars: 100,
                needs_music: true,
                music_style: Some("trending o mexicana"),
                priority: FormatPriority::Visual,
                ephemeral: false,
                carousel_slides: None,
                notes: "Caption muy corto. El texto principal va en el video con subtítulos. Hook en los primeros 3 segundos.",
            },
            Self::FbStory | Self::IgStory => ChannelFormat {
                aspect_ratio: "9:16",
                caption_max_chars: 50,
                needs_music: false,
                music_style: None,
                priority: FormatPriority::Visual,
                ephemeral: true,
                carousel_slides: None,
                notes: "Caption mínimo o vacío. El contenido visual debe comunicar TODO.",
            },
            Self::Tiktok => ChannelFormat {
                aspect_ratio: "9:16",
                caption_max_chars: 150,
                needs_music: true,
                music_style: Some("corridos mexicanos, regional popular"),
                priority: FormatPriority::Visual,
                ephemeral: false,
                carousel_slides: Some((2, 3)),
                notes: "Carrusel de 2-3 imágenes (no video). Caption muy corto; el texto grande va en las imágenes.",
            },
        }
    }

    /// Vertical or ephemeral surfaces where the caption must stay terse.
    pub fn is_terse(&self) -> bool {
        let format = self.format();
        format.ephemeral || format.priority == FormatPriority::Visual
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Channel::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| format!("unknown channel '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// PostStatus
// ---------------------------------------------------------------------------

/// Review lifecycle of a post. Posts are never deleted, only superseded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    #[default]
    Draft,
    Approved,
    Scheduled,
    Published,
    Rejected,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Approved => "approved",
            Self::Scheduled => "scheduled",
            Self::Published => "published",
            Self::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for PostStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "draft" => Ok(Self::Draft),
            "approved" => Ok(Self::Approved),
            "scheduled" => Ok(Self::Scheduled),
            "published" => Ok(Self::Published),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Post
// ---------------------------------------------------------------------------

/// One generated piece of content.
///
/// `topic_hash` is always recomputed from `topic` on save; a value supplied
/// by the caller is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    #[serde(default)]
    pub id: PostId,
    /// Caller-supplied idempotency key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// Target calendar date.
    pub date_for: NaiveDate,
    /// Generation time. History ordering uses this, not `date_for`.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    pub channel: Channel,
    pub post_type: String,
    #[serde(default)]
    pub content_tone: String,
    pub topic: String,
    #[serde(default)]
    pub topic_hash: String,
    #[serde(default)]
    pub problem_identified: String,
    pub caption: String,
    pub image_prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub carousel_slides: Vec<String>,
    #[serde(default)]
    pub needs_music: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posting_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cta: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hashtags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_product_id: Option<String>,
    /// Structured audit echo: `products`, `theme`, `strategy`, `notes`.
    #[serde(default)]
    pub formatted_content: serde_json::Value,
    #[serde(default)]
    pub status: PostStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_feedback: Option<String>,
    /// Set when dedup attempts ran out and this candidate may repeat history.
    #[serde(default)]
    pub possibly_duplicate: bool,
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// A sellable catalog item, with an optional precomputed embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub sku: String,
    pub category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub shipping_cost: f64,
    /// Item-specific margin as a fraction (0.30 = 30%).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub margin: Option<f64>,
    #[serde(default)]
    pub stock: i64,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub specs: Vec<String>,
    /// Populated by an external indexing job; read-only here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

fn default_active() -> bool {
    true
}

/// Denormalized product details attached to a generated post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub id: String,
    pub name: String,
    pub sku: String,
    pub category: String,
    /// Sale price after shipping and margin, rounded to cents.
    pub price: f64,
    pub in_stock: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub specs: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_id_roundtrip() {
        let id = PostId::new();
        let parsed: PostId = id.to_string().parse().expect("parse post id");
        assert_eq!(id, parsed);
    }

    #[test]
    fn channel_serde_uses_kebab_names() {
        let json = serde_json::to_string(&Channel::WaStatus).expect("serialize");
        assert_eq!(json, r#""wa-status""#);
        let ch: Channel = serde_json::from_str(r#""fb-reel""#).expect("deserialize");
        assert_eq!(ch, Channel::FbReel);
        assert_eq!("TikTok".parse::<Channel>(), Ok(Channel::Tiktok));
        assert!("myspace".parse::<Channel>().is_err());
    }

    #[test]
    fn channel_formats() {
        let status = Channel::WaStatus.format();
        assert_eq!(status.caption_max_chars, 50);
        assert!(status.needs_music);
        assert!(status.ephemeral);

        assert_eq!(Channel::Tiktok.format().carousel_slides, Some((2, 3)));
        assert_eq!(Channel::FbPost.format().caption_max_chars, 2000);
        assert!(!Channel::FbPost.is_terse());
        assert!(Channel::IgStory.is_terse());
    }

    #[test]
    fn post_deserializes_with_minimal_fields() {
        let json = r#"{
            "date_for": "2026-03-10",
            "channel": "fb-post",
            "post_type": "Infografías",
            "topic": "Riego manual gasta tiempo → Automatizar con temporizador",
            "caption": "texto",
            "image_prompt": "prompt"
        }"#;
        let post: Post = serde_json::from_str(json).expect("deserialize post");
        assert_eq!(post.status, PostStatus::Draft);
        assert!(post.carousel_slides.is_empty());
        assert!(post.topic_hash.is_empty());
        assert!(!post.possibly_duplicate);
    }

    #[test]
    fn status_parses() {
        assert_eq!("Approved".parse::<PostStatus>(), Ok(PostStatus::Approved));
        assert!("archived".parse::<PostStatus>().is_err());
    }
}

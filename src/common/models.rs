use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A point as (longitude, latitude) in degrees. (0, 0) means "unknown".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lng: f64,
    pub lat: f64,
}

impl GeoPoint {
    pub const UNKNOWN: GeoPoint = GeoPoint { lng: 0.0, lat: 0.0 };

    pub fn new(lng: f64, lat: f64) -> Self {
        Self { lng, lat }
    }

    pub fn is_known(&self) -> bool {
        self.lng != 0.0 || self.lat != 0.0
    }
}

impl Default for GeoPoint {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Local,
    Global,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Local => "local",
            Visibility::Global => "global",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Visibility::Local),
            "global" => Some(Visibility::Global),
            _ => None,
        }
    }
}

/// A topical community users can discover and attach pods to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Community {
    pub id: String,
    pub name: String,
    /// Lowercased, small set (1-10 entries).
    pub tags: Vec<String>,
    pub description: String,
    pub visibility: Visibility,
    pub geo: GeoPoint,
    /// Source IP recorded at creation, used to lazily resolve `geo` later.
    pub admin_ip: Option<String>,
    /// Empty until the embedding service has produced one.
    pub embedding: Vec<f32>,
    pub members_count: i64,
    pub activity_score: f64,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodType {
    Chat,
    Hangout,
    Study,
    Game,
    Other,
}

impl PodType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodType::Chat => "chat",
            PodType::Hangout => "hangout",
            PodType::Study => "study",
            PodType::Game => "game",
            PodType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chat" => Some(PodType::Chat),
            "hangout" => Some(PodType::Hangout),
            "study" => Some(PodType::Study),
            "game" => Some(PodType::Game),
            "other" => Some(PodType::Other),
            _ => None,
        }
    }
}

/// One transcript entry. `sender` is None for generated (icebreaker) messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: Option<String>,
    pub text: String,
    pub time: DateTime<Utc>,
    pub is_generated: bool,
}

/// A short-lived discussion room attached to a community.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pod {
    pub id: String,
    pub community_id: String,
    pub created_by: String,
    pub pod_type: PodType,
    pub title: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub members: Vec<String>,
    pub transcript: Vec<ChatMessage>,
    pub geo: Option<GeoPoint>,
    pub active: bool,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Community proposal returned when a search finds no good match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suggestion {
    pub name: String,
    pub tags: Vec<String>,
    pub description: String,
}

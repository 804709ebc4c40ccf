//! Core domain types for gametrics
//!
//! Telemetry is modelled as a common envelope plus a category-tagged payload.
//! The four categories share the envelope fields and each adds its own
//! columns; the category tag routes a batch to the matching collector
//! endpoint and is never part of the wire payload itself.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Category** | One of design/business/user/quality; selects schema and endpoint |
//! | **App key** | Per-game identifier routing events to the right remote account |
//! | **Envelope** | Fields shared by every event (user, session, build, position) |
//! | **Event id** | Colon-delimited hierarchy chosen by the game, e.g. `"Buy:Wand"` |

use serde::{Serialize, Serializer};

// ============================================
// Category
// ============================================

/// Event category, determines schema and upload endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Design,
    Business,
    User,
    Quality,
}

impl Category {
    /// Returns the identifier used in storage and endpoint paths
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Design => "design",
            Category::Business => "business",
            Category::User => "user",
            Category::Quality => "quality",
        }
    }

    /// All categories, in drain order
    pub fn all() -> [Category; 4] {
        [
            Category::Design,
            Category::Business,
            Category::User,
            Category::Quality,
        ]
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "design" => Ok(Category::Design),
            "business" => Ok(Category::Business),
            "user" => Ok(Category::User),
            "quality" => Ok(Category::Quality),
            _ => Err(format!("unknown category: {}", s)),
        }
    }
}

// ============================================
// Gender
// ============================================

/// User gender as reported by the game
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Gender {
    Male,
    Female,
    #[default]
    Unknown,
}

impl Gender {
    /// Single-letter wire/storage form
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "m",
            Gender::Female => "f",
            Gender::Unknown => "n",
        }
    }
}

impl std::str::FromStr for Gender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "m" => Ok(Gender::Male),
            "f" => Ok(Gender::Female),
            "n" => Ok(Gender::Unknown),
            _ => Err(format!("unknown gender: {}", s)),
        }
    }
}

impl Serialize for Gender {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

// ============================================
// Envelope
// ============================================

/// Fields shared by every event regardless of category
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEnvelope {
    /// Stable per-device/user identifier
    pub user_id: String,
    /// Regenerated per session
    pub session_id: String,
    /// Host application version
    pub build: String,
    /// Colon-delimited hierarchy, e.g. `"PickedUpAmmo:Shotgun"`
    pub event_id: String,
    /// Current screen/level/context
    pub area: String,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

// ============================================
// Payloads
// ============================================

/// User-event fields: demographics plus optional acquisition/device attributes.
///
/// The optional attributes are omitted from the wire payload when absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UserFields {
    pub gender: Gender,
    pub birth_year: i32,
    pub friend_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_major: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_minor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdk_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_publisher: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_site: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_campaign: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_ad: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_keyword: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub android_id: Option<String>,
}

/// Category-specific event payload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    /// Gameplay metric with a numeric value
    Design { value: f32 },
    /// Monetary transaction in the smallest currency unit
    Business { currency: String, amount: i64 },
    /// Demographics and acquisition info
    User(UserFields),
    /// Free text, typically an error message or stack trace
    Quality { message: String },
}

// ============================================
// Event
// ============================================

/// A single telemetry event: envelope plus category payload.
///
/// Serializes to the flat snake_case object the collector expects; the
/// category tag is routing information and is not serialized.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    #[serde(flatten)]
    pub envelope: EventEnvelope,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn design(envelope: EventEnvelope, value: f32) -> Self {
        Self {
            envelope,
            payload: EventPayload::Design { value },
        }
    }

    pub fn business(envelope: EventEnvelope, currency: String, amount: i64) -> Self {
        Self {
            envelope,
            payload: EventPayload::Business { currency, amount },
        }
    }

    pub fn user(envelope: EventEnvelope, fields: UserFields) -> Self {
        Self {
            envelope,
            payload: EventPayload::User(fields),
        }
    }

    pub fn quality(envelope: EventEnvelope, message: String) -> Self {
        Self {
            envelope,
            payload: EventPayload::Quality { message },
        }
    }

    /// Category tag derived from the payload
    pub fn category(&self) -> Category {
        match self.payload {
            EventPayload::Design { .. } => Category::Design,
            EventPayload::Business { .. } => Category::Business,
            EventPayload::User(_) => Category::User,
            EventPayload::Quality { .. } => Category::Quality,
        }
    }
}

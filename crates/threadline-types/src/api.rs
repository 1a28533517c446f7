use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{Message, ThreadId};

// -- JWT Claims --

/// Claims carried by the bearer token. The client only reads them to learn
/// who it is; the server is the one that validates the signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(alias = "user")]
    pub username: String,
    #[serde(default)]
    pub is_staff: bool,
    #[serde(default)]
    pub is_superuser: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.is_staff || self.is_superuser
    }
}

// -- Threads --

/// Thread detail payload: metadata plus the full message history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadResponse {
    pub id: ThreadId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Tenant, template and SLA metadata the engine does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

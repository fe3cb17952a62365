//! Wire types for mailbox change notifications.

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Envelope posted to the notification endpoint.
///
/// A missing `value` array deserializes as empty; callers treat an empty
/// envelope the same as a malformed one.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeNotificationPayload {
    #[serde(default)]
    pub value: Vec<ChangeNotification>,
}

/// One change entry inside a notification envelope.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub client_state: Option<String>,
    #[serde(default)]
    pub change_type: Option<String>,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub subscription_expiration_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resource_data: Option<ResourceData>,
}

impl ChangeNotification {
    /// Message id carried by the entry, trimmed. `None` when absent or blank.
    pub fn message_id(&self) -> Option<&str> {
        self.resource_data
            .as_ref()
            .and_then(|data| data.id.as_deref())
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceData {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "@odata.type")]
    pub odata_type: Option<String>,
    #[serde(default, rename = "@odata.id")]
    pub odata_id: Option<String>,
}

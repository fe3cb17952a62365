//! Queue wire format for reply tasks.

use serde::{Deserialize, Serialize};

/// One unit of reply work, carried as JSON on the work queue.
///
/// `email_id` is the only required field; absent optionals are omitted
/// from the serialized form entirely rather than written as null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailTask {
    pub email_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
}

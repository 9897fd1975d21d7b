use serde::{Deserialize, Serialize};

use crate::domain::{UserId, UserStatus};

/// Last known presence of one user.
///
/// Every field except `id` is optional: a partial record is an update that
/// only overlays the fields it carries (see [`PresenceRecord::merge`]).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    #[serde(rename = "_id")]
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<UserStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utc_offset: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(
        default,
        rename = "avatarETag",
        skip_serializing_if = "Option::is_none"
    )]
    pub avatar_etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl PresenceRecord {
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Placeholder for identifiers the server did not report.
    pub fn offline(id: impl Into<UserId>) -> Self {
        Self::new(id).with_status(UserStatus::Offline)
    }

    pub fn with_status(mut self, status: UserStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_status_text(mut self, status_text: impl Into<String>) -> Self {
        self.status_text = Some(status_text.into());
        self
    }

    /// Overlays the fields present in `patch`; absent fields keep their value.
    pub fn merge(&mut self, patch: &PresenceRecord) {
        fn overlay<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if let Some(value) = value {
                *slot = Some(value.clone());
            }
        }

        overlay(&mut self.name, &patch.name);
        overlay(&mut self.status, &patch.status);
        overlay(&mut self.utc_offset, &patch.utc_offset);
        overlay(&mut self.status_text, &patch.status_text);
        overlay(&mut self.avatar_etag, &patch.avatar_etag);
        overlay(&mut self.roles, &patch.roles);
        overlay(&mut self.username, &patch.username);
    }
}

/// Query sent to the batch presence endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceQuery {
    pub ids: Vec<UserId>,
}

impl PresenceQuery {
    pub fn to_query_value(&self) -> String {
        self.ids
            .iter()
            .map(UserId::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Response of the batch presence endpoint. Requested identifiers missing
/// from `users` are unknown to the server.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UsersPresencePayload {
    #[serde(default, alias = "records")]
    pub users: Vec<PresenceRecord>,
    #[serde(default)]
    pub full: bool,
}

/// Interest delta sent to the live presence stream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubscriptionUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added: Option<Vec<UserId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed: Option<Vec<UserId>>,
}

impl SubscriptionUpdate {
    /// Builds an update, leaving out whichever side is empty.
    pub fn new(added: Vec<UserId>, removed: Vec<UserId>) -> Self {
        Self {
            added: (!added.is_empty()).then_some(added),
            removed: (!removed.is_empty()).then_some(removed),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_none() && self.removed.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientPresenceRequest {
    Subscribe(SubscriptionUpdate),
}

/// Compact status frame: status is a [`crate::domain::STATUS_MAP`] code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactStatus {
    #[serde(rename = "_id")]
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub status: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerPresenceEvent {
    UserPresence(PresenceRecord),
    UserStatus(CompactStatus),
}

impl ServerPresenceEvent {
    /// Converts the frame into a partial record. Compact frames with an
    /// unknown status code keep the status untouched.
    pub fn into_record(self) -> PresenceRecord {
        match self {
            ServerPresenceEvent::UserPresence(record) => record,
            ServerPresenceEvent::UserStatus(compact) => PresenceRecord {
                id: compact.id,
                status: UserStatus::from_code(compact.status),
                status_text: compact.status_text,
                username: compact.username,
                ..PresenceRecord::default()
            },
        }
    }
}

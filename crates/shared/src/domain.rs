use std::{borrow::Borrow, fmt};

use serde::{Deserialize, Serialize};

/// Opaque user identifier as issued by the server.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&UserId> for UserId {
    fn from(value: &UserId) -> Self {
        value.clone()
    }
}

impl Borrow<str> for UserId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    #[default]
    Offline,
    Online,
    Away,
    Busy,
}

/// Numeric status codes used by compact presence frames, indexed by code.
pub const STATUS_MAP: [UserStatus; 4] = [
    UserStatus::Offline,
    UserStatus::Online,
    UserStatus::Away,
    UserStatus::Busy,
];

impl UserStatus {
    pub fn from_code(code: u8) -> Option<Self> {
        STATUS_MAP.get(usize::from(code)).copied()
    }

    pub fn code(self) -> u8 {
        match self {
            UserStatus::Offline => 0,
            UserStatus::Online => 1,
            UserStatus::Away => 2,
            UserStatus::Busy => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UserStatus::Offline => "offline",
            UserStatus::Online => "online",
            UserStatus::Away => "away",
            UserStatus::Busy => "busy",
        }
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

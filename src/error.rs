//! Broker error taxonomy
//!
//! One variant per stable error code from the external interface contract.
//! Every client-facing failure carries one of these; the string form is
//! the stable `ERR_*` code used in close reasons and JSON error bodies.

use std::fmt;

/// Crate-wide error type. Maps 1:1 onto the stable `ERR_*` code taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    InvalidConfig(String),
    InvalidInput(String),
    InvalidMessageFormat,
    Unauthorized,
    NoSessionCookie,
    InvalidToken,
    SessionNotActive,
    InviteMissing,
    InviteInvalid,
    InviteNotFound,
    InviteExpired,
    InviteUsed,
    InviteRevoked,
    RateLimited { retry_after_secs: u64 },
    RateLimitedConnection { retry_after_secs: u64 },
    RateLimitedInvite { retry_after_secs: u64 },
    QueueFull,
    AlreadyInQueue,
    ReconnectionInProgress,
    SessionNotFound,
    SessionSpawnFailed(String),
    SessionTimeout,
    OriginRequired,
    OriginNotAllowed,
    UnknownMessageType,
    StoreError(String),
    FileError(String),
    ContentTypeError,
    Internal(String),
}

impl BrokerError {
    /// The stable wire code, used in JSON error bodies and close reasons.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "ERR_INVALID_CONFIG",
            Self::InvalidInput(_) => "ERR_INVALID_INPUT",
            Self::InvalidMessageFormat => "ERR_INVALID_MESSAGE_FORMAT",
            Self::Unauthorized => "ERR_UNAUTHORIZED",
            Self::NoSessionCookie => "ERR_NO_SESSION_COOKIE",
            Self::InvalidToken => "ERR_INVALID_TOKEN",
            Self::SessionNotActive => "ERR_SESSION_NOT_ACTIVE",
            Self::InviteMissing => "ERR_INVITE_MISSING",
            Self::InviteInvalid => "ERR_INVITE_INVALID",
            Self::InviteNotFound => "ERR_INVITE_NOT_FOUND",
            Self::InviteExpired => "ERR_INVITE_EXPIRED",
            Self::InviteUsed => "ERR_INVITE_USED",
            Self::InviteRevoked => "ERR_INVITE_REVOKED",
            Self::RateLimited { .. } => "ERR_RATE_LIMITED",
            Self::RateLimitedConnection { .. } => "ERR_RATE_LIMITED_CONNECTION",
            Self::RateLimitedInvite { .. } => "ERR_RATE_LIMITED_INVITE",
            Self::QueueFull => "ERR_QUEUE_FULL",
            Self::AlreadyInQueue => "ERR_ALREADY_IN_QUEUE",
            Self::ReconnectionInProgress => "ERR_RECONNECTION_IN_PROGRESS",
            Self::SessionNotFound => "ERR_SESSION_NOT_FOUND",
            Self::SessionSpawnFailed(_) => "ERR_SESSION_SPAWN_FAILED",
            Self::SessionTimeout => "ERR_SESSION_TIMEOUT",
            Self::OriginRequired => "ERR_ORIGIN_REQUIRED",
            Self::OriginNotAllowed => "ERR_ORIGIN_NOT_ALLOWED",
            Self::UnknownMessageType => "ERR_UNKNOWN_MESSAGE_TYPE",
            Self::StoreError(_) => "ERR_REDIS_ERROR",
            Self::FileError(_) => "ERR_FILE_ERROR",
            Self::ContentTypeError => "ERR_CONTENT_TYPE_ERROR",
            Self::Internal(_) => "ERR_INTERNAL",
        }
    }

    /// HTTP status for the validator surface.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidConfig(_)
            | Self::InvalidInput(_)
            | Self::InvalidMessageFormat => 400,
            Self::Unauthorized
            | Self::NoSessionCookie
            | Self::InvalidToken
            | Self::SessionNotActive => 401,
            Self::InviteMissing
            | Self::InviteInvalid
            | Self::InviteNotFound
            | Self::InviteExpired
            | Self::InviteUsed
            | Self::InviteRevoked => 400,
            Self::RateLimited { .. }
            | Self::RateLimitedConnection { .. }
            | Self::RateLimitedInvite { .. } => 429,
            Self::QueueFull | Self::AlreadyInQueue | Self::ReconnectionInProgress => 409,
            Self::SessionNotFound => 404,
            Self::SessionSpawnFailed(_) | Self::SessionTimeout => 500,
            Self::OriginRequired | Self::OriginNotAllowed => 401,
            Self::UnknownMessageType => 400,
            Self::StoreError(_) => 503,
            Self::FileError(_) => 500,
            Self::ContentTypeError => 415,
            Self::Internal(_) => 500,
        }
    }

    /// `retryAfter` seconds, when applicable.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs }
            | Self::RateLimitedConnection { retry_after_secs }
            | Self::RateLimitedInvite { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// A short human message suitable for a client-facing error body.
    pub fn message(&self) -> String {
        match self {
            Self::InvalidConfig(m) => format!("invalid configuration: {m}"),
            Self::InvalidInput(m) => format!("invalid input: {m}"),
            Self::InvalidMessageFormat => "invalid message format".to_string(),
            Self::Unauthorized => "unauthorized".to_string(),
            Self::NoSessionCookie => "no session cookie".to_string(),
            Self::InvalidToken => "invalid token".to_string(),
            Self::SessionNotActive => "session not active".to_string(),
            Self::InviteMissing => "invite token missing".to_string(),
            Self::InviteInvalid => "invite token malformed".to_string(),
            Self::InviteNotFound => "invite not found".to_string(),
            Self::InviteExpired => "invite expired".to_string(),
            Self::InviteUsed => "invite already used".to_string(),
            Self::InviteRevoked => "invite revoked".to_string(),
            Self::RateLimited { retry_after_secs } => {
                format!("rate limited, retry after {retry_after_secs}s")
            }
            Self::RateLimitedConnection { retry_after_secs } => {
                format!("connection rate limited, retry after {retry_after_secs}s")
            }
            Self::RateLimitedInvite { retry_after_secs } => {
                format!("invite attempts rate limited, retry after {retry_after_secs}s")
            }
            Self::QueueFull => "queue is full".to_string(),
            Self::AlreadyInQueue => "already queued or active".to_string(),
            Self::ReconnectionInProgress => "reconnection already in progress".to_string(),
            Self::SessionNotFound => "session not found".to_string(),
            Self::SessionSpawnFailed(m) => format!("failed to spawn session: {m}"),
            Self::SessionTimeout => "session timed out".to_string(),
            Self::OriginRequired => "origin header required".to_string(),
            Self::OriginNotAllowed => "origin not allowed".to_string(),
            Self::UnknownMessageType => "unknown message type".to_string(),
            Self::StoreError(m) => format!("store error: {m}"),
            Self::FileError(m) => format!("file error: {m}"),
            Self::ContentTypeError => "unsupported content type".to_string(),
            Self::Internal(m) => format!("internal error: {m}"),
        }
    }

    /// `CODE: message` form truncated to 123 bytes, for WebSocket close reasons.
    pub fn close_reason(&self) -> String {
        let full = format!("{}: {}", self.code(), self.message());
        truncate_bytes(&full, 123)
    }
}

/// Truncate a string to at most `max_bytes` bytes on a char boundary.
pub fn truncate_bytes(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for BrokerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_taxonomy_is_stable() {
        assert_eq!(BrokerError::QueueFull.code(), "ERR_QUEUE_FULL");
        assert_eq!(BrokerError::InviteUsed.code(), "ERR_INVITE_USED");
        assert_eq!(
            BrokerError::SessionSpawnFailed("x".into()).code(),
            "ERR_SESSION_SPAWN_FAILED"
        );
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(BrokerError::QueueFull.http_status(), 409);
        assert_eq!(BrokerError::NoSessionCookie.http_status(), 401);
        assert_eq!(
            BrokerError::RateLimitedInvite { retry_after_secs: 5 }.http_status(),
            429
        );
        assert_eq!(BrokerError::StoreError("x".into()).http_status(), 503);
    }

    #[test]
    fn truncate_bytes_respects_char_boundaries() {
        let long = "x".repeat(200);
        let truncated = truncate_bytes(&long, 123);
        assert_eq!(truncated.len(), 123);

        let multibyte = "é".repeat(100); // 2 bytes each
        let truncated = truncate_bytes(&multibyte, 123);
        assert!(truncated.len() <= 123);
        assert!(truncated.is_char_boundary(truncated.len()));
    }

    #[test]
    fn close_reason_is_bounded() {
        let err = BrokerError::SessionSpawnFailed("a".repeat(300));
        let reason = err.close_reason();
        assert!(reason.len() <= 123);
        assert!(reason.starts_with("ERR_SESSION_SPAWN_FAILED:"));
    }
}

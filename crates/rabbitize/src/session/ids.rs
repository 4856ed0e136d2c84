use chrono::{SecondsFormat, Utc};

/// Reserved session id that turns on interactive niceties (time overlay,
/// recording opt-out unless explicitly requested).
pub const INTERACTIVE_SESSION_ID: &str = "interactive";

/// Session identity triple. The session id is either operator-provided
/// (batch runs, `SESSION_ID`) or a generated UTC timestamp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionIds {
    pub client_id: String,
    pub test_id: String,
    pub session_id: String,
}

impl SessionIds {
    pub fn new(client_id: &str, test_id: &str, session_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            test_id: test_id.to_string(),
            session_id: session_id.to_string(),
        }
    }

    /// Generate a fresh timestamp session id: RFC 3339 millis with `:` and
    /// `.` replaced by `-` so it is filesystem- and URL-safe.
    pub fn generated(client_id: &str, test_id: &str) -> Self {
        Self::new(client_id, test_id, &timestamp_session_id())
    }

    pub fn interactive(&self) -> bool {
        self.session_id == INTERACTIVE_SESSION_ID
    }

    /// Frame-topic key and API path segment.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.client_id, self.test_id, self.session_id)
    }
}

pub fn timestamp_session_id() -> String {
    Utc::now()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_path_safe() {
        let id = timestamp_session_id();
        assert!(!id.contains(':'));
        assert!(!id.contains('.'));
        assert!(id.ends_with('Z'));
    }

    #[test]
    fn interactive_is_the_reserved_id_only() {
        assert!(SessionIds::new("c", "t", "interactive").interactive());
        assert!(!SessionIds::new("c", "t", "Interactive").interactive());
        assert!(!SessionIds::generated("c", "t").interactive());
    }

    #[test]
    fn key_is_the_triple() {
        let ids = SessionIds::new("acme", "login", "s1");
        assert_eq!(ids.key(), "acme/login/s1");
    }
}

use thiserror::Error;

/// Why a wire command was rejected before touching the browser. Rejection
/// never mutates session state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    /// Verbs are matched verbatim; anything else is refused as-is.
    #[error("Unknown command: {0}")]
    UnknownVerb(String),
    /// Known verb, unusable arguments.
    #[error("{0}")]
    BadArgs(String),
}

/// Whether an error from a browser call means the page context was torn
/// down underneath us rather than a real failure.
pub fn is_context_destroyed(err: &anyhow::Error) -> bool {
    let text = format!("{err:#}");
    text.contains("Execution context was destroyed")
        || text.contains("Cannot find context with specified id")
        || text.contains("no object with guid")
        || text.contains("Inspected target navigated or closed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_verb_renders_verbatim() {
        let err = CommandError::UnknownVerb(":Click".to_string());
        assert_eq!(format!("{err}"), "Unknown command: :Click");
    }

    #[test]
    fn context_destroyed_matches_cdp_phrasings() {
        for msg in [
            "Execution context was destroyed, most likely because of a navigation",
            "CDP error for Runtime.evaluate: Cannot find context with specified id",
            "page: no object with guid abc123",
        ] {
            assert!(is_context_destroyed(&anyhow::anyhow!("{msg}")), "{msg}");
        }
    }

    #[test]
    fn ordinary_errors_are_not_context_destroyed() {
        assert!(!is_context_destroyed(&anyhow::anyhow!(
            "JS error: ReferenceError: foo is not defined"
        )));
    }
}

//! The workflow execution engine: context, scheduler, and retry policy.

pub mod context;
pub mod executor;

pub use context::ExecutionContext;
pub use executor::{run_workflow, RunResult};

/// An exception message is transient iff its lowercased text contains any of
/// these substrings (§4.4 leaf execution, §7 taxonomy).
const TRANSIENT_MARKERS: &[&str] = &["timeout", "connection", "rate limit", "429", "503"];

pub fn is_transient(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_transient_markers_case_insensitively() {
        assert!(is_transient("Connection refused"));
        assert!(is_transient("got HTTP 503"));
        assert!(is_transient("Rate Limit exceeded"));
        assert!(!is_transient("null pointer dereference"));
    }
}

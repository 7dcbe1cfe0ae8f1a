//! Translation of raw backend error strings into user-facing explanations.

/// Known failure patterns, matched case-insensitively as substrings.
const TRANSLATIONS: &[(&[&str], &str)] = &[
    (
        &["no such element"],
        "A required GStreamer plugin is not installed on the server",
    ),
    (
        &["not-negotiated", "not negotiated"],
        "Incompatible media formats between pipeline elements (caps negotiation failed)",
    ),
    (
        &["could not open", "could not read"],
        "Could not open the media source; check the URI and that the source is reachable",
    ),
    (
        &["connection refused"],
        "The remote source refused the connection",
    ),
    (
        &["timeout", "timed out"],
        "The source did not respond in time",
    ),
    (
        &["no such file"],
        "The referenced file does not exist on the server",
    ),
    (
        &["syntax error", "erroneous pipeline"],
        "The pipeline description is invalid",
    ),
    (
        &["resource busy", "device or resource busy"],
        "The device is already in use by another pipeline",
    ),
    (
        &["permission denied"],
        "The server is not allowed to access the requested resource",
    ),
];

/// Map a raw backend error to a user-facing message.
///
/// Falls back to the raw message when no known pattern matches.
pub fn translate_error(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    TRANSLATIONS
        .iter()
        .find(|(patterns, _)| patterns.iter().any(|p| lowered.contains(p)))
        .map(|(_, explanation)| format!("{} ({})", explanation, raw.trim()))
        .unwrap_or_else(|| raw.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_patterns() {
        let message = translate_error("gst-error: No such element or plugin 'srtsrc'");
        assert!(message.starts_with("A required GStreamer plugin is not installed"));
        assert!(message.contains("'srtsrc'"));

        assert!(translate_error("Internal data stream error: not-negotiated")
            .starts_with("Incompatible media formats"));
        assert!(translate_error("Connection timed out").starts_with("The source did not respond"));
    }

    #[test]
    fn test_first_pattern_wins() {
        // Matches both "could not open" and "no such file"
        let message = translate_error("Could not open resource for reading: No such file");
        assert!(message.starts_with("Could not open the media source"));
    }

    #[test]
    fn test_unknown_falls_back_to_raw() {
        assert_eq!(translate_error("  something odd  "), "something odd");
    }
}

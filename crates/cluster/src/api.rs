//! Helpers for building API URLs and reading config flags

use crate::state::DEFAULT_PROJECT;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

/// API version prefix
pub const API_VERSION: &str = "1.0";

// Unreserved characters and ':' are kept verbatim in a path segment
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b':');

/// Build `/1.0/<segments...>`, appending `?project=<p>` unless `project` is
/// the default project or empty.
pub fn api_url(segments: &[&str], project: &str) -> String {
    let mut url = format!("/{API_VERSION}");
    for segment in segments {
        url.push('/');
        url.extend(utf8_percent_encode(segment, PATH_SEGMENT));
    }

    if !project.is_empty() && project != DEFAULT_PROJECT {
        url.push_str("?project=");
        url.extend(utf8_percent_encode(project, PATH_SEGMENT));
    }

    url
}

/// Whether a config value is one of the accepted true spellings
pub fn is_true(value: &str) -> bool {
    ["true", "1", "yes", "on"]
        .iter()
        .any(|candidate| value.eq_ignore_ascii_case(candidate))
}

/// Whether an optional config value is set to true
pub fn is_true_opt(value: Option<&String>) -> bool {
    value.is_some_and(|value| is_true(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_url_project_suffix() {
        assert_eq!(api_url(&["networks", "lxdbr0"], "default"), "/1.0/networks/lxdbr0");
        assert_eq!(
            api_url(&["instances", "web1"], "blue"),
            "/1.0/instances/web1?project=blue"
        );
        assert_eq!(api_url(&["instances", "web1"], ""), "/1.0/instances/web1");
    }

    #[test]
    fn test_api_url_escapes_segments() {
        assert_eq!(
            api_url(&["networks", "br0", "forwards", "2001:db8::1"], "default"),
            "/1.0/networks/br0/forwards/2001:db8::1"
        );
        assert_eq!(api_url(&["instances", "a b"], "x/y"), "/1.0/instances/a%20b?project=x%2Fy");
    }

    #[test]
    fn test_is_true() {
        for value in ["true", "TRUE", "1", "yes", "On"] {
            assert!(is_true(value), "{value}");
        }
        for value in ["", "false", "0", "no", "off", "enabled"] {
            assert!(!is_true(value), "{value}");
        }
        assert!(!is_true_opt(None));
    }
}

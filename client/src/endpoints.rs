//! Endpoint discovery.
//!
//! Builds the ordered list of WebSocket URLs the transport tries. Explicit
//! URLs come first, then whatever the environment describes, then the usual
//! local development addresses.

use streamctl_types::{DEFAULT_PORT, DEFAULT_WS_PATH};

/// Endpoint hints read from the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointEnv {
    /// `GSTREAMER_WS_URL`, a complete URL
    pub url: Option<String>,
    /// `GSTREAMER_WS_HOST`
    pub host: Option<String>,
    /// `GSTREAMER_WS_PORT`
    pub port: Option<u16>,
    /// `GSTREAMER_WS_PATH`
    pub path: Option<String>,
}

impl EndpointEnv {
    pub fn from_env() -> Self {
        let var = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            url: var("GSTREAMER_WS_URL"),
            host: var("GSTREAMER_WS_HOST"),
            port: var("GSTREAMER_WS_PORT").and_then(|p| p.parse().ok()),
            path: var("GSTREAMER_WS_PATH"),
        }
    }
}

/// Ordered, de-duplicated endpoint candidates.
pub fn candidate_urls(configured: &[String], env: &EndpointEnv) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::new();
    let mut push = |url: String| {
        if !candidates.contains(&url) {
            candidates.push(url);
        }
    };

    if let Some(url) = &env.url {
        push(url.clone());
    }
    for url in configured {
        push(url.clone());
    }

    let port = env.port.unwrap_or(DEFAULT_PORT);
    let path = normalize_path(env.path.as_deref().unwrap_or(DEFAULT_WS_PATH));
    if let Some(host) = &env.host {
        push(format!("ws://{}:{}{}", host, port, path));
        push(format!("ws://{}:{}", host, port));
    }

    for host in ["localhost", "127.0.0.1"] {
        push(format!("ws://{}:{}{}", host, port, path));
        push(format!("ws://{}:{}", host, port));
    }

    candidates
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let urls = candidate_urls(&[], &EndpointEnv::default());
        assert_eq!(
            urls,
            vec![
                "ws://localhost:8080/gstreamer",
                "ws://localhost:8080",
                "ws://127.0.0.1:8080/gstreamer",
                "ws://127.0.0.1:8080",
            ]
        );
    }

    #[test]
    fn test_explicit_urls_first_and_deduplicated() {
        let env = EndpointEnv {
            url: Some("ws://override:1/x".to_string()),
            host: Some("media-box".to_string()),
            port: Some(9000),
            path: Some("ws".to_string()),
        };
        let configured = vec![
            "ws://configured:2".to_string(),
            "ws://override:1/x".to_string(),
        ];
        let urls = candidate_urls(&configured, &env);
        assert_eq!(urls[0], "ws://override:1/x");
        assert_eq!(urls[1], "ws://configured:2");
        assert_eq!(urls[2], "ws://media-box:9000/ws");
        assert_eq!(urls[3], "ws://media-box:9000");
        assert!(urls.contains(&"ws://localhost:9000/ws".to_string()));
        assert_eq!(urls.len(), 8);
    }

    #[test]
    fn test_root_path_collapses() {
        let env = EndpointEnv {
            path: Some("/".to_string()),
            ..Default::default()
        };
        let urls = candidate_urls(&[], &env);
        assert_eq!(urls, vec!["ws://localhost:8080", "ws://127.0.0.1:8080"]);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("GSTREAMER_WS_HOST", "studio");
        std::env::set_var("GSTREAMER_WS_PORT", "not-a-port");
        let env = EndpointEnv::from_env();
        std::env::remove_var("GSTREAMER_WS_HOST");
        std::env::remove_var("GSTREAMER_WS_PORT");

        assert_eq!(env.host.as_deref(), Some("studio"));
        assert_eq!(env.port, None);
    }
}

//! Runtime contract of a built image.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Read-only network and process contract derived from the final layer.
///
/// Exactly one listening port and exactly one entrypoint command exist per
/// built image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// TCP port the foreground process listens on
    pub listening_port: u16,
    /// Working directory of the foreground process
    pub working_directory: String,
    /// Program run in the foreground
    pub entrypoint_command: String,
    /// Arguments passed to the program
    pub entrypoint_args: Vec<String>,
    /// Environment recorded on the image
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl RuntimeConfig {
    /// Full argv of the foreground process.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.entrypoint_command.clone())
            .chain(self.entrypoint_args.iter().cloned())
            .collect()
    }

    /// `KEY=VALUE` environment list, sorted by key.
    pub fn env_list(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RuntimeConfig {
        RuntimeConfig {
            listening_port: 8080,
            working_directory: "/srv/www".to_string(),
            entrypoint_command: "httpd-ctl".to_string(),
            entrypoint_args: vec!["-D".to_string(), "FOREGROUND".to_string()],
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn test_argv() {
        assert_eq!(sample().argv(), vec!["httpd-ctl", "-D", "FOREGROUND"]);
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["listeningPort"], 8080);
        assert_eq!(json["workingDirectory"], "/srv/www");
        assert_eq!(json["entrypointCommand"], "httpd-ctl");
        assert!(json.get("env").is_none());
    }

    #[test]
    fn test_env_list_sorted() {
        let mut config = sample();
        config.env.insert("Z".to_string(), "1".to_string());
        config.env.insert("A".to_string(), "2".to_string());
        assert_eq!(config.env_list(), vec!["A=2", "Z=1"]);
    }
}

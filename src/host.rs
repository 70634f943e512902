//! Host environment classification.
//!
//! The environment is read once into [`HostIndicators`]; [`classify_host`] is a
//! pure function over that snapshot so the queue never re-queries process state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Scheduling profile of the hosting process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostProfile {
    /// Long-lived process with event-loop turns available indefinitely
    Persistent,
    /// May be frozen or torn down right after the current unit of work
    Ephemeral,
}

impl HostProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostProfile::Persistent => "persistent",
            HostProfile::Ephemeral => "ephemeral",
        }
    }
}

impl fmt::Display for HostProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "persistent" | "server" | "long-lived" => Ok(HostProfile::Persistent),
            "ephemeral" | "serverless" | "short-lived" => Ok(HostProfile::Ephemeral),
            other => Err(format!("unknown host profile '{}'", other)),
        }
    }
}

/// Explicit override, checked before any platform marker
pub const PROFILE_OVERRIDE_VAR: &str = "LOGSHIP_HOST_PROFILE";

/// Environment variables set by function-as-a-service platforms
const SERVERLESS_MARKERS: &[&str] = &[
    "AWS_LAMBDA_FUNCTION_NAME",
    "AWS_EXECUTION_ENV",
    "FUNCTION_TARGET",
    "K_SERVICE",
    "FUNCTIONS_WORKER_RUNTIME",
    "VERCEL",
    "NETLIFY",
];

/// Snapshot of the environment variables that drive classification
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostIndicators {
    vars: HashMap<String, String>,
}

impl HostIndicators {
    /// Capture the relevant variables from the current process
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(mut lookup: impl FnMut(&str) -> Option<String>) -> Self {
        let vars = SERVERLESS_MARKERS
            .iter()
            .copied()
            .chain(std::iter::once(PROFILE_OVERRIDE_VAR))
            .filter_map(|name| lookup(name).map(|value| (name.to_string(), value)))
            .collect();
        Self { vars }
    }

    pub fn from_pairs<K: Into<String>, V: Into<String>>(
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(|v| v.as_str())
            .filter(|v| !v.is_empty())
    }
}

/// Classify the host. A valid override wins; otherwise any serverless marker
/// means ephemeral.
pub fn classify_host(indicators: &HostIndicators) -> HostProfile {
    if let Some(profile) = indicators
        .get(PROFILE_OVERRIDE_VAR)
        .and_then(|v| v.parse::<HostProfile>().ok())
    {
        return profile;
    }
    if SERVERLESS_MARKERS
        .iter()
        .any(|name| indicators.get(name).is_some())
    {
        HostProfile::Ephemeral
    } else {
        HostProfile::Persistent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_process_is_persistent() {
        assert_eq!(
            classify_host(&HostIndicators::default()),
            HostProfile::Persistent
        );
    }

    #[test]
    fn lambda_marker_is_ephemeral() {
        let indicators = HostIndicators::from_pairs([("AWS_LAMBDA_FUNCTION_NAME", "ingest")]);
        assert_eq!(classify_host(&indicators), HostProfile::Ephemeral);
    }

    #[test]
    fn empty_marker_is_ignored() {
        let indicators = HostIndicators::from_pairs([("K_SERVICE", "")]);
        assert_eq!(classify_host(&indicators), HostProfile::Persistent);
    }

    #[test]
    fn override_wins_over_markers() {
        let indicators = HostIndicators::from_pairs([
            ("VERCEL", "1"),
            (PROFILE_OVERRIDE_VAR, "persistent"),
        ]);
        assert_eq!(classify_host(&indicators), HostProfile::Persistent);
    }

    #[test]
    fn invalid_override_falls_back_to_markers() {
        let indicators = HostIndicators::from_pairs([
            ("NETLIFY", "true"),
            (PROFILE_OVERRIDE_VAR, "sometimes"),
        ]);
        assert_eq!(classify_host(&indicators), HostProfile::Ephemeral);
    }

    #[test]
    fn lookup_only_captures_known_variables() {
        let indicators = HostIndicators::from_lookup(|name| match name {
            "FUNCTION_TARGET" => Some("handler".to_string()),
            _ => None,
        });
        assert_eq!(
            indicators,
            HostIndicators::from_pairs([("FUNCTION_TARGET", "handler")])
        );
    }
}

//! The canonical Kite identity tuple and its path form.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `username/environment/name/version/region/hostname/id`, the
/// hierarchical sort key the registry keys entries on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    pub environment: String,
    pub name: String,
    pub version: String,
    pub region: String,
    pub hostname: String,
    pub id: Uuid,
}

impl Identity {
    pub fn path(&self) -> String {
        format!(
            "/{}/{}/{}/{}/{}/{}/{}",
            self.username,
            self.environment,
            self.name,
            self.version,
            self.region,
            self.hostname,
            self.id
        )
    }

    /// Parse a canonical path back into its fields. Used by re-registration
    /// and by tests that round-trip an identity through the wire.
    pub fn parse(path: &str) -> Option<Self> {
        let trimmed = path.trim_start_matches('/');
        let parts: Vec<&str> = trimmed.split('/').collect();
        if parts.len() != 7 {
            return None;
        }
        Some(Self {
            username: parts[0].to_string(),
            environment: parts[1].to_string(),
            name: parts[2].to_string(),
            version: parts[3].to_string(),
            region: parts[4].to_string(),
            hostname: parts[5].to_string(),
            id: parts[6].parse().ok()?,
        })
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path())
    }
}

/// A query over the path fields. Fields are matched by prefix in
/// declaration order; a `None` after the first `None` means "wildcard from
/// here on". Skipping a field (setting one after leaving an earlier one
/// unset) is rejected by [`Query::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub id: Option<Uuid>,
}

impl Query {
    /// Parse the `"username/environment/name"` shorthand. A bare name query
    /// such as `{name: adder}` is written with explicit field selection via
    /// [`Query::by_name`] instead; this path form is for fully or partially
    /// qualified prefixes like `"/adder"`, filled left-to-right starting at
    /// `username`.
    pub fn parse_path(s: &str) -> Option<Self> {
        let trimmed = s.trim_start_matches('/');
        if trimmed.is_empty() {
            return Some(Self::default());
        }
        let parts: Vec<&str> = trimmed.split('/').collect();
        if parts.len() > 7 {
            return None;
        }
        let mut q = Self::default();
        let fields: [&mut Option<String>; 6] = [
            &mut q.username,
            &mut q.environment,
            &mut q.name,
            &mut q.version,
            &mut q.region,
            &mut q.hostname,
        ];
        for (i, field) in fields.into_iter().enumerate() {
            if let Some(part) = parts.get(i) {
                *field = Some((*part).to_string());
            }
        }
        if let Some(id_part) = parts.get(6) {
            q.id = Some(id_part.parse().ok()?);
        }
        Some(q)
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// No field may be set after an earlier one is left unset: a set
    /// region without an environment is rejected.
    pub fn validate(&self) -> bool {
        let fields = [
            self.username.is_some(),
            self.environment.is_some(),
            self.name.is_some(),
            self.version.is_some(),
            self.region.is_some(),
            self.hostname.is_some(),
            self.id.is_some(),
        ];
        let mut seen_gap = false;
        for set in fields {
            if !set {
                seen_gap = true;
            } else if seen_gap {
                return false;
            }
        }
        true
    }

    /// Whether `identity` matches this query by prefix.
    pub fn matches(&self, identity: &Identity) -> bool {
        if let Some(v) = &self.username {
            if v != &identity.username {
                return false;
            }
        }
        if let Some(v) = &self.environment {
            if v != &identity.environment {
                return false;
            }
        }
        if let Some(v) = &self.name {
            if v != &identity.name {
                return false;
            }
        }
        if let Some(v) = &self.version {
            if v != &identity.version {
                return false;
            }
        }
        if let Some(v) = &self.region {
            if v != &identity.region {
                return false;
            }
        }
        if let Some(v) = &self.hostname {
            if v != &identity.hostname {
                return false;
            }
        }
        if let Some(v) = &self.id {
            if v != &identity.id {
                return false;
            }
        }
        true
    }
}

/// A live registry entry: an identity, the URL it advertised, when it
/// registered, and the heartbeat URL it must POST to to stay live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub identity: Identity,
    pub url: String,
    pub issued_at: i64,
    pub heartbeat_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Identity {
        Identity {
            username: "devuser".into(),
            environment: "dev".into(),
            name: "adder".into(),
            version: "0.0.1".into(),
            region: "default".into(),
            hostname: "box1".into(),
            id: Uuid::nil(),
        }
    }

    #[test]
    fn path_round_trips() {
        let id = sample();
        let parsed = Identity::parse(&id.path()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn query_rejects_gaps() {
        let q = Query {
            username: None,
            environment: Some("dev".into()),
            ..Default::default()
        };
        assert!(!q.validate());
    }

    #[test]
    fn query_matches_by_name() {
        let q = Query::by_name("adder");
        assert!(q.matches(&sample()));
        assert!(!q.matches(&Identity {
            name: "other".into(),
            ..sample()
        }));
    }
}

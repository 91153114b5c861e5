// types.rs
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{AccessError, Result};

/// Upper bound for a CommonName / Organization attribute (RFC 5280 ub-common-name)
const MAX_ATTRIBUTE_LEN: usize = 64;

/// A cluster user: certificate CN maps to the Kubernetes username and each
/// O attribute to a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Identity {
    name: String,
    groups: Vec<String>,
}

impl Identity {
    pub fn new(name: impl Into<String>, groups: Vec<String>) -> Result<Self> {
        let name = name.into();
        validate_attribute("subject name", &name)?;
        for group in &groups {
            validate_attribute("group", group)?;
        }
        Ok(Self { name, groups })
    }

    /// Identity with a single organization, the common case
    pub fn with_group(name: impl Into<String>, group: impl Into<String>) -> Result<Self> {
        Self::new(name, vec![group.into()])
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }
}

fn validate_attribute(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(AccessError::invalid_identity(format!("{} is empty", what)));
    }
    if value.len() > MAX_ATTRIBUTE_LEN {
        return Err(AccessError::invalid_identity(format!(
            "{} '{}' exceeds {} bytes",
            what, value, MAX_ATTRIBUTE_LEN
        )));
    }
    if value.trim() != value {
        return Err(AccessError::invalid_identity(format!(
            "{} '{}' has leading or trailing whitespace",
            what, value
        )));
    }
    if let Some(c) = value
        .chars()
        .find(|c| c.is_control() || *c == '/' || *c == '%')
    {
        return Err(AccessError::invalid_identity(format!(
            "{} '{}' contains disallowed character {:?}",
            what, value, c
        )));
    }
    Ok(())
}

/// API server address plus the trust anchor clients should verify it with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterEndpoint {
    pub name: String,
    pub server: String,
    /// PEM encoded CA certificate
    pub ca_pem: Option<String>,
}

impl ClusterEndpoint {
    pub fn new(name: impl Into<String>, server: impl Into<String>, ca_pem: Option<String>) -> Self {
        Self {
            name: name.into(),
            server: server.into(),
            ca_pem,
        }
    }

    /// Parsed server URL; only https endpoints are accepted.
    pub fn server_url(&self) -> Result<Url> {
        if self.server.trim().is_empty() {
            return Err(AccessError::incomplete("cluster server URL is missing"));
        }
        let url = Url::parse(&self.server).map_err(|e| {
            AccessError::validation(format!("invalid server URL '{}': {}", self.server, e))
        })?;
        if url.scheme() != "https" {
            return Err(AccessError::validation(format!(
                "server URL '{}' must use https",
                self.server
            )));
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_and_email_usernames() {
        let alice = Identity::with_group("alice", "team-group").unwrap();
        assert_eq!(alice.name(), "alice");
        assert_eq!(alice.groups(), ["team-group".to_string()]);

        assert!(Identity::new("bob@example.com", vec![]).is_ok());
        assert!(Identity::new("system:serviceaccount:ci:deployer", vec![]).is_ok());
    }

    #[test]
    fn rejects_unencodable_names() {
        let too_long = "x".repeat(65);
        for bad in ["", " alice", "alice\n", "a/b", "50%", too_long.as_str()] {
            let err = Identity::new(bad, vec![]).unwrap_err();
            assert!(
                matches!(err, AccessError::InvalidIdentity(_)),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn rejects_bad_group() {
        let err = Identity::with_group("alice", "").unwrap_err();
        assert!(err.to_string().contains("group is empty"));
    }

    #[test]
    fn server_url_must_be_https() {
        let ep = ClusterEndpoint::new("prod", "https://10.0.0.1:6443", None);
        assert_eq!(ep.server_url().unwrap().port(), Some(6443));

        let ep = ClusterEndpoint::new("prod", "http://10.0.0.1:6443", None);
        assert!(matches!(ep.server_url(), Err(AccessError::Validation(_))));

        let ep = ClusterEndpoint::new("prod", "", None);
        assert!(matches!(ep.server_url(), Err(AccessError::IncompleteInputs(_))));
    }
}

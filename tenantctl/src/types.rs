//! Common type definitions for tenants and hostnames.
//!
//! This module defines:
//! - Tag rules ([`validate_tag`]) and the reserved tag list
//! - [`ServiceType`], the closed set of hosted applications
//! - Hostname helpers used by signup and the domain router
//!
//! # Tags
//!
//! A tag is the stable identity of a tenant and doubles as the subdomain of its default
//! hostname. Tags are 3 to 32 characters of ASCII letters, digits and underscores, and are
//! case-sensitive. Some tags are reserved because they collide with platform hostnames
//! (`www`, `api`, ...) and the `inttest_` prefix is kept for integration environments.
//!
//! # Utility Functions
//!
//! - [`abbrev_uuid`]: Abbreviate UUIDs to first 8 chars for logging

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::{Error, Result};

pub const MIN_TAG_LEN: usize = 3;
pub const MAX_TAG_LEN: usize = 32;

/// Tags that would shadow platform hostnames
pub const BLACKLISTED_TAGS: &[&str] = &["api", "www", "mail", "cname", "status", "support"];

/// Prefix reserved for integration-test tenants
pub const RESERVED_TAG_PREFIX: &str = "inttest_";

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

/// Check tag syntax: length and character set.
pub fn validate_tag_syntax(tag: &str) -> Result<()> {
    if tag.len() > MAX_TAG_LEN {
        return Err(Error::validation(format!("Tag must be at most {MAX_TAG_LEN} characters.")));
    }
    if tag.len() < MIN_TAG_LEN {
        return Err(Error::validation(format!("Tag must be at least {MIN_TAG_LEN} characters.")));
    }
    if !tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::validation("Tag must contain only letters, digits, and underscores."));
    }
    Ok(())
}

pub fn is_tag_blacklisted(tag: &str) -> bool {
    BLACKLISTED_TAGS.contains(&tag) || tag.starts_with(RESERVED_TAG_PREFIX)
}

/// Full tag validation applied at signup: syntax plus the reserved list.
pub fn validate_tag(tag: &str) -> Result<()> {
    validate_tag_syntax(tag)?;
    if is_tag_blacklisted(tag) {
        return Err(Error::validation(format!("Tag '{tag}' is reserved.")));
    }
    Ok(())
}

/// The kind of application a tenant runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Flarum,
    Mediawiki,
    Wordpress,
}

impl ServiceType {
    pub const ALL: [ServiceType; 3] = [ServiceType::Flarum, ServiceType::Mediawiki, ServiceType::Wordpress];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Flarum => "flarum",
            ServiceType::Mediawiki => "mediawiki",
            ServiceType::Wordpress => "wordpress",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ServiceType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::validation(format!("Invalid site type '{s}'.")))
    }
}

/// Lowercase, trim and drop a trailing root dot.
pub fn normalize_hostname(hostname: &str) -> String {
    hostname.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Check that `hostname` is a syntactically valid fully qualified DNS name.
pub fn validate_hostname(hostname: &str) -> Result<()> {
    let invalid = || Error::validation(format!("'{hostname}' is not a valid hostname."));

    if hostname.is_empty() || hostname.len() > 253 {
        return Err(invalid());
    }
    let labels: Vec<&str> = hostname.split('.').collect();
    if labels.len() < 2 {
        return Err(invalid());
    }
    for label in labels {
        let ok = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !ok {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Default hostname minted for a tag under one of the platform's domains
pub fn default_hostname(tag: &str, parent_domain: &str) -> String {
    format!("{tag}.{parent_domain}")
}

/// Return the allowed parent domain `hostname` falls under, if any.
pub fn matching_parent_domain<'a>(hostname: &str, allowed_domains: &'a [String]) -> Option<&'a str> {
    allowed_domains
        .iter()
        .find(|domain| hostname == domain.as_str() || hostname.ends_with(&format!(".{domain}")))
        .map(String::as_str)
}

/// Check that `email` is a deliverable address.
pub fn validate_email(email: &str) -> Result<()> {
    email
        .trim()
        .parse::<lettre::Address>()
        .map(|_| ())
        .map_err(|_| Error::validation(format!("'{}' is not a valid e-mail address.", email.trim())))
}

//! Purpose-scoped capability tokens.
//!
//! Tokens are HS256 JWTs carrying the tenant tag as `sub`, a `purpose` claim and `gen`, the
//! creation time of the site the token was minted for. A removed tag can be reclaimed by a new
//! owner; the new site has a different `gen`, so the previous owner's tokens stop working.
//! There is no server-side revocation list, so every purpose embeds exactly the claims needed
//! to make it self-invalidating:
//!
//! - `access`: plain subject, used for authenticated account actions
//! - `reset`: carries `pfp`, a fingerprint of the password hash at issuance. Once the password
//!   changes the fingerprint no longer matches, which makes the link single-use
//! - `email_change`: carries the pending `new_email`; replaying it is harmless
//! - `download`: very short lived, authorizes one export download link
//!
//! Verification distinguishes [`Error::TokenExpired`] (request a new link) from
//! [`Error::TokenInvalid`] (malformed, tampered, or minted for a different purpose).

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{Config, TokensConfig};
use crate::db::models::tenants::Tenant;
use crate::errors::{Error, Result};

/// Length of the hex password fingerprint embedded in reset tokens
const FINGERPRINT_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenPurpose {
    Access,
    Reset,
    EmailChange,
    Download,
}

impl TokenPurpose {
    fn label(&self) -> &'static str {
        match self {
            TokenPurpose::Access => "access",
            TokenPurpose::Reset => "reset",
            TokenPurpose::EmailChange => "confirmation",
            TokenPurpose::Download => "download",
        }
    }
}

impl fmt::Display for TokenPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// JWT claims shared by every token purpose
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityClaims {
    pub sub: String, // Tenant tag
    pub purpose: TokenPurpose,
    /// Creation time of the site in microseconds; tokens without it never match
    #[serde(default, rename = "gen")]
    pub generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pfp: Option<String>, // Password fingerprint (reset only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_email: Option<String>, // Pending address (email_change only)
    pub exp: i64,
    pub iat: i64,
}

/// Identifies one incarnation of a tag
fn generation(tenant: &Tenant) -> i64 {
    tenant.created_at.timestamp_micros()
}

fn ensure_issued_for(tag: &str, token_generation: i64, purpose: TokenPurpose, tenant: &Tenant) -> Result<()> {
    if tenant.tag == tag && token_generation == generation(tenant) {
        Ok(())
    } else {
        Err(invalid(purpose))
    }
}

/// A decoded access or download token, still to be checked against the site it names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub tag: String,
    purpose: TokenPurpose,
    generation: i64,
}

impl Grant {
    /// Fails if the tag has since been reclaimed by another site
    pub fn ensure_current(&self, tenant: &Tenant) -> Result<()> {
        ensure_issued_for(&self.tag, self.generation, self.purpose, tenant)
    }
}

/// A decoded reset token, still to be checked against the tenant's current password hash
#[derive(Debug, Clone)]
pub struct ResetGrant {
    pub tag: String,
    generation: i64,
    fingerprint: String,
}

impl ResetGrant {
    /// True if the token was issued for this site and its password has not changed since
    pub fn matches(&self, tenant: &Tenant) -> bool {
        ensure_issued_for(&self.tag, self.generation, TokenPurpose::Reset, tenant).is_ok()
            && self.fingerprint == password_fingerprint(&tenant.admin_password_hash)
    }

    pub fn ensure_matches(&self, tenant: &Tenant) -> Result<()> {
        if self.matches(tenant) {
            Ok(())
        } else {
            Err(invalid(TokenPurpose::Reset))
        }
    }
}

/// A decoded email change token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailChangeGrant {
    pub tag: String,
    pub new_email: String,
    generation: i64,
}

impl EmailChangeGrant {
    pub fn ensure_current(&self, tenant: &Tenant) -> Result<()> {
        ensure_issued_for(&self.tag, self.generation, TokenPurpose::EmailChange, tenant)
    }
}

/// Truncated sha256 of a password hash. Never reveals the hash itself.
pub fn password_fingerprint(password_hash: &str) -> String {
    let digest = Sha256::digest(password_hash.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(FINGERPRINT_LEN);
    hex
}

/// Mints and validates capability tokens with a single shared secret.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    lifetimes: TokensConfig,
}

impl TokenIssuer {
    pub fn new(secret: &str, lifetimes: TokensConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            lifetimes,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let secret = config.secret_key.as_ref().ok_or_else(|| Error::Internal {
            operation: "issue tokens: secret_key is required".to_string(),
        })?;
        Ok(Self::new(secret, config.tokens.clone()))
    }

    pub fn issue_access(&self, tenant: &Tenant) -> Result<String> {
        self.issue(tenant, TokenPurpose::Access, self.lifetimes.access, None, None)
    }

    /// Bound to the tenant's current password hash
    pub fn issue_reset(&self, tenant: &Tenant) -> Result<String> {
        let pfp = password_fingerprint(&tenant.admin_password_hash);
        self.issue(tenant, TokenPurpose::Reset, self.lifetimes.reset, Some(pfp), None)
    }

    pub fn issue_email_change(&self, tenant: &Tenant, new_email: &str) -> Result<String> {
        self.issue(
            tenant,
            TokenPurpose::EmailChange,
            self.lifetimes.email_change,
            None,
            Some(new_email.to_string()),
        )
    }

    pub fn issue_download(&self, tenant: &Tenant) -> Result<String> {
        self.issue(tenant, TokenPurpose::Download, self.lifetimes.download, None, None)
    }

    pub fn verify_access(&self, token: &str) -> Result<Grant> {
        self.verify_grant(token, TokenPurpose::Access)
    }

    pub fn verify_reset(&self, token: &str) -> Result<ResetGrant> {
        let claims = self.decode(token, TokenPurpose::Reset)?;
        let fingerprint = claims.pfp.ok_or_else(|| invalid(TokenPurpose::Reset))?;
        Ok(ResetGrant {
            tag: claims.sub,
            generation: claims.generation,
            fingerprint,
        })
    }

    pub fn verify_email_change(&self, token: &str) -> Result<EmailChangeGrant> {
        let claims = self.decode(token, TokenPurpose::EmailChange)?;
        let new_email = claims.new_email.ok_or_else(|| invalid(TokenPurpose::EmailChange))?;
        Ok(EmailChangeGrant {
            tag: claims.sub,
            new_email,
            generation: claims.generation,
        })
    }

    /// Names the site whose export the download token authorizes
    pub fn verify_download(&self, token: &str) -> Result<Grant> {
        self.verify_grant(token, TokenPurpose::Download)
    }

    fn verify_grant(&self, token: &str, purpose: TokenPurpose) -> Result<Grant> {
        let claims = self.decode(token, purpose)?;
        Ok(Grant {
            tag: claims.sub,
            purpose,
            generation: claims.generation,
        })
    }

    fn issue(
        &self,
        tenant: &Tenant,
        purpose: TokenPurpose,
        lifetime: Duration,
        pfp: Option<String>,
        new_email: Option<String>,
    ) -> Result<String> {
        let now = Utc::now();
        let lifetime = chrono::Duration::from_std(lifetime).map_err(|e| Error::Internal {
            operation: format!("compute {purpose} token expiry: {e}"),
        })?;
        let claims = CapabilityClaims {
            sub: tenant.tag.clone(),
            purpose,
            generation: generation(tenant),
            pfp,
            new_email,
            exp: (now + lifetime).timestamp(),
            iat: now.timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).map_err(|e| Error::Internal {
            operation: format!("create {purpose} token: {e}"),
        })
    }

    fn decode(&self, token: &str, expected: TokenPurpose) -> Result<CapabilityClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        let data = decode::<CapabilityClaims>(token, &self.decoding, &validation).map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => Error::TokenExpired {
                purpose: expected.to_string(),
            },

            // Server errors - key issues, internal failures
            ErrorKind::InvalidEcdsaKey
            | ErrorKind::InvalidRsaKey(_)
            | ErrorKind::RsaFailedSigning
            | ErrorKind::InvalidKeyFormat
            | ErrorKind::Crypto(_) => Error::Internal {
                operation: format!("verify {expected} token: {e}"),
            },

            // Everything else is a malformed or tampered token
            _ => invalid(expected),
        })?;

        if data.claims.purpose != expected || data.claims.sub.is_empty() {
            return Err(invalid(expected));
        }
        Ok(data.claims)
    }
}

fn invalid(purpose: TokenPurpose) -> Error {
    Error::TokenInvalid {
        purpose: purpose.to_string(),
    }
}

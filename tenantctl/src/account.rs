//! Credential actions of a site admin.
//!
//! Sensitive one-shot actions are authorized by capability tokens instead of sessions. A reset
//! token carries a fingerprint of the password hash it was issued against, so changing the
//! password through any path invalidates every outstanding reset link. Every token is also
//! bound to the site it was minted for, so a reclaimed tag does not honor old links.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::auth::password::{Argon2Params, hash_password, validate_new_password, verify_password};
use crate::auth::tokens::TokenIssuer;
use crate::config::{Config, TokensConfig};
use crate::db::handlers::TenantRepository;
use crate::db::models::tenants::{Tenant, TenantUpdate};
use crate::email::{Email, Mailer};
use crate::errors::{Error, Result};
use crate::types::validate_email;

/// Result of a successful login
#[derive(Debug, Clone)]
pub struct LoginSession {
    pub tenant: Tenant,
    pub access_token: String,
}

pub struct AccountService {
    tenants: Arc<dyn TenantRepository>,
    tokens: Arc<TokenIssuer>,
    mailer: Arc<dyn Mailer>,
    password_hashing: Argon2Params,
    lifetimes: TokensConfig,
    public_url: String,
}

fn invalid_credentials() -> Error {
    Error::Authorization {
        message: "Invalid site, e-mail or password.".to_string(),
    }
}

impl AccountService {
    pub fn new(config: &Config, tenants: Arc<dyn TenantRepository>, tokens: Arc<TokenIssuer>, mailer: Arc<dyn Mailer>) -> Self {
        Self {
            tenants,
            tokens,
            mailer,
            password_hashing: config.password_hashing,
            lifetimes: config.tokens.clone(),
            public_url: config.public_url(),
        }
    }

    async fn active(&self, tag: &str) -> Result<Tenant> {
        self.tenants
            .get(tag)
            .await?
            .filter(|t| !t.is_removed())
            .ok_or_else(|| Error::not_found("Site", tag))
    }

    fn link(&self, path: &str, token: &str) -> String {
        format!("{}/{path}?token={token}", self.public_url.trim_end_matches('/'))
    }

    async fn deliver(&self, to: &str, email: &Email) {
        if let Err(e) = self.mailer.send(to, email).await {
            warn!(error = %e, subject = %email.subject, "Failed to send e-mail");
        }
    }

    /// Check a password by tag, admin e-mail or hostname and hand out an access token.
    #[instrument(skip_all, fields(identifier = %identifier), err)]
    pub async fn login(&self, identifier: &str, password: &str, ip: Option<&str>) -> Result<LoginSession> {
        let tenant = self
            .tenants
            .get_by_identifier(identifier.trim(), false)
            .await?
            .ok_or_else(invalid_credentials)?;

        if !verify_password(password, &tenant.admin_password_hash)? {
            return Err(invalid_credentials());
        }

        let tenant = self
            .tenants
            .update(&tenant.tag, &TenantUpdate::login(Utc::now(), ip.map(str::to_string)))
            .await?;
        let access_token = self.tokens.issue_access(&tenant)?;
        info!(tag = %tenant.tag, "Admin logged in");
        Ok(LoginSession { tenant, access_token })
    }

    /// The active site an access token was issued for
    pub async fn authenticate(&self, access_token: &str) -> Result<Tenant> {
        let grant = self.tokens.verify_access(access_token)?;
        let tenant = self.active(&grant.tag).await?;
        grant.ensure_current(&tenant)?;
        Ok(tenant)
    }

    /// Mail a reset link to the admin. Unknown identifiers are silently accepted.
    #[instrument(skip_all, fields(identifier = %identifier), err)]
    pub async fn request_password_reset(&self, identifier: &str) -> Result<()> {
        let Some(tenant) = self.tenants.get_by_identifier(identifier.trim(), false).await? else {
            debug!("Password reset requested for unknown site");
            return Ok(());
        };

        let token = self.tokens.issue_reset(&tenant)?;
        let email = Email::password_reset(&tenant.tag, &self.link("reset", &token), self.lifetimes.reset);
        self.deliver(&tenant.admin_email, &email).await;
        Ok(())
    }

    /// Redeem a reset link. The link stops working as soon as the password changes.
    #[instrument(skip_all, err)]
    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<Tenant> {
        let grant = self.tokens.verify_reset(token)?;
        let tenant = self.active(&grant.tag).await?;
        grant.ensure_matches(&tenant)?;

        validate_new_password(new_password)?;
        let hash = hash_password(new_password, self.password_hashing)?;
        let tenant = self.tenants.update(&tenant.tag, &TenantUpdate::password_hash(hash)).await?;
        info!(tag = %tenant.tag, "Admin password reset");
        Ok(tenant)
    }

    #[instrument(skip_all, fields(tag = %tag), err)]
    pub async fn change_password(&self, tag: &str, current_password: &str, new_password: &str) -> Result<Tenant> {
        let tenant = self.active(tag).await?;
        if !verify_password(current_password, &tenant.admin_password_hash)? {
            return Err(Error::Authorization {
                message: "Current password is incorrect.".to_string(),
            });
        }
        if current_password == new_password {
            return Err(Error::validation("New password must be different from the current password."));
        }

        validate_new_password(new_password)?;
        let hash = hash_password(new_password, self.password_hashing)?;
        self.tenants
            .update(&tenant.tag, &TenantUpdate::password_hash(hash))
            .await
            .map_err(Into::into)
    }

    /// Mail a confirmation link to the new address; nothing changes until it is followed.
    #[instrument(skip_all, fields(tag = %tag), err)]
    pub async fn request_email_change(&self, tag: &str, new_email: &str, password: &str) -> Result<()> {
        let new_email = new_email.trim();
        validate_email(new_email)?;

        let tenant = self.active(tag).await?;
        if !verify_password(password, &tenant.admin_password_hash)? {
            return Err(invalid_credentials());
        }
        if tenant.admin_email.eq_ignore_ascii_case(new_email) {
            return Err(Error::conflict(format!("'{new_email}' is already the admin e-mail.")));
        }

        let token = self.tokens.issue_email_change(&tenant, new_email)?;
        let email = Email::email_change(
            &tenant.tag,
            new_email,
            &self.link("email/confirm", &token),
            self.lifetimes.email_change,
        );
        self.deliver(new_email, &email).await;
        Ok(())
    }

    /// Apply a confirmed e-mail change. Replaying the link is harmless.
    #[instrument(skip_all, err)]
    pub async fn confirm_email_change(&self, token: &str) -> Result<Tenant> {
        let grant = self.tokens.verify_email_change(token)?;
        let tenant = self.active(&grant.tag).await?;
        grant.ensure_current(&tenant)?;
        let tenant = self
            .tenants
            .update(&tenant.tag, &TenantUpdate::admin_email(grant.new_email))
            .await?;
        info!(tag = %tenant.tag, "Admin e-mail changed");
        Ok(tenant)
    }

    /// A short-lived link for downloading the site's export without logging in
    pub async fn issue_download_link(&self, tag: &str) -> Result<String> {
        let tenant = self.active(tag).await?;
        Ok(self.link("download", &self.tokens.issue_download(&tenant)?))
    }

    pub async fn authorize_download(&self, token: &str) -> Result<Tenant> {
        let grant = self.tokens.verify_download(token)?;
        let tenant = self.active(&grant.tag).await?;
        grant.ensure_current(&tenant)?;
        if !tenant.is_installed() {
            return Err(Error::conflict(format!("Site '{}' has nothing to download yet.", tenant.tag)));
        }
        Ok(tenant)
    }
}

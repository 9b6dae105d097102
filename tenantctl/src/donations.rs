//! Donation ledger and the Ko-fi webhook.
//!
//! Donations only ever add to a site's `donated_amount`. Crossing the perks threshold unlocks
//! custom domains; nothing is taken away when it is not crossed.
//!
//! After a credit the installed site's own configuration is refreshed with the new total, so
//! the application can thank the donor. That job is best-effort: the credit stands either way.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::db::errors::DbError;
use crate::db::handlers::TenantRepository;
use crate::db::handlers::repository::DONATION_CONSTRAINT;
use crate::db::models::tenants::Tenant;
use crate::email::{Email, Mailer};
use crate::errors::{Error, Result};
use crate::jobs::JobExecutor;
use crate::jobs::spec::{JobSpec, UpdateConfigParams};

/// The JSON document Ko-fi posts in the `data` form field
#[derive(Debug, Clone, Deserialize)]
pub struct KofiPayload {
    pub verification_token: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub from_name: String,
    #[serde(default)]
    pub message: Option<String>,
    pub amount: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub kofi_transaction_id: String,
}

impl KofiPayload {
    pub fn from_form_data(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(|e| Error::validation(format!("Invalid Ko-fi payload: {e}")))
    }
}

/// A donation credited to a site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credit {
    pub tag: String,
    pub total: Decimal,
    /// This donation crossed the perks threshold
    pub perks_unlocked: bool,
    /// Set when the site's configuration could not be refreshed
    pub config_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DonationOutcome {
    Credited(Credit),
    /// No active site matched; the info address was told
    Unmatched,
}

pub struct DonationLedger {
    tenants: Arc<dyn TenantRepository>,
    jobs: Arc<dyn JobExecutor>,
    mailer: Arc<dyn Mailer>,
    verification_token: Option<String>,
    info_email: Option<String>,
    perks_threshold: Decimal,
}

/// Exclusive upper bound of a NUMERIC(10, 2) column
const MAX_AMOUNT: Decimal = Decimal::from_parts(100_000_000, 0, 0, false, 0);

fn parse_amount(amount: &str) -> Result<Decimal> {
    let amount = Decimal::from_str(amount.trim())
        .map_err(|_| Error::validation(format!("'{amount}' is not a valid amount.")))?;
    if amount <= Decimal::ZERO {
        return Err(Error::validation("Donation amount must be positive."));
    }
    // Stored as NUMERIC(10, 2); anything finer would be rounded silently.
    if amount.normalize().scale() > 2 {
        return Err(Error::validation(format!("'{amount}' has more than two decimal places.")));
    }
    if amount >= MAX_AMOUNT {
        return Err(Error::validation(format!("'{amount}' exceeds the largest amount that can be stored.")));
    }
    Ok(amount)
}

/// The host a donor named at the start of their message, e.g. `https://forum1.example.com/`
fn host_from_message(message: &str) -> Option<String> {
    let word = message.split_whitespace().next()?;
    let candidate = if word.contains("://") {
        word.to_string()
    } else {
        format!("http://{word}")
    };
    url::Url::parse(&candidate)
        .ok()?
        .host_str()
        .map(|host| host.trim_end_matches('.').to_ascii_lowercase())
}

impl DonationLedger {
    pub fn new(
        config: &Config,
        tenants: Arc<dyn TenantRepository>,
        jobs: Arc<dyn JobExecutor>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        Self {
            tenants,
            jobs,
            mailer,
            verification_token: config.donations.kofi_verification_token.clone(),
            info_email: config.donations.info_email.clone(),
            perks_threshold: config.donations.perks_threshold,
        }
    }

    /// Add `amount` to the active site matching `identifier`.
    #[instrument(skip(self), err)]
    pub async fn record(&self, identifier: &str, amount: &str) -> Result<Credit> {
        let amount = parse_amount(amount)?;
        let tenant = self
            .tenants
            .get_by_identifier(identifier, false)
            .await?
            .ok_or_else(|| Error::not_found("Site", identifier))?;
        self.credit(&tenant, amount).await
    }

    async fn credit(&self, tenant: &Tenant, amount: Decimal) -> Result<Credit> {
        let total = self.tenants.add_donation(&tenant.tag, amount).await.map_err(|e| match e {
            DbError::CheckViolation { constraint, .. } if constraint.as_deref() == Some(DONATION_CONSTRAINT) => {
                Error::validation("Donation amount must be positive.")
            }
            DbError::NotFound => Error::not_found("Site", &tenant.tag),
            e => e.into(),
        })?;

        let before = total - amount;
        let perks_unlocked = before < self.perks_threshold && total >= self.perks_threshold;
        info!(tag = %tenant.tag, %amount, %total, perks_unlocked, "Donation credited");

        let config_error = if tenant.is_installed() {
            self.sync_site_config(tenant, total).await.err().map(|e| e.to_string())
        } else {
            None
        };

        Ok(Credit {
            tag: tenant.tag.clone(),
            total,
            perks_unlocked,
            config_error,
        })
    }

    async fn sync_site_config(&self, tenant: &Tenant, total: Decimal) -> Result<()> {
        let spec = JobSpec::UpdateConfig(UpdateConfigParams {
            tag: tenant.tag.clone(),
            service_type: tenant.service_type,
            donated_amount: total,
            donor_perks: total >= self.perks_threshold,
        });
        if let Err(e) = self.jobs.run_to_success(&spec).await {
            warn!(tag = %tenant.tag, error = %e, "Refreshing site configuration after donation failed");
            return Err(e);
        }
        Ok(())
    }

    /// Handle one Ko-fi notification. Unmatched donations are reported and still acknowledged.
    #[instrument(skip_all, fields(transaction = %payload.kofi_transaction_id), err)]
    pub async fn handle_kofi(&self, payload: &KofiPayload) -> Result<DonationOutcome> {
        match &self.verification_token {
            Some(expected) if *expected == payload.verification_token => {}
            _ => {
                return Err(Error::Authorization {
                    message: "Invalid verification token".to_string(),
                });
            }
        }

        let amount = parse_amount(&payload.amount)?;

        let mut tenant = None;
        if let Some(host) = payload.message.as_deref().and_then(host_from_message) {
            tenant = self.tenants.get_by_identifier(&host, false).await?;
        }
        if tenant.is_none() && !payload.email.is_empty() {
            tenant = self.tenants.get_by_identifier(payload.email.trim(), false).await?;
        }

        match tenant {
            Some(tenant) => Ok(DonationOutcome::Credited(self.credit(&tenant, amount).await?)),
            None => {
                warn!(%amount, currency = %payload.currency, "Donation matched no site");
                self.report_unmatched(payload).await;
                Ok(DonationOutcome::Unmatched)
            }
        }
    }

    async fn report_unmatched(&self, payload: &KofiPayload) {
        let Some(info_email) = &self.info_email else {
            return;
        };
        let email = Email::unmatched_donation(
            &format!("{} {}", payload.amount, payload.currency).trim().to_string(),
            &payload.from_name,
            &payload.email,
            &payload.kofi_transaction_id,
            payload.message.as_deref().unwrap_or("(none)"),
        );
        if let Err(e) = self.mailer.send(info_email, &email).await {
            warn!(error = %e, "Failed to report unmatched donation");
        }
    }
}

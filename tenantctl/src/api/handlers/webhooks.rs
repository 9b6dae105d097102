//! Incoming webhooks from donation platforms.

use axum::{Form, Json, extract::State};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::AppState;
use crate::donations::{DonationOutcome, KofiPayload};
use crate::errors::Error;

#[derive(Debug, Deserialize)]
pub struct KofiForm {
    pub data: String,
}

/// Ko-fi wants a 200 for every genuine notification, including donations that match no site.
#[tracing::instrument(skip_all)]
pub async fn kofi(State(state): State<AppState>, Form(form): Form<KofiForm>) -> Result<Json<Value>, Error> {
    let payload = KofiPayload::from_form_data(&form.data)?;

    match state.donations.handle_kofi(&payload).await? {
        DonationOutcome::Credited(credit) => {
            tracing::debug!(tag = %credit.tag, total = %credit.total, "Ko-fi donation credited");
        }
        DonationOutcome::Unmatched => tracing::debug!("Ko-fi donation left unmatched"),
    }

    Ok(Json(json!({ "status": "ok" })))
}

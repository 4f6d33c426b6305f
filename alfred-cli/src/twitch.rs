//! Outbound validation of Twitch OAuth tokens.
//!
//! `Authenticate{twitch}` hands the token to Twitch's validation endpoint;
//! a `200` whose body carries a decimal `user_id` yields the synthetic
//! identifier `twitch:<user_id>`. Anything else refuses the credential.

use std::sync::Arc;

use reqwest::StatusCode;
use reqwest::header::AUTHORIZATION;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::transactions::ClientTransactions;

/// Production validation endpoint. Tests substitute a local server.
pub const VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";

/// Outcome delivered back to the owning session: the validated user id, or
/// the reason the credential was refused.
pub type Outcome = Result<String, String>;

/// Begins validation of `token`, delivering the outcome through `reply`.
/// When the owning session is gone by completion time the transaction is
/// abandoned with a warning, and nothing else happens.
pub fn begin_validation(
    pool: &Arc<ClientTransactions>,
    validate_url: &str,
    token: &str,
    reply: mpsc::Sender<Outcome>,
) -> u64 {
    let request = pool
        .client()
        .get(validate_url)
        .header(AUTHORIZATION, format!("OAuth {token}"));
    pool.post(request, move |id, result| {
        let outcome = match result {
            Ok(response) if response.status == StatusCode::OK => parse_user_id(&response.body),
            Ok(response) => Err(format!("token validation returned {}", response.status)),
            Err(transaction_error) => Err(format!("token validation failed: {transaction_error}")),
        };
        if reply.try_send(outcome).is_err() {
            warn!(id, "transaction abandoned: session is gone");
        }
    })
}

fn parse_user_id(body: &str) -> Outcome {
    let decoded: Value = serde_json::from_str(body)
        .map_err(|decode_error| format!("unparseable validation response: {decode_error}"))?;
    let user_id = match decoded.get("user_id") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Number(number)) => number.to_string(),
        _ => return Err("validation response missing user_id".into()),
    };
    if !user_id.is_empty() && user_id.bytes().all(|byte| byte.is_ascii_digit()) {
        Ok(user_id)
    } else {
        Err("validation response user_id is not decimal".into())
    }
}

use async_trait::async_trait;
use reqwest::{
    Client,
    header::{ACCEPT, AUTHORIZATION},
};
use tracing::{debug, warn};

use crate::domain::ticket::Ticket;
use crate::error::{AppError, AppResult};
use crate::services::TicketStore;

/// Reads the ticket table through the Supabase REST (PostgREST) endpoint.
pub struct SupabaseStore {
    http: Client,
    base_url: Option<String>,
    api_key: Option<String>,
    table: String,
}

impl SupabaseStore {
    pub fn new(base_url: Option<String>, api_key: Option<String>, table: String) -> Self {
        Self {
            http: Client::new(),
            base_url,
            api_key,
            table,
        }
    }

    fn api_details(&self) -> AppResult<(&str, &str)> {
        let base_url = self
            .base_url
            .as_deref()
            .ok_or_else(|| AppError::Configuration("Supabase URL not configured".to_string()))?;
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| AppError::Configuration("Supabase key not configured".to_string()))?;
        Ok((base_url, api_key))
    }

    fn table_endpoint(base_url: &str, table: &str) -> String {
        format!("{}/rest/v1/{}", base_url.trim_end_matches('/'), table)
    }
}

#[async_trait]
impl TicketStore for SupabaseStore {
    async fn list_tickets(&self) -> AppResult<Vec<Ticket>> {
        let (base_url, api_key) = self.api_details()?;
        let endpoint = Self::table_endpoint(base_url, &self.table);
        debug!(%endpoint, "listing tickets");

        let response = self
            .http
            .get(endpoint)
            .query(&[("select", "*"), ("order", "created_at.desc")])
            .header("apikey", api_key)
            .header(AUTHORIZATION, format!("Bearer {api_key}"))
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| AppError::Load(format!("failed to reach the ticket store: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unable to read response>".to_string());
            warn!(%status, %body, "ticket store rejected the listing");
            return Err(AppError::Load(format!("ticket store responded with {status}")));
        }

        let tickets: Vec<Ticket> = response
            .json()
            .await
            .map_err(|err| AppError::Load(format!("failed to parse ticket rows: {err}")))?;
        debug!(count = tickets.len(), "tickets listed");
        Ok(tickets)
    }
}

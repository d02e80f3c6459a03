use async_trait::async_trait;
use reqwest::{
    Client,
    header::{ACCEPT, CONTENT_TYPE},
};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::domain::ticket::{NewTicket, TicketId};
use crate::error::{AppError, AppResult};
use crate::services::{CreatedTicket, ServiceHealth, TicketIntake};

/// Talks to the classification service that creates and later classifies tickets.
pub struct IntakeClient {
    http: Client,
    base_url: String,
}

impl IntakeClient {
    pub fn new(base_url: String) -> Self {
        Self {
            http: Client::new(),
            base_url,
        }
    }

    fn endpoint(base_url: &str, path: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl TicketIntake for IntakeClient {
    async fn create_ticket(&self, draft: &NewTicket) -> AppResult<CreatedTicket> {
        let response = self
            .http
            .post(Self::endpoint(&self.base_url, "create_ticket"))
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .json(draft)
            .send()
            .await
            .map_err(|err| {
                warn!("failed to call the ticket service: {err}");
                AppError::Submission
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unable to read response>".to_string());
            warn!(%status, %body, "ticket service rejected the ticket");
            return Err(AppError::Submission);
        }

        // The body is informative only; an unreadable one still means success.
        let created = match response.json::<CreateTicketResponse>().await {
            Ok(payload) => CreatedTicket {
                id: payload.ticket_id.map(TicketId),
                message: payload.message,
                request_id: payload.request_id,
            },
            Err(err) => {
                debug!("ticket service returned an unexpected body: {err}");
                CreatedTicket::default()
            }
        };
        info!(id = ?created.id, "ticket submitted");
        Ok(created)
    }

    async fn health(&self) -> AppResult<ServiceHealth> {
        let response = self
            .http
            .get(Self::endpoint(&self.base_url, "health"))
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| AppError::Service(format!("failed to reach the service: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Service(format!("service responded with {status}")));
        }

        response
            .json()
            .await
            .map_err(|err| AppError::Service(format!("failed to parse health report: {err}")))
    }
}

#[derive(Deserialize)]
struct CreateTicketResponse {
    ticket_id: Option<String>,
    message: Option<String>,
    request_id: Option<String>,
}

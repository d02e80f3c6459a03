use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{AppError, AppResult};

pub const MIN_DESCRIPTION_CHARS: usize = 30;
const SUMMARY_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(pub String);

impl TicketId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TicketId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketCategory {
    #[serde(rename = "Técnico")]
    Tecnico,
    #[serde(rename = "Facturación")]
    Facturacion,
    #[serde(rename = "Comercial")]
    Comercial,
    #[serde(rename = "Otro", other)]
    Otro,
}

impl TicketCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketCategory::Tecnico => "Técnico",
            TicketCategory::Facturacion => "Facturación",
            TicketCategory::Comercial => "Comercial",
            TicketCategory::Otro => "Otro",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketSentiment {
    #[serde(rename = "Positivo")]
    Positivo,
    #[serde(rename = "Negativo")]
    Negativo,
    #[serde(rename = "Neutral", other)]
    Neutral,
}

impl TicketSentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketSentiment::Positivo => "Positivo",
            TicketSentiment::Neutral => "Neutral",
            TicketSentiment::Negativo => "Negativo",
        }
    }
}

/// A row of the remote `tickets` table.
///
/// `category`, `sentiment` and `processed` are written once by the external
/// classifier; everything else is fixed at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: Option<TicketCategory>,
    #[serde(default)]
    pub sentiment: Option<TicketSentiment>,
    #[serde(default)]
    pub processed: bool,
}

impl Ticket {
    /// First 80 characters of the description, with an ellipsis when cut.
    pub fn summary(&self) -> String {
        let mut chars = self.description.chars();
        let head: String = chars.by_ref().take(SUMMARY_CHARS).collect();
        if chars.next().is_some() {
            format!("{head}...")
        } else {
            head
        }
    }

    pub fn status_label(&self) -> &'static str {
        if self.processed { "processed" } else { "pending" }
    }
}

/// A description that passed local validation and may be sent for creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewTicket {
    description: String,
}

impl NewTicket {
    pub fn new(description: impl Into<String>) -> AppResult<Self> {
        let description = description.into();
        let length = description.chars().count();
        if length < MIN_DESCRIPTION_CHARS {
            return Err(AppError::DescriptionTooShort {
                length,
                minimum: MIN_DESCRIPTION_CHARS,
            });
        }
        Ok(Self { description })
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Text being composed for a new ticket.
///
/// The text is only cleared by a successful submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketForm {
    pub description: String,
}

impl TicketForm {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
        }
    }

    pub fn char_count(&self) -> usize {
        self.description.chars().count()
    }

    pub fn remaining_chars(&self) -> usize {
        MIN_DESCRIPTION_CHARS.saturating_sub(self.char_count())
    }

    pub fn is_ready(&self) -> bool {
        self.remaining_chars() == 0
    }

    pub fn draft(&self) -> AppResult<NewTicket> {
        NewTicket::new(self.description.clone())
    }

    pub fn clear(&mut self) {
        self.description.clear();
    }
}

mod timestamp {
    use super::*;

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        // Postgres renders `timestamptz` with a short `+00` offset.
        if let Ok(parsed) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
            return Some(parsed.with_timezone(&Utc));
        }
        if let Ok(parsed) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%#z") {
            return Some(parsed.with_timezone(&Utc));
        }
        for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
                return Some(naive.and_utc());
            }
        }
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
    }
}

#[cfg(test)]
pub(crate) use timestamp::parse as parse_timestamp;

use crate::domain::ticket::{Ticket, TicketId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "DELETE" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

/// One row-level notification from the change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    /// Row after the change. Absent for deletions.
    pub record: Option<Ticket>,
    /// Identifier of the row before the change, when the feed provides it.
    pub old_id: Option<TicketId>,
}

impl ChangeEvent {
    pub fn insert(ticket: Ticket) -> Self {
        Self {
            kind: ChangeKind::Insert,
            record: Some(ticket),
            old_id: None,
        }
    }

    pub fn update(ticket: Ticket) -> Self {
        let old_id = Some(ticket.id.clone());
        Self {
            kind: ChangeKind::Update,
            record: Some(ticket),
            old_id,
        }
    }

    pub fn delete(id: TicketId) -> Self {
        Self {
            kind: ChangeKind::Delete,
            record: None,
            old_id: Some(id),
        }
    }

    pub fn ticket_id(&self) -> Option<&TicketId> {
        self.record
            .as_ref()
            .map(|ticket| &ticket.id)
            .or(self.old_id.as_ref())
    }
}

/// What a change subscription delivers to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Change(ChangeEvent),
    /// The channel is (again) live; notifications before this point may have been missed.
    Resubscribed,
    /// A notification arrived that could not be understood.
    Fault(String),
}

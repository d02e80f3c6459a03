use std::collections::HashSet;

use crate::domain::change::{ChangeEvent, ChangeKind};
use crate::domain::ticket::{Ticket, TicketId};
use crate::error::{AppError, AppResult};

/// Locally cached tickets, newest first, one entry per id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TicketCollection {
    tickets: Vec<Ticket>,
}

impl TicketCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a collection from a full server listing.
    ///
    /// Duplicate ids keep their first occurrence. The sort is stable, so rows
    /// sharing a timestamp keep the server's relative order.
    pub fn from_rows(rows: Vec<Ticket>) -> Self {
        let mut seen = HashSet::with_capacity(rows.len());
        let mut tickets: Vec<Ticket> = rows
            .into_iter()
            .filter(|ticket| seen.insert(ticket.id.clone()))
            .collect();
        tickets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Self { tickets }
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    pub fn as_slice(&self) -> &[Ticket] {
        &self.tickets
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ticket> {
        self.tickets.iter()
    }

    pub fn get(&self, id: &TicketId) -> Option<&Ticket> {
        self.tickets.iter().find(|ticket| &ticket.id == id)
    }

    fn position(&self, id: &TicketId) -> Option<usize> {
        self.tickets.iter().position(|ticket| &ticket.id == id)
    }

    /// Adds a ticket at its sorted position. Returns false if the id is already present.
    pub fn insert(&mut self, ticket: Ticket) -> bool {
        if self.position(&ticket.id).is_some() {
            return false;
        }
        self.place(ticket);
        true
    }

    /// Replaces the ticket with the same id. Returns false if it is unknown.
    ///
    /// The row keeps its slot unless its `created_at` changed, in which case
    /// it moves to its sorted position.
    pub fn update(&mut self, ticket: Ticket) -> bool {
        let Some(index) = self.position(&ticket.id) else {
            return false;
        };
        if self.tickets[index].created_at == ticket.created_at {
            self.tickets[index] = ticket;
        } else {
            self.tickets.remove(index);
            self.place(ticket);
        }
        true
    }

    fn place(&mut self, ticket: Ticket) {
        let index = self
            .tickets
            .partition_point(|existing| existing.created_at > ticket.created_at);
        self.tickets.insert(index, ticket);
    }

    pub fn remove(&mut self, id: &TicketId) -> bool {
        match self.position(id) {
            Some(index) => {
                self.tickets.remove(index);
                true
            }
            None => false,
        }
    }

    /// Patches the collection with a single notification.
    ///
    /// Returns whether anything changed. A malformed event is rejected before
    /// any mutation happens.
    pub fn apply(&mut self, event: ChangeEvent) -> AppResult<bool> {
        match event.kind {
            ChangeKind::Insert => {
                let ticket = event.record.ok_or_else(|| {
                    AppError::Feed("insert notification without a row".to_string())
                })?;
                Ok(self.insert(ticket))
            }
            ChangeKind::Update => {
                let ticket = event.record.ok_or_else(|| {
                    AppError::Feed("update notification without a row".to_string())
                })?;
                Ok(self.update(ticket))
            }
            ChangeKind::Delete => {
                let id = event
                    .old_id
                    .or_else(|| event.record.map(|ticket| ticket.id))
                    .ok_or_else(|| {
                        AppError::Feed("delete notification without an id".to_string())
                    })?;
                Ok(self.remove(&id))
            }
        }
    }
}

impl<'a> IntoIterator for &'a TicketCollection {
    type Item = &'a Ticket;
    type IntoIter = std::slice::Iter<'a, Ticket>;

    fn into_iter(self) -> Self::IntoIter {
        self.tickets.iter()
    }
}

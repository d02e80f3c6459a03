pub mod change_feed;
pub mod ticket_intake;
pub mod ticket_store;

pub use change_feed::{ChangeFeed, FeedSubscription};
pub use ticket_intake::{CreatedTicket, ServiceHealth, TicketIntake};
pub use ticket_store::TicketStore;

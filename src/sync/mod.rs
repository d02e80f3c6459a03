pub mod controller;

pub use controller::{ReconcilePolicy, SyncHandle, SyncOptions, SyncState, TicketSync};

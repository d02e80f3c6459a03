pub mod change;
pub mod collection;
pub mod ticket;

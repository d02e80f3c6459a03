pub mod intake;
pub mod realtime;
pub mod supabase;

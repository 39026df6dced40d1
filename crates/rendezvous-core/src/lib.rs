//! rendezvous-core: domain types and pure policy for the event-dating
//! notification engine. Normalization, dedup keys, and configuration live
//! here; everything async lives in rendezvous-notify.

pub mod clock;
pub mod config;
pub mod dedup_key;
pub mod normalize;
pub mod source;
pub mod types;

// Event-management core: registration lifecycle, capacity/waitlist
// reconciliation, and the queries backing them. HTTP transport, auth and
// notification delivery are the embedding application's concern.

pub mod config;
pub mod db;
pub mod models;
pub mod services;

// Models module - database entity representations

pub mod event;
pub mod registration;
pub mod user;

pub use event::Event;
pub use registration::{Registration, RegistrationStatus};
pub use user::User;

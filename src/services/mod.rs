// Services module - business logic

pub mod event;
pub mod notification;
pub mod registration;

pub use event::{EventError, EventService};
pub use notification::{NotificationKind, NotificationPayload, NotificationSink, TracingSink};
pub use registration::{RegistrationError, RegistrationService};

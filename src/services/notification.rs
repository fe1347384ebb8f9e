use crate::models::{Event, Registration};

/// Domain events the lifecycle services emit. Delivery (email, Slack, push)
/// lives outside this crate; consumers subscribe by implementing
/// [`NotificationSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    UserRegistered,
    RegistrationConfirmed,
    RegistrationCancelled,
    EventCreated,
    EventUpdated,
    EventPublished,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::UserRegistered => "user.registered",
            NotificationKind::RegistrationConfirmed => "registration.confirmed",
            NotificationKind::RegistrationCancelled => "registration.cancelled",
            NotificationKind::EventCreated => "event.created",
            NotificationKind::EventUpdated => "event.updated",
            NotificationKind::EventPublished => "event.published",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum NotificationPayload<'a> {
    Registration(&'a Registration),
    Event(&'a Event),
}

/// Fire-and-forget notification emission. Services call `emit` synchronously
/// after their transaction commits; implementations may enqueue asynchronous
/// delivery but must not block. The sink is injected into each service
/// constructor, there is no global dispatcher.
pub trait NotificationSink: Send + Sync {
    fn emit(&self, kind: NotificationKind, payload: NotificationPayload<'_>);
}

/// Default sink: logs the emission and drops it. Useful in tests and for
/// deployments without a delivery pipeline.
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn emit(&self, kind: NotificationKind, payload: NotificationPayload<'_>) {
        match payload {
            NotificationPayload::Registration(registration) => {
                tracing::info!(
                    kind = kind.as_str(),
                    registration_id = %registration.id,
                    user_id = %registration.user_id,
                    event_id = %registration.event_id,
                    status = ?registration.status,
                    "notification emitted"
                );
            }
            NotificationPayload::Event(event) => {
                tracing::info!(
                    kind = kind.as_str(),
                    event_id = %event.id,
                    title = %event.title,
                    "notification emitted"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_have_stable_wire_names() {
        assert_eq!(NotificationKind::UserRegistered.as_str(), "user.registered");
        assert_eq!(
            NotificationKind::RegistrationConfirmed.as_str(),
            "registration.confirmed"
        );
        assert_eq!(
            NotificationKind::RegistrationCancelled.as_str(),
            "registration.cancelled"
        );
        assert_eq!(NotificationKind::EventPublished.as_str(), "event.published");
    }
}

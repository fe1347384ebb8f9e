use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::registration::CreateRegistrationData;
use crate::models::{Event, Registration, RegistrationStatus, User};
use crate::services::notification::{NotificationKind, NotificationPayload, NotificationSink};

#[derive(thiserror::Error, Debug)]
pub enum RegistrationError {
    #[error("user already has an active registration for this event")]
    DuplicateRegistration,

    #[error("cannot register for an unpublished event")]
    EventNotPublished,

    #[error("cannot register for an event that has already ended")]
    EventAlreadyEnded,

    #[error("event is at capacity")]
    EventFull,

    #[error("registration has been cancelled")]
    AlreadyCancelled,

    #[error("paid amount must not be negative")]
    InvalidAmount,

    #[error("event not found")]
    EventNotFound,

    #[error("registration not found")]
    RegistrationNotFound,

    #[error("user not found")]
    UserNotFound,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Per-status registration counts for one event, with the capacity view
/// derived from the same snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EventStatistics {
    pub confirmed: i64,
    pub pending: i64,
    pub cancelled: i64,
    pub waitlist: i64,
    pub available_spots: Option<i64>,
    pub is_full: bool,
    pub total_revenue: Decimal,
}

/// Pure registration policy: may this user register for this event?
///
/// `existing` is the user's current registration for the event, if any. A
/// cancelled one does not count against them.
pub fn user_can_register(user: &User, event: &Event, existing: Option<&Registration>) -> bool {
    if existing.is_some_and(|r| !r.is_cancelled()) {
        return false;
    }
    if !event.is_published {
        return false;
    }
    if event.is_past() {
        return false;
    }
    // Organizers do not take seats at their own events.
    if event.organizer_id == user.id {
        return false;
    }
    true
}

/// Pure cancellation policy: only the owner may cancel, only once, and only
/// before the event starts.
pub fn user_can_cancel(user: &User, registration: &Registration, event: &Event) -> bool {
    if registration.user_id != user.id {
        return false;
    }
    if registration.is_cancelled() {
        return false;
    }
    if event.is_ongoing() || event.is_past() {
        return false;
    }
    true
}

/// The only component that creates or mutates registrations. Every operation
/// that reads event capacity before writing runs inside a transaction holding
/// a row lock on the event, so concurrent calls on the same event serialize
/// and can never jointly overshoot `max_participants`.
#[derive(Clone)]
pub struct RegistrationService {
    pool: PgPool,
    notifier: Arc<dyn NotificationSink>,
}

impl RegistrationService {
    pub fn new(pool: PgPool, notifier: Arc<dyn NotificationSink>) -> Self {
        Self { pool, notifier }
    }

    /// Registers a user for an event. Enters Waitlist when the event is full,
    /// Pending otherwise.
    #[tracing::instrument(skip(self))]
    pub async fn register(
        &self,
        user_id: Uuid,
        event_id: Uuid,
    ) -> Result<Registration, RegistrationError> {
        let mut tx = self.pool.begin().await?;

        let event = Event::find_by_id_for_update(&mut *tx, event_id)
            .await?
            .ok_or(RegistrationError::EventNotFound)?;

        if Registration::find_active_by_user_and_event(&mut *tx, user_id, event_id)
            .await?
            .is_some()
        {
            return Err(RegistrationError::DuplicateRegistration);
        }
        if !event.is_published {
            return Err(RegistrationError::EventNotPublished);
        }
        if event.is_past() {
            return Err(RegistrationError::EventAlreadyEnded);
        }

        let confirmed =
            Registration::count_by_event_and_status(&mut *tx, event_id, RegistrationStatus::Confirmed)
                .await?;
        let status = if event.is_full(confirmed) {
            RegistrationStatus::Waitlist
        } else {
            RegistrationStatus::Pending
        };

        let registration = Registration::create(
            &mut *tx,
            CreateRegistrationData {
                user_id,
                event_id,
                status,
            },
        )
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RegistrationError::DuplicateRegistration
            }
            _ => RegistrationError::Database(e),
        })?;

        tx.commit().await?;

        tracing::info!(
            registration_id = %registration.id,
            status = ?registration.status,
            "user registered"
        );
        self.notifier.emit(
            NotificationKind::UserRegistered,
            NotificationPayload::Registration(&registration),
        );

        Ok(registration)
    }

    /// Confirms a registration. Idempotent: confirming a Confirmed
    /// registration returns it unchanged.
    ///
    /// Confirmation is allowed from both Pending and Waitlist, but never while
    /// the event is full; the capacity invariant takes precedence over any
    /// shortcut off the waitlist.
    #[tracing::instrument(skip(self))]
    pub async fn confirm(&self, registration_id: Uuid) -> Result<Registration, RegistrationError> {
        let mut tx = self.pool.begin().await?;

        let registration = Registration::find_by_id(&mut *tx, registration_id)
            .await?
            .ok_or(RegistrationError::RegistrationNotFound)?;

        if registration.is_confirmed() {
            return Ok(registration);
        }

        let event = Event::find_by_id_for_update(&mut *tx, registration.event_id)
            .await?
            .ok_or(RegistrationError::EventNotFound)?;

        // The registration may have moved while we waited for the event lock.
        let mut registration = Registration::find_by_id(&mut *tx, registration_id)
            .await?
            .ok_or(RegistrationError::RegistrationNotFound)?;
        if registration.is_confirmed() {
            return Ok(registration);
        }
        if registration.is_cancelled() {
            return Err(RegistrationError::AlreadyCancelled);
        }

        let confirmed = Registration::count_by_event_and_status(
            &mut *tx,
            event.id,
            RegistrationStatus::Confirmed,
        )
        .await?;
        if event.is_full(confirmed) {
            return Err(RegistrationError::EventFull);
        }

        registration.confirm();
        registration.save_status(&mut *tx).await?;
        tx.commit().await?;

        tracing::info!(registration_id = %registration.id, "registration confirmed");
        self.notifier.emit(
            NotificationKind::RegistrationConfirmed,
            NotificationPayload::Registration(&registration),
        );

        Ok(registration)
    }

    /// Cancels a registration. Idempotent. When a confirmed seat is freed,
    /// waitlist promotion runs inside the same transaction so a concurrent
    /// register cannot race the freed slot.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, registration_id: Uuid) -> Result<Registration, RegistrationError> {
        let mut tx = self.pool.begin().await?;

        let registration = Registration::find_by_id(&mut *tx, registration_id)
            .await?
            .ok_or(RegistrationError::RegistrationNotFound)?;

        if registration.is_cancelled() {
            return Ok(registration);
        }

        let event = Event::find_by_id_for_update(&mut *tx, registration.event_id)
            .await?
            .ok_or(RegistrationError::EventNotFound)?;

        // The registration may have moved while we waited for the event lock.
        let mut registration = Registration::find_by_id(&mut *tx, registration_id)
            .await?
            .ok_or(RegistrationError::RegistrationNotFound)?;
        if registration.is_cancelled() {
            return Ok(registration);
        }

        let was_confirmed = registration.is_confirmed();
        registration.cancel();
        registration.save_status(&mut *tx).await?;

        let promoted = if was_confirmed {
            Self::promote_within(&mut tx, &event).await?
        } else {
            None
        };

        tx.commit().await?;

        tracing::info!(
            registration_id = %registration.id,
            was_confirmed,
            promoted = promoted.as_ref().map(|p| p.id).map(tracing::field::display),
            "registration cancelled"
        );
        self.notifier.emit(
            NotificationKind::RegistrationCancelled,
            NotificationPayload::Registration(&registration),
        );
        if let Some(promoted) = &promoted {
            self.notifier.emit(
                NotificationKind::UserRegistered,
                NotificationPayload::Registration(promoted),
            );
        }

        Ok(registration)
    }

    /// Promotes the earliest-registered waitlisted registration into Pending
    /// if the event has a free seat. Returns None when the event is full or
    /// the waitlist is empty.
    #[tracing::instrument(skip(self))]
    pub async fn promote_from_waitlist(
        &self,
        event_id: Uuid,
    ) -> Result<Option<Registration>, RegistrationError> {
        let mut tx = self.pool.begin().await?;

        let event = Event::find_by_id_for_update(&mut *tx, event_id)
            .await?
            .ok_or(RegistrationError::EventNotFound)?;

        let promoted = Self::promote_within(&mut tx, &event).await?;
        tx.commit().await?;

        if let Some(promoted) = &promoted {
            tracing::info!(registration_id = %promoted.id, "promoted from waitlist");
            self.notifier.emit(
                NotificationKind::UserRegistered,
                NotificationPayload::Registration(promoted),
            );
        }

        Ok(promoted)
    }

    /// Promotion step shared by `cancel` and `promote_from_waitlist`. The
    /// caller must hold the event row lock in `tx`.
    async fn promote_within(
        tx: &mut Transaction<'_, Postgres>,
        event: &Event,
    ) -> Result<Option<Registration>, RegistrationError> {
        let confirmed = Registration::count_by_event_and_status(
            &mut **tx,
            event.id,
            RegistrationStatus::Confirmed,
        )
        .await?;
        if event.is_full(confirmed) {
            return Ok(None);
        }

        let Some(mut next) = Registration::next_on_waitlist(&mut **tx, event.id).await? else {
            return Ok(None);
        };

        next.promote();
        next.save_status(&mut **tx).await?;

        Ok(Some(next))
    }

    /// Records a payment against a registration. No state-machine transition.
    pub async fn mark_as_paid(
        &self,
        registration_id: Uuid,
        amount: Decimal,
    ) -> Result<Registration, RegistrationError> {
        if amount < Decimal::ZERO {
            return Err(RegistrationError::InvalidAmount);
        }

        let mut registration = Registration::find_by_id(&self.pool, registration_id)
            .await?
            .ok_or(RegistrationError::RegistrationNotFound)?;

        registration.mark_paid(amount);
        registration.save_payment(&self.pool).await?;

        tracing::info!(registration_id = %registration.id, %amount, "registration marked paid");
        Ok(registration)
    }

    pub async fn regenerate_ticket_code(
        &self,
        registration_id: Uuid,
    ) -> Result<Registration, RegistrationError> {
        let mut registration = Registration::find_by_id(&self.pool, registration_id)
            .await?
            .ok_or(RegistrationError::RegistrationNotFound)?;

        registration.regenerate_ticket_code();
        registration.save_ticket_code(&self.pool).await?;

        Ok(registration)
    }

    /// Reassigns a registration to another user, keeping its place in the
    /// lifecycle. The new user must not already hold an active registration.
    #[tracing::instrument(skip(self))]
    pub async fn transfer(
        &self,
        registration_id: Uuid,
        new_user_id: Uuid,
    ) -> Result<Registration, RegistrationError> {
        let mut tx = self.pool.begin().await?;

        let mut registration = Registration::find_by_id(&mut *tx, registration_id)
            .await?
            .ok_or(RegistrationError::RegistrationNotFound)?;

        if Registration::find_active_by_user_and_event(&mut *tx, new_user_id, registration.event_id)
            .await?
            .is_some()
        {
            return Err(RegistrationError::DuplicateRegistration);
        }

        registration.transfer_to(new_user_id);
        // A transfer racing past the duplicate check lands on the partial
        // unique index, same as register.
        registration.save_owner(&mut *tx).await.map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RegistrationError::DuplicateRegistration
            }
            _ => RegistrationError::Database(e),
        })?;
        tx.commit().await?;

        tracing::info!(registration_id = %registration.id, new_user_id = %new_user_id, "registration transferred");
        Ok(registration)
    }

    /// Cancels Pending registrations that have sat unconfirmed for more than
    /// `days` days. Returns how many were cancelled.
    pub async fn cleanup_old_pending(&self, days: i64) -> Result<u64, RegistrationError> {
        let cutoff = Utc::now() - Duration::days(days);
        let cancelled = Registration::cancel_stale_pending(&self.pool, cutoff).await?;

        if cancelled > 0 {
            tracing::info!(cancelled, days, "stale pending registrations cancelled");
        }
        Ok(cancelled)
    }

    // ------------------------------------------------------------------
    // Read queries
    // ------------------------------------------------------------------

    pub async fn registrations_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<Registration>, RegistrationError> {
        Ok(Registration::list_by_user(&self.pool, user_id).await?)
    }

    pub async fn upcoming_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<Registration>, RegistrationError> {
        Ok(Registration::list_upcoming_confirmed_by_user(&self.pool, user_id).await?)
    }

    pub async fn confirmed_for_event(
        &self,
        event_id: Uuid,
    ) -> Result<Vec<Registration>, RegistrationError> {
        Ok(Registration::list_confirmed_by_event(&self.pool, event_id).await?)
    }

    pub async fn waitlist_for_event(
        &self,
        event_id: Uuid,
    ) -> Result<Vec<Registration>, RegistrationError> {
        Ok(Registration::list_waitlist_by_event(&self.pool, event_id).await?)
    }

    pub async fn find_by_ticket_code(
        &self,
        ticket_code: &str,
    ) -> Result<Option<Registration>, RegistrationError> {
        Ok(Registration::find_by_ticket_code(&self.pool, ticket_code).await?)
    }

    pub async fn statistics_for_event(
        &self,
        event_id: Uuid,
    ) -> Result<EventStatistics, RegistrationError> {
        let event = Event::find_by_id(&self.pool, event_id)
            .await?
            .ok_or(RegistrationError::EventNotFound)?;

        let confirmed =
            Registration::count_by_event_and_status(&self.pool, event_id, RegistrationStatus::Confirmed)
                .await?;
        let pending =
            Registration::count_by_event_and_status(&self.pool, event_id, RegistrationStatus::Pending)
                .await?;
        let cancelled =
            Registration::count_by_event_and_status(&self.pool, event_id, RegistrationStatus::Cancelled)
                .await?;
        let waitlist =
            Registration::count_by_event_and_status(&self.pool, event_id, RegistrationStatus::Waitlist)
                .await?;
        let total_revenue = Registration::revenue_for_event(&self.pool, event_id).await?;

        Ok(EventStatistics {
            confirmed,
            pending,
            cancelled,
            waitlist,
            available_spots: event.available_spots(confirmed),
            is_full: event.is_full(confirmed),
            total_revenue,
        })
    }

    // ------------------------------------------------------------------
    // Policy predicates. These answer "would this be allowed", they do not
    // enforce anything; enforcement belongs to the caller.
    // ------------------------------------------------------------------

    pub async fn can_user_register(
        &self,
        user_id: Uuid,
        event_id: Uuid,
    ) -> Result<bool, RegistrationError> {
        let user = User::find_by_id(&self.pool, user_id)
            .await?
            .ok_or(RegistrationError::UserNotFound)?;
        let event = Event::find_by_id(&self.pool, event_id)
            .await?
            .ok_or(RegistrationError::EventNotFound)?;
        let existing =
            Registration::find_active_by_user_and_event(&self.pool, user_id, event_id).await?;

        Ok(user_can_register(&user, &event, existing.as_ref()))
    }

    pub async fn can_user_cancel(
        &self,
        user_id: Uuid,
        registration_id: Uuid,
    ) -> Result<bool, RegistrationError> {
        let user = User::find_by_id(&self.pool, user_id)
            .await?
            .ok_or(RegistrationError::UserNotFound)?;
        let registration = Registration::find_by_id(&self.pool, registration_id)
            .await?
            .ok_or(RegistrationError::RegistrationNotFound)?;
        let event = Event::find_by_id(&self.pool, registration.event_id)
            .await?
            .ok_or(RegistrationError::EventNotFound)?;

        Ok(user_can_cancel(&user, &registration, &event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn user() -> User {
        User {
            id: Uuid::new_v4(),
            email: format!("{}@example.com", Uuid::new_v4().simple()),
            display_name: "Test user".to_string(),
            created_at: Utc::now(),
        }
    }

    fn published_event(organizer_id: Uuid) -> Event {
        let now = Utc::now();
        Event {
            id: Uuid::new_v4(),
            organizer_id,
            title: "Rust meetup".to_string(),
            description: "Monthly meetup of the local Rust group".to_string(),
            location: "Community hall".to_string(),
            start_date: now + Duration::days(7),
            end_date: now + Duration::days(7) + Duration::hours(2),
            max_participants: Some(10),
            price: None,
            image_url: None,
            tags: serde_json::Value::from(Vec::<String>::new()),
            is_published: true,
            created_at: now,
            updated_at: None,
        }
    }

    fn registration_for(user: &User, event: &Event, status: RegistrationStatus) -> Registration {
        let mut r = Registration {
            id: Uuid::new_v4(),
            seq: 1,
            user_id: user.id,
            event_id: event.id,
            status: RegistrationStatus::Pending,
            registered_at: Utc::now(),
            confirmed_at: None,
            cancelled_at: None,
            ticket_code: "A1B2C3D4E5F6".to_string(),
            notes: None,
            paid_amount: None,
            paid_at: None,
        };
        match status {
            RegistrationStatus::Pending => {}
            RegistrationStatus::Confirmed => r.confirm(),
            RegistrationStatus::Cancelled => r.cancel(),
            RegistrationStatus::Waitlist => r.status = RegistrationStatus::Waitlist,
        }
        r
    }

    #[test]
    fn register_policy_allows_the_plain_case() {
        let organizer = user();
        let attendee = user();
        let event = published_event(organizer.id);

        assert!(user_can_register(&attendee, &event, None));
    }

    #[test]
    fn register_policy_rejects_active_duplicate() {
        let organizer = user();
        let attendee = user();
        let event = published_event(organizer.id);
        let existing = registration_for(&attendee, &event, RegistrationStatus::Pending);

        assert!(!user_can_register(&attendee, &event, Some(&existing)));
    }

    #[test]
    fn register_policy_ignores_cancelled_registration() {
        let organizer = user();
        let attendee = user();
        let event = published_event(organizer.id);
        let cancelled = registration_for(&attendee, &event, RegistrationStatus::Cancelled);

        assert!(user_can_register(&attendee, &event, Some(&cancelled)));
    }

    #[test]
    fn register_policy_rejects_unpublished_event() {
        let organizer = user();
        let attendee = user();
        let mut event = published_event(organizer.id);
        event.is_published = false;

        assert!(!user_can_register(&attendee, &event, None));
    }

    #[test]
    fn register_policy_rejects_ended_event() {
        let organizer = user();
        let attendee = user();
        let mut event = published_event(organizer.id);
        let now = Utc::now();
        event.start_date = now - Duration::days(2);
        event.end_date = now - Duration::days(1);

        assert!(!user_can_register(&attendee, &event, None));
    }

    #[test]
    fn register_policy_rejects_the_organizer_regardless_of_capacity() {
        let organizer = user();
        let mut event = published_event(organizer.id);
        event.max_participants = None;

        assert!(!user_can_register(&organizer, &event, None));
    }

    #[test]
    fn cancel_policy_requires_ownership() {
        let organizer = user();
        let owner = user();
        let stranger = user();
        let event = published_event(organizer.id);
        let registration = registration_for(&owner, &event, RegistrationStatus::Confirmed);

        assert!(user_can_cancel(&owner, &registration, &event));
        assert!(!user_can_cancel(&stranger, &registration, &event));
    }

    #[test]
    fn cancel_policy_rejects_already_cancelled() {
        let organizer = user();
        let owner = user();
        let event = published_event(organizer.id);
        let registration = registration_for(&owner, &event, RegistrationStatus::Cancelled);

        assert!(!user_can_cancel(&owner, &registration, &event));
    }

    #[test]
    fn cancel_policy_rejects_started_or_finished_events() {
        let organizer = user();
        let owner = user();
        let mut event = published_event(organizer.id);
        let registration = registration_for(&owner, &event, RegistrationStatus::Confirmed);
        let now = Utc::now();

        event.start_date = now - Duration::hours(1);
        event.end_date = now + Duration::hours(1);
        assert!(!user_can_cancel(&owner, &registration, &event));

        event.start_date = now - Duration::days(2);
        event.end_date = now - Duration::days(1);
        assert!(!user_can_cancel(&owner, &registration, &event));
    }
}

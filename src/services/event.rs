use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::event::CreateEventData;
use crate::models::{Event, Registration, RegistrationStatus, User};
use crate::services::notification::{NotificationKind, NotificationPayload, NotificationSink};

#[derive(thiserror::Error, Debug)]
pub enum EventError {
    #[error("event not found")]
    NotFound,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Partial update. An outer `None` leaves the field unchanged; for the
/// nullable columns the inner `None` clears the value, so e.g.
/// `max_participants: Some(None)` returns an event to unbounded capacity.
#[derive(Debug, Clone, Default)]
pub struct UpdateEventData {
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub max_participants: Option<Option<i32>>,
    pub price: Option<Option<Decimal>>,
    pub image_url: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
}

impl UpdateEventData {
    fn apply_to(self, event: &mut Event) {
        if let Some(title) = self.title {
            event.title = title;
        }
        if let Some(description) = self.description {
            event.description = description;
        }
        if let Some(location) = self.location {
            event.location = location;
        }
        if let Some(start_date) = self.start_date {
            event.start_date = start_date;
        }
        if let Some(end_date) = self.end_date {
            event.end_date = end_date;
        }
        if let Some(max_participants) = self.max_participants {
            event.max_participants = max_participants;
        }
        if let Some(price) = self.price {
            event.price = price;
        }
        if let Some(image_url) = self.image_url {
            event.image_url = image_url;
        }
        if let Some(tags) = self.tags {
            event.tags = serde_json::Value::from(tags);
        }
    }
}

fn validate_event(
    title: &str,
    description: &str,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    max_participants: Option<i32>,
    price: Option<Decimal>,
) -> Result<(), EventError> {
    if title.trim().len() < 3 {
        return Err(EventError::Validation(
            "title must be at least 3 characters".to_string(),
        ));
    }
    if description.trim().len() < 10 {
        return Err(EventError::Validation(
            "description must be at least 10 characters".to_string(),
        ));
    }
    if end_date <= start_date {
        return Err(EventError::Validation(
            "end date must be after start date".to_string(),
        ));
    }
    if max_participants.is_some_and(|max| max <= 0) {
        return Err(EventError::Validation(
            "max participants must be positive".to_string(),
        ));
    }
    if price.is_some_and(|p| p < Decimal::ZERO) {
        return Err(EventError::Validation(
            "price must not be negative".to_string(),
        ));
    }
    Ok(())
}

/// Organizer-side event management. Registration state is out of bounds here
/// except for the cascade cancellation when an event is deleted.
#[derive(Clone)]
pub struct EventService {
    pool: PgPool,
    notifier: Arc<dyn NotificationSink>,
}

impl EventService {
    pub fn new(pool: PgPool, notifier: Arc<dyn NotificationSink>) -> Self {
        Self { pool, notifier }
    }

    /// Creates an event in the unpublished state.
    #[tracing::instrument(skip(self, data), fields(organizer_id = %data.organizer_id))]
    pub async fn create(&self, data: CreateEventData) -> Result<Event, EventError> {
        validate_event(
            &data.title,
            &data.description,
            data.start_date,
            data.end_date,
            data.max_participants,
            data.price,
        )?;

        let event = Event::create(&self.pool, data).await?;

        tracing::info!(event_id = %event.id, title = %event.title, "event created");
        self.notifier.emit(
            NotificationKind::EventCreated,
            NotificationPayload::Event(&event),
        );

        Ok(event)
    }

    /// Applies a partial update. Omitted fields keep their current values.
    pub async fn update(&self, event_id: Uuid, data: UpdateEventData) -> Result<Event, EventError> {
        let mut event = Event::find_by_id(&self.pool, event_id)
            .await?
            .ok_or(EventError::NotFound)?;

        data.apply_to(&mut event);

        validate_event(
            &event.title,
            &event.description,
            event.start_date,
            event.end_date,
            event.max_participants,
            event.price,
        )?;

        event.updated_at = Some(Utc::now());
        event.save(&self.pool).await?;

        self.notifier.emit(
            NotificationKind::EventUpdated,
            NotificationPayload::Event(&event),
        );

        Ok(event)
    }

    /// Publishes an event. Idempotent; the notification fires only on the
    /// unpublished-to-published edge.
    #[tracing::instrument(skip(self))]
    pub async fn publish(&self, event_id: Uuid) -> Result<Event, EventError> {
        let mut event = Event::find_by_id(&self.pool, event_id)
            .await?
            .ok_or(EventError::NotFound)?;

        if !event.is_published {
            event.is_published = true;
            event.updated_at = Some(Utc::now());
            event.save(&self.pool).await?;

            tracing::info!(event_id = %event.id, "event published");
            self.notifier.emit(
                NotificationKind::EventPublished,
                NotificationPayload::Event(&event),
            );
        }

        Ok(event)
    }

    pub async fn unpublish(&self, event_id: Uuid) -> Result<Event, EventError> {
        let mut event = Event::find_by_id(&self.pool, event_id)
            .await?
            .ok_or(EventError::NotFound)?;

        if event.is_published {
            event.is_published = false;
            event.updated_at = Some(Utc::now());
            event.save(&self.pool).await?;
        }

        Ok(event)
    }

    /// Deletes an event. All of its registrations are cancelled first, in the
    /// same transaction, so downstream consumers observe the cancellations
    /// before the rows disappear.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, event_id: Uuid) -> Result<(), EventError> {
        let mut tx = self.pool.begin().await?;

        let event = Event::find_by_id_for_update(&mut *tx, event_id)
            .await?
            .ok_or(EventError::NotFound)?;

        let cancelled = Registration::cancel_all_for_event(&mut *tx, event.id).await?;
        Event::delete(&mut *tx, event.id).await?;

        tx.commit().await?;

        tracing::info!(event_id = %event.id, cancelled, "event deleted");
        Ok(())
    }

    /// Copies an event for a new occurrence. The copy starts unpublished and
    /// carries no registrations.
    pub async fn duplicate(
        &self,
        event_id: Uuid,
        organizer_id: Uuid,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> Result<Event, EventError> {
        let original = Event::find_by_id(&self.pool, event_id)
            .await?
            .ok_or(EventError::NotFound)?;

        let tags: Vec<String> = serde_json::from_value(original.tags).unwrap_or_default();

        self.create(CreateEventData {
            organizer_id,
            title: format!("{} (copy)", original.title),
            description: original.description,
            location: original.location,
            start_date,
            end_date,
            max_participants: original.max_participants,
            price: original.price,
            image_url: original.image_url,
            tags,
        })
        .await
    }

    pub async fn upcoming_published(&self, limit: Option<i64>) -> Result<Vec<Event>, EventError> {
        Ok(Event::list_upcoming_published(&self.pool, limit).await?)
    }

    pub async fn by_organizer(&self, organizer_id: Uuid) -> Result<Vec<Event>, EventError> {
        Ok(Event::list_by_organizer(&self.pool, organizer_id).await?)
    }

    pub async fn free_events(&self) -> Result<Vec<Event>, EventError> {
        Ok(Event::list_free(&self.pool).await?)
    }

    pub async fn search(&self, term: &str) -> Result<Vec<Event>, EventError> {
        Ok(Event::search(&self.pool, term).await?)
    }

    /// Whether an event may still be deleted: not in the past and without
    /// confirmed registrations.
    pub async fn can_be_deleted(&self, event_id: Uuid) -> Result<bool, EventError> {
        let event = Event::find_by_id(&self.pool, event_id)
            .await?
            .ok_or(EventError::NotFound)?;

        if event.is_past() {
            return Ok(false);
        }

        let confirmed = Registration::count_by_event_and_status(
            &self.pool,
            event.id,
            RegistrationStatus::Confirmed,
        )
        .await?;

        Ok(confirmed == 0)
    }
}

/// Pure edit policy: only the organizer may modify an event.
pub fn user_can_edit(user: &User, event: &Event) -> bool {
    event.organizer_id == user.id
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn valid_args() -> (String, String, DateTime<Utc>, DateTime<Utc>) {
        let now = Utc::now();
        (
            "Rust meetup".to_string(),
            "Monthly meetup of the local Rust group".to_string(),
            now + Duration::days(7),
            now + Duration::days(7) + Duration::hours(2),
        )
    }

    #[test]
    fn accepts_well_formed_event_data() {
        let (title, description, start, end) = valid_args();
        assert!(validate_event(&title, &description, start, end, Some(50), None).is_ok());
    }

    #[test]
    fn rejects_short_title() {
        let (_, description, start, end) = valid_args();
        let err = validate_event("ab", &description, start, end, None, None).unwrap_err();
        assert!(matches!(err, EventError::Validation(_)));
    }

    #[test]
    fn rejects_short_description() {
        let (title, _, start, end) = valid_args();
        let err = validate_event(&title, "too short", start, end, None, None).unwrap_err();
        assert!(matches!(err, EventError::Validation(_)));
    }

    #[test]
    fn rejects_inverted_date_range() {
        let (title, description, start, end) = valid_args();
        let err = validate_event(&title, &description, end, start, None, None).unwrap_err();
        assert!(matches!(err, EventError::Validation(_)));
    }

    fn stored_event() -> Event {
        let (title, description, start, end) = valid_args();
        Event {
            id: Uuid::new_v4(),
            organizer_id: Uuid::new_v4(),
            title,
            description,
            location: "Community hall".to_string(),
            start_date: start,
            end_date: end,
            max_participants: Some(50),
            price: Some(Decimal::new(2500, 2)),
            image_url: Some("https://example.com/banner.png".to_string()),
            tags: serde_json::Value::from(vec!["rust".to_string()]),
            is_published: true,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn update_leaves_omitted_fields_untouched() {
        let mut event = stored_event();
        let before = event.clone();

        UpdateEventData {
            location: Some("Town library".to_string()),
            ..Default::default()
        }
        .apply_to(&mut event);

        assert_eq!(event.location, "Town library");
        assert_eq!(event.title, before.title);
        assert_eq!(event.max_participants, before.max_participants);
        assert_eq!(event.price, before.price);
        assert_eq!(event.image_url, before.image_url);
    }

    #[test]
    fn update_can_clear_nullable_fields() {
        let mut event = stored_event();

        UpdateEventData {
            max_participants: Some(None),
            price: Some(None),
            image_url: Some(None),
            ..Default::default()
        }
        .apply_to(&mut event);

        // Back to an unbounded free event with no banner.
        assert_eq!(event.max_participants, None);
        assert!(!event.is_full(1_000));
        assert_eq!(event.price, None);
        assert!(event.is_free());
        assert_eq!(event.image_url, None);
    }

    #[test]
    fn rejects_non_positive_capacity_and_negative_price() {
        let (title, description, start, end) = valid_args();
        assert!(validate_event(&title, &description, start, end, Some(0), None).is_err());
        assert!(validate_event(
            &title,
            &description,
            start,
            end,
            None,
            Some(Decimal::new(-100, 2))
        )
        .is_err());
    }
}

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgExecutor};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Event {
    pub id: Uuid,
    pub organizer_id: Uuid,
    pub title: String,
    pub description: String,
    pub location: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// None means unbounded capacity.
    pub max_participants: Option<i32>,
    pub price: Option<Decimal>,
    pub image_url: Option<String>,
    pub tags: serde_json::Value,
    pub is_published: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CreateEventData {
    pub organizer_id: Uuid,
    pub title: String,
    pub description: String,
    pub location: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub max_participants: Option<i32>,
    pub price: Option<Decimal>,
    pub image_url: Option<String>,
    pub tags: Vec<String>,
}

impl Event {
    pub async fn create(
        exec: impl PgExecutor<'_>,
        data: CreateEventData,
    ) -> Result<Self, sqlx::Error> {
        let event = sqlx::query_as::<_, Event>(
            r#"
            INSERT INTO events (organizer_id, title, description, location, start_date,
                                end_date, max_participants, price, image_url, tags)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(data.organizer_id)
        .bind(data.title)
        .bind(data.description)
        .bind(data.location)
        .bind(data.start_date)
        .bind(data.end_date)
        .bind(data.max_participants)
        .bind(data.price)
        .bind(data.image_url)
        .bind(serde_json::Value::from(data.tags))
        .fetch_one(exec)
        .await?;

        Ok(event)
    }

    pub async fn find_by_id(
        exec: impl PgExecutor<'_>,
        id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        let event = sqlx::query_as::<_, Event>(
            r#"
            SELECT * FROM events WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(exec)
        .await?;

        Ok(event)
    }

    /// Loads the event row under a row-level lock. Every capacity
    /// read-then-write sequence starts here so that concurrent lifecycle
    /// operations on the same event are serialized.
    pub async fn find_by_id_for_update(
        exec: impl PgExecutor<'_>,
        id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        let event = sqlx::query_as::<_, Event>(
            r#"
            SELECT * FROM events WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(exec)
        .await?;

        Ok(event)
    }

    /// Published events that have not started yet, soonest first.
    pub async fn list_upcoming_published(
        exec: impl PgExecutor<'_>,
        limit: Option<i64>,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let events = sqlx::query_as::<_, Event>(
            r#"
            SELECT * FROM events
            WHERE is_published = TRUE AND start_date > NOW()
            ORDER BY start_date ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(exec)
        .await?;

        Ok(events)
    }

    pub async fn list_by_organizer(
        exec: impl PgExecutor<'_>,
        organizer_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let events = sqlx::query_as::<_, Event>(
            r#"
            SELECT * FROM events
            WHERE organizer_id = $1
            ORDER BY start_date DESC
            "#,
        )
        .bind(organizer_id)
        .fetch_all(exec)
        .await?;

        Ok(events)
    }

    /// Upcoming published events with no price (or an explicit zero price).
    pub async fn list_free(exec: impl PgExecutor<'_>) -> Result<Vec<Self>, sqlx::Error> {
        let events = sqlx::query_as::<_, Event>(
            r#"
            SELECT * FROM events
            WHERE is_published = TRUE
              AND start_date > NOW()
              AND (price IS NULL OR price = 0)
            ORDER BY start_date ASC
            "#,
        )
        .fetch_all(exec)
        .await?;

        Ok(events)
    }

    /// Case-insensitive title/description search over published events.
    pub async fn search(
        exec: impl PgExecutor<'_>,
        term: &str,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let pattern = format!("%{}%", term);
        let events = sqlx::query_as::<_, Event>(
            r#"
            SELECT * FROM events
            WHERE is_published = TRUE
              AND (title ILIKE $1 OR description ILIKE $1)
            ORDER BY start_date ASC
            "#,
        )
        .bind(pattern)
        .fetch_all(exec)
        .await?;

        Ok(events)
    }

    /// Persists every mutable column of the row.
    pub async fn save(&self, exec: impl PgExecutor<'_>) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE events
            SET title = $2,
                description = $3,
                location = $4,
                start_date = $5,
                end_date = $6,
                max_participants = $7,
                price = $8,
                image_url = $9,
                tags = $10,
                is_published = $11,
                updated_at = $12
            WHERE id = $1
            "#,
        )
        .bind(self.id)
        .bind(&self.title)
        .bind(&self.description)
        .bind(&self.location)
        .bind(self.start_date)
        .bind(self.end_date)
        .bind(self.max_participants)
        .bind(self.price)
        .bind(&self.image_url)
        .bind(&self.tags)
        .bind(self.is_published)
        .bind(self.updated_at)
        .execute(exec)
        .await?;

        Ok(())
    }

    pub async fn delete(exec: impl PgExecutor<'_>, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            DELETE FROM events WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(exec)
        .await?;

        Ok(())
    }

    /// Remaining capacity given a live confirmed count. None when unbounded.
    ///
    /// The confirmed count must come from a query against committed state (see
    /// `Registration::count_by_event_and_status`), never from a cached
    /// collection.
    pub fn available_spots(&self, confirmed_count: i64) -> Option<i64> {
        self.max_participants
            .map(|max| i64::from(max) - confirmed_count)
    }

    /// An unbounded event is never full.
    pub fn is_full(&self, confirmed_count: i64) -> bool {
        match self.max_participants {
            None => false,
            Some(max) => confirmed_count >= i64::from(max),
        }
    }

    pub fn is_past(&self) -> bool {
        self.end_date < Utc::now()
    }

    pub fn is_upcoming(&self) -> bool {
        self.start_date > Utc::now()
    }

    pub fn is_ongoing(&self) -> bool {
        let now = Utc::now();
        self.start_date <= now && self.end_date >= now
    }

    pub fn is_free(&self) -> bool {
        match self.price {
            None => true,
            Some(price) => price == Decimal::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn event(max_participants: Option<i32>) -> Event {
        let now = Utc::now();
        Event {
            id: Uuid::new_v4(),
            organizer_id: Uuid::new_v4(),
            title: "Rust meetup".to_string(),
            description: "Monthly meetup of the local Rust group".to_string(),
            location: "Community hall".to_string(),
            start_date: now + Duration::days(7),
            end_date: now + Duration::days(7) + Duration::hours(2),
            max_participants,
            price: None,
            image_url: None,
            tags: serde_json::Value::from(Vec::<String>::new()),
            is_published: true,
            created_at: now,
            updated_at: None,
        }
    }

    #[test]
    fn bounded_capacity_math() {
        let e = event(Some(10));
        assert_eq!(e.available_spots(3), Some(7));
        assert!(!e.is_full(9));
        assert!(e.is_full(10));
        // An overshoot still reads as full rather than wrapping.
        assert!(e.is_full(11));
        assert_eq!(e.available_spots(11), Some(-1));
    }

    #[test]
    fn unbounded_event_is_never_full() {
        let e = event(None);
        assert_eq!(e.available_spots(1_000_000), None);
        assert!(!e.is_full(1_000_000));
    }

    #[test]
    fn time_window_predicates() {
        let now = Utc::now();

        let mut e = event(None);
        assert!(e.is_upcoming());
        assert!(!e.is_past());
        assert!(!e.is_ongoing());

        e.start_date = now - Duration::hours(1);
        e.end_date = now + Duration::hours(1);
        assert!(e.is_ongoing());
        assert!(!e.is_past());

        e.start_date = now - Duration::days(2);
        e.end_date = now - Duration::days(1);
        assert!(e.is_past());
        assert!(!e.is_ongoing());
    }

    #[test]
    fn free_when_price_absent_or_zero() {
        let mut e = event(None);
        assert!(e.is_free());

        e.price = Some(Decimal::ZERO);
        assert!(e.is_free());

        e.price = Some(Decimal::new(1500, 2));
        assert!(!e.is_free());
    }
}

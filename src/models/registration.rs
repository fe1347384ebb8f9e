use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArgumentBuffer, PgTypeInfo, PgValueRef};
use sqlx::{FromRow, PgExecutor, Postgres};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Waitlist,
}

impl RegistrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationStatus::Pending => "pending",
            RegistrationStatus::Confirmed => "confirmed",
            RegistrationStatus::Cancelled => "cancelled",
            RegistrationStatus::Waitlist => "waitlist",
        }
    }
}

impl std::str::FromStr for RegistrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RegistrationStatus::Pending),
            "confirmed" => Ok(RegistrationStatus::Confirmed),
            "cancelled" => Ok(RegistrationStatus::Cancelled),
            "waitlist" => Ok(RegistrationStatus::Waitlist),
            other => Err(format!("unknown registration status: {other}")),
        }
    }
}

// The status column is plain TEXT (with a CHECK constraint), not a Postgres
// enum type, so encode/decode delegate to the builtin string mapping.
impl sqlx::Type<Postgres> for RegistrationStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <&str as sqlx::Type<Postgres>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, Postgres> for RegistrationStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> IsNull {
        <&str as sqlx::Encode<'q, Postgres>>::encode(self.as_str(), buf)
    }
}

impl<'r> sqlx::Decode<'r, Postgres> for RegistrationStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<'r, Postgres>>::decode(value)?;
        s.parse().map_err(Into::into)
    }
}

/// One user's claim on a seat at one event.
///
/// Rows are only ever created and mutated through
/// `services::registration::RegistrationService`; everything else reads.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Registration {
    pub id: Uuid,
    /// Insertion order, assigned by the database. Tiebreaker for waitlist
    /// promotion when two rows share a registered_at timestamp.
    pub seq: i64,
    pub user_id: Uuid,
    pub event_id: Uuid,
    pub status: RegistrationStatus,
    pub registered_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub ticket_code: String,
    pub notes: Option<String>,
    pub paid_amount: Option<Decimal>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CreateRegistrationData {
    pub user_id: Uuid,
    pub event_id: Uuid,
    pub status: RegistrationStatus,
}

/// 12 uppercase hex characters (48 random bits), unique per ticket.
fn generate_ticket_code() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    hex[..12].to_uppercase()
}

impl Registration {
    // ------------------------------------------------------------------
    // In-memory state transitions. No error conditions at this layer;
    // invalid transitions are rejected by the lifecycle service.
    // ------------------------------------------------------------------

    /// Moves to Confirmed. confirmed_at is stamped on the first transition in
    /// and never overwritten.
    pub fn confirm(&mut self) {
        self.status = RegistrationStatus::Confirmed;
        if self.confirmed_at.is_none() {
            self.confirmed_at = Some(Utc::now());
        }
    }

    /// Moves to Cancelled. cancelled_at is stamped on the first transition in
    /// and never overwritten.
    pub fn cancel(&mut self) {
        self.status = RegistrationStatus::Cancelled;
        if self.cancelled_at.is_none() {
            self.cancelled_at = Some(Utc::now());
        }
    }

    /// Moves a waitlisted registration back into Pending. The promoted user
    /// still has to confirm explicitly, mirroring the normal flow.
    pub fn promote(&mut self) {
        self.status = RegistrationStatus::Pending;
    }

    pub fn mark_paid(&mut self, amount: Decimal) {
        self.paid_amount = Some(amount);
        self.paid_at = Some(Utc::now());
    }

    pub fn regenerate_ticket_code(&mut self) {
        self.ticket_code = generate_ticket_code();
    }

    /// Reassigns the seat to another user. The old ticket code is invalidated.
    pub fn transfer_to(&mut self, user_id: Uuid) {
        self.user_id = user_id;
        self.regenerate_ticket_code();
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == RegistrationStatus::Confirmed
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == RegistrationStatus::Cancelled
    }

    pub fn is_pending(&self) -> bool {
        self.status == RegistrationStatus::Pending
    }

    pub fn is_on_waitlist(&self) -> bool {
        self.status == RegistrationStatus::Waitlist
    }

    pub fn is_paid(&self) -> bool {
        self.paid_at.is_some() && self.paid_amount.is_some()
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub async fn create(
        exec: impl PgExecutor<'_>,
        data: CreateRegistrationData,
    ) -> Result<Self, sqlx::Error> {
        let registration = sqlx::query_as::<_, Registration>(
            r#"
            INSERT INTO registrations (user_id, event_id, status, ticket_code)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(data.user_id)
        .bind(data.event_id)
        .bind(data.status)
        .bind(generate_ticket_code())
        .fetch_one(exec)
        .await?;

        Ok(registration)
    }

    pub async fn find_by_id(
        exec: impl PgExecutor<'_>,
        id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        let registration = sqlx::query_as::<_, Registration>(
            r#"
            SELECT * FROM registrations WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(exec)
        .await?;

        Ok(registration)
    }

    /// The non-cancelled registration for a (user, event) pair, if any. At
    /// most one exists, enforced by a partial unique index.
    pub async fn find_active_by_user_and_event(
        exec: impl PgExecutor<'_>,
        user_id: Uuid,
        event_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        let registration = sqlx::query_as::<_, Registration>(
            r#"
            SELECT * FROM registrations
            WHERE user_id = $1 AND event_id = $2 AND status <> 'cancelled'
            "#,
        )
        .bind(user_id)
        .bind(event_id)
        .fetch_optional(exec)
        .await?;

        Ok(registration)
    }

    pub async fn find_by_ticket_code(
        exec: impl PgExecutor<'_>,
        ticket_code: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        let registration = sqlx::query_as::<_, Registration>(
            r#"
            SELECT * FROM registrations WHERE ticket_code = $1
            "#,
        )
        .bind(ticket_code)
        .fetch_optional(exec)
        .await?;

        Ok(registration)
    }

    pub async fn list_confirmed_by_event(
        exec: impl PgExecutor<'_>,
        event_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let registrations = sqlx::query_as::<_, Registration>(
            r#"
            SELECT * FROM registrations
            WHERE event_id = $1 AND status = 'confirmed'
            ORDER BY confirmed_at ASC
            "#,
        )
        .bind(event_id)
        .fetch_all(exec)
        .await?;

        Ok(registrations)
    }

    /// The waitlist in promotion order: first registered, first served.
    pub async fn list_waitlist_by_event(
        exec: impl PgExecutor<'_>,
        event_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let registrations = sqlx::query_as::<_, Registration>(
            r#"
            SELECT * FROM registrations
            WHERE event_id = $1 AND status = 'waitlist'
            ORDER BY registered_at ASC, seq ASC
            "#,
        )
        .bind(event_id)
        .fetch_all(exec)
        .await?;

        Ok(registrations)
    }

    pub async fn list_by_user(
        exec: impl PgExecutor<'_>,
        user_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let registrations = sqlx::query_as::<_, Registration>(
            r#"
            SELECT r.* FROM registrations r
            JOIN events e ON e.id = r.event_id
            WHERE r.user_id = $1
            ORDER BY e.start_date DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(exec)
        .await?;

        Ok(registrations)
    }

    /// Confirmed registrations for events that have not started yet.
    pub async fn list_upcoming_confirmed_by_user(
        exec: impl PgExecutor<'_>,
        user_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let registrations = sqlx::query_as::<_, Registration>(
            r#"
            SELECT r.* FROM registrations r
            JOIN events e ON e.id = r.event_id
            WHERE r.user_id = $1
              AND r.status = 'confirmed'
              AND e.start_date > NOW()
            ORDER BY e.start_date ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(exec)
        .await?;

        Ok(registrations)
    }

    pub async fn count_by_event_and_status(
        exec: impl PgExecutor<'_>,
        event_id: Uuid,
        status: RegistrationStatus,
    ) -> Result<i64, sqlx::Error> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM registrations
            WHERE event_id = $1 AND status = $2
            "#,
        )
        .bind(event_id)
        .bind(status)
        .fetch_one(exec)
        .await?;

        Ok(count)
    }

    /// Next registration in line for a freed seat, FIFO by registered_at with
    /// insertion order breaking ties.
    pub async fn next_on_waitlist(
        exec: impl PgExecutor<'_>,
        event_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        let registration = sqlx::query_as::<_, Registration>(
            r#"
            SELECT * FROM registrations
            WHERE event_id = $1 AND status = 'waitlist'
            ORDER BY registered_at ASC, seq ASC
            LIMIT 1
            "#,
        )
        .bind(event_id)
        .fetch_optional(exec)
        .await?;

        Ok(registration)
    }

    /// Total paid amount across all registrations for an event.
    pub async fn revenue_for_event(
        exec: impl PgExecutor<'_>,
        event_id: Uuid,
    ) -> Result<Decimal, sqlx::Error> {
        let revenue = sqlx::query_scalar::<_, Decimal>(
            r#"
            SELECT COALESCE(SUM(paid_amount), 0) FROM registrations
            WHERE event_id = $1 AND paid_amount IS NOT NULL
            "#,
        )
        .bind(event_id)
        .fetch_one(exec)
        .await?;

        Ok(revenue)
    }

    /// Cancels pending registrations older than the cutoff. Returns the
    /// number of rows affected.
    pub async fn cancel_stale_pending(
        exec: impl PgExecutor<'_>,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE registrations
            SET status = 'cancelled', cancelled_at = NOW()
            WHERE status = 'pending' AND registered_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(exec)
        .await?;

        Ok(result.rows_affected())
    }

    /// Cancels every non-cancelled registration for an event. Used when the
    /// owning event is torn down.
    pub async fn cancel_all_for_event(
        exec: impl PgExecutor<'_>,
        event_id: Uuid,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE registrations
            SET status = 'cancelled',
                cancelled_at = COALESCE(cancelled_at, NOW())
            WHERE event_id = $1 AND status <> 'cancelled'
            "#,
        )
        .bind(event_id)
        .execute(exec)
        .await?;

        Ok(result.rows_affected())
    }

    /// Persists status and the transition timestamps.
    pub async fn save_status(&self, exec: impl PgExecutor<'_>) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE registrations
            SET status = $2, confirmed_at = $3, cancelled_at = $4
            WHERE id = $1
            "#,
        )
        .bind(self.id)
        .bind(self.status)
        .bind(self.confirmed_at)
        .bind(self.cancelled_at)
        .execute(exec)
        .await?;

        Ok(())
    }

    pub async fn save_payment(&self, exec: impl PgExecutor<'_>) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE registrations
            SET paid_amount = $2, paid_at = $3
            WHERE id = $1
            "#,
        )
        .bind(self.id)
        .bind(self.paid_amount)
        .bind(self.paid_at)
        .execute(exec)
        .await?;

        Ok(())
    }

    pub async fn save_ticket_code(&self, exec: impl PgExecutor<'_>) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE registrations
            SET ticket_code = $2
            WHERE id = $1
            "#,
        )
        .bind(self.id)
        .bind(&self.ticket_code)
        .execute(exec)
        .await?;

        Ok(())
    }

    pub async fn save_owner(&self, exec: impl PgExecutor<'_>) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE registrations
            SET user_id = $2, ticket_code = $3
            WHERE id = $1
            "#,
        )
        .bind(self.id)
        .bind(self.user_id)
        .bind(&self.ticket_code)
        .execute(exec)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(status: RegistrationStatus) -> Registration {
        Registration {
            id: Uuid::new_v4(),
            seq: 1,
            user_id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            status,
            registered_at: Utc::now(),
            confirmed_at: None,
            cancelled_at: None,
            ticket_code: generate_ticket_code(),
            notes: None,
            paid_amount: None,
            paid_at: None,
        }
    }

    #[test]
    fn status_maps_to_builtin_text_type() {
        use sqlx::Type;

        // The schema stores status as TEXT; binding must target the builtin
        // string type, not a custom Postgres type.
        let info = <RegistrationStatus as Type<Postgres>>::type_info();
        assert_eq!(info.to_string(), "TEXT");
        assert!(<RegistrationStatus as Type<Postgres>>::compatible(&info));
    }

    #[test]
    fn status_round_trips_through_its_text_form() {
        for status in [
            RegistrationStatus::Pending,
            RegistrationStatus::Confirmed,
            RegistrationStatus::Cancelled,
            RegistrationStatus::Waitlist,
        ] {
            assert_eq!(status.as_str().parse::<RegistrationStatus>(), Ok(status));
        }
        assert!("unknown".parse::<RegistrationStatus>().is_err());
    }

    #[test]
    fn confirm_stamps_timestamp_exactly_once() {
        let mut r = registration(RegistrationStatus::Pending);
        assert!(r.is_pending());

        r.confirm();
        assert!(r.is_confirmed());
        let first = r.confirmed_at.expect("confirmed_at set on first confirm");

        r.confirm();
        assert!(r.is_confirmed());
        assert_eq!(r.confirmed_at, Some(first));
    }

    #[test]
    fn cancel_stamps_timestamp_exactly_once() {
        let mut r = registration(RegistrationStatus::Confirmed);

        r.cancel();
        assert!(r.is_cancelled());
        let first = r.cancelled_at.expect("cancelled_at set on first cancel");

        r.cancel();
        assert_eq!(r.cancelled_at, Some(first));
    }

    #[test]
    fn promote_moves_waitlist_to_pending_without_confirming() {
        let mut r = registration(RegistrationStatus::Waitlist);
        assert!(r.is_on_waitlist());

        r.promote();
        assert!(r.is_pending());
        assert!(r.confirmed_at.is_none());
    }

    #[test]
    fn paid_only_when_both_fields_set() {
        let mut r = registration(RegistrationStatus::Confirmed);
        assert!(!r.is_paid());

        r.mark_paid(Decimal::new(2500, 2));
        assert!(r.is_paid());
        assert_eq!(r.paid_amount, Some(Decimal::new(2500, 2)));
        assert!(r.paid_at.is_some());
    }

    #[test]
    fn ticket_codes_are_twelve_uppercase_hex_chars() {
        let code = generate_ticket_code();
        assert_eq!(code.len(), 12);
        assert!(code.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn regenerating_changes_the_code() {
        let mut r = registration(RegistrationStatus::Pending);
        let before = r.ticket_code.clone();
        r.regenerate_ticket_code();
        assert_ne!(r.ticket_code, before);
    }

    #[test]
    fn transfer_reassigns_owner_and_invalidates_code() {
        let mut r = registration(RegistrationStatus::Confirmed);
        let old_code = r.ticket_code.clone();
        let new_user = Uuid::new_v4();

        r.transfer_to(new_user);
        assert_eq!(r.user_id, new_user);
        assert_ne!(r.ticket_code, old_code);
    }
}

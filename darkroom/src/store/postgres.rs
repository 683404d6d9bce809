//! PostgreSQL store implementation.
//!
//! Every trait method runs as a single transaction. The two invariants the
//! SQL carries:
//!
//! - Holds use a conditional single-statement update
//!   (`... WHERE balance - held >= $amount`), so two concurrent
//!   reservations against the same account can never both read a stale
//!   available balance.
//! - Commit/cancel flip the reservation row with a
//!   `WHERE status = 'processing'` guard and only touch the account when
//!   that guard matched, so a duplicate transition can never move credits
//!   twice.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPool;
use sqlx::{FromRow, PgConnection};
use uuid::Uuid;

use crate::types::{AccountId, AssetId, FilterId, ModelId, ReservationId};

use super::error::{Result, StoreError};
use super::models::*;
use super::Store;

/// Postgres-backed implementation of [`Store`].
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(FromRow)]
struct ReservationRow {
    id: Uuid,
    account_id: Uuid,
    amount: Decimal,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = StoreError;

    fn try_from(row: ReservationRow) -> Result<Self> {
        let status = row
            .status
            .parse()
            .map_err(|e: String| StoreError::Other(anyhow::anyhow!(e)))?;
        Ok(Reservation {
            id: row.id,
            account_id: row.account_id,
            amount: row.amount,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct AssetRow {
    id: Uuid,
    account_id: Uuid,
    reservation_id: Uuid,
    provider_request_id: Option<String>,
    status: String,
    output_location: Option<String>,
    attempt: i32,
    fail_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AssetRow> for Asset {
    type Error = StoreError;

    fn try_from(row: AssetRow) -> Result<Self> {
        let status = row
            .status
            .parse()
            .map_err(|e: String| StoreError::Other(anyhow::anyhow!(e)))?;
        Ok(Asset {
            id: row.id,
            account_id: row.account_id,
            reservation_id: row.reservation_id,
            provider_request_id: row.provider_request_id,
            status,
            output_location: row.output_location,
            attempt: row.attempt,
            fail_reason: row.fail_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const ASSET_COLUMNS: &str = "id, account_id, reservation_id, provider_request_id, status, \
                             output_location, attempt, fail_reason, created_at, updated_at";

const RESERVATION_COLUMNS: &str = "id, account_id, amount, status, created_at, updated_at";

/// Flip a PROCESSING reservation to a terminal status and apply the
/// corresponding ledger movement, inside the caller's transaction.
///
/// `debit` distinguishes commit (charge and release) from cancel (release
/// only). Fails with `InvalidReservationState` when the row is already
/// terminal; the guard in the UPDATE means the ledger is untouched in that
/// case.
async fn transition_reservation(
    conn: &mut PgConnection,
    id: ReservationId,
    to: ReservationStatus,
    debit: bool,
) -> Result<Reservation> {
    let updated: Option<ReservationRow> = sqlx::query_as(&format!(
        r#"
        UPDATE reservations
        SET status = $2, updated_at = now()
        WHERE id = $1 AND status = 'processing'
        RETURNING {RESERVATION_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(to.as_str())
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = updated else {
        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM reservations WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?;
        return match current {
            Some((status,)) => Err(StoreError::InvalidReservationState {
                id,
                actual: status
                    .parse()
                    .map_err(|e: String| StoreError::Other(anyhow::anyhow!(e)))?,
            }),
            None => Err(StoreError::ReservationNotFound),
        };
    };

    let balance_delta = if debit { row.amount } else { Decimal::ZERO };
    sqlx::query("UPDATE accounts SET balance = balance - $2, held = held - $3 WHERE id = $1")
        .bind(row.account_id)
        .bind(balance_delta)
        .bind(row.amount)
        .execute(&mut *conn)
        .await?;

    row.try_into()
}

/// Like [`transition_reservation`] to FAILED, but tolerant of a reservation
/// already cancelled by a duplicate delivery: returns Ok(None) instead of
/// erroring, without touching the ledger.
async fn cancel_tolerant(
    conn: &mut PgConnection,
    id: ReservationId,
) -> Result<Option<Reservation>> {
    match transition_reservation(conn, id, ReservationStatus::Failed, false).await {
        Ok(reservation) => Ok(Some(reservation)),
        Err(StoreError::InvalidReservationState {
            actual: ReservationStatus::Failed,
            ..
        }) => Ok(None),
        Err(e) => Err(e),
    }
}

async fn fetch_asset(conn: &mut PgConnection, id: AssetId) -> Result<Asset> {
    let row: Option<AssetRow> =
        sqlx::query_as(&format!("SELECT {ASSET_COLUMNS} FROM assets WHERE id = $1"))
            .bind(id)
            .fetch_optional(conn)
            .await?;
    row.ok_or(StoreError::AssetNotFound)?.try_into()
}

#[async_trait]
impl Store for PostgresStore {
    async fn create_account(&self, initial_balance: Decimal) -> Result<Account> {
        let account = sqlx::query_as(
            r#"
            INSERT INTO accounts (id, balance, held)
            VALUES ($1, $2, 0)
            RETURNING id, balance, held, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(initial_balance)
        .fetch_one(&self.pool)
        .await?;
        Ok(account)
    }

    async fn get_account(&self, id: AccountId) -> Result<Account> {
        let account: Option<Account> =
            sqlx::query_as("SELECT id, balance, held, created_at FROM accounts WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        account.ok_or(StoreError::AccountNotFound)
    }

    async fn available(&self, id: AccountId) -> Result<Decimal> {
        Ok(self.get_account(id).await?.available())
    }

    async fn grant(&self, id: AccountId, amount: Decimal) -> Result<Account> {
        let account: Option<Account> = sqlx::query_as(
            r#"
            UPDATE accounts SET balance = balance + $2
            WHERE id = $1
            RETURNING id, balance, held, created_at
            "#,
        )
        .bind(id)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await?;
        account.ok_or(StoreError::AccountNotFound)
    }

    async fn reserve(
        &self,
        account_id: AccountId,
        amount: Decimal,
        asset_count: u32,
    ) -> Result<(Reservation, Vec<Asset>)> {
        let mut tx = self.pool.begin().await?;

        // Conditional hold: the availability check and the increment are one
        // statement, so concurrent reservations serialize on the row lock
        // and the losing caller sees the post-update balance.
        let held: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE accounts SET held = held + $2
            WHERE id = $1 AND balance - held >= $2
            RETURNING id
            "#,
        )
        .bind(account_id)
        .bind(amount)
        .fetch_optional(&mut *tx)
        .await?;

        if held.is_none() {
            // Distinguish a missing account from a shortfall
            let account: Option<Account> =
                sqlx::query_as("SELECT id, balance, held, created_at FROM accounts WHERE id = $1")
                    .bind(account_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            return match account {
                Some(account) => Err(StoreError::InsufficientFunds {
                    requested: amount,
                    available: account.available(),
                }),
                None => Err(StoreError::AccountNotFound),
            };
        }

        let reservation: ReservationRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO reservations (id, account_id, amount, status)
            VALUES ($1, $2, $3, 'processing')
            RETURNING {RESERVATION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(amount)
        .fetch_one(&mut *tx)
        .await?;

        let mut assets = Vec::with_capacity(asset_count as usize);
        for _ in 0..asset_count {
            let asset: AssetRow = sqlx::query_as(&format!(
                r#"
                INSERT INTO assets (id, account_id, reservation_id, status, attempt)
                VALUES ($1, $2, $3, 'pending', 0)
                RETURNING {ASSET_COLUMNS}
                "#
            ))
            .bind(Uuid::new_v4())
            .bind(account_id)
            .bind(reservation.id)
            .fetch_one(&mut *tx)
            .await?;
            assets.push(asset.try_into()?);
        }

        tx.commit().await?;
        Ok((reservation.try_into()?, assets))
    }

    async fn commit_reservation(&self, id: ReservationId) -> Result<Reservation> {
        let mut tx = self.pool.begin().await?;
        let reservation =
            transition_reservation(&mut *tx, id, ReservationStatus::Completed, true).await?;
        tx.commit().await?;
        Ok(reservation)
    }

    async fn cancel_reservation(&self, id: ReservationId) -> Result<Reservation> {
        let mut tx = self.pool.begin().await?;
        let reservation =
            transition_reservation(&mut *tx, id, ReservationStatus::Failed, false).await?;
        tx.commit().await?;
        Ok(reservation)
    }

    async fn get_reservation(&self, id: ReservationId) -> Result<Reservation> {
        let row: Option<ReservationRow> = sqlx::query_as(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or(StoreError::ReservationNotFound)?.try_into()
    }

    async fn get_asset(&self, id: AssetId) -> Result<Asset> {
        let mut conn = self.pool.acquire().await?;
        fetch_asset(&mut *conn, id).await
    }

    async fn list_reservation_assets(&self, id: ReservationId) -> Result<Vec<Asset>> {
        let rows: Vec<AssetRow> = sqlx::query_as(&format!(
            "SELECT {ASSET_COLUMNS} FROM assets WHERE reservation_id = $1 ORDER BY created_at"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_generated_assets(&self, id: AccountId) -> Result<Vec<Asset>> {
        let rows: Vec<AssetRow> = sqlx::query_as(&format!(
            r#"
            SELECT {ASSET_COLUMNS} FROM assets
            WHERE account_id = $1 AND status = 'generated'
            ORDER BY created_at
            "#
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn set_asset_submitted(&self, id: AssetId, provider_request_id: &str) -> Result<Asset> {
        let row: Option<AssetRow> = sqlx::query_as(&format!(
            r#"
            UPDATE assets SET provider_request_id = $2, updated_at = now()
            WHERE id = $1
            RETURNING {ASSET_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(provider_request_id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or(StoreError::AssetNotFound)?.try_into()
    }

    async fn mark_asset_uploading(
        &self,
        id: AssetId,
        provider_request_id: Option<&str>,
    ) -> Result<Asset> {
        let row: Option<AssetRow> = sqlx::query_as(&format!(
            r#"
            UPDATE assets SET
                status = 'uploading',
                provider_request_id = COALESCE($2, provider_request_id),
                updated_at = now()
            WHERE id = $1
            RETURNING {ASSET_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(provider_request_id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or(StoreError::AssetNotFound)?.try_into()
    }

    async fn mark_asset_generated(&self, id: AssetId, output_location: &str) -> Result<Asset> {
        let row: Option<AssetRow> = sqlx::query_as(&format!(
            r#"
            UPDATE assets SET
                status = 'generated',
                output_location = $2,
                fail_reason = NULL,
                updated_at = now()
            WHERE id = $1
            RETURNING {ASSET_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(output_location)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or(StoreError::AssetNotFound)?.try_into()
    }

    async fn mark_asset_failed(&self, id: AssetId, reason: &str) -> Result<Asset> {
        let row: Option<AssetRow> = sqlx::query_as(&format!(
            r#"
            UPDATE assets SET status = 'failed', fail_reason = $2, updated_at = now()
            WHERE id = $1
            RETURNING {ASSET_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or(StoreError::AssetNotFound)?.try_into()
    }

    async fn record_generation_failure(
        &self,
        id: AssetId,
        reason: &str,
        max_attempts: i32,
        permanent: bool,
    ) -> Result<FailureDisposition> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(i32, Uuid)> = sqlx::query_as(
            r#"
            UPDATE assets SET attempt = attempt + 1, updated_at = now()
            WHERE id = $1
            RETURNING attempt, reservation_id
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((attempt, reservation_id)) = row else {
            return Err(StoreError::AssetNotFound);
        };

        if !permanent && attempt < max_attempts {
            tx.commit().await?;
            return Ok(FailureDisposition::Retry { attempt });
        }

        // Exhausted (or permanent): refund and close out the asset, all in
        // this transaction so duplicate deliveries cannot double-release.
        // A reservation already FAILED (duplicate delivery) or already
        // COMPLETED (a sibling asset in the batch committed it) leaves the
        // ledger alone; the asset still fails.
        match transition_reservation(&mut *tx, reservation_id, ReservationStatus::Failed, false)
            .await
        {
            Ok(_) => {}
            Err(StoreError::InvalidReservationState {
                actual: ReservationStatus::Failed | ReservationStatus::Completed,
                ..
            }) => {}
            Err(e) => return Err(e),
        }

        sqlx::query(
            "UPDATE assets SET status = 'failed', fail_reason = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(FailureDisposition::Refunded)
    }

    async fn record_materialization_failure(&self, id: AssetId, reason: &str) -> Result<Asset> {
        let row: Option<AssetRow> = sqlx::query_as(&format!(
            r#"
            UPDATE assets SET
                attempt = attempt + 1,
                status = 'failed',
                fail_reason = $2,
                updated_at = now()
            WHERE id = $1
            RETURNING {ASSET_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or(StoreError::AssetNotFound)?.try_into()
    }

    async fn pending_assets_for_provider_request(
        &self,
        provider_request_id: &str,
    ) -> Result<Vec<Asset>> {
        let rows: Vec<AssetRow> = sqlx::query_as(&format!(
            r#"
            SELECT {ASSET_COLUMNS} FROM assets
            WHERE provider_request_id = $1 AND status = 'pending'
            ORDER BY created_at
            "#
        ))
        .bind(provider_request_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn complete_webhook_batch(
        &self,
        reservation_id: ReservationId,
        rows: Vec<(AssetId, WebhookDisposition)>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Commit first: the PROCESSING guard makes a concurrent duplicate
        // delivery fail here before any asset row has moved.
        transition_reservation(&mut *tx, reservation_id, ReservationStatus::Completed, true)
            .await?;

        for (asset_id, disposition) in rows {
            match disposition {
                WebhookDisposition::Url(url) => {
                    sqlx::query(
                        r#"
                        UPDATE assets SET status = 'generated', output_location = $2, updated_at = now()
                        WHERE id = $1
                        "#,
                    )
                    .bind(asset_id)
                    .bind(url)
                    .execute(&mut *tx)
                    .await?;
                }
                WebhookDisposition::Inline(_) => {
                    sqlx::query(
                        "UPDATE assets SET status = 'uploading', updated_at = now() WHERE id = $1",
                    )
                    .bind(asset_id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn fail_webhook_batch(
        &self,
        reservation_id: ReservationId,
        asset_ids: Vec<AssetId>,
        reason: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        cancel_tolerant(&mut *tx, reservation_id).await?;

        sqlx::query(
            r#"
            UPDATE assets SET status = 'failed', fail_reason = $2, updated_at = now()
            WHERE id = ANY($1)
            "#,
        )
        .bind(&asset_ids)
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_model(&self, id: ModelId) -> Result<ImageModel> {
        let row: Option<ImageModel> = sqlx::query_as(
            r#"
            SELECT id, name, provider, model, cost_per_call, created_at
            FROM image_models WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or(StoreError::ModelNotFound)
    }

    async fn get_filter(&self, id: FilterId) -> Result<Filter> {
        let row: Option<Filter> = sqlx::query_as(
            r#"
            SELECT id, model_id, name, additional_cost, created_at
            FROM filters WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or(StoreError::FilterNotFound)
    }

    async fn create_model(
        &self,
        name: &str,
        provider: &str,
        model: &str,
        cost_per_call: Decimal,
    ) -> Result<ImageModel> {
        let row = sqlx::query_as(
            r#"
            INSERT INTO image_models (id, name, provider, model, cost_per_call)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, name, provider, model, cost_per_call, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(provider)
        .bind(model)
        .bind(cost_per_call)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn create_filter(
        &self,
        model_id: ModelId,
        name: &str,
        additional_cost: Decimal,
    ) -> Result<Filter> {
        let row = sqlx::query_as(
            r#"
            INSERT INTO filters (id, model_id, name, additional_cost)
            VALUES ($1, $2, $3, $4)
            RETURNING id, model_id, name, additional_cost, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(model_id)
        .bind(name)
        .bind(additional_cost)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }
}

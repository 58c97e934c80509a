use crate::rows::{address_text, convert_all, PositionRow, POSITION_COLUMNS};
use crate::{store_error, PgStore};
use async_trait::async_trait;
use lendsync_core::store::page_bounds;
use lendsync_core::{Amount, Position, PositionFilter, PositionStatus, PositionStore, StoreError};
use sqlx::{Postgres, QueryBuilder};
use tracing::debug;

fn push_filter(query: &mut QueryBuilder<'_, Postgres>, filter: &PositionFilter) {
    if let Some(user_id) = filter.user_id {
        query.push(" AND user_id = ").push_bind(user_id);
    }
    if let Some(status) = filter.status {
        query.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(token) = filter.collateral_token {
        query.push(" AND collateral_token = ").push_bind(address_text(token));
    }
    if let Some(token) = filter.borrowed_token {
        query.push(" AND borrowed_token = ").push_bind(address_text(token));
    }
}

fn opt_text(amount: Option<Amount>) -> Option<String> {
    amount.map(|a| a.to_string())
}

impl PgStore {
    /// Explains a conditional write that touched no row.
    async fn position_write_rejected(&self, id: i64, expected_version: Option<i64>) -> StoreError {
        let stored = sqlx::query_as::<_, (String, i64)>("SELECT status, version FROM positions WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await;
        match stored {
            Err(e) => store_error(e),
            Ok(None) => StoreError::NotFound(format!("position {id}")),
            Ok(Some((_, version))) if expected_version.is_some_and(|v| v != version) => {
                StoreError::VersionConflict { id }
            }
            Ok(Some((status, _))) => {
                StoreError::Conflict(format!("position {id} is {status} and cannot change status"))
            }
        }
    }
}

#[async_trait]
impl PositionStore for PgStore {
    async fn create(&self, position: Position) -> Result<Position, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO positions (
                user_id, collateral_amount, collateral_token, borrowed_amount, borrowed_token,
                interest_rate, health_factor, liquidation_price, status, version,
                last_interest_update
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, $10)
            RETURNING {POSITION_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, PositionRow>(&sql)
            .bind(position.user_id)
            .bind(position.collateral_amount.to_string())
            .bind(address_text(position.collateral_token))
            .bind(position.borrowed_amount.to_string())
            .bind(address_text(position.borrowed_token))
            .bind(position.interest_rate.to_string())
            .bind(opt_text(position.health_factor))
            .bind(opt_text(position.liquidation_price))
            .bind(position.status.as_str())
            .bind(position.last_interest_update)
            .fetch_one(self.pool())
            .await
            .map_err(store_error)?;
        debug!(id = row.id, user_id = row.user_id, "Position inserted");
        row.try_into()
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Position>, StoreError> {
        let sql = format!("SELECT {POSITION_COLUMNS} FROM positions WHERE id = $1");
        sqlx::query_as::<_, PositionRow>(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(store_error)?
            .map(Position::try_from)
            .transpose()
    }

    async fn find_by_user_id(&self, user_id: i64) -> Result<Vec<Position>, StoreError> {
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE user_id = $1 ORDER BY created_at DESC, id DESC"
        );
        let rows = sqlx::query_as::<_, PositionRow>(&sql)
            .bind(user_id)
            .fetch_all(self.pool())
            .await
            .map_err(store_error)?;
        convert_all(rows)
    }

    async fn find_active_by_user_id(&self, user_id: i64) -> Result<Option<Position>, StoreError> {
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE user_id = $1 AND status = 'active'"
        );
        sqlx::query_as::<_, PositionRow>(&sql)
            .bind(user_id)
            .fetch_optional(self.pool())
            .await
            .map_err(store_error)?
            .map(Position::try_from)
            .transpose()
    }

    async fn update(&self, position: &Position) -> Result<Position, StoreError> {
        // A terminal row only accepts writes that keep its status.
        let sql = format!(
            r#"
            UPDATE positions SET
                collateral_amount = $1,
                collateral_token = $2,
                borrowed_amount = $3,
                borrowed_token = $4,
                interest_rate = $5,
                health_factor = $6,
                liquidation_price = $7,
                status = $8,
                last_interest_update = $9,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $10 AND version = $11 AND (status = 'active' OR status = $8)
            RETURNING {POSITION_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, PositionRow>(&sql)
            .bind(position.collateral_amount.to_string())
            .bind(address_text(position.collateral_token))
            .bind(position.borrowed_amount.to_string())
            .bind(address_text(position.borrowed_token))
            .bind(position.interest_rate.to_string())
            .bind(opt_text(position.health_factor))
            .bind(opt_text(position.liquidation_price))
            .bind(position.status.as_str())
            .bind(position.last_interest_update)
            .bind(position.id)
            .bind(position.version)
            .fetch_optional(self.pool())
            .await
            .map_err(store_error)?;
        match row {
            Some(row) => row.try_into(),
            None => Err(self.position_write_rejected(position.id, Some(position.version)).await),
        }
    }

    async fn update_status(&self, id: i64, status: PositionStatus) -> Result<Position, StoreError> {
        let sql = format!(
            r#"
            UPDATE positions SET status = $1, version = version + 1, updated_at = NOW()
            WHERE id = $2 AND status = 'active'
            RETURNING {POSITION_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, PositionRow>(&sql)
            .bind(status.as_str())
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(store_error)?;
        match row {
            Some(row) => row.try_into(),
            None => Err(self.position_write_rejected(id, None).await),
        }
    }

    async fn find_at_risk(&self, threshold: Amount) -> Result<Vec<Position>, StoreError> {
        let sql = format!(
            r#"
            SELECT {POSITION_COLUMNS} FROM positions
            WHERE status = 'active'
              AND borrowed_amount <> '0'
              AND health_factor IS NOT NULL
              AND health_factor::numeric <= $1::numeric
            ORDER BY health_factor::numeric ASC, id ASC
            "#
        );
        let rows = sqlx::query_as::<_, PositionRow>(&sql)
            .bind(threshold.to_string())
            .fetch_all(self.pool())
            .await
            .map_err(store_error)?;
        convert_all(rows)
    }

    async fn list(
        &self,
        filter: &PositionFilter,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Position>, StoreError> {
        let (offset, limit) = page_bounds(offset, limit);
        let mut query = QueryBuilder::<Postgres>::new(format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE 1=1"
        ));
        push_filter(&mut query, filter);
        query
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit as i64)
            .push(" OFFSET ")
            .push_bind(offset as i64);
        let rows = query
            .build_query_as::<PositionRow>()
            .fetch_all(self.pool())
            .await
            .map_err(store_error)?;
        convert_all(rows)
    }

    async fn count(&self, filter: &PositionFilter) -> Result<i64, StoreError> {
        let mut query = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM positions WHERE 1=1");
        push_filter(&mut query, filter);
        query
            .build_query_scalar::<i64>()
            .fetch_one(self.pool())
            .await
            .map_err(store_error)
    }
}

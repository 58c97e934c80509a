use crate::rows::{address_text, convert_all, hash_text, to_i64, TransactionRow, TRANSACTION_COLUMNS};
use crate::{store_error, PgStore};
use alloy::primitives::B256;
use async_trait::async_trait;
use lendsync_core::store::page_bounds;
use lendsync_core::{StoreError, TransactionFilter, TransactionLedger, TransactionRecord};
use sqlx::{Postgres, QueryBuilder};

fn push_filter(query: &mut QueryBuilder<'_, Postgres>, filter: &TransactionFilter) {
    if let Some(user_id) = filter.user_id {
        query.push(" AND user_id = ").push_bind(user_id);
    }
    if !filter.kinds.is_empty() {
        query.push(" AND kind IN (");
        let mut kinds = query.separated(", ");
        for kind in &filter.kinds {
            kinds.push_bind(kind.as_str());
        }
        kinds.push_unseparated(")");
    }
    if let Some(status) = filter.status {
        query.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(hash) = filter.hash {
        query.push(" AND hash = ").push_bind(hash_text(hash));
    }
    if let Some(token) = filter.token_address {
        query.push(" AND token_address = ").push_bind(address_text(token));
    }
    if let Some(after) = filter.created_after {
        query.push(" AND created_at >= ").push_bind(after);
    }
    if let Some(before) = filter.created_before {
        query.push(" AND created_at < ").push_bind(before);
    }
}

#[async_trait]
impl TransactionLedger for PgStore {
    async fn create(&self, record: TransactionRecord) -> Result<TransactionRecord, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO transactions (
                user_id, kind, status, hash, amount, token_address,
                block_number, gas_used, gas_price, error_message
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {TRANSACTION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(record.user_id)
            .bind(record.kind.as_str())
            .bind(record.status.as_str())
            .bind(hash_text(record.hash))
            .bind(record.amount.to_string())
            .bind(address_text(record.token_address))
            .bind(to_i64("block_number", record.block_number)?)
            .bind(to_i64("gas_used", record.gas_used)?)
            .bind(record.gas_price.map(|p| p.to_string()))
            .bind(record.error_message)
            .fetch_one(self.pool())
            .await
            .map_err(store_error)?
            .try_into()
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<TransactionRecord>, StoreError> {
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1");
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(store_error)?
            .map(TransactionRecord::try_from)
            .transpose()
    }

    async fn find_by_hash(&self, hash: B256) -> Result<Vec<TransactionRecord>, StoreError> {
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE hash = $1 ORDER BY id");
        let rows = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(hash_text(hash))
            .fetch_all(self.pool())
            .await
            .map_err(store_error)?;
        convert_all(rows)
    }

    async fn find_by_user_id(&self, user_id: i64) -> Result<Vec<TransactionRecord>, StoreError> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE user_id = $1 ORDER BY created_at DESC, id DESC"
        );
        let rows = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(user_id)
            .fetch_all(self.pool())
            .await
            .map_err(store_error)?;
        convert_all(rows)
    }

    async fn update(&self, record: &TransactionRecord) -> Result<TransactionRecord, StoreError> {
        let sql = format!(
            r#"
            UPDATE transactions SET
                status = $1,
                block_number = $2,
                gas_used = $3,
                gas_price = $4,
                error_message = $5,
                updated_at = NOW()
            WHERE id = $6
            RETURNING {TRANSACTION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(record.status.as_str())
            .bind(to_i64("block_number", record.block_number)?)
            .bind(to_i64("gas_used", record.gas_used)?)
            .bind(record.gas_price.map(|p| p.to_string()))
            .bind(record.error_message.as_deref())
            .bind(record.id)
            .fetch_optional(self.pool())
            .await
            .map_err(store_error)?
            .ok_or_else(|| StoreError::NotFound(format!("transaction {}", record.id)))?
            .try_into()
    }

    async fn find_pending(&self, limit: i64) -> Result<Vec<TransactionRecord>, StoreError> {
        let (_, limit) = page_bounds(0, limit);
        let sql = format!(
            r#"
            SELECT {TRANSACTION_COLUMNS} FROM transactions
            WHERE status = 'pending'
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            "#
        );
        let rows = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(limit as i64)
            .fetch_all(self.pool())
            .await
            .map_err(store_error)?;
        convert_all(rows)
    }

    async fn list(
        &self,
        filter: &TransactionFilter,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let (offset, limit) = page_bounds(offset, limit);
        let mut query = QueryBuilder::<Postgres>::new(format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE 1=1"
        ));
        push_filter(&mut query, filter);
        query
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit as i64)
            .push(" OFFSET ")
            .push_bind(offset as i64);
        let rows = query
            .build_query_as::<TransactionRow>()
            .fetch_all(self.pool())
            .await
            .map_err(store_error)?;
        convert_all(rows)
    }

    async fn count(&self, filter: &TransactionFilter) -> Result<i64, StoreError> {
        let mut query = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM transactions WHERE 1=1");
        push_filter(&mut query, filter);
        query
            .build_query_scalar::<i64>()
            .fetch_one(self.pool())
            .await
            .map_err(store_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fresh_address, store};
    use alloy::primitives::Address;
    use lendsync_core::{Amount, TransactionKind, TransactionStatus};

    fn record(user_id: i64, kind: TransactionKind, hash: B256) -> TransactionRecord {
        TransactionRecord::pending(user_id, kind, hash, Amount::from(10u64), Address::repeat_byte(3))
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_hash_is_unique_per_user() {
        let store = store().await;
        let liquidator = store.register_user(fresh_address()).await.unwrap();
        let borrower = store.register_user(fresh_address()).await.unwrap();
        let hash = B256::from(fresh_address().into_word());

        TransactionLedger::create(&store, record(liquidator.id, TransactionKind::Liquidate, hash))
            .await
            .unwrap();
        TransactionLedger::create(&store, record(borrower.id, TransactionKind::Liquidate, hash))
            .await
            .unwrap();
        assert!(matches!(
            TransactionLedger::create(&store, record(borrower.id, TransactionKind::Liquidate, hash)).await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(store.find_by_hash(hash).await.unwrap().len(), 2);
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_kind_filter_and_settlement() {
        let store = store().await;
        let user = store.register_user(fresh_address()).await.unwrap();
        for kind in [TransactionKind::Deposit, TransactionKind::Withdraw, TransactionKind::Borrow] {
            let hash = B256::from(fresh_address().into_word());
            TransactionLedger::create(&store, record(user.id, kind, hash)).await.unwrap();
        }

        let lending = TransactionFilter::for_user(user.id).with_kinds(&TransactionKind::LENDING);
        assert_eq!(TransactionLedger::count(&store, &lending).await.unwrap(), 2);
        let page = TransactionLedger::list(&store, &lending, 0, 10).await.unwrap();
        assert_eq!(page[0].kind, TransactionKind::Withdraw);

        let mut settled = page[0].clone();
        settled.status = TransactionStatus::Confirmed;
        settled.block_number = Some(100);
        settled.gas_used = Some(21_000);
        settled.gas_price = Some(Amount::from(2_000_000_000u64));
        let saved = TransactionLedger::update(&store, &settled).await.unwrap();
        assert_eq!(saved.status, TransactionStatus::Confirmed);
        assert_eq!(saved.gas_used, Some(21_000));
    }
}

use crate::rows::{address_text, UserRow};
use crate::{store_error, PgStore};
use alloy::primitives::Address;
use async_trait::async_trait;
use lendsync_core::{StoreError, UserAccount, UserDirectory};

impl PgStore {
    /// Register an account, or return the existing one for `address`.
    pub async fn register_user(&self, address: Address) -> Result<UserAccount, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            INSERT INTO users (address, active)
            VALUES ($1, TRUE)
            ON CONFLICT (address) DO UPDATE SET address = EXCLUDED.address
            RETURNING id, address, active
            "#,
        )
        .bind(address_text(address))
        .fetch_one(self.pool())
        .await
        .map_err(store_error)?;
        row.try_into()
    }

    /// Soft-delete or restore an account.
    pub async fn set_user_active(&self, id: i64, active: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE users SET active = $1 WHERE id = $2")
            .bind(active)
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(store_error)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for PgStore {
    async fn find_by_address(&self, address: Address) -> Result<Option<UserAccount>, StoreError> {
        sqlx::query_as::<_, UserRow>("SELECT id, address, active FROM users WHERE address = $1")
            .bind(address_text(address))
            .fetch_optional(self.pool())
            .await
            .map_err(store_error)?
            .map(UserAccount::try_from)
            .transpose()
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<UserAccount>, StoreError> {
        sqlx::query_as::<_, UserRow>("SELECT id, address, active FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(store_error)?
            .map(UserAccount::try_from)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fresh_address, store};

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_register_is_idempotent_and_soft_delete() {
        let store = store().await;
        let address = fresh_address();
        let user = store.register_user(address).await.unwrap();
        assert_eq!(store.register_user(address).await.unwrap().id, user.id);

        store.set_user_active(user.id, false).await.unwrap();
        let found = store.find_by_address(address).await.unwrap().unwrap();
        assert!(!found.active);
        assert!(UserDirectory::find_by_id(&store, -1).await.unwrap().is_none());
    }
}

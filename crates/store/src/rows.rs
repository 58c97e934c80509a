//! Row types as stored, and their conversion into domain records.

use alloy::primitives::{Address, B256};
use chrono::{DateTime, Utc};
use lendsync_core::{Amount, Position, StoreError, TransactionRecord, UserAccount};
use sqlx::FromRow;
use std::str::FromStr;

pub(crate) const POSITION_COLUMNS: &str = "id, user_id, collateral_amount, collateral_token, \
    borrowed_amount, borrowed_token, interest_rate, health_factor, liquidation_price, status, \
    version, last_interest_update, created_at, updated_at";

pub(crate) const TRANSACTION_COLUMNS: &str = "id, user_id, kind, status, hash, amount, \
    token_address, block_number, gas_used, gas_price, error_message, created_at, updated_at";

fn parse<T>(column: &str, value: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| StoreError::InvalidData(format!("{column} {value:?}: {e}")))
}

fn parse_opt<T>(column: &str, value: Option<&str>) -> Result<Option<T>, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.map(|v| parse(column, v)).transpose()
}

fn unsigned(column: &str, value: Option<i64>) -> Result<Option<u64>, StoreError> {
    value
        .map(|v| {
            u64::try_from(v).map_err(|_| StoreError::InvalidData(format!("{column} is negative: {v}")))
        })
        .transpose()
}

/// Lowercase hex, the stored form of addresses.
pub(crate) fn address_text(address: Address) -> String {
    format!("{address:#x}")
}

pub(crate) fn hash_text(hash: B256) -> String {
    format!("{hash:#x}")
}

#[derive(Debug, FromRow)]
pub(crate) struct PositionRow {
    pub id: i64,
    pub user_id: i64,
    pub collateral_amount: String,
    pub collateral_token: String,
    pub borrowed_amount: String,
    pub borrowed_token: String,
    pub interest_rate: String,
    pub health_factor: Option<String>,
    pub liquidation_price: Option<String>,
    pub status: String,
    pub version: i64,
    pub last_interest_update: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<PositionRow> for Position {
    type Error = StoreError;

    fn try_from(row: PositionRow) -> Result<Self, Self::Error> {
        Ok(Position {
            id: row.id,
            user_id: row.user_id,
            collateral_amount: parse::<Amount>("collateral_amount", &row.collateral_amount)?,
            collateral_token: parse::<Address>("collateral_token", &row.collateral_token)?,
            borrowed_amount: parse::<Amount>("borrowed_amount", &row.borrowed_amount)?,
            borrowed_token: parse::<Address>("borrowed_token", &row.borrowed_token)?,
            interest_rate: parse::<Amount>("interest_rate", &row.interest_rate)?,
            health_factor: parse_opt("health_factor", row.health_factor.as_deref())?,
            liquidation_price: parse_opt("liquidation_price", row.liquidation_price.as_deref())?,
            status: parse("status", &row.status)?,
            version: row.version,
            last_interest_update: row.last_interest_update,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct TransactionRow {
    pub id: i64,
    pub user_id: i64,
    pub kind: String,
    pub status: String,
    pub hash: String,
    pub amount: String,
    pub token_address: String,
    pub block_number: Option<i64>,
    pub gas_used: Option<i64>,
    pub gas_price: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for TransactionRecord {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(TransactionRecord {
            id: row.id,
            user_id: row.user_id,
            kind: parse("kind", &row.kind)?,
            status: parse("status", &row.status)?,
            hash: parse::<B256>("hash", &row.hash)?,
            amount: parse::<Amount>("amount", &row.amount)?,
            token_address: parse::<Address>("token_address", &row.token_address)?,
            block_number: unsigned("block_number", row.block_number)?,
            gas_used: unsigned("gas_used", row.gas_used)?,
            gas_price: parse_opt("gas_price", row.gas_price.as_deref())?,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct UserRow {
    pub id: i64,
    pub address: String,
    pub active: bool,
}

impl TryFrom<UserRow> for UserAccount {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(UserAccount {
            id: row.id,
            address: parse("address", &row.address)?,
            active: row.active,
        })
    }
}

/// Convert every row, failing on the first malformed one.
pub(crate) fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, StoreError>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

pub(crate) fn to_i64(column: &str, value: Option<u64>) -> Result<Option<i64>, StoreError> {
    value
        .map(|v| i64::try_from(v).map_err(|_| StoreError::InvalidData(format!("{column} out of range: {v}"))))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lendsync_core::{PositionStatus, TransactionKind, TransactionStatus};

    fn position_row() -> PositionRow {
        let now = Utc::now();
        PositionRow {
            id: 7,
            user_id: 3,
            collateral_amount: "300".into(),
            collateral_token: "0x0000000000000000000000000000000000000003".into(),
            borrowed_amount: "115792089237316195423570985008687907853269984665640564039457584007913129639935".into(),
            borrowed_token: "0x0000000000000000000000000000000000000002".into(),
            interest_rate: "80000000000000000".into(),
            health_factor: Some("1500000000000000000".into()),
            liquidation_price: None,
            status: "active".into(),
            version: 4,
            last_interest_update: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_position_row_converts_full_width_amounts() {
        let position = Position::try_from(position_row()).unwrap();
        assert_eq!(position.borrowed_amount, Amount::MAX);
        assert_eq!(position.status, PositionStatus::Active);
        assert_eq!(position.health_factor.unwrap().to_string(), "1500000000000000000");
        assert_eq!(position.version, 4);
    }

    #[test]
    fn test_malformed_rows_are_invalid_data() {
        let mut row = position_row();
        row.collateral_amount = "-5".into();
        assert!(matches!(Position::try_from(row), Err(StoreError::InvalidData(_))));

        let mut row = position_row();
        row.status = "open".into();
        assert!(matches!(Position::try_from(row), Err(StoreError::InvalidData(_))));
    }

    #[test]
    fn test_transaction_row_conversion() {
        let now = Utc::now();
        let row = TransactionRow {
            id: 1,
            user_id: 2,
            kind: "deposit_collateral".into(),
            status: "confirmed".into(),
            hash: format!("{:#x}", B256::repeat_byte(0xab)),
            amount: "10".into(),
            token_address: "0x0000000000000000000000000000000000000003".into(),
            block_number: Some(100),
            gas_used: Some(-1),
            gas_price: Some("2000000000".into()),
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        assert!(matches!(TransactionRecord::try_from(row), Err(StoreError::InvalidData(_))));

        let row = TransactionRow {
            id: 1,
            user_id: 2,
            kind: "deposit_collateral".into(),
            status: "confirmed".into(),
            hash: format!("{:#x}", B256::repeat_byte(0xab)),
            amount: "10".into(),
            token_address: "0x0000000000000000000000000000000000000003".into(),
            block_number: Some(100),
            gas_used: Some(21_000),
            gas_price: Some("2000000000".into()),
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        let record = TransactionRecord::try_from(row).unwrap();
        assert_eq!(record.kind, TransactionKind::DepositCollateral);
        assert_eq!(record.status, TransactionStatus::Confirmed);
        assert_eq!(record.hash, B256::repeat_byte(0xab));
        assert_eq!(record.gas_used, Some(21_000));
    }

    #[test]
    fn test_stored_hex_is_lowercase() {
        let address: Address = "0xAbCdEf0000000000000000000000000000000001".parse().unwrap();
        assert_eq!(address_text(address), "0xabcdef0000000000000000000000000000000001");
    }
}

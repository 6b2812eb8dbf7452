//! PostgreSQL ledger backend

use super::*;
use crate::config::DatabaseConfig;

use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};

/// Ledger persisted in PostgreSQL
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub async fn new(config: &DatabaseConfig) -> RelayerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Create tables if they do not exist yet
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key VARCHAR(64) PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS source_events (
                unique_id VARCHAR(160) PRIMARY KEY,
                source_chain VARCHAR(16) NOT NULL,
                kind VARCHAR(8) NOT NULL,
                asset_chain VARCHAR(8) NOT NULL,
                asset_address TEXT NOT NULL,
                amount TEXT NOT NULL,
                sender TEXT NOT NULL,
                recipient TEXT NOT NULL,
                block_number BIGINT NOT NULL,
                block_hash VARCHAR(80) NOT NULL,
                confirm_number BIGINT NOT NULL DEFAULT 0,
                confirm_status VARCHAR(16) NOT NULL,
                bridge_fee TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_source_events_chain_block
            ON source_events (source_chain, block_number)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dest_actions (
                seq BIGSERIAL,
                id VARCHAR(160) PRIMARY KEY,
                source_chain VARCHAR(16) NOT NULL,
                dest_chain VARCHAR(16) NOT NULL,
                kind VARCHAR(8) NOT NULL,
                asset_chain VARCHAR(8) NOT NULL,
                asset_address TEXT NOT NULL,
                amount TEXT NOT NULL,
                recipient TEXT NOT NULL,
                status VARCHAR(16) NOT NULL,
                message TEXT,
                exec_tx_hash VARCHAR(80),
                block_number BIGINT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_dest_actions_status
            ON dest_actions (dest_chain, status, seq)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Ledger migrations complete");
        Ok(())
    }
}

fn asset_columns(asset: &Asset) -> RelayerResult<(String, String)> {
    let value = serde_json::to_value(asset)?;
    let chain = value["chain"].as_str().unwrap_or_default().to_string();
    Ok((chain, asset.address().to_string()))
}

fn asset_from_columns(chain: &str, address: String) -> RelayerResult<Asset> {
    let value = serde_json::json!({ "chain": chain, "address": address });
    Ok(serde_json::from_value(value)?)
}

fn amount_column(row: &PgRow, column: &str) -> RelayerResult<u128> {
    let raw: String = row.get(column);
    crate::asset::parse_amount(&raw)
        .ok_or_else(|| RelayerError::Internal(format!("corrupt {} column: {:?}", column, raw)))
}

fn source_event_from_row(row: &PgRow) -> RelayerResult<SourceEvent> {
    let source_chain: String = row.get("source_chain");
    let kind: String = row.get("kind");
    let asset_chain: String = row.get("asset_chain");
    let confirm_status: String = row.get("confirm_status");

    Ok(SourceEvent {
        unique_id: row.get("unique_id"),
        source_chain: source_chain.parse()?,
        kind: kind.parse()?,
        asset: asset_from_columns(&asset_chain, row.get("asset_address"))?,
        amount: amount_column(row, "amount")?,
        sender: row.get("sender"),
        recipient: row.get("recipient"),
        block_number: row.get::<i64, _>("block_number") as u64,
        block_hash: row.get("block_hash"),
        confirm_number: row.get::<i64, _>("confirm_number") as u64,
        confirm_status: confirm_status.parse()?,
        bridge_fee: amount_column(row, "bridge_fee")?,
        created_at: row.get("created_at"),
    })
}

fn dest_action_from_row(row: &PgRow) -> RelayerResult<DestAction> {
    let source_chain: String = row.get("source_chain");
    let dest_chain: String = row.get("dest_chain");
    let kind: String = row.get("kind");
    let asset_chain: String = row.get("asset_chain");
    let status: String = row.get("status");

    Ok(DestAction {
        id: row.get("id"),
        source_chain: source_chain.parse()?,
        dest_chain: dest_chain.parse()?,
        kind: kind.parse()?,
        asset: asset_from_columns(&asset_chain, row.get("asset_address"))?,
        amount: amount_column(row, "amount")?,
        recipient: row.get("recipient"),
        status: status.parse()?,
        message: row.get("message"),
        exec_tx_hash: row.get("exec_tx_hash"),
        block_number: row.get::<Option<i64>, _>("block_number").map(|b| b as u64),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

const DEST_ACTION_COLUMNS: &str = "id, source_chain, dest_chain, kind, asset_chain, asset_address, \
     amount, recipient, status, message, exec_tx_hash, block_number, created_at, updated_at";

const SOURCE_EVENT_COLUMNS: &str = "unique_id, source_chain, kind, asset_chain, asset_address, \
     amount, sender, recipient, block_number, block_hash, confirm_number, confirm_status, \
     bridge_fee, created_at";

impl PostgresLedger {
    async fn insert_dest_action(&self, action: &DestAction) -> RelayerResult<bool> {
        let (asset_chain, asset_address) = asset_columns(&action.asset)?;
        let result = sqlx::query(
            r#"
            INSERT INTO dest_actions
                (id, source_chain, dest_chain, kind, asset_chain, asset_address, amount,
                 recipient, status, message, exec_tx_hash, block_number)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&action.id)
        .bind(action.source_chain.as_str())
        .bind(action.dest_chain.as_str())
        .bind(action.kind.as_str())
        .bind(asset_chain)
        .bind(asset_address)
        .bind(action.amount.to_string())
        .bind(&action.recipient)
        .bind(action.status.as_str())
        .bind(&action.message)
        .bind(&action.exec_tx_hash)
        .bind(action.block_number.map(|b| b as i64))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl TransferLedger for PostgresLedger {
    async fn upsert_source_event(&self, event: &SourceEvent) -> RelayerResult<bool> {
        let (asset_chain, asset_address) = asset_columns(&event.asset)?;
        let row = sqlx::query(
            r#"
            INSERT INTO source_events
                (unique_id, source_chain, kind, asset_chain, asset_address, amount, sender,
                 recipient, block_number, block_hash, confirm_number, confirm_status, bridge_fee)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (unique_id)
            DO UPDATE SET confirm_number =
                GREATEST(source_events.confirm_number, EXCLUDED.confirm_number)
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&event.unique_id)
        .bind(event.source_chain.as_str())
        .bind(event.kind.as_str())
        .bind(asset_chain)
        .bind(asset_address)
        .bind(event.amount.to_string())
        .bind(&event.sender)
        .bind(&event.recipient)
        .bind(event.block_number as i64)
        .bind(&event.block_hash)
        .bind(event.confirm_number as i64)
        .bind(event.confirm_status.as_str())
        .bind(event.bridge_fee.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<bool, _>("inserted"))
    }

    async fn source_events(&self, ids: &[String]) -> RelayerResult<Vec<SourceEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM source_events WHERE unique_id = ANY($1)",
            SOURCE_EVENT_COLUMNS
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(source_event_from_row).collect()
    }

    async fn unconfirmed_events(&self, chain: ChainKind) -> RelayerResult<Vec<SourceEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM source_events \
             WHERE source_chain = $1 AND confirm_status = 'unconfirmed' \
             ORDER BY block_number",
            SOURCE_EVENT_COLUMNS
        ))
        .bind(chain.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(source_event_from_row).collect()
    }

    async fn update_confirm_number(&self, id: &str, confirm_number: u64) -> RelayerResult<()> {
        sqlx::query(
            r#"
            UPDATE source_events
            SET confirm_number = GREATEST(confirm_number, $2)
            WHERE unique_id = $1
            "#,
        )
        .bind(id)
        .bind(confirm_number as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_confirmed(&self, ids: &[String]) -> RelayerResult<()> {
        for id in ids {
            sqlx::query(
                "UPDATE source_events SET confirm_status = 'confirmed' WHERE unique_id = $1",
            )
            .bind(id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn create_dest_actions(&self, actions: &[DestAction]) -> RelayerResult<u64> {
        let mut created = 0;
        for action in actions {
            if self.insert_dest_action(action).await? {
                created += 1;
            }
        }
        Ok(created)
    }

    async fn record_settlement(&self, settlement: &Settlement) -> RelayerResult<()> {
        if self.insert_dest_action(&settlement.to_dest_action()).await? {
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE dest_actions
            SET exec_tx_hash = CASE WHEN status = 'success' THEN exec_tx_hash ELSE $2 END,
                status = 'success',
                message = NULL,
                block_number = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(&settlement.source_id)
        .bind(&settlement.tx_hash)
        .bind(settlement.block_number as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_dest_actions(
        &self,
        dest_chain: Option<ChainKind>,
        status: ActionStatus,
        limit: usize,
    ) -> RelayerResult<Vec<DestAction>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM dest_actions \
             WHERE status = $1 AND ($2::VARCHAR IS NULL OR dest_chain = $2) \
             ORDER BY seq LIMIT $3",
            DEST_ACTION_COLUMNS
        ))
        .bind(status.as_str())
        .bind(dest_chain.map(|c| c.as_str()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(dest_action_from_row).collect()
    }

    async fn dest_actions(&self, ids: &[String]) -> RelayerResult<Vec<DestAction>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM dest_actions WHERE id = ANY($1) ORDER BY seq",
            DEST_ACTION_COLUMNS
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(dest_action_from_row).collect()
    }

    async fn mark_pending(&self, ids: &[String]) -> RelayerResult<()> {
        for id in ids {
            sqlx::query(
                r#"
                UPDATE dest_actions
                SET status = 'pending', updated_at = NOW()
                WHERE id = $1 AND status IN ('todo', 'error')
                "#,
            )
            .bind(id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn mark_success(&self, id: &str, exec_tx_hash: &str) -> RelayerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dest_actions
            SET status = 'success', exec_tx_hash = $2, message = NULL, updated_at = NOW()
            WHERE id = $1 AND status <> 'success'
            "#,
        )
        .bind(id)
        .bind(exec_tx_hash)
        .execute(&self.pool)
        .await?;

        debug!(unique_id = id, tx_hash = exec_tx_hash, "Marked action success");
        Ok(result.rows_affected() > 0)
    }

    async fn mark_error(&self, id: &str, message: &str) -> RelayerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dest_actions
            SET status = 'error', message = $2, updated_at = NOW()
            WHERE id = $1 AND status <> 'success'
            "#,
        )
        .bind(id)
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn rollback(
        &self,
        chain: ChainKind,
        after_height: u64,
        scope: RollbackScope,
    ) -> RelayerResult<RollbackReport> {
        let deleted = sqlx::query(
            "DELETE FROM source_events WHERE source_chain = $1 AND block_number > $2",
        )
        .bind(chain.as_str())
        .bind(after_height as i64)
        .execute(&self.pool)
        .await?;

        let mut report = RollbackReport {
            source_events: deleted.rows_affected(),
            dest_actions: 0,
        };

        if scope == RollbackScope::SourceEventsAndActions {
            let deleted = sqlx::query(
                "DELETE FROM dest_actions WHERE dest_chain = $1 AND block_number > $2",
            )
            .bind(chain.as_str())
            .bind(after_height as i64)
            .execute(&self.pool)
            .await?;
            report.dest_actions = deleted.rows_affected();
        }

        Ok(report)
    }

    async fn cursor(&self, chain: ChainKind) -> RelayerResult<Option<ChainCursor>> {
        let row = sqlx::query("SELECT value FROM kv_store WHERE key = $1")
            .bind(chain.cursor_key())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| ChainCursor::decode(&r.get::<String, _>("value")))
            .transpose()
    }

    async fn save_cursor(&self, chain: ChainKind, cursor: &ChainCursor) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key)
            DO UPDATE SET value = $2, updated_at = NOW()
            "#,
        )
        .bind(chain.cursor_key())
        .bind(cursor.encode())
        .execute(&self.pool)
        .await?;

        debug!(chain = %chain, height = cursor.height, "Saved cursor");
        Ok(())
    }

    async fn stats(&self) -> RelayerResult<LedgerStats> {
        let events = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE confirm_status = 'unconfirmed') as unconfirmed,
                COUNT(*) FILTER (WHERE confirm_status = 'confirmed') as confirmed
            FROM source_events
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let actions = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'todo') as todo,
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'success') as success,
                COUNT(*) FILTER (WHERE status = 'error') as error
            FROM dest_actions
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(LedgerStats {
            unconfirmed: events.get::<i64, _>("unconfirmed") as u64,
            confirmed: events.get::<i64, _>("confirmed") as u64,
            todo: actions.get::<i64, _>("todo") as u64,
            pending: actions.get::<i64, _>("pending") as u64,
            success: actions.get::<i64, _>("success") as u64,
            error: actions.get::<i64, _>("error") as u64,
        })
    }

    async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;

    #[test]
    fn test_asset_columns_round_trip() {
        let asset = Asset::Tron("trx".into());
        let (chain, address) = asset_columns(&asset).unwrap();
        assert_eq!(chain, "TRON");
        assert_eq!(asset_from_columns(&chain, address).unwrap(), asset);

        let (chain, _) = asset_columns(&eth_asset()).unwrap();
        assert_eq!(chain, "ETH");
    }
}

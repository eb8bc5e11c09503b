//! Analytics predictions. Stored and synced exactly like readings.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::error::{DbError, DbResult};
use crate::repository::sync::SyncOutboxRepository;
use fieldgate_core::{Prediction, SyncTable};

const SELECT_COLUMNS: &str = "SELECT id, model_name, prediction_type, input_data, \
     prediction_result, confidence, timestamp, created_at FROM ai_predictions";

#[derive(sqlx::FromRow)]
struct PredictionRow {
    id: String,
    model_name: String,
    prediction_type: String,
    input_data: String,
    prediction_result: String,
    confidence: f64,
    timestamp: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl TryFrom<PredictionRow> for Prediction {
    type Error = DbError;

    fn try_from(row: PredictionRow) -> DbResult<Self> {
        Ok(Prediction {
            id: row.id,
            model_name: row.model_name,
            prediction_type: row.prediction_type,
            input_data: serde_json::from_str(&row.input_data)?,
            prediction_result: serde_json::from_str(&row.prediction_result)?,
            confidence: row.confidence,
            timestamp: row.timestamp,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PredictionRepository {
    pool: SqlitePool,
}

impl PredictionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        PredictionRepository { pool }
    }

    /// Stores a prediction and queues it for sync. Returns the outbox id.
    pub async fn insert(&self, prediction: &Prediction) -> DbResult<i64> {
        let input_data = serde_json::to_string(&prediction.input_data)?;
        let prediction_result = serde_json::to_string(&prediction.prediction_result)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO ai_predictions (
                id, model_name, prediction_type, input_data, prediction_result,
                confidence, timestamp, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&prediction.id)
        .bind(&prediction.model_name)
        .bind(&prediction.prediction_type)
        .bind(input_data)
        .bind(prediction_result)
        .bind(prediction.confidence)
        .bind(prediction.timestamp)
        .bind(prediction.created_at)
        .execute(&mut *tx)
        .await?;

        let outbox_id =
            SyncOutboxRepository::enqueue(&mut tx, SyncTable::AiPredictions, &prediction.id).await?;

        tx.commit().await?;
        Ok(outbox_id)
    }

    pub async fn get_by_ids(&self, ids: &[String]) -> DbResult<Vec<Prediction>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        query.push(" WHERE id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let rows: Vec<PredictionRow> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(Prediction::try_from).collect()
    }

    /// Most recent predictions, optionally for one model.
    pub async fn list_recent(&self, model_name: Option<&str>, limit: u32) -> DbResult<Vec<Prediction>> {
        let mut query = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        if let Some(model) = model_name {
            query.push(" WHERE model_name = ").push_bind(model);
        }
        query.push(" ORDER BY timestamp DESC LIMIT ").push_bind(limit);

        let rows: Vec<PredictionRow> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(Prediction::try_from).collect()
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ai_predictions")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_and_list() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let prediction = Prediction::new(
            "load_forecast",
            "power_1h",
            json!({"window": [1.0, 2.0]}),
            json!({"power": 3.0}),
            0.87,
        );
        db.predictions().insert(&prediction).await.unwrap();
        db.predictions()
            .insert(&Prediction::new("anomaly", "score", json!({}), json!(0.1), 0.5))
            .await
            .unwrap();

        let forecasts = db
            .predictions()
            .list_recent(Some("load_forecast"), 10)
            .await
            .unwrap();
        assert_eq!(forecasts, vec![prediction]);
        assert_eq!(db.predictions().count().await.unwrap(), 2);
        assert_eq!(db.sync_outbox().count_pending().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_insert_is_atomic() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        sqlx::query(
            "CREATE TRIGGER reject_outbox BEFORE INSERT ON sync_outbox \
             BEGIN SELECT RAISE(ABORT, 'outbox unavailable'); END",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let prediction = Prediction::new("load_forecast", "power_1h", json!({}), json!({"power": 3.0}), 0.9);
        assert!(db.predictions().insert(&prediction).await.is_err());

        assert_eq!(db.predictions().count().await.unwrap(), 0);
        assert!(db
            .predictions()
            .get_by_ids(&[prediction.id.clone()])
            .await
            .unwrap()
            .is_empty());
    }
}

use futures::future::BoxFuture;
use sqlx::{PgConnection, PgPool};
use tracing::debug;

use crate::error::{map_sqlx_err, RelayError};
use crate::record::{EventSpec, OutboxRecord, RecordId};
use crate::store::postgres::PostgresOutboxStore;
use crate::telemetry;

/// Boxed async mutation executed inside the enqueue transaction.
pub type Mutation<'a, R> =
    Box<dyn for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<R, RelayError>> + Send + 'a>;

/// The transactional write path.
///
/// `enqueue` runs a caller-supplied business mutation and the outbox
/// insert in one database transaction: either both are durable or
/// neither is. Any error rolls the transaction back and surfaces
/// unchanged.
#[derive(Clone, Debug)]
pub struct EnqueueService {
    pool: PgPool,
}

impl EnqueueService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Execute `mutation`, build the outbox record from the domain
    /// result via `spec`, insert it, and commit. Returns the domain
    /// result together with the assigned record id.
    ///
    /// ```ignore
    /// let (order, outbox_id) = enqueue
    ///     .enqueue(
    ///         Box::new(|conn| Box::pin(insert_order(conn, request))),
    ///         |order| {
    ///             EventSpec::new(order.id.to_string(), "Order", "OrderCreated", order.to_event())
    ///         },
    ///     )
    ///     .await?;
    /// ```
    pub async fn enqueue<R, S>(
        &self,
        mutation: Mutation<'_, R>,
        spec: S,
    ) -> Result<(R, RecordId), RelayError>
    where
        R: Send,
        S: FnOnce(&R) -> EventSpec + Send,
    {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let result = match mutation(&mut *tx).await {
            Ok(result) => result,
            Err(err) => {
                tx.rollback().await.map_err(map_sqlx_err)?;
                return Err(err);
            }
        };

        let record = {
            let event_spec = spec(&result);
            let span = telemetry::enqueue_span(&event_spec.aggregate_type, &event_spec.event_type);
            let _enter = span.enter();
            OutboxRecord::from_spec(event_spec)
        };
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                tx.rollback().await.map_err(map_sqlx_err)?;
                return Err(err);
            }
        };

        if let Err(err) = PostgresOutboxStore::insert(&mut *tx, &record).await {
            tx.rollback().await.map_err(map_sqlx_err)?;
            return Err(err);
        }

        tx.commit().await.map_err(map_sqlx_err)?;

        debug!(
            record_id = %record.id,
            aggregate_id = %record.aggregate_id,
            event_type = %record.event_type,
            "event enqueued"
        );
        Ok((result, record.id))
    }
}

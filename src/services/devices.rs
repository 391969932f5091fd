use std::time::Duration;

use serde_json::{json, Value};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::device::{Device, TelemetryRequest};
use crate::services::metrics;

const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts telemetry from shared-secret devices and relays it to the
/// external ingestion endpoint. Immutable after construction.
pub struct DeviceGateway {
    client: reqwest::Client,
    telemetry_url: Option<String>,
    deploy_key: Option<String>,
}

/// The external response, returned to the device verbatim.
pub struct ForwardedResponse {
    pub status: u16,
    pub body: Value,
}

impl DeviceGateway {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(FORWARD_TIMEOUT)
                .build()
                .unwrap_or_default(),
            telemetry_url: config.telemetry_url.clone(),
            deploy_key: config.telemetry_deploy_key.clone(),
        }
    }

    /// Verify the device, update its heartbeat on a detached task, forward
    /// the enriched payload and hand back whatever the ingestion endpoint
    /// answered.
    pub async fn submit(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        pool: &PgPool,
        tenant_id: Uuid,
        req: &TelemetryRequest,
    ) -> AppResult<ForwardedResponse> {
        // Tenant-scoped lookup: the row-level policy hides other tenants'
        // devices even for a colliding hardware id.
        let device = sqlx::query_as::<_, Device>(
            "SELECT * FROM devices WHERE hardware_id = $1 AND is_active = TRUE",
        )
        .bind(&req.hardware_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(AppError::InvalidCredentials)?;

        if !bcrypt::verify(&req.secret, &device.secret_hash).unwrap_or(false) {
            return Err(AppError::InvalidCredentials);
        }

        Self::touch_heartbeat(pool.clone(), tenant_id, device.id);

        let url = self
            .telemetry_url
            .as_deref()
            .ok_or_else(|| AppError::BadGateway("telemetry endpoint not configured".into()))?;

        let mut enriched = match &req.payload {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("payload".into(), other.clone());
                map
            }
        };
        enriched.insert("tenant_id".into(), json!(tenant_id));
        enriched.insert("device_id".into(), json!(device.id));
        enriched.insert("hardware_id".into(), json!(device.hardware_id));
        enriched.insert("received_at".into(), json!(chrono::Utc::now()));

        let mut request = self.client.post(url).json(&Value::Object(enriched));
        if let Some(key) = &self.deploy_key {
            request = request.header("X-Deploy-Key", key);
        }

        let response = request.send().await.map_err(|e| {
            metrics::TELEMETRY_FORWARDS.with_label_values(&["error"]).inc();
            AppError::BadGateway(format!("telemetry forward failed: {e}"))
        })?;

        metrics::TELEMETRY_FORWARDS.with_label_values(&["ok"]).inc();
        let status = response.status().as_u16();
        let body = response
            .json::<Value>()
            .await
            .unwrap_or_else(|_| json!({ "status": "accepted" }));

        Ok(ForwardedResponse { status, body })
    }

    /// Heartbeat is fire-and-forget on a detached task with its own
    /// tenant-bound transaction; a store outage silently drops it.
    fn touch_heartbeat(pool: PgPool, tenant_id: Uuid, device_id: Uuid) {
        tokio::spawn(async move {
            let run = async {
                let mut tx = crate::db::tenant::begin_tenant_tx(&pool, tenant_id).await?;
                sqlx::query("UPDATE devices SET last_heartbeat = NOW() WHERE id = $1")
                    .bind(device_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await
            };
            if let Err(e) = run.await {
                tracing::debug!("heartbeat update for device {device_id} dropped: {e}");
            }
        });
    }
}

//! Redis metadata store backend.
//!
//! Image records and the run timing record are JSON strings under
//! namespaced keys; received-tile sets use Redis sets, whose `SADD`
//! return value gives the atomic test-and-insert the assembler's dedup
//! depends on. Records expire after 24 hours so finished runs do not
//! accumulate in a shared instance.

use super::{ImageInfo, MetadataStore, StoreError};
use crate::stats::RunTimings;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// Time-to-live for metadata records.
const RECORD_TTL_SECS: u64 = 24 * 60 * 60;

/// Metadata store over Redis.
///
/// Cheap to clone; clones share the underlying multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    namespace: String,
}

impl RedisStore {
    /// Connects to Redis and verifies the server is reachable.
    pub async fn connect(addr: &str, namespace: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(addr)
            .map_err(|e| StoreError::Unavailable(format!("invalid redis address: {e}")))?;
        let mut conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self {
            conn,
            namespace: namespace.to_string(),
        })
    }

    fn info_key(&self, image_id: u32) -> String {
        format!("{}:image:{}:info", self.namespace, image_id)
    }

    fn received_key(&self, image_id: u32) -> String {
        format!("{}:image:{}:received", self.namespace, image_id)
    }

    fn completed_key(&self, image_id: u32) -> String {
        format!("{}:image:{}:completed", self.namespace, image_id)
    }

    fn timing_key(&self) -> String {
        format!("{}:timing", self.namespace)
    }
}

fn backend_err(e: redis::RedisError) -> StoreError {
    if e.is_connection_refusal() || e.is_io_error() || e.is_timeout() {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Backend(e.to_string())
    }
}

impl MetadataStore for RedisStore {
    async fn put_image_info(&self, info: &ImageInfo) -> Result<(), StoreError> {
        let json = serde_json::to_string(info).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(self.info_key(info.id), json, RECORD_TTL_SECS)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn image_info(&self, image_id: u32) -> Result<Option<ImageInfo>, StoreError> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn
            .get(self.info_key(image_id))
            .await
            .map_err(backend_err)?;
        match json {
            Some(json) => {
                let info =
                    serde_json::from_str(&json).map_err(|e| StoreError::Corrupt(e.to_string()))?;
                Ok(Some(info))
            }
            None => Ok(None),
        }
    }

    async fn mark_tile_received(&self, image_id: u32, tile_id: u32) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let added: i64 = conn
            .sadd(self.received_key(image_id), tile_id)
            .await
            .map_err(backend_err)?;
        Ok(added == 1)
    }

    async fn received_count(&self, image_id: u32) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let count: i64 = conn
            .scard(self.received_key(image_id))
            .await
            .map_err(backend_err)?;
        Ok(count as u64)
    }

    async fn mark_completed(&self, image_id: u32) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        // NX: the first completion stamp wins on duplicate saves.
        let _set: bool = conn
            .set_nx(self.completed_key(image_id), Utc::now().to_rfc3339())
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn completed_at(&self, image_id: u32) -> Result<Option<DateTime<Utc>>, StoreError> {
        let mut conn = self.conn.clone();
        let stamp: Option<String> = conn
            .get(self.completed_key(image_id))
            .await
            .map_err(backend_err)?;
        match stamp {
            Some(stamp) => {
                let when = DateTime::parse_from_rfc3339(&stamp)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                Ok(Some(when.with_timezone(&Utc)))
            }
            None => Ok(None),
        }
    }

    async fn put_timings(&self, timings: &RunTimings) -> Result<(), StoreError> {
        let json =
            serde_json::to_string(timings).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(self.timing_key(), json, RECORD_TTL_SECS)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn timings(&self) -> Result<Option<RunTimings>, StoreError> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(self.timing_key()).await.map_err(backend_err)?;
        match json {
            Some(json) => {
                let timings =
                    serde_json::from_str(&json).map_err(|e| StoreError::Corrupt(e.to_string()))?;
                Ok(Some(timings))
            }
            None => Ok(None),
        }
    }
}

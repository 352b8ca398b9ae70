use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use core_config::{ConfigError, FromEnv, env_optional, env_or_default, env_parse};
use qdrant_client::qdrant::{
    self, CountPointsBuilder, CreateCollectionBuilder, Distance, PointId, PointStruct,
    ScrollPointsBuilder, SearchPointsBuilder, UpsertPointsBuilder, Value as QdrantValue,
    VectorParamsBuilder,
};
use qdrant_client::{Qdrant, QdrantError};

use super::{EngineError, EngineResult, StorageEngine};
use crate::models::{
    DistanceMetric, EngineHandle, InsertSummary, ResourceConfig, RowPage, SearchHit,
    SearchQuery, VectorRecord,
};
use uuid::Uuid;

/// Qdrant connection configuration
#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6334".to_string(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

impl FromEnv for QdrantConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            url: env_or_default("QDRANT_URL", &defaults.url),
            api_key: env_optional("QDRANT_API_KEY"),
            timeout_secs: env_parse("QDRANT_TIMEOUT_SECS", defaults.timeout_secs)?,
        })
    }
}

impl From<QdrantError> for EngineError {
    fn from(err: QdrantError) -> Self {
        EngineError::Unavailable(format!("Qdrant error: {}", err))
    }
}

const DATABASE_PREFIX: &str = "db:";
const COLLECTION_PREFIX: &str = "collection:";
const SCROLL_BATCH: u32 = 256;

/// Qdrant-backed engine.
///
/// A database is a namespace only and costs no remote call; each table is one
/// collection named after its tenant-qualified namespace.
pub struct QdrantEngine {
    client: Qdrant,
}

impl QdrantEngine {
    pub fn new(config: QdrantConfig) -> EngineResult<Self> {
        let mut builder = Qdrant::from_url(&config.url);

        if let Some(api_key) = config.api_key {
            builder = builder.api_key(api_key);
        }

        builder = builder.timeout(Duration::from_secs(config.timeout_secs));

        let client = builder
            .build()
            .map_err(|e| EngineError::Internal(format!("Failed to build client: {}", e)))?;

        Ok(Self { client })
    }

    pub fn from_client(client: Qdrant) -> Self {
        Self { client }
    }

    /// Verify the server answers.
    pub async fn health_check(&self) -> EngineResult<()> {
        self.client.health_check().await?;
        Ok(())
    }

    fn to_qdrant_distance(metric: DistanceMetric) -> Distance {
        match metric {
            DistanceMetric::Cosine => Distance::Cosine,
            DistanceMetric::L2 => Distance::Euclid,
            DistanceMetric::Dot => Distance::Dot,
        }
    }

    fn collection(handle: &EngineHandle) -> EngineResult<&str> {
        handle
            .as_str()
            .strip_prefix(COLLECTION_PREFIX)
            .ok_or_else(|| EngineError::NotFound(format!("{} is not a table", handle)))
    }

    fn point_id_to_string(point_id: &PointId) -> Option<String> {
        match &point_id.point_id_options {
            Some(qdrant::point_id::PointIdOptions::Uuid(uuid)) => Some(uuid.clone()),
            Some(qdrant::point_id::PointIdOptions::Num(num)) => Some(num.to_string()),
            None => None,
        }
    }

    #[allow(deprecated)]
    fn vector_from_output(vectors: Option<qdrant::VectorsOutput>) -> Vec<f32> {
        match vectors.and_then(|v| v.vectors_options) {
            Some(qdrant::vectors_output::VectorsOptions::Vector(v)) => v.data,
            Some(qdrant::vectors_output::VectorsOptions::Vectors(named)) => named
                .vectors
                .into_values()
                .next()
                .map(|v| v.data)
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    fn payload_to_qdrant(payload: Option<serde_json::Value>) -> HashMap<String, QdrantValue> {
        let Some(serde_json::Value::Object(map)) = payload else {
            return HashMap::new();
        };

        map.into_iter()
            .filter_map(|(key, val)| json_to_qdrant_value(val).map(|v| (key, v)))
            .collect()
    }

    fn qdrant_to_payload(payload: HashMap<String, QdrantValue>) -> Option<serde_json::Value> {
        if payload.is_empty() {
            return None;
        }

        let map: serde_json::Map<String, serde_json::Value> = payload
            .into_iter()
            .filter_map(|(key, val)| qdrant_value_to_json(val).map(|v| (key, v)))
            .collect();

        Some(serde_json::Value::Object(map))
    }
}

fn json_to_qdrant_value(val: serde_json::Value) -> Option<QdrantValue> {
    match val {
        serde_json::Value::Null => None,
        serde_json::Value::Bool(b) => Some(QdrantValue::from(b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Some(QdrantValue::from(i)),
            None => n.as_f64().map(QdrantValue::from),
        },
        serde_json::Value::String(s) => Some(QdrantValue::from(s)),
        // nested values are kept as their JSON text
        other => Some(QdrantValue::from(other.to_string())),
    }
}

fn qdrant_value_to_json(val: QdrantValue) -> Option<serde_json::Value> {
    use qdrant::value::Kind;

    match val.kind {
        Some(Kind::NullValue(_)) => Some(serde_json::Value::Null),
        Some(Kind::BoolValue(b)) => Some(serde_json::Value::Bool(b)),
        Some(Kind::IntegerValue(i)) => Some(serde_json::Value::Number(i.into())),
        Some(Kind::DoubleValue(f)) => serde_json::Number::from_f64(f).map(serde_json::Value::Number),
        Some(Kind::StringValue(s)) => Some(serde_json::Value::String(s)),
        _ => None,
    }
}

#[async_trait]
impl StorageEngine for QdrantEngine {
    async fn create_resource(
        &self,
        namespace: &str,
        config: &ResourceConfig,
    ) -> EngineResult<EngineHandle> {
        match config {
            ResourceConfig::Database { .. } => {
                Ok(EngineHandle(format!("{}{}", DATABASE_PREFIX, namespace)))
            }
            ResourceConfig::Table { dimension, metric } => {
                // A crash between engine create and the ready write leaves the
                // collection behind; a retried create adopts it.
                if !self.client.collection_exists(namespace).await? {
                    let builder = CreateCollectionBuilder::new(namespace).vectors_config(
                        VectorParamsBuilder::new(
                            u64::from(*dimension),
                            Self::to_qdrant_distance(*metric),
                        ),
                    );
                    self.client.create_collection(builder).await?;
                    tracing::info!(collection = %namespace, "Created Qdrant collection");
                }
                Ok(EngineHandle(format!("{}{}", COLLECTION_PREFIX, namespace)))
            }
        }
    }

    async fn drop_resource(&self, handle: &EngineHandle) -> EngineResult<()> {
        let Some(collection) = handle.as_str().strip_prefix(COLLECTION_PREFIX) else {
            return Ok(());
        };

        if self.client.collection_exists(collection).await? {
            self.client.delete_collection(collection).await?;
            tracing::info!(collection = %collection, "Deleted Qdrant collection");
        }
        Ok(())
    }

    async fn insert(
        &self,
        handle: &EngineHandle,
        rows: Vec<VectorRecord>,
    ) -> EngineResult<InsertSummary> {
        let collection = Self::collection(handle)?;
        let inserted = rows.len();

        let points: Vec<PointStruct> = rows
            .into_iter()
            .map(|row| {
                PointStruct::new(
                    PointId::from(row.id.to_string()),
                    row.vector,
                    Self::payload_to_qdrant(row.payload),
                )
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(collection, points).wait(true))
            .await?;

        Ok(InsertSummary { inserted })
    }

    async fn search(
        &self,
        handle: &EngineHandle,
        query: SearchQuery,
    ) -> EngineResult<Vec<SearchHit>> {
        let collection = Self::collection(handle)?;

        let builder =
            SearchPointsBuilder::new(collection, query.vector, u64::from(query.limit))
                .with_payload(true);

        let results = self.client.search_points(builder).await?;

        Ok(results
            .result
            .into_iter()
            .filter_map(|point| {
                let id = point.id.as_ref().and_then(Self::point_id_to_string)?;
                Some(SearchHit {
                    id,
                    score: point.score,
                    payload: Self::qdrant_to_payload(point.payload),
                })
            })
            .collect())
    }

    async fn scan(&self, handle: &EngineHandle, offset: u64, limit: u32) -> EngineResult<RowPage> {
        let collection = Self::collection(handle)?;

        let total_rows = self
            .client
            .count(CountPointsBuilder::new(collection).exact(true))
            .await?
            .result
            .map(|r| r.count)
            .unwrap_or_default();

        // Qdrant pages by point id, so the offset is walked batch by batch.
        let mut skip = offset;
        let mut rows = Vec::new();
        let mut cursor: Option<PointId> = None;
        while rows.len() < limit as usize && skip < total_rows {
            let mut builder = ScrollPointsBuilder::new(collection)
                .limit(SCROLL_BATCH)
                .with_payload(true)
                .with_vectors(true);
            if let Some(from) = cursor.take() {
                builder = builder.offset(from);
            }

            let page = self.client.scroll(builder).await?;
            let fetched = page.result.len() as u64;
            for point in page.result {
                if skip > 0 {
                    skip -= 1;
                    continue;
                }
                if rows.len() == limit as usize {
                    break;
                }
                let Some(id) = point
                    .id
                    .as_ref()
                    .and_then(Self::point_id_to_string)
                    .and_then(|id| Uuid::parse_str(&id).ok())
                else {
                    continue;
                };
                rows.push(VectorRecord {
                    id,
                    vector: Self::vector_from_output(point.vectors),
                    payload: Self::qdrant_to_payload(point.payload),
                });
            }

            match page.next_page_offset {
                Some(next) if fetched > 0 => cursor = Some(next),
                _ => break,
            }
        }

        Ok(RowPage {
            rows,
            total_rows,
            offset,
            limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qdrant_config_from_env() {
        temp_env::with_vars(
            [
                ("QDRANT_URL", Some("http://qdrant:6334")),
                ("QDRANT_API_KEY", None),
                ("QDRANT_TIMEOUT_SECS", Some("5")),
            ],
            || {
                let config = QdrantConfig::from_env().unwrap();
                assert_eq!(config.url, "http://qdrant:6334");
                assert!(config.api_key.is_none());
                assert_eq!(config.timeout_secs, 5);
            },
        );
    }

    #[test]
    fn test_payload_conversion_keeps_scalars() {
        let payload = serde_json::json!({"title": "doc", "rank": 3, "flag": true, "skip": null});
        let converted = QdrantEngine::payload_to_qdrant(Some(payload));
        assert_eq!(converted.len(), 3);

        let back = QdrantEngine::qdrant_to_payload(converted).unwrap();
        assert_eq!(back["title"], "doc");
        assert_eq!(back["rank"], 3);
    }

    #[test]
    fn test_missing_vectors_read_as_empty() {
        assert!(QdrantEngine::vector_from_output(None).is_empty());
    }

    #[test]
    fn test_database_handles_are_not_collections() {
        let handle = EngineHandle(format!("{}acme.db", DATABASE_PREFIX));
        assert!(QdrantEngine::collection(&handle).is_err());
    }
}

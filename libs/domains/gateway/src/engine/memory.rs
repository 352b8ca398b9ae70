use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{EngineError, EngineResult, StorageEngine};
use crate::models::{
    DistanceMetric, EngineHandle, InsertSummary, ResourceConfig, RowPage, SearchHit,
    SearchQuery, VectorRecord,
};

#[derive(Debug)]
enum Namespace {
    Database,
    Table {
        dimension: u32,
        metric: DistanceMetric,
        rows: HashMap<Uuid, VectorRecord>,
    },
}

/// Brute-force engine kept entirely in memory (for development/testing)
#[derive(Debug, Default, Clone)]
pub struct InMemoryEngine {
    namespaces: Arc<RwLock<HashMap<String, Namespace>>>,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of namespaces currently provisioned.
    pub async fn namespace_count(&self) -> usize {
        self.namespaces.read().await.len()
    }
}

/// Higher is closer for every metric, so hits sort the same way.
fn score(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    match metric {
        DistanceMetric::Dot => dot,
        DistanceMetric::Cosine => {
            let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm_a == 0.0 || norm_b == 0.0 {
                0.0
            } else {
                dot / (norm_a * norm_b)
            }
        }
        DistanceMetric::L2 => {
            let dist: f32 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
            -dist.sqrt()
        }
    }
}

#[async_trait]
impl StorageEngine for InMemoryEngine {
    async fn create_resource(
        &self,
        namespace: &str,
        config: &ResourceConfig,
    ) -> EngineResult<EngineHandle> {
        let mut namespaces = self.namespaces.write().await;
        let entry = match config {
            ResourceConfig::Database { .. } => Namespace::Database,
            ResourceConfig::Table { dimension, metric } => Namespace::Table {
                dimension: *dimension,
                metric: *metric,
                rows: HashMap::new(),
            },
        };
        namespaces.insert(namespace.to_string(), entry);

        tracing::debug!(namespace = %namespace, "Provisioned in-memory namespace");
        Ok(EngineHandle(namespace.to_string()))
    }

    async fn drop_resource(&self, handle: &EngineHandle) -> EngineResult<()> {
        self.namespaces.write().await.remove(handle.as_str());
        Ok(())
    }

    async fn insert(
        &self,
        handle: &EngineHandle,
        rows: Vec<VectorRecord>,
    ) -> EngineResult<InsertSummary> {
        let mut namespaces = self.namespaces.write().await;
        let Some(Namespace::Table {
            dimension,
            rows: stored,
            ..
        }) = namespaces.get_mut(handle.as_str())
        else {
            return Err(EngineError::NotFound(handle.to_string()));
        };

        if let Some(bad) = rows.iter().find(|r| r.vector.len() != *dimension as usize) {
            return Err(EngineError::Rejected(format!(
                "row {} has dimension {}, expected {}",
                bad.id,
                bad.vector.len(),
                dimension
            )));
        }

        let inserted = rows.len();
        stored.extend(rows.into_iter().map(|r| (r.id, r)));
        Ok(InsertSummary { inserted })
    }

    async fn search(
        &self,
        handle: &EngineHandle,
        query: SearchQuery,
    ) -> EngineResult<Vec<SearchHit>> {
        let namespaces = self.namespaces.read().await;
        let Some(Namespace::Table {
            dimension,
            metric,
            rows,
        }) = namespaces.get(handle.as_str())
        else {
            return Err(EngineError::NotFound(handle.to_string()));
        };

        if query.vector.len() != *dimension as usize {
            return Err(EngineError::Rejected(format!(
                "query has dimension {}, expected {}",
                query.vector.len(),
                dimension
            )));
        }

        let mut hits: Vec<SearchHit> = rows
            .values()
            .map(|r| SearchHit {
                id: r.id.to_string(),
                score: score(*metric, &query.vector, &r.vector),
                payload: r.payload.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        hits.truncate(query.limit as usize);
        Ok(hits)
    }

    async fn scan(&self, handle: &EngineHandle, offset: u64, limit: u32) -> EngineResult<RowPage> {
        let namespaces = self.namespaces.read().await;
        let Some(Namespace::Table { rows: stored, .. }) = namespaces.get(handle.as_str()) else {
            return Err(EngineError::NotFound(handle.to_string()));
        };

        let mut ids: Vec<&Uuid> = stored.keys().collect();
        ids.sort();

        let rows = ids
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(limit as usize)
            .filter_map(|id| stored.get(id).cloned())
            .collect();

        Ok(RowPage {
            rows,
            total_rows: stored.len() as u64,
            offset,
            limit,
        })
    }
}

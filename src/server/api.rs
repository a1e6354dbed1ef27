//! Diagnostics HTTP API.
//!
//! - GET /health
//! - GET /metrics
//! - GET /v1/memory/stats
//! - GET /v1/memory/detail
//! - GET /v1/memory/topn?n=N
//! - GET /v1/delvec/{tablet_id}/{segment_id}?version=N
//! - POST /v1/delvec/{tablet_id}/{segment_id}
//! - GET /v1/dcg/{tablet_id}/{segment_id}?version=N

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::UpdateError;
use crate::manager::UpdateManager;
use crate::mem_tracker::MemTracker;
use crate::reader::{
    DeltaColumnGroupLoader, DelvecLoader, LocalDeltaColumnGroupLoader, LocalDelvecLoader,
};
use crate::store::MetaStore;
use crate::types::{TabletId, TabletSegmentId};

/// Application state shared across handlers.
pub struct AppState {
    pub manager: Arc<UpdateManager>,
    pub store: Arc<dyn MetaStore>,
    pub delvec_loader: Arc<dyn DelvecLoader>,
    pub dcg_loader: Arc<dyn DeltaColumnGroupLoader>,
    pub start_time: Instant,
}

impl AppState {
    /// Serve reads of `store` through the caches of `manager`.
    pub fn new(manager: Arc<UpdateManager>, store: Arc<dyn MetaStore>) -> Self {
        Self {
            delvec_loader: Arc::new(LocalDelvecLoader::new(
                Arc::clone(&manager),
                Arc::clone(&store),
            )),
            dcg_loader: Arc::new(LocalDeltaColumnGroupLoader::new(
                Arc::clone(&manager),
                Some(Arc::clone(&store)),
            )),
            manager,
            store,
            start_time: Instant::now(),
        }
    }
}

/// Build the axum router with all diagnostics routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/memory/stats", get(memory_stats))
        .route("/v1/memory/detail", get(detail_memory_stats))
        .route("/v1/memory/topn", get(topn_memory_stats))
        .route("/v1/delvec/{tablet_id}/{segment_id}", get(get_del_vec).post(publish_del_vec))
        .route("/v1/dcg/{tablet_id}/{segment_id}", get(get_delta_column_group))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub keep_pindex_bf: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PoolStats {
    pub name: String,
    pub consumption: i64,
    pub peak: i64,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MemoryStatsResponse {
    pub summary: String,
    pub pools: Vec<PoolStats>,
    pub primary_index_num: usize,
    pub del_vector_num: usize,
    pub delta_column_group_num: usize,
}

#[derive(Debug, Deserialize)]
pub struct TopnParams {
    #[serde(default = "default_topn")]
    pub n: usize,
}

fn default_topn() -> usize {
    10
}

#[derive(Debug, Deserialize)]
pub struct VersionParams {
    #[serde(default = "default_version")]
    pub version: i64,
}

fn default_version() -> i64 {
    i64::MAX
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DelVectorResponse {
    pub tablet_id: TabletId,
    pub segment_id: u32,
    pub version: i64,
    pub cardinality: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishDelVectorRequest {
    pub version: i64,
    pub rows: Vec<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeltaColumnGroupResponse {
    pub tablet_id: TabletId,
    pub segment_id: u32,
    pub versions: Vec<i64>,
}

type ApiError = (StatusCode, String);

fn api_error(err: UpdateError) -> ApiError {
    let status = match &err {
        UpdateError::NotFound(_) => StatusCode::NOT_FOUND,
        UpdateError::InvariantViolation(_) => StatusCode::CONFLICT,
        UpdateError::MemoryLimitExceeded(_) => StatusCode::SERVICE_UNAVAILABLE,
        UpdateError::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(error = %err, "Request failed");
    (status, err.to_string())
}

fn pool(tracker: &MemTracker) -> PoolStats {
    PoolStats {
        name: tracker.label().to_string(),
        consumption: tracker.consumption(),
        peak: tracker.peak_consumption(),
        limit: tracker.limit(),
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        keep_pindex_bf: state.manager.keep_pindex_bf(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<String, (StatusCode, String)> {
    state.manager.metrics_text().map_err(|err| {
        warn!(error = %err, "Render metrics failed");
        (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    })
}

async fn memory_stats(State(state): State<Arc<AppState>>) -> Json<MemoryStatsResponse> {
    let mgr = &state.manager;
    let t = mgr.trackers();
    Json(MemoryStatsResponse {
        summary: mgr.memory_stats(),
        pools: [
            &t.update,
            &t.index_cache,
            &t.row_state,
            &t.column_state,
            &t.del_vec_cache,
            &t.delta_column_group_cache,
        ]
        .into_iter()
        .map(|tracker| pool(tracker))
        .collect(),
        primary_index_num: mgr.index_cache().object_size(),
        del_vector_num: mgr.del_vec_cache().len(),
        delta_column_group_num: mgr.delta_column_group_cache().len(),
    })
}

async fn detail_memory_stats(State(state): State<Arc<AppState>>) -> String {
    state.manager.detail_memory_stats()
}

async fn topn_memory_stats(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TopnParams>,
) -> String {
    state.manager.topn_memory_stats(params.n)
}

async fn get_del_vec(
    State(state): State<Arc<AppState>>,
    Path((tablet_id, segment_id)): Path<(TabletId, u32)>,
    Query(params): Query<VersionParams>,
) -> Result<Json<DelVectorResponse>, ApiError> {
    let tsid = TabletSegmentId::new(tablet_id, segment_id);
    let delvec = state.delvec_loader.load(tsid, params.version).map_err(api_error)?;
    Ok(Json(DelVectorResponse {
        tablet_id,
        segment_id,
        version: delvec.version(),
        cardinality: delvec.cardinality(),
    }))
}

/// Persist `rows` as deleted at a new version and publish it to the cache.
async fn publish_del_vec(
    State(state): State<Arc<AppState>>,
    Path((tablet_id, segment_id)): Path<(TabletId, u32)>,
    Json(req): Json<PublishDelVectorRequest>,
) -> Result<Json<DelVectorResponse>, ApiError> {
    let tsid = TabletSegmentId::new(tablet_id, segment_id);
    let mgr = &state.manager;
    let latest = mgr
        .get_latest_del_vec(state.store.as_ref(), tsid)
        .map_err(api_error)?;
    if req.version <= latest.version() {
        return Err(api_error(UpdateError::InvariantViolation(format!(
            "delete vector {tsid}: version {} <= latest {}",
            req.version,
            latest.version()
        ))));
    }
    let next = latest.add_dels_as_new_version(&req.rows, req.version);
    state.store.set_del_vector(tsid, &next).map_err(api_error)?;
    let cardinality = next.cardinality();
    mgr.set_cached_del_vec(tsid, Arc::new(next)).map_err(api_error)?;
    Ok(Json(DelVectorResponse {
        tablet_id,
        segment_id,
        version: req.version,
        cardinality,
    }))
}

async fn get_delta_column_group(
    State(state): State<Arc<AppState>>,
    Path((tablet_id, segment_id)): Path<(TabletId, u32)>,
    Query(params): Query<VersionParams>,
) -> Result<Json<DeltaColumnGroupResponse>, ApiError> {
    let tsid = TabletSegmentId::new(tablet_id, segment_id);
    let list = state.dcg_loader.load(tsid, params.version).map_err(api_error)?;
    Ok(Json(DeltaColumnGroupResponse {
        tablet_id,
        segment_id,
        versions: list.iter().map(|dcg| dcg.version()).collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::{Result, UpdateError};
    use crate::ingest::{PrimaryIndex, PrimaryIndexLoader, UpdateState, UpdateStateLoader};
    use crate::manager::Collaborators;
    use crate::store::fs::LocalFileSystem;
    use crate::store::memory::MemoryMetaStore;
    use crate::types::{DelVector, DeltaColumnGroup, Rowset, Tablet};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct NoLoad;

    impl PrimaryIndexLoader for NoLoad {
        fn load(&self, _tablet: &dyn Tablet, _keep_bf: bool) -> Result<Arc<dyn PrimaryIndex>> {
            Err(UpdateError::Uninitialized("no index".into()))
        }
    }

    impl UpdateStateLoader for NoLoad {
        fn load(
            &self,
            _tablet: &dyn Tablet,
            _rowset: &Rowset,
            _mem_tracker: &Arc<MemTracker>,
        ) -> Result<Box<dyn UpdateState>> {
            Err(UpdateError::Uninitialized("no state".into()))
        }
    }

    fn app() -> Router {
        app_with_store(MemoryMetaStore::shared())
    }

    fn app_with_store(store: Arc<MemoryMetaStore>) -> Router {
        let loaders = Arc::new(NoLoad);
        let manager = UpdateManager::new(
            Arc::new(Config::default()),
            &MemTracker::root("process", -1),
            Collaborators {
                index_loader: loaders.clone(),
                row_state_loader: loaders.clone(),
                column_state_loader: loaders,
                fs: Arc::new(LocalFileSystem),
            },
        )
        .unwrap();
        build_router(Arc::new(AppState::new(Arc::new(manager), store)))
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    async fn post_json(app: Router, uri: &str, body: &str) -> (StatusCode, String) {
        let req = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_body(app(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = serde_json::from_str(&body).unwrap();
        assert_eq!(health.status, "ok");
        assert!(health.keep_pindex_bf);
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let (status, body) = get_body(app(), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("update_primary_index_num"));
        assert!(body.contains("delta_column_group_get_total"));
    }

    #[tokio::test]
    async fn test_memory_stats() {
        let (status, body) = get_body(app(), "/v1/memory/stats").await;
        assert_eq!(status, StatusCode::OK);
        let stats: MemoryStatsResponse = serde_json::from_str(&body).unwrap();
        assert_eq!(stats.pools.len(), 6);
        assert_eq!(stats.pools[0].name, "update");
        assert!(stats.pools[0].limit.is_some());
        assert_eq!(stats.primary_index_num, 0);
    }

    #[tokio::test]
    async fn test_detail_and_topn() {
        let (status, body) = get_body(app(), "/v1/memory/detail").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.starts_with("primary index stats: total:0"));

        let (status, body) = get_body(app(), "/v1/memory/topn?n=3").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_get_del_vec() {
        let store = MemoryMetaStore::shared();
        let tsid = TabletSegmentId::new(3, 0);
        store.set_del_vector(tsid, &DelVector::from_rows(4, [1, 2, 3])).unwrap();
        let app = app_with_store(Arc::clone(&store));

        let (status, body) = get_body(app.clone(), "/v1/delvec/3/0?version=9").await;
        assert_eq!(status, StatusCode::OK);
        let dv: DelVectorResponse = serde_json::from_str(&body).unwrap();
        assert_eq!(dv.version, 4);
        assert_eq!(dv.cardinality, 3);

        get_body(app, "/v1/delvec/3/0?version=9").await;
        assert_eq!(store.del_vector_reads(), 1);
    }

    #[tokio::test]
    async fn test_publish_del_vec() {
        let store = MemoryMetaStore::shared();
        let app = app_with_store(Arc::clone(&store));

        let body = r#"{"version":2,"rows":[5,6]}"#;
        let (status, body) = post_json(app.clone(), "/v1/delvec/3/1", body).await;
        assert_eq!(status, StatusCode::OK);
        let dv: DelVectorResponse = serde_json::from_str(&body).unwrap();
        assert_eq!((dv.version, dv.cardinality), (2, 2));

        let body = r#"{"version":5,"rows":[6,7]}"#;
        let (status, body) = post_json(app.clone(), "/v1/delvec/3/1", body).await;
        assert_eq!(status, StatusCode::OK);
        let dv: DelVectorResponse = serde_json::from_str(&body).unwrap();
        assert_eq!((dv.version, dv.cardinality), (5, 3));

        let stale = r#"{"version":5,"rows":[8]}"#;
        let (status, _) = post_json(app.clone(), "/v1/delvec/3/1", stale).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, body) = get_body(app, "/v1/delvec/3/1").await;
        let dv: DelVectorResponse = serde_json::from_str(&body).unwrap();
        assert_eq!(dv.version, 5);
        let (persisted, latest) =
            store.get_del_vector(TabletSegmentId::new(3, 1), i64::MAX).unwrap();
        assert_eq!((persisted.version(), latest), (5, 5));
    }

    #[tokio::test]
    async fn test_get_delta_column_group() {
        let store = MemoryMetaStore::shared();
        let tsid = TabletSegmentId::new(8, 2);
        for (version, column, file) in [(3, 1, "a"), (7, 2, "b")] {
            let dcg = DeltaColumnGroup::new(version, vec![vec![column]], vec![file.to_string()]);
            store.put_delta_column_group(tsid, dcg);
        }
        let app = app_with_store(store);

        let (status, body) = get_body(app.clone(), "/v1/dcg/8/2?version=5").await;
        assert_eq!(status, StatusCode::OK);
        let resp: DeltaColumnGroupResponse = serde_json::from_str(&body).unwrap();
        assert_eq!(resp.versions, vec![3]);

        let (_, body) = get_body(app, "/v1/dcg/8/2").await;
        let resp: DeltaColumnGroupResponse = serde_json::from_str(&body).unwrap();
        assert_eq!(resp.versions, vec![7, 3]);
    }
}

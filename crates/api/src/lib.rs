use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use utoipa::{OpenApi, ToSchema};

use docsvc::{DocService, TagCategory};
use storage::{SearchHit, SqliteVfs, VfsError};
use vfs::{
    path as vpath, Direction, FileContent, Node, NodeId, OwnerId, PasteMode, SearchMode,
    SearchOrder, ADMIN,
};

// --- OpenAPI ---

#[derive(OpenApi)]
#[openapi(
    info(
        title = "docfs API",
        version = "0.1.0",
        description = "Database-backed virtual file system API"
    ),
    paths(openapi_spec),
    components(schemas(
        storage::SearchHit,
        docsvc::TagCategory,
        // Request types
        CreateFolderRequest,
        SaveFileRequest,
        ReadFileRequest,
        TreeRenderRequest,
        DeleteItemsRequest,
        PasteItemsRequest,
        MoveUpOrDownRequest,
        RenameRequest,
        SetPublicRequest,
        SearchTextRequest,
        TagsRequest,
        // Response types
        MessageResponse,
        CreateFolderResponse,
        ReadFileResponse,
        TreeItem,
        TreeRenderResponse,
        DeleteItemsResponse,
        PasteItemsResponse,
        OpResponse,
        SearchTextResponse,
        ExtractTagsResponse,
        ScanTagsResponse,
        HealthResponse,
        ErrorBody,
    ))
)]
pub struct ApiDoc;

/// Get OpenAPI specification
#[utoipa::path(
    get,
    path = "/api/openapi.json",
    responses(
        (status = 200, description = "OpenAPI JSON specification")
    ),
    tag = "docs"
)]
async fn openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

// --- App state ---

#[derive(Clone)]
pub struct AppState {
    pub svc: Arc<DocService<SqliteVfs>>,
    /// Configured document root keys; requests naming any other key are
    /// rejected before touching the store.
    pub roots: Arc<Vec<String>>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(svc: Arc<DocService<SqliteVfs>>, roots: Vec<String>) -> Self {
        Self {
            svc,
            roots: Arc::new(roots),
            start_time: Instant::now(),
        }
    }
}

// --- Principal ---

/// Acting principal, taken from the `x-owner-id` header the fronting
/// auth layer injects. Absent header means admin (local mode).
pub struct Principal(pub OwnerId);

#[async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match parts.headers.get("x-owner-id") {
            None => Ok(Principal(ADMIN)),
            Some(value) => {
                let owner = value
                    .to_str()
                    .ok()
                    .and_then(|s| s.trim().parse::<OwnerId>().ok())
                    .filter(|o| *o >= 0)
                    .ok_or_else(|| {
                        ApiError(VfsError::BadArgument(
                            "invalid x-owner-id header".to_string(),
                        ))
                    })?;
                Ok(Principal(owner))
            }
        }
    }
}

// --- Errors ---

#[derive(Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
}

/// Wire-side wrapper turning engine errors into status codes plus a
/// display-safe diagnostic body.
pub struct ApiError(pub VfsError);

impl From<VfsError> for ApiError {
    fn from(e: VfsError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            VfsError::NotFound => StatusCode::NOT_FOUND,
            VfsError::AlreadyExists(_) => StatusCode::CONFLICT,
            VfsError::InvalidName(_) | VfsError::InvalidPath(_) | VfsError::BadArgument(_) => {
                StatusCode::BAD_REQUEST
            }
            VfsError::Unauthorized => StatusCode::FORBIDDEN,
            VfsError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            VfsError::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            VfsError::Conflict(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(status = %status, "request failed: {}", self.0);
        }
        (status, Json(ErrorBody {
            error: self.0.to_string(),
        }))
            .into_response()
    }
}

fn require_root(state: &AppState, key: &str) -> Result<(), ApiError> {
    if state.roots.iter().any(|r| r == key) {
        Ok(())
    } else {
        Err(ApiError(VfsError::BadArgument(format!(
            "unknown document root: {}",
            key
        ))))
    }
}

fn require_tree_path(p: &str) -> Result<String, ApiError> {
    if vpath::valid_path(p) {
        Ok(vpath::normalize(p))
    } else {
        Err(ApiError(VfsError::InvalidPath(p.to_string())))
    }
}

// --- Request types ---

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateFolderRequest {
    pub folder_name: String,
    pub tree_folder: String,
    #[serde(default)]
    pub insert_after_node: Option<String>,
    pub doc_root_key: String,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SaveFileRequest {
    pub filename: String,
    pub content: String,
    pub tree_folder: String,
    pub doc_root_key: String,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReadFileRequest {
    pub path: String,
    pub doc_root_key: String,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TreeRenderRequest {
    pub tree_folder: String,
    pub doc_root_key: String,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeleteItemsRequest {
    pub paths: Vec<String>,
    pub doc_root_key: String,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PasteItemsRequest {
    pub dest_folder: String,
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub anchor_uuid: Option<NodeId>,
    #[schema(value_type = Vec<String>)]
    pub item_uuids: Vec<NodeId>,
    #[schema(value_type = String)]
    pub mode: PasteMode,
    pub doc_root_key: String,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MoveUpOrDownRequest {
    pub filename: String,
    pub tree_folder: String,
    #[schema(value_type = String)]
    pub direction: Direction,
    pub doc_root_key: String,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RenameRequest {
    pub old_path: String,
    pub new_path: String,
    pub doc_root_key: String,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SetPublicRequest {
    pub path: String,
    pub is_public: bool,
    #[serde(default)]
    pub recursive: bool,
    pub doc_root_key: String,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchTextRequest {
    #[serde(default)]
    pub query: String,
    pub tree_folder: String,
    pub doc_root_key: String,
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub search_mode: Option<SearchMode>,
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub search_order: Option<SearchOrder>,
}

#[derive(Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TagsRequest {
    #[serde(default)]
    pub doc_root_key: Option<String>,
}

// --- Response types ---

#[derive(Serialize, ToSchema)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateFolderResponse {
    pub message: String,
    pub folder_name: String,
    pub ordinal: i32,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReadFileResponse {
    pub path: String,
    /// Text verbatim; binary content base64-encoded.
    pub content: String,
    pub binary: bool,
    pub content_type: String,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TreeItem {
    #[schema(value_type = String)]
    pub uuid: NodeId,
    pub name: String,
    pub path: String,
    pub ordinal: i32,
    pub is_directory: bool,
    pub is_public: bool,
    pub is_binary: bool,
    pub content_type: String,
    pub size_bytes: i64,
    #[schema(value_type = String)]
    pub modified_time: DateTime<Utc>,
}

impl From<Node> for TreeItem {
    fn from(n: Node) -> Self {
        Self {
            path: n.full_path(),
            uuid: n.uuid,
            name: n.filename,
            ordinal: n.ordinal,
            is_directory: n.is_directory,
            is_public: n.is_public,
            is_binary: n.is_binary,
            content_type: n.content_type,
            size_bytes: n.size_bytes,
            modified_time: n.modified_time,
        }
    }
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TreeRenderResponse {
    pub parent: String,
    pub items: Vec<TreeItem>,
    pub count: usize,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeleteItemsResponse {
    pub message: String,
    pub deleted: u64,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PasteItemsResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moved: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copied: Option<usize>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OpResponse {
    pub success: bool,
    pub diagnostic: String,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchTextResponse {
    pub query: String,
    pub search_path: String,
    #[schema(value_type = String)]
    pub search_mode: SearchMode,
    pub result_count: usize,
    pub results: Vec<SearchHit>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtractTagsResponse {
    pub success: bool,
    pub tags: Vec<String>,
    pub categories: Vec<TagCategory>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScanTagsResponse {
    pub success: bool,
    pub message: String,
    pub existing_tags: usize,
    pub new_tags: usize,
    pub total_tags: usize,
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub version: String,
    pub roots: Vec<String>,
    pub backend: String,
}

// --- Handlers ---

async fn create_folder(
    State(state): State<AppState>,
    Principal(caller): Principal,
    Json(req): Json<CreateFolderRequest>,
) -> Result<(StatusCode, Json<CreateFolderResponse>), ApiError> {
    require_root(&state, &req.doc_root_key)?;
    let parent = require_tree_path(&req.tree_folder)?;
    let (_, ordinal) = state
        .svc
        .create_folder(
            caller,
            &parent,
            &req.folder_name,
            &req.doc_root_key,
            req.insert_after_node.as_deref(),
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateFolderResponse {
            message: "Folder created".to_string(),
            folder_name: req.folder_name,
            ordinal,
        }),
    ))
}

async fn save_file(
    State(state): State<AppState>,
    Principal(caller): Principal,
    Json(req): Json<SaveFileRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    require_root(&state, &req.doc_root_key)?;
    let parent = require_tree_path(&req.tree_folder)?;
    state
        .svc
        .save_file(caller, &parent, &req.filename, &req.doc_root_key, &req.content)
        .await?;
    Ok(Json(MessageResponse {
        message: "File saved".to_string(),
    }))
}

async fn read_file(
    State(state): State<AppState>,
    Principal(caller): Principal,
    Json(req): Json<ReadFileRequest>,
) -> Result<Json<ReadFileResponse>, ApiError> {
    require_root(&state, &req.doc_root_key)?;
    let path = require_tree_path(&req.path)?;
    let (node, content) = state.svc.read_file(caller, &path, &req.doc_root_key).await?;
    let (content, binary) = match content {
        FileContent::Text(text) => (text, false),
        FileContent::Binary(bytes) => (
            base64::engine::general_purpose::STANDARD.encode(bytes),
            true,
        ),
    };
    Ok(Json(ReadFileResponse {
        path,
        content,
        binary,
        content_type: node.content_type,
    }))
}

async fn tree_render(
    State(state): State<AppState>,
    Principal(caller): Principal,
    Json(req): Json<TreeRenderRequest>,
) -> Result<Json<TreeRenderResponse>, ApiError> {
    require_root(&state, &req.doc_root_key)?;
    let parent = require_tree_path(&req.tree_folder)?;
    let items: Vec<TreeItem> = state
        .svc
        .tree(caller, &parent, &req.doc_root_key)
        .await?
        .into_iter()
        .map(TreeItem::from)
        .collect();
    let count = items.len();
    Ok(Json(TreeRenderResponse {
        parent,
        items,
        count,
    }))
}

async fn delete_items(
    State(state): State<AppState>,
    Principal(caller): Principal,
    Json(req): Json<DeleteItemsRequest>,
) -> Result<Json<DeleteItemsResponse>, ApiError> {
    require_root(&state, &req.doc_root_key)?;
    for p in &req.paths {
        require_tree_path(p)?;
    }
    let deleted = state
        .svc
        .delete_items(caller, &req.paths, &req.doc_root_key)
        .await?;
    Ok(Json(DeleteItemsResponse {
        message: "Items deleted".to_string(),
        deleted,
    }))
}

async fn paste_items(
    State(state): State<AppState>,
    Principal(caller): Principal,
    Json(req): Json<PasteItemsRequest>,
) -> Result<Json<PasteItemsResponse>, ApiError> {
    require_root(&state, &req.doc_root_key)?;
    let dest = require_tree_path(&req.dest_folder)?;
    let count = state
        .svc
        .paste_items(
            caller,
            &dest,
            &req.doc_root_key,
            req.anchor_uuid,
            &req.item_uuids,
            req.mode,
        )
        .await?;
    let (moved, copied) = match req.mode {
        PasteMode::Move => (Some(count), None),
        PasteMode::Copy => (None, Some(count)),
    };
    Ok(Json(PasteItemsResponse {
        message: "Items pasted".to_string(),
        moved,
        copied,
    }))
}

async fn move_up_or_down(
    State(state): State<AppState>,
    Principal(caller): Principal,
    Json(req): Json<MoveUpOrDownRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    require_root(&state, &req.doc_root_key)?;
    let parent = require_tree_path(&req.tree_folder)?;
    state
        .svc
        .move_up_or_down(
            caller,
            &parent,
            &req.filename,
            &req.doc_root_key,
            req.direction,
        )
        .await?;
    Ok(Json(MessageResponse {
        message: "Files moved successfully".to_string(),
    }))
}

async fn rename(
    State(state): State<AppState>,
    Principal(caller): Principal,
    Json(req): Json<RenameRequest>,
) -> Result<Json<OpResponse>, ApiError> {
    require_root(&state, &req.doc_root_key)?;
    let old_path = require_tree_path(&req.old_path)?;
    let new_path = require_tree_path(&req.new_path)?;
    state
        .svc
        .rename_path(caller, &old_path, &new_path, &req.doc_root_key)
        .await?;
    Ok(Json(OpResponse {
        success: true,
        diagnostic: "renamed".to_string(),
    }))
}

async fn set_public(
    State(state): State<AppState>,
    Principal(caller): Principal,
    Json(req): Json<SetPublicRequest>,
) -> Result<Json<OpResponse>, ApiError> {
    require_root(&state, &req.doc_root_key)?;
    let path = require_tree_path(&req.path)?;
    state
        .svc
        .set_public_path(
            caller,
            &path,
            &req.doc_root_key,
            req.is_public,
            req.recursive,
        )
        .await?;
    Ok(Json(OpResponse {
        success: true,
        diagnostic: if req.is_public {
            "made public".to_string()
        } else {
            "made private".to_string()
        },
    }))
}

async fn search_text(
    State(state): State<AppState>,
    Principal(caller): Principal,
    Json(req): Json<SearchTextRequest>,
) -> Result<Json<SearchTextResponse>, ApiError> {
    require_root(&state, &req.doc_root_key)?;
    let scope = require_tree_path(&req.tree_folder)?;
    let mode = req.search_mode.unwrap_or_default();
    let order = req.search_order.unwrap_or_default();
    let results = state
        .svc
        .search(caller, &req.query, &scope, &req.doc_root_key, mode, order)
        .await?;
    Ok(Json(SearchTextResponse {
        result_count: results.len(),
        query: req.query,
        search_path: scope,
        search_mode: mode,
        results,
    }))
}

fn tags_root(state: &AppState, body: Option<Json<TagsRequest>>) -> Result<String, ApiError> {
    let requested = body.and_then(|Json(b)| b.doc_root_key);
    match requested {
        Some(key) => {
            require_root(state, &key)?;
            Ok(key)
        }
        None => state
            .roots
            .first()
            .cloned()
            .ok_or_else(|| ApiError(VfsError::BadArgument("no document roots configured".to_string()))),
    }
}

async fn extract_tags(
    State(state): State<AppState>,
    Principal(caller): Principal,
    body: Option<Json<TagsRequest>>,
) -> Result<Json<ExtractTagsResponse>, ApiError> {
    let root = tags_root(&state, body)?;
    let report = state.svc.extract_tags(caller, &root).await?;
    Ok(Json(ExtractTagsResponse {
        success: true,
        tags: report.tags,
        categories: report.categories,
    }))
}

async fn scan_and_update_tags(
    State(state): State<AppState>,
    Principal(caller): Principal,
    body: Option<Json<TagsRequest>>,
) -> Result<Json<ScanTagsResponse>, ApiError> {
    let root = tags_root(&state, body)?;
    let report = state.svc.scan_and_update_tags(caller, &root).await?;
    Ok(Json(ScanTagsResponse {
        success: true,
        message: format!("{} new tags discovered", report.new_tags),
        existing_tags: report.existing_tags,
        new_tags: report.new_tags,
        total_tags: report.total_tags,
    }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        roots: state.roots.as_ref().clone(),
        backend: "sqlite".to_string(),
    })
}

// --- Router ---

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/createFolder", post(create_folder))
        .route("/saveFile", post(save_file))
        .route("/readFile", post(read_file))
        .route("/treeRender", post(tree_render))
        .route("/deleteItems", post(delete_items))
        .route("/pasteItems", post(paste_items))
        .route("/moveUpOrDown", post(move_up_or_down))
        .route("/rename", post(rename))
        .route("/setPublic", post(set_public))
        .route("/searchText", post(search_text))
        .route("/extractTags", post(extract_tags))
        .route("/scanAndUpdateTags", post(scan_and_update_tags))
        .route("/health", get(health))
        .route("/openapi.json", get(openapi_spec));

    Router::new().nest("/api", api).layer(cors).with_state(state)
}

pub async fn serve(
    state: AppState,
    addr: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("api listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
}

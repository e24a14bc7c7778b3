//! HTTP endpoints exposing the derived mint state.

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{future::Future, net::SocketAddr, sync::Arc};
use tracing::{debug, warn};

use crate::{
    app::App,
    content::MintInfo,
    discussion::Thread,
    index::IndexStatus,
    mint::{MetaFilters, Mint, MintQuery},
    queue::{MetadataQueueHandle, QueueStatus, View},
    reactions::{ReactionCount, ReactionTarget},
    reviews::{ReviewPage, ReviewQuery, ReviewSort},
    uptime::UptimeReport,
};

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

#[derive(Clone)]
pub struct HttpState {
    pub app: Arc<App>,
    pub queue: MetadataQueueHandle,
}

/// Response body for the `/healthz` endpoint.
#[derive(Serialize, Deserialize)]
struct Health {
    /// Always "ok" when the server is running.
    status: String,
}

/// Service description served at `/`.
#[derive(Serialize, Deserialize)]
struct ServiceInfo {
    name: String,
    version: String,
    relays: Vec<String>,
}

#[derive(Serialize)]
struct StatusBody {
    index: IndexStatus,
    queue: QueueStatus,
}

/// URL parameters of the review listing.
#[derive(Deserialize, Default)]
struct ReviewParams {
    sort: Option<String>,
    rating: Option<u8>,
    page: Option<usize>,
    page_size: Option<usize>,
}

impl ReviewParams {
    fn into_query(self) -> Result<ReviewQuery, (StatusCode, String)> {
        let mut q = ReviewQuery::default();
        if let Some(sort) = self.sort {
            q.sort = sort
                .parse::<ReviewSort>()
                .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
        }
        q.rating = self.rating;
        q.page = self.page.unwrap_or(q.page);
        q.page_size = self.page_size.unwrap_or(q.page_size);
        Ok(q)
    }
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/", get(service_info))
        .route("/healthz", get(healthz))
        .route("/mints", get(list_mints))
        .route("/mints/:id", get(mint_detail))
        .route("/mints/:id/info", get(mint_info))
        .route("/mints/:id/uptime", get(mint_uptime))
        .route("/mints/:id/reviews", get(mint_reviews))
        .route("/mints/:id/comments", get(mint_comments))
        .route("/mints/:id/reactions", get(mint_reactions))
        .route("/meta-filters", get(meta_filters))
        .route("/status", get(status))
        .route("/view/:name", put(set_view))
        .with_state(Arc::new(state))
}

/// Serve the HTTP API until `shutdown` resolves.
pub async fn serve_http(
    addr: SocketAddr,
    state: HttpState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    debug!(%addr, "http listening");
    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn find_mint(state: &HttpState, id: &str) -> Result<Mint, (StatusCode, String)> {
    state
        .app
        .index
        .mint(id)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("unknown mint {id}")))
}

async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

async fn service_info(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(ServiceInfo {
            name: "cashumints".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            relays: state.app.settings.relays.clone(),
        }),
    )
}

/// Mints matching `network`, `nut` and the `q` search term.
async fn list_mints(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<MintQuery>,
) -> Json<Vec<Mint>> {
    let mints: Vec<Mint> = state
        .app
        .index
        .mints()
        .iter()
        .filter(|m| query.matches(m))
        .cloned()
        .collect();
    debug!(count = mints.len(), "GET /mints");
    Json(mints)
}

async fn mint_detail(State(state): State<Arc<HttpState>>, Path(id): Path<String>) -> ApiResult<Mint> {
    find_mint(&state, &id).map(Json)
}

async fn mint_info(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> ApiResult<MintInfo> {
    find_mint(&state, &id)?;
    state
        .app
        .index
        .get_mint_info(&id)
        .await
        .map(Json)
        .ok_or((StatusCode::BAD_GATEWAY, "mint info unavailable".into()))
}

async fn mint_uptime(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> ApiResult<UptimeReport> {
    let mint = find_mint(&state, &id)?;
    Ok(Json(state.app.uptime.uptime(&mint.url).await))
}

async fn mint_reviews(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
    Query(params): Query<ReviewParams>,
) -> ApiResult<ReviewPage> {
    let mint = find_mint(&state, &id)?;
    let query = params.into_query()?;
    Ok(Json(query.apply(&mint.recommendations)))
}

async fn mint_comments(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> ApiResult<Vec<Thread>> {
    let mint = find_mint(&state, &id)?;
    if let Err(e) = state.app.discussion.load(&mint).await {
        warn!(mint = %id, "loading comments failed: {e:#}");
        return Err((StatusCode::BAD_GATEWAY, format!("{e:#}")));
    }
    Ok(Json(state.app.discussion.threads(&id)))
}

async fn mint_reactions(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> ApiResult<Vec<ReactionCount>> {
    let mint = find_mint(&state, &id)?;
    state
        .app
        .reactions
        .load(&ReactionTarget::mint(&mint))
        .await
        .map(Json)
        .map_err(|e| (StatusCode::BAD_GATEWAY, format!("{e:#}")))
}

async fn meta_filters(State(state): State<Arc<HttpState>>) -> Json<MetaFilters> {
    Json(state.app.index.meta_filters())
}

async fn status(State(state): State<Arc<HttpState>>) -> Json<StatusBody> {
    Json(StatusBody {
        index: state.app.index.status(),
        queue: state.queue.status(),
    })
}

/// Record the view the client is showing; arms or disarms the metadata queue.
async fn set_view(State(state): State<Arc<HttpState>>, Path(name): Path<String>) -> StatusCode {
    let view = View::parse(&name);
    debug!(?view, armed = view.arms_queue(), "view changed");
    state.queue.set_view(&view);
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        app::tests::memory_app,
        index::tests::{announcement, review_event},
        queue::spawn_metadata_queue,
        source::tests::MemorySource,
    };
    use reqwest::{self, header::ACCESS_CONTROL_ALLOW_ORIGIN};
    use serde_json::Value;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::task;

    async fn spawn(state: HttpState) -> (String, task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = axum::serve(listener, router(state).into_make_service());
        let handle = task::spawn(async move {
            server.await.unwrap();
        });
        (format!("http://{addr}"), handle)
    }

    async fn loaded_state(dir: &TempDir) -> (HttpState, task::JoinHandle<()>) {
        let mut a = announcement("e1", "https://a.io", Some("a"));
        a.content = r#"{"name":"Alpha"}"#.into();
        let mut b = announcement("e2", "https://b.io", Some("b"));
        b.tags.push(crate::event::Tag::new(&["n", "testnet"]));
        let source = Arc::new(MemorySource::new(vec![
            a,
            b,
            review_event("r1", "x", "a", "[2/5] meh"),
            review_event("r2", "y", "a", "[5/5] great"),
        ]));
        let app = Arc::new(memory_app(dir.path(), source));
        app.index.load_mints().await.unwrap();
        let (queue, worker) = spawn_metadata_queue(app.index.clone(), Duration::from_millis(10));
        (HttpState { app, queue }, worker)
    }

    #[tokio::test]
    async fn health_and_service_info() {
        let dir = TempDir::new().unwrap();
        let (state, bg) = loaded_state(&dir).await;
        let (base, handle) = spawn(state).await;
        let body: Health = reqwest::get(format!("{base}/healthz"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body.status, "ok");

        let resp = reqwest::get(format!("{base}/")).await.unwrap();
        assert_eq!(
            resp.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
        let info: ServiceInfo = resp.json().await.unwrap();
        assert_eq!(info.name, "cashumints");
        handle.abort();
        bg.abort();
    }

    #[tokio::test]
    async fn mints_are_filtered_and_detailed() {
        let dir = TempDir::new().unwrap();
        let (state, bg) = loaded_state(&dir).await;
        let (base, handle) = spawn(state).await;

        let all: Vec<Value> = reqwest::get(format!("{base}/mints"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        let testnet: Vec<Value> = reqwest::get(format!("{base}/mints?network=testnet"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(testnet.len(), 1);
        assert_eq!(testnet[0]["id"], "b");
        let search: Vec<Value> = reqwest::get(format!("{base}/mints?q=alpha"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(search[0]["id"], "a");

        let detail: Value = reqwest::get(format!("{base}/mints/a"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(detail["rating"], 3.5);
        let missing = reqwest::get(format!("{base}/mints/zz")).await.unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

        let page: Value = reqwest::get(format!("{base}/mints/a/reviews?sort=lowest"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(page["total"], 2);
        assert_eq!(page["items"][0]["id"], "r1");
        let bad = reqwest::get(format!("{base}/mints/a/reviews?sort=random"))
            .await
            .unwrap();
        assert_eq!(bad.status(), reqwest::StatusCode::BAD_REQUEST);

        let uptime: UptimeReport = reqwest::get(format!("{base}/mints/a/uptime"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(uptime, UptimeReport::default());

        let info: Value = reqwest::get(format!("{base}/mints/a/info"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(info["name"], "Info a.io");
        handle.abort();
        bg.abort();
    }

    #[tokio::test]
    async fn view_arms_queue() {
        let dir = TempDir::new().unwrap();
        let (state, bg) = loaded_state(&dir).await;
        let queue = state.queue.clone();
        let (base, handle) = spawn(state).await;
        let client = reqwest::Client::new();

        let resp = client
            .put(format!("{base}/view/all-mints"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NO_CONTENT);
        let mut watch = queue.watch();
        tokio::time::timeout(Duration::from_secs(5), watch.wait_for(|s| s.armed))
            .await
            .unwrap()
            .unwrap();

        client
            .put(format!("{base}/view/settings"))
            .send()
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), watch.wait_for(|s| !s.armed))
            .await
            .unwrap()
            .unwrap();

        let status: Value = reqwest::get(format!("{base}/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["index"]["phase"], "success");
        assert_eq!(status["index"]["count"], 2);
        handle.abort();
        bg.abort();
    }
}

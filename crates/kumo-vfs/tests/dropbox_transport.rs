//! Dropbox transport against a mock of the Dropbox HTTP API.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use url::Url;

use kumo_vfs::vfs::{
    DropboxSettings, DropboxTransport, FindQuery, ScandirOptions, TransferOptions, UploadFile,
    UrlOptions,
};
use kumo_vfs::{
    Authorizer, Dispatcher, FileBlob, MountOptions, MountPoint, Registry, SessionStatus,
    Transport, VfsError, VfsResult, VirtualPath,
};

// ============================================================================
// Mock API
// ============================================================================

#[derive(Debug, Clone)]
enum Node {
    Folder,
    File(Vec<u8>),
}

#[derive(Default)]
struct Mock {
    /// Keyed by Dropbox path (`/docs/a.txt`).
    files: Mutex<BTreeMap<String, Node>>,
    expired: Mutex<HashSet<String>>,
    continue_calls: AtomicUsize,
    create_link_calls: AtomicUsize,
    revoke_calls: AtomicUsize,
}

type Shared = Arc<Mock>;

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

/// Reject requests without a live token.
fn auth(mock: &Mock, headers: &HeaderMap) -> Result<(), Response> {
    match bearer(headers) {
        Some(token) if mock.expired.lock().contains(&token) => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error_summary": "expired_access_token/",
                "error": { ".tag": "expired_access_token" }
            })),
        )
            .into_response()),
        Some(_) => Ok(()),
        None => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error_summary": "missing_token/" })),
        )
            .into_response()),
    }
}

fn conflict(summary: &str) -> Response {
    (
        StatusCode::CONFLICT,
        Json(json!({ "error_summary": summary })),
    )
        .into_response()
}

/// Untagged metadata, as `files/upload` returns it.
fn metadata(path: &str, node: &Node) -> Value {
    let name = path.rsplit('/').next().unwrap_or_default();
    match node {
        Node::Folder => json!({ "name": name, "path_display": path, "id": format!("id:{path}") }),
        Node::File(data) => json!({
            "name": name, "path_display": path, "id": format!("id:{path}"), "size": data.len()
        }),
    }
}

fn tagged(path: &str, node: &Node) -> Value {
    let mut value = metadata(path, node);
    let tag = match node {
        Node::Folder => "folder",
        Node::File(_) => "file",
    };
    value[".tag"] = json!(tag);
    value
}

fn api_arg(headers: &HeaderMap) -> Value {
    headers
        .get("dropbox-api-arg")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| serde_json::from_str(v).ok())
        .unwrap_or_default()
}

fn page(n: usize) -> Value {
    let entries: Vec<Value> = (0..100)
        .map(|i| {
            json!({
                ".tag": "file",
                "name": format!("f{n}-{i}.txt"),
                "path_display": format!("/f{n}-{i}.txt"),
                "id": format!("id:{n}-{i}"),
                "size": i,
            })
        })
        .collect();
    json!({ "entries": entries, "cursor": (n + 1).to_string(), "has_more": n < 2 })
}

async fn list_folder(State(mock): State<Shared>, headers: HeaderMap) -> Response {
    if let Err(r) = auth(&mock, &headers) {
        return r;
    }
    Json(page(0)).into_response()
}

async fn list_folder_continue(
    State(mock): State<Shared>,
    headers: HeaderMap,
    Json(args): Json<Value>,
) -> Response {
    if let Err(r) = auth(&mock, &headers) {
        return r;
    }
    mock.continue_calls.fetch_add(1, Ordering::SeqCst);
    let n: usize = args["cursor"].as_str().unwrap().parse().unwrap();
    Json(page(n)).into_response()
}

async fn get_metadata(
    State(mock): State<Shared>,
    headers: HeaderMap,
    Json(args): Json<Value>,
) -> Response {
    if let Err(r) = auth(&mock, &headers) {
        return r;
    }
    let path = args["path"].as_str().unwrap();
    match mock.files.lock().get(path) {
        Some(node) => Json(tagged(path, node)).into_response(),
        None => conflict("path/not_found/.."),
    }
}

async fn list_shared_links(
    State(mock): State<Shared>,
    headers: HeaderMap,
    Json(args): Json<Value>,
) -> Response {
    if let Err(r) = auth(&mock, &headers) {
        return r;
    }
    let links = match args["path"].as_str().unwrap() {
        "/a.txt" => json!([{
            "url": "https://www.dropbox.com/s/abc/a.txt?dl=0",
            "link_permissions": { "resolved_visibility": { ".tag": "public" } }
        }]),
        "/team.txt" => json!([{
            "url": "https://www.dropbox.com/s/team/team.txt?dl=0",
            "link_permissions": { "resolved_visibility": { ".tag": "team_only" } }
        }]),
        _ => json!([]),
    };
    Json(json!({ "links": links })).into_response()
}

async fn create_shared_link(
    State(mock): State<Shared>,
    headers: HeaderMap,
    Json(args): Json<Value>,
) -> Response {
    if let Err(r) = auth(&mock, &headers) {
        return r;
    }
    mock.create_link_calls.fetch_add(1, Ordering::SeqCst);
    let name = args["path"].as_str().unwrap().trim_start_matches('/');
    Json(json!({ "url": format!("https://www.dropbox.com/s/new/{name}?dl=0") })).into_response()
}

async fn space_usage(State(mock): State<Shared>, headers: HeaderMap) -> Response {
    if let Err(r) = auth(&mock, &headers) {
        return r;
    }
    Json(json!({ "used": 30, "allocation": { ".tag": "individual", "allocated": 100 } }))
        .into_response()
}

async fn download(State(mock): State<Shared>, headers: HeaderMap) -> Response {
    if let Err(r) = auth(&mock, &headers) {
        return r;
    }
    let arg = api_arg(&headers);
    let path = arg["path"].as_str().unwrap_or_default();
    match mock.files.lock().get(path) {
        Some(Node::File(data)) => data.clone().into_response(),
        _ => conflict("path/not_found/"),
    }
}

async fn upload(State(mock): State<Shared>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(r) = auth(&mock, &headers) {
        return r;
    }
    let arg = api_arg(&headers);
    assert_eq!(arg["mode"], "overwrite");
    let path = arg["path"].as_str().unwrap().to_string();
    let node = Node::File(body.to_vec());
    let response = metadata(&path, &node);
    mock.files.lock().insert(path, node);
    Json(response).into_response()
}

async fn create_folder(
    State(mock): State<Shared>,
    headers: HeaderMap,
    Json(args): Json<Value>,
) -> Response {
    if let Err(r) = auth(&mock, &headers) {
        return r;
    }
    let path = args["path"].as_str().unwrap().to_string();
    let mut files = mock.files.lock();
    if files.contains_key(&path) {
        return conflict("path/conflict/folder/..");
    }
    let response = json!({ "metadata": metadata(&path, &Node::Folder) });
    files.insert(path, Node::Folder);
    Json(response).into_response()
}

async fn delete(
    State(mock): State<Shared>,
    headers: HeaderMap,
    Json(args): Json<Value>,
) -> Response {
    if let Err(r) = auth(&mock, &headers) {
        return r;
    }
    let path = args["path"].as_str().unwrap();
    let mut files = mock.files.lock();
    let Some(node) = files.remove(path) else {
        return conflict("path_lookup/not_found/..");
    };
    let prefix = format!("{path}/");
    files.retain(|k, _| !k.starts_with(&prefix));
    Json(json!({ "metadata": tagged(path, &node) })).into_response()
}

/// `copy_v2` and `move_v2`.
fn relocate(mock: &Mock, args: &Value, keep_source: bool) -> Response {
    let from = args["from_path"].as_str().unwrap();
    let to = args["to_path"].as_str().unwrap();
    let mut files = mock.files.lock();
    if !files.contains_key(from) {
        return conflict("from_lookup/not_found/..");
    }
    if files.contains_key(to) {
        return conflict("to/conflict/file/..");
    }
    let prefix = format!("{from}/");
    let moved: Vec<(String, Node)> = files
        .iter()
        .filter(|(k, _)| k.as_str() == from || k.starts_with(&prefix))
        .map(|(k, n)| (format!("{to}{}", &k[from.len()..]), n.clone()))
        .collect();
    if !keep_source {
        files.retain(|k, _| k != from && !k.starts_with(&prefix));
    }
    let node = moved[0].1.clone();
    files.extend(moved);
    Json(json!({ "metadata": tagged(to, &node) })).into_response()
}

async fn copy(
    State(mock): State<Shared>,
    headers: HeaderMap,
    Json(args): Json<Value>,
) -> Response {
    if let Err(r) = auth(&mock, &headers) {
        return r;
    }
    relocate(&mock, &args, true)
}

async fn rename(
    State(mock): State<Shared>,
    headers: HeaderMap,
    Json(args): Json<Value>,
) -> Response {
    if let Err(r) = auth(&mock, &headers) {
        return r;
    }
    relocate(&mock, &args, false)
}

async fn search(
    State(mock): State<Shared>,
    headers: HeaderMap,
    Json(args): Json<Value>,
) -> Response {
    if let Err(r) = auth(&mock, &headers) {
        return r;
    }
    let query = args["query"].as_str().unwrap().to_lowercase();
    let scope = args["options"]["path"].as_str().unwrap_or_default().to_string();
    let max = args["options"]["max_results"].as_u64().unwrap() as usize;
    let matches: Vec<Value> = mock
        .files
        .lock()
        .iter()
        .filter(|(k, _)| k.starts_with(&format!("{scope}/")))
        .filter(|(k, _)| {
            let name = k.rsplit('/').next().unwrap_or_default();
            name.to_lowercase().contains(&query)
        })
        .take(max)
        .map(|(k, n)| {
            json!({
                "match_type": { ".tag": "filename" },
                "metadata": { ".tag": "metadata", "metadata": tagged(k, n) }
            })
        })
        .collect();
    Json(json!({ "matches": matches, "has_more": false })).into_response()
}

async fn revoke(State(mock): State<Shared>) -> Response {
    mock.revoke_calls.fetch_add(1, Ordering::SeqCst);
    Json(Value::Null).into_response()
}

async fn spawn_mock() -> (Shared, String) {
    let mock = Shared::default();
    mock.files
        .lock()
        .insert("/a.txt".to_string(), Node::File(b"hello".to_vec()));
    let app = Router::new()
        .route("/2/files/list_folder", post(list_folder))
        .route("/2/files/list_folder/continue", post(list_folder_continue))
        .route("/2/files/get_metadata", post(get_metadata))
        .route("/2/files/download", post(download))
        .route("/2/files/upload", post(upload))
        .route("/2/files/create_folder_v2", post(create_folder))
        .route("/2/files/delete_v2", post(delete))
        .route("/2/files/copy_v2", post(copy))
        .route("/2/files/move_v2", post(rename))
        .route("/2/files/search_v2", post(search))
        .route("/2/sharing/list_shared_links", post(list_shared_links))
        .route(
            "/2/sharing/create_shared_link_with_settings",
            post(create_shared_link),
        )
        .route("/2/users/get_space_usage", post(space_usage))
        .route("/2/auth/token/revoke", post(revoke))
        .with_state(mock.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (mock, format!("http://{addr}"))
}

// ============================================================================
// Fixtures
// ============================================================================

/// Hands out `tok1`, `tok2`, ... one per sign-in.
#[derive(Default)]
struct CountingAuthorizer {
    calls: AtomicUsize,
}

#[async_trait]
impl Authorizer for CountingAuthorizer {
    async fn authorize(&self, auth_url: Url) -> VfsResult<Url> {
        assert!(auth_url.query().unwrap().contains("response_type=token"));
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        // Long enough for concurrent callers to pile up behind this attempt.
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(Url::parse(&format!("http://localhost/cb#access_token=tok{n}&token_type=bearer")).unwrap())
    }
}

struct Fixture {
    mock: Shared,
    authorizer: Arc<CountingAuthorizer>,
    transport: Arc<DropboxTransport>,
    vfs: Dispatcher,
}

async fn fixture() -> Fixture {
    let (mock, base) = spawn_mock().await;
    let authorizer = Arc::new(CountingAuthorizer::default());
    let settings = DropboxSettings {
        client_key: Some("app-key".into()),
        api_base: base.clone(),
        content_base: base,
        auth_timeout_secs: 5,
        ..Default::default()
    };
    let transport = Arc::new(DropboxTransport::new(settings, authorizer.clone()).unwrap());

    let registry = Arc::new(Registry::new());
    let as_transport: Arc<dyn Transport> = transport.clone();
    registry
        .register(MountPoint::new("dropbox", as_transport, MountOptions::default()).unwrap())
        .unwrap();
    registry.mount("dropbox", None).await.unwrap();

    Fixture {
        mock,
        authorizer,
        transport,
        vfs: Dispatcher::new(registry).with_source("test"),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_mount_does_not_sign_in() {
    let f = fixture().await;
    assert!(f.vfs.registry().get("dropbox").unwrap().is_mounted());
    assert_eq!(f.authorizer.calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        f.transport.session().unwrap().status(),
        SessionStatus::Unauthenticated
    );
}

#[tokio::test]
async fn test_scandir_drains_every_page() {
    let f = fixture().await;
    let entries = f
        .vfs
        .scandir("dropbox:///", &ScandirOptions::default())
        .await
        .unwrap();

    assert_eq!(entries.len(), 300);
    assert_eq!(f.mock.continue_calls.load(Ordering::SeqCst), 2);
    assert_eq!(entries[0].path.to_string(), "dropbox:///f0-0.txt");
    assert_eq!(entries[299].id.as_deref(), Some("id:2-99"));
    assert!(entries.iter().all(|e| !e.is_backlink()));
}

#[tokio::test]
async fn test_concurrent_callers_share_one_sign_in() {
    let f = fixture().await;

    let calls = (0..5).map(|_| f.vfs.fileinfo("dropbox:///a.txt"));
    let results = futures::future::join_all(calls).await;

    for result in results {
        assert_eq!(result.unwrap().size, 5);
    }
    assert_eq!(f.authorizer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(f.transport.session().unwrap().attempts(), 1);
}

#[tokio::test]
async fn test_url_reuses_existing_link() {
    let f = fixture().await;

    let preview = f
        .vfs
        .url("dropbox:///a.txt", &UrlOptions { dl: Some(0) })
        .await
        .unwrap();
    assert_eq!(preview, "https://www.dropbox.com/s/abc/a.txt?dl=0");
    assert_eq!(f.mock.create_link_calls.load(Ordering::SeqCst), 0);

    let direct = f
        .vfs
        .url("dropbox:///a.txt", &UrlOptions { dl: Some(1) })
        .await
        .unwrap();
    assert_eq!(direct, "https://www.dropbox.com/s/abc/a.txt?dl=1");

    // Without a flag a reused link becomes a direct download.
    let default = f
        .vfs
        .url("dropbox:///a.txt", &UrlOptions::default())
        .await
        .unwrap();
    assert_eq!(default, "https://www.dropbox.com/s/abc/a.txt?dl=1");
    assert_eq!(f.mock.create_link_calls.load(Ordering::SeqCst), 0);

    let created = f
        .vfs
        .url("dropbox:///b.txt", &UrlOptions::default())
        .await
        .unwrap();
    assert_eq!(created, "https://www.dropbox.com/s/new/b.txt?dl=0");
    assert_eq!(f.mock.create_link_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_url_ignores_non_public_link() {
    let f = fixture().await;
    let url = f
        .vfs
        .url("dropbox:///team.txt", &UrlOptions { dl: Some(0) })
        .await
        .unwrap();
    assert_eq!(url, "https://www.dropbox.com/s/new/team.txt?dl=0");
    assert_eq!(f.mock.create_link_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_write_read_round_trip() {
    let f = fixture().await;
    let bytes: Vec<u8> = (0..=255u8).collect();
    let blob = FileBlob::new(bytes.clone(), "application/octet-stream");
    f.vfs.write("dropbox:///notes/a b.bin", blob).await.unwrap();
    assert!(f.mock.files.lock().contains_key("/notes/a b.bin"));

    let blob = f.vfs.read("dropbox:///notes/a b.bin").await.unwrap();
    assert_eq!(&blob.data[..], &bytes[..]);

    let info = f.vfs.fileinfo("dropbox:///notes/a b.bin").await.unwrap();
    assert_eq!(info.size, 256);
    assert_eq!(info.filename, "a b.bin");
}

#[tokio::test]
async fn test_upload_maps_untagged_response() {
    let f = fixture().await;
    let uploaded = f
        .vfs
        .upload(
            "dropbox:///docs",
            UploadFile::new("report.txt", FileBlob::new("report", "text/plain")),
            TransferOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(uploaded.path.to_string(), "dropbox:///docs/report.txt");
    assert_eq!(uploaded.size, 6);
    assert_eq!(uploaded.id.as_deref(), Some("id:/docs/report.txt"));
    assert!(!uploaded.is_dir());

    // A second upload without overwrite hits the guard.
    assert!(matches!(
        f.vfs
            .upload(
                "dropbox:///docs",
                UploadFile::new("report.txt", FileBlob::new("again", "text/plain")),
                TransferOptions::default(),
            )
            .await,
        Err(VfsError::Exists(_))
    ));
}

#[tokio::test]
async fn test_mkdir_twice_is_exists() {
    let f = fixture().await;
    f.vfs
        .mkdir("dropbox:///docs", TransferOptions::default())
        .await
        .unwrap();
    assert!(f.vfs.fileinfo("dropbox:///docs").await.unwrap().is_dir());

    assert!(matches!(
        f.vfs.mkdir("dropbox:///docs", TransferOptions::default()).await,
        Err(VfsError::Exists(_))
    ));
    // The provider's own conflict maps the same way.
    let docs = VirtualPath::parse("dropbox:///docs").unwrap();
    assert!(matches!(
        f.transport.mkdir(&docs).await,
        Err(VfsError::Exists(_))
    ));
}

#[tokio::test]
async fn test_copy_move_unlink() {
    let f = fixture().await;

    f.vfs
        .copy("dropbox:///a.txt", "dropbox:///b.txt", TransferOptions::default())
        .await
        .unwrap();
    f.vfs
        .rename("dropbox:///b.txt", "dropbox:///c.txt", TransferOptions::default())
        .await
        .unwrap();
    assert!(f.vfs.exists("dropbox:///a.txt").await.unwrap());
    assert!(!f.vfs.exists("dropbox:///b.txt").await.unwrap());
    assert_eq!(&f.vfs.read("dropbox:///c.txt").await.unwrap().data[..], b"hello");

    // Straight to the provider: an occupied target is a conflict.
    let a = VirtualPath::parse("dropbox:///a.txt").unwrap();
    let c = VirtualPath::parse("dropbox:///c.txt").unwrap();
    assert!(matches!(f.transport.copy(&a, &c).await, Err(VfsError::Exists(_))));

    f.vfs.unlink("dropbox:///a.txt").await.unwrap();
    assert!(!f.mock.files.lock().contains_key("/a.txt"));
    assert!(f.transport.unlink(&a).await.unwrap_err().is_not_found());
    assert!(f.transport.rename(&a, &c).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_find() {
    let f = fixture().await;
    f.vfs
        .write("dropbox:///docs/Report.txt", FileBlob::new("r", "text/plain"))
        .await
        .unwrap();
    f.vfs
        .write("dropbox:///docs/notes.md", FileBlob::new("n", "text/markdown"))
        .await
        .unwrap();

    let hits = f
        .vfs
        .find("dropbox:///", &FindQuery::new("report"))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].path.to_string(), "dropbox:///docs/Report.txt");
    assert_eq!(hits[0].mime.as_deref(), Some("text/plain"));
}

#[tokio::test]
async fn test_expired_token_forces_new_sign_in() {
    let f = fixture().await;
    assert_eq!(&f.vfs.read("dropbox:///a.txt").await.unwrap().data[..], b"hello");

    f.mock.expired.lock().insert("tok1".to_string());
    assert_eq!(
        f.vfs.read("dropbox:///a.txt").await.unwrap_err(),
        VfsError::AuthExpired
    );
    assert_eq!(
        f.transport.session().unwrap().status(),
        SessionStatus::Unauthenticated
    );

    // The next request signs in again and gets a fresh token.
    assert_eq!(&f.vfs.read("dropbox:///a.txt").await.unwrap().data[..], b"hello");
    assert_eq!(f.authorizer.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_errors_and_free_space() {
    let f = fixture().await;
    assert!(f.vfs.fileinfo("dropbox:///nope").await.unwrap_err().is_not_found());
    assert!(f.vfs.read("dropbox:///nope").await.unwrap_err().is_not_found());
    assert_eq!(f.vfs.free_space("dropbox:///").await.unwrap(), 70);
}

#[tokio::test]
async fn test_sign_out_unmounts() {
    let f = fixture().await;
    let mut events = f.vfs.subscribe("vfs.unmount");
    f.vfs.fileinfo("dropbox:///a.txt").await.unwrap();

    f.vfs.sign_out("dropbox").await.unwrap();

    assert_eq!(f.mock.revoke_calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        f.vfs.read("dropbox:///a.txt").await,
        Err(VfsError::NoMount(_))
    ));
    let event = events.recv().await.unwrap();
    assert_eq!(event.subject, "vfs.unmount");
    assert_eq!(event.sender.as_deref(), Some("test"));
}

#[tokio::test]
async fn test_missing_client_key_disables_mount() {
    let registry = Arc::new(Registry::new());
    let transport: Arc<dyn Transport> = Arc::new(
        DropboxTransport::new(DropboxSettings::default(), Arc::new(CountingAuthorizer::default()))
            .unwrap(),
    );
    registry
        .register(MountPoint::new("dropbox", transport, MountOptions::default()).unwrap())
        .unwrap();

    let vfs = Dispatcher::new(registry);
    assert!(matches!(
        vfs.read("dropbox:///a.txt").await,
        Err(VfsError::NoMount(_))
    ));
}

// tests/azure_backends.rs
//
// Key Vault, managed identity and Blob Storage clients against in-process
// stand-ins speaking the same REST shapes.

mod common;

use axum::{
    body::Bytes as AxumBytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use bytes::Bytes;
use chrono::TimeZone;
use common::serve;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use transit_feed_archiver::archive::blob::{BlobArchiveWriter, BlobAuth};
use transit_feed_archiver::identity::{ManagedIdentity, StaticToken, TokenSource, VAULT_RESOURCE};
use transit_feed_archiver::secrets::{CachedSecretProvider, KeyVaultSecretProvider, SecretProvider};
use transit_feed_archiver::{build_key, ArchiveWriter, IngestError};

fn bearer_is(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {token}"))
}

// ---- Key Vault ----

#[derive(Clone, Default)]
struct VaultState {
    hits: Arc<AtomicUsize>,
}

async fn get_secret(
    State(st): State<VaultState>,
    Path(name): Path<String>,
    Query(q): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    st.hits.fetch_add(1, Ordering::SeqCst);
    if !bearer_is(&headers, "vault-token") {
        return (StatusCode::UNAUTHORIZED, "missing bearer").into_response();
    }
    if q.get("api-version").map(String::as_str) != Some("7.4") {
        return (StatusCode::BAD_REQUEST, "api-version").into_response();
    }
    match name.as_str() {
        "delijn-api-key" => Json(json!({ "value": "kv-key", "id": "https://kv/secrets/delijn-api-key/1" })).into_response(),
        "empty" => Json(json!({ "value": "" })).into_response(),
        _ => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": { "code": "SecretNotFound" } })),
        )
            .into_response(),
    }
}

async fn vault() -> (String, VaultState) {
    let st = VaultState::default();
    let router = Router::new()
        .route("/secrets/{name}", get(get_secret))
        .with_state(st.clone());
    (serve(router).await, st)
}

fn kv(base: &str, name: &str) -> KeyVaultSecretProvider {
    KeyVaultSecretProvider::new(
        reqwest::Client::new(),
        format!("{base}/"),
        name,
        Arc::new(StaticToken::new("vault-token")),
    )
}

#[tokio::test]
async fn key_vault_resolves_named_secret() {
    let (base, _) = vault().await;
    let cred = kv(&base, "delijn-api-key").resolve().await.expect("secret");
    assert_eq!(cred.expose(), "kv-key");
}

#[tokio::test]
async fn missing_secret_is_secret_unavailable() {
    let (base, _) = vault().await;
    let err = kv(&base, "nope").resolve().await.unwrap_err();
    match err {
        IngestError::SecretUnavailable(msg) => assert!(msg.contains("404"), "{msg}"),
        other => panic!("expected SecretUnavailable, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_secret_value_is_secret_unavailable() {
    let (base, _) = vault().await;
    let err = kv(&base, "empty").resolve().await.unwrap_err();
    assert!(matches!(err, IngestError::SecretUnavailable(_)));
}

#[tokio::test]
async fn unreachable_vault_is_secret_unavailable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let err = kv(&format!("http://{addr}"), "delijn-api-key")
        .resolve()
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::SecretUnavailable(_)));
}

#[tokio::test]
async fn cached_key_vault_hits_the_store_once() {
    let (base, st) = vault().await;
    let cached = CachedSecretProvider::new(kv(&base, "delijn-api-key"));
    for _ in 0..3 {
        assert_eq!(cached.resolve().await.unwrap().expose(), "kv-key");
    }
    assert_eq!(st.hits.load(Ordering::SeqCst), 1);
}

// ---- managed identity ----

#[tokio::test]
async fn managed_identity_token_is_cached_per_resource() {
    let hits = Arc::new(AtomicUsize::new(0));
    let expires = (chrono::Utc::now().timestamp() + 3600).to_string();
    let router = Router::new().route(
        "/msi/token",
        get({
            let hits = hits.clone();
            move |headers: HeaderMap, Query(q): Query<HashMap<String, String>>| {
                let hits = hits.clone();
                let expires = expires.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    if !headers.get("x-identity-header").is_some_and(|v| v == "secret-header") {
                        return (StatusCode::UNAUTHORIZED, "no identity header").into_response();
                    }
                    let resource = q.get("resource").cloned().unwrap_or_default();
                    Json(json!({
                        "access_token": format!("tok-for-{resource}"),
                        "expires_on": expires,
                    }))
                    .into_response()
                }
            }
        }),
    );
    let base = serve(router).await;
    let mi = ManagedIdentity::app_service(
        reqwest::Client::new(),
        format!("{base}/msi/token"),
        "secret-header",
        None,
    );

    let a = mi.token(VAULT_RESOURCE).await.unwrap();
    let b = mi.token(VAULT_RESOURCE).await.unwrap();
    assert_eq!(a, "tok-for-https://vault.azure.net");
    assert_eq!(a, b);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let storage = mi.token("https://storage.azure.com/").await.unwrap();
    assert_eq!(storage, "tok-for-https://storage.azure.com/");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn imds_requires_metadata_header() {
    let router = Router::new().route(
        "/metadata/identity/oauth2/token",
        get(|headers: HeaderMap| async move {
            if headers.get("metadata").is_some_and(|v| v == "true") {
                Json(json!({ "access_token": "imds-tok", "expires_on": "9999999999" })).into_response()
            } else {
                (StatusCode::BAD_REQUEST, "Required metadata header not specified").into_response()
            }
        }),
    );
    let base = serve(router).await;
    let mi = ManagedIdentity::imds(
        reqwest::Client::new(),
        format!("{base}/metadata/identity/oauth2/token"),
        Some("client-id".into()),
    );
    assert_eq!(mi.token(VAULT_RESOURCE).await.unwrap(), "imds-tok");
}

// ---- blob storage ----

#[derive(Clone, Default)]
struct BlobState {
    puts: Arc<Mutex<Vec<(String, HeaderMap, Vec<u8>)>>>,
}

async fn put_blob(
    State(st): State<BlobState>,
    Path((container, blob)): Path<(String, String)>,
    Query(q): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: AxumBytes,
) -> Response {
    let sas_ok = q.get("sig").map(String::as_str) == Some("abc");
    if !bearer_is(&headers, "storage-token") && !sas_ok {
        return (StatusCode::FORBIDDEN, "AuthorizationPermissionMismatch").into_response();
    }
    if container != "lake" {
        return (StatusCode::NOT_FOUND, "ContainerNotFound").into_response();
    }
    let blob = blob.trim_start_matches('/').to_string();
    st.puts.lock().unwrap().push((blob, headers, body.to_vec()));
    (StatusCode::CREATED, [(header::ETAG, "\"0x8DC3D\"")]).into_response()
}

async fn blob_service() -> (String, BlobState) {
    let st = BlobState::default();
    let router = Router::new()
        .route("/{container}/{*blob}", put(put_blob))
        .with_state(st.clone());
    (serve(router).await, st)
}

fn reference_key() -> transit_feed_archiver::ArchiveKey {
    build_key(chrono::Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 33).unwrap())
}

#[tokio::test]
async fn blob_writer_puts_block_blob_with_identity_token() {
    let (base, st) = blob_service().await;
    let w = BlobArchiveWriter::new(
        reqwest::Client::new(),
        base,
        "lake",
        BlobAuth::Identity(Arc::new(StaticToken::new("storage-token"))),
    );

    let receipt = w
        .write(&reference_key(), Bytes::from_static(br#"{"ok":true}"#))
        .await
        .expect("write ok");

    assert_eq!(receipt.key.as_str(), "raw/2024/03/05/2024-03-05T14-07-33.json");
    assert_eq!(receipt.bytes, 11);
    assert_eq!(receipt.etag.as_deref(), Some("0x8DC3D"));

    let puts = st.puts.lock().unwrap();
    assert_eq!(puts.len(), 1);
    let (blob, headers, body) = &puts[0];
    assert_eq!(blob, "raw/2024/03/05/2024-03-05T14-07-33.json");
    assert_eq!(body.as_slice(), br#"{"ok":true}"#);
    assert_eq!(headers.get("x-ms-blob-type").unwrap(), "BlockBlob");
    assert!(headers.get("x-ms-version").is_some());
    assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "application/json");
}

#[tokio::test]
async fn blob_writer_overwrites_without_existence_check() {
    let (base, st) = blob_service().await;
    let w = BlobArchiveWriter::new(
        reqwest::Client::new(),
        base,
        "lake",
        BlobAuth::Sas("sv=2024&sig=abc".into()),
    );
    let key = reference_key();
    w.write(&key, Bytes::from_static(b"{\"v\":1}")).await.unwrap();
    w.write(&key, Bytes::from_static(b"{\"v\":2}")).await.unwrap();

    let puts = st.puts.lock().unwrap();
    assert_eq!(puts.len(), 2);
    assert!(puts.iter().all(|(blob, h, _)| blob == key.as_str() && h.get("if-none-match").is_none()));
}

#[tokio::test]
async fn blob_authorization_failure_is_storage_error() {
    let (base, _) = blob_service().await;
    let w = BlobArchiveWriter::new(
        reqwest::Client::new(),
        base,
        "lake",
        BlobAuth::Identity(Arc::new(StaticToken::new("expired"))),
    );
    let err = w.write(&reference_key(), Bytes::from_static(b"{}")).await.unwrap_err();
    match err {
        IngestError::Storage(msg) => assert!(msg.contains("authorization failed"), "{msg}"),
        other => panic!("expected Storage, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_container_is_storage_error() {
    let (base, _) = blob_service().await;
    let w = BlobArchiveWriter::new(
        reqwest::Client::new(),
        base,
        "does-not-exist",
        BlobAuth::Identity(Arc::new(StaticToken::new("storage-token"))),
    );
    let err = w.write(&reference_key(), Bytes::from_static(b"{}")).await.unwrap_err();
    match err {
        IngestError::Storage(msg) => assert!(msg.contains("container not found"), "{msg}"),
        other => panic!("expected Storage, got {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_blob_endpoint_does_not_leak_sas_token() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let w = BlobArchiveWriter::new(
        reqwest::Client::new(),
        format!("http://{addr}"),
        "lake",
        BlobAuth::Sas("sv=2024-08-04&sig=TOPSECRETSIG".into()),
    );
    let err = w.write(&reference_key(), Bytes::from_static(b"{}")).await.unwrap_err();
    let rendered = err.to_string();
    assert!(matches!(err, IngestError::Storage(_)), "got {err:?}");
    assert!(!rendered.contains("sig="), "{rendered}");
    assert!(!rendered.contains("TOPSECRETSIG"), "{rendered}");
    assert!(rendered.contains(reference_key().as_str()), "{rendered}");
}

//! Defines the SWORD v3 routes.
//!
//! ## Structure
//! - **Service**
//!   - `GET    /service-document` — service document
//!   - `POST   /service-document` — create a deposit
//!
//! - **Deposit**
//!   - `GET/POST/PUT/DELETE /deposit/{id}` — status document, append, replace, delete
//!   - `GET/POST/PUT/DELETE /deposit/{id}/metadata`
//!   - `POST/PUT/DELETE     /deposit/{id}/fileset`
//!   - `GET/PUT/DELETE      /deposit/{id}/file/{*key}`
//!
//! - **Segmented uploads**
//!   - `POST /staging` — initiate
//!   - `GET/POST/DELETE /staging/{id}` — inspect, upload a segment, abort
//!
//! The wildcard `*key` allows nested keys like `data/2025/img.jpg`.

use crate::{
    config::AppConfig,
    handlers::{
        deposit_handlers::{
            append_deposit, append_fileset, append_metadata, create_deposit, delete_deposit,
            delete_fileset, delete_metadata, get_metadata, get_service_document, get_status,
            replace_deposit, replace_fileset, replace_metadata,
        },
        file_handlers::{delete_file, get_file, put_file},
        health_handlers::{healthz, readyz},
        staging_handlers::{delete_staging, get_staging, init_staging, upload_segment},
    },
    services::{deposit_service::DepositService, storage_service::StorageService},
};
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub storage: StorageService,
    pub deposits: DepositService,
    pub config: Arc<AppConfig>,
}

/// Build and return the router for every SWORD route.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/service-document",
            get(get_service_document).post(create_deposit),
        )
        .route(
            "/deposit/{id}",
            get(get_status)
                .post(append_deposit)
                .put(replace_deposit)
                .delete(delete_deposit),
        )
        .route(
            "/deposit/{id}/metadata",
            get(get_metadata)
                .post(append_metadata)
                .put(replace_metadata)
                .delete(delete_metadata),
        )
        .route(
            "/deposit/{id}/fileset",
            post(append_fileset)
                .put(replace_fileset)
                .delete(delete_fileset),
        )
        .route(
            "/deposit/{id}/file/{*key}",
            get(get_file).put(put_file).delete(delete_file),
        )
        .route("/staging", post(init_staging))
        .route(
            "/staging/{id}",
            get(get_staging).post(upload_segment).delete(delete_staging),
        )
}

#[cfg(test)]
mod tests {
    use crate::{
        metadata::{MetadataFormat, SWORD_CONTEXT},
        models::tags::FileState,
        packaging::PackagingFormat,
        services::record_store,
        tasks::Task,
        test_helpers::{
            BASE_URL, BagBuilder, TestApp, body_bytes, body_json, path_of, test_app, test_app_with,
            zip_bytes,
        },
    };
    use axum::{
        body::Body,
        http::{Method, Request, StatusCode, header},
    };
    use bytes::Bytes;
    use futures::{StreamExt, stream};
    use serde_json::{Value, json};
    use std::{io, time::Duration};
    use tokio::sync::oneshot;
    use tower::ServiceExt;

    const ORIGINAL_DEPOSIT: &str = "http://purl.org/net/sword/3.0/terms/originalDeposit";
    const FILESET_FILE: &str = "http://purl.org/net/sword/3.0/terms/fileSetFile";

    fn request(
        method: Method,
        uri: &str,
        headers: &[(&str, &str)],
        body: impl Into<Body>,
    ) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(body.into()).unwrap()
    }

    /// Create a draft deposit holding one binary file and return its path.
    async fn binary_deposit(app: &TestApp, filename: &str, content: &'static str) -> String {
        let disposition = format!("attachment; filename={filename}");
        let response = app
            .send(request(
                Method::POST,
                "/service-document",
                &[
                    ("content-disposition", disposition.as_str()),
                    ("content-type", "text/plain"),
                    ("in-progress", "true"),
                ],
                content,
            ))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let location = response.headers()[header::LOCATION].to_str().unwrap().to_string();
        path_of(&location).to_string()
    }

    async fn status(app: &TestApp, deposit: &str) -> Value {
        let response = app
            .send(request(Method::GET, deposit, &[], Body::empty()))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        body_json(response).await
    }

    fn has_rel(link: &Value, rel: &str) -> bool {
        link["rel"].as_array().unwrap().iter().any(|r| r == rel)
    }

    /// Keys of the file-set links, sorted.
    fn fileset_keys(status: &Value) -> Vec<String> {
        let mut keys: Vec<String> = status["links"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|link| has_rel(link, FILESET_FILE))
            .map(|link| {
                let id = link["@id"].as_str().unwrap();
                id.split_once("/file/").unwrap().1.to_string()
            })
            .collect();
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn service_document_advertises_formats() {
        let app = test_app().await;
        let response = app
            .send(request(Method::GET, "/service-document", &[], Body::empty()))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/ld+json");
        let doc = body_json(response).await;
        assert_eq!(doc["@type"], "ServiceDocument");
        assert_eq!(doc["@id"], format!("{BASE_URL}/service-document"));
        assert_eq!(doc["acceptPackaging"].as_array().unwrap().len(), 3);
        assert_eq!(doc["staging"], format!("{BASE_URL}/staging"));
    }

    #[tokio::test]
    async fn health_endpoints_answer() {
        let app = test_app().await;
        let live = app.send(request(Method::GET, "/healthz", &[], Body::empty())).await;
        assert_eq!(live.status(), StatusCode::OK);
        let ready = app.send(request(Method::GET, "/readyz", &[], Body::empty())).await;
        assert_eq!(ready.status(), StatusCode::OK);
        assert_eq!(body_json(ready).await["checks"]["database"]["ok"], true);
    }

    #[tokio::test]
    async fn slow_upload_does_not_hold_up_other_deposits() {
        let app = test_app().await;
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let slow_body = stream::once(async move {
            let _ = started_tx.send(());
            Ok::<_, io::Error>(Bytes::from_static(b"first "))
        })
        .chain(stream::once(async move {
            let _ = release_rx.await;
            Ok::<_, io::Error>(Bytes::from_static(b"last"))
        }));
        let slow = tokio::spawn(app.router.clone().oneshot(request(
            Method::POST,
            "/service-document",
            &[
                ("content-disposition", "attachment; filename=slow.bin"),
                ("content-type", "application/octet-stream"),
                ("in-progress", "true"),
            ],
            Body::from_stream(slow_body),
        )));
        started_rx.await.unwrap();

        let fast = tokio::time::timeout(
            Duration::from_secs(2),
            app.send(request(
                Method::POST,
                "/service-document",
                &[
                    ("content-disposition", "attachment; filename=fast.bin"),
                    ("content-type", "application/octet-stream"),
                    ("in-progress", "true"),
                ],
                "x",
            )),
        )
        .await
        .expect("second deposit waited on the first upload");
        assert_eq!(fast.status(), StatusCode::CREATED);

        release_tx.send(()).unwrap();
        let slow = slow.await.unwrap().unwrap();
        assert_eq!(slow.status(), StatusCode::CREATED);
        let deposit = path_of(slow.headers()[header::LOCATION].to_str().unwrap()).to_string();
        let file = app
            .send(request(
                Method::GET,
                &format!("{deposit}/file/slow.bin"),
                &[],
                Body::empty(),
            ))
            .await;
        assert_eq!(body_bytes(file).await, b"first last");
    }

    #[tokio::test]
    async fn binary_deposit_is_both_original_and_fileset_file() {
        let app = test_app().await;
        let deposit = binary_deposit(&app, "hello.txt", "hello").await;

        let status = status(&app, &deposit).await;
        assert_eq!(status["@id"], format!("{BASE_URL}{deposit}"));
        assert_eq!(status["actions"]["appendFiles"], true);
        let links = status["links"].as_array().unwrap();
        let both: Vec<_> = links
            .iter()
            .filter(|link| has_rel(link, ORIGINAL_DEPOSIT) && has_rel(link, FILESET_FILE))
            .collect();
        assert_eq!(both.len(), 1);
        assert_eq!(links.len(), 1);

        let response = app
            .send(request(
                Method::GET,
                &format!("{deposit}/file/hello.txt"),
                &[],
                Body::empty(),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(body_bytes(response).await, b"hello");
    }

    #[tokio::test]
    async fn zip_deposit_is_unpacked_into_the_fileset() {
        let app = test_app().await;
        let archive = zip_bytes(&[("a.txt", b"a"), ("dir/b.txt", b"b")]);
        let response = app
            .send(request(
                Method::POST,
                "/service-document",
                &[
                    ("content-disposition", "attachment; filename=package.zip"),
                    ("content-type", "application/zip"),
                    ("packaging", PackagingFormat::SimpleZip.uri()),
                    ("in-progress", "true"),
                ],
                archive,
            ))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let status = body_json(response).await;

        assert_eq!(fileset_keys(&status), vec!["a.txt", "dir/b.txt"]);
        let originals: Vec<_> = status["links"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|link| has_rel(link, ORIGINAL_DEPOSIT))
            .collect();
        assert_eq!(originals.len(), 1);
        assert_eq!(originals[0]["packaging"], PackagingFormat::SimpleZip.uri());
    }

    #[tokio::test]
    async fn zip_bomb_is_refused_without_a_deposit() {
        let app = test_app_with(|config| config.max_unpacked_size = 16 * 1024).await;
        let zip_deposit = |archive: Vec<u8>| {
            request(
                Method::POST,
                "/service-document",
                &[
                    ("content-disposition", "attachment; filename=package.zip"),
                    ("content-type", "application/zip"),
                    ("packaging", PackagingFormat::SimpleZip.uri()),
                    ("in-progress", "true"),
                ],
                archive,
            )
        };

        let bomb = zip_bytes(&[("small.txt", vec![b'a'; 10]), ("big.bin", vec![0u8; 64 * 1024])]);
        let response = app.send(zip_deposit(bomb)).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body_json(response).await["@type"], "MaxUploadSizeExceeded");
        let mut conn = app.state.storage.db.acquire().await.unwrap();
        assert!(record_store::list_ids(&mut conn).await.unwrap().is_empty());

        let fits = zip_bytes(&[("a.txt", vec![b'a'; 8 * 1024])]);
        let response = app.send(zip_deposit(fits)).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(fileset_keys(&body_json(response).await), vec!["a.txt"]);
    }

    #[tokio::test]
    async fn zip_deposit_requires_zip_content_type() {
        let app = test_app().await;
        let response = app
            .send(request(
                Method::POST,
                "/service-document",
                &[
                    ("content-disposition", "attachment; filename=package.zip"),
                    ("content-type", "text/plain"),
                    ("packaging", PackagingFormat::SimpleZip.uri()),
                ],
                "not a zip",
            ))
            .await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(body_json(response).await["@type"], "ContentTypeNotAcceptable");
    }

    #[tokio::test]
    async fn bag_with_fetch_entries_is_rejected_without_a_deposit() {
        let app = test_app().await;
        let bag = BagBuilder::new()
            .payload("a.txt", b"alpha")
            .fetch("http://example.org/b.txt - data/b.txt")
            .build();
        let response = app
            .send(request(
                Method::POST,
                "/service-document",
                &[
                    ("content-disposition", "attachment; filename=bag.zip"),
                    ("content-type", "application/zip"),
                    ("packaging", PackagingFormat::SwordBagIt.uri()),
                ],
                bag,
            ))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["@type"], "ValidationFailed");
        assert!(body["timestamp"].is_string());

        let mut conn = app.state.storage.db.acquire().await.unwrap();
        assert!(record_store::list_ids(&mut conn).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bag_info_and_metadata_reach_the_status_document() {
        let app = test_app().await;
        let bag = BagBuilder::new()
            .payload("a.txt", b"alpha")
            .info("Source-Organization", "Example Org")
            .metadata(br#"{"dc:title": "From the bag"}"#)
            .build();
        let response = app
            .send(request(
                Method::POST,
                "/service-document",
                &[
                    ("content-disposition", "attachment; filename=bag.zip"),
                    ("content-type", "application/zip"),
                    ("packaging", PackagingFormat::SwordBagIt.uri()),
                    ("in-progress", "true"),
                ],
                bag,
            ))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let status = body_json(response).await;
        assert_eq!(status["bagitInfo"]["Source-Organization"], "Example Org");
        assert_eq!(fileset_keys(&status), vec!["a.txt"]);

        let metadata = app
            .send(request(
                Method::GET,
                &format!("{}/metadata", path_of(status["@id"].as_str().unwrap())),
                &[],
                Body::empty(),
            ))
            .await;
        assert_eq!(metadata.status(), StatusCode::OK);
        assert_eq!(body_json(metadata).await["dc:title"], "From the bag");
    }

    #[tokio::test]
    async fn metadata_appends_merge_and_reject_other_formats() {
        let app = test_app().await;
        let document = json!({
            "@context": SWORD_CONTEXT,
            "@type": "Metadata",
            "dc:title": "First",
            "dc:creator": "Someone",
        });
        let response = app
            .send(request(
                Method::POST,
                "/service-document",
                &[
                    ("content-disposition", "attachment; metadata=true"),
                    ("content-type", "application/ld+json"),
                    ("in-progress", "true"),
                ],
                document.to_string(),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let deposit = path_of(response.headers()[header::LOCATION].to_str().unwrap()).to_string();
        let metadata_path = format!("{deposit}/metadata");

        let response = app
            .send(request(
                Method::POST,
                &metadata_path,
                &[("content-type", "application/ld+json"), ("in-progress", "true")],
                json!({"dc:title": "Second"}).to_string(),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .send(request(
                Method::POST,
                &metadata_path,
                &[
                    ("content-type", "application/json"),
                    ("metadata-format", MetadataFormat::DublinCore.uri()),
                    ("in-progress", "true"),
                ],
                json!({"title": "Third"}).to_string(),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .send(request(Method::GET, &metadata_path, &[], Body::empty()))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["metadata-format"], MetadataFormat::Sword.uri());
        let stored = body_json(response).await;
        assert_eq!(stored["dc:title"], "Second");
        assert_eq!(stored["dc:creator"], "Someone");
        assert_eq!(stored["@id"], format!("{BASE_URL}{metadata_path}"));
    }

    #[tokio::test]
    async fn missing_metadata_is_not_found() {
        let app = test_app().await;
        let deposit = binary_deposit(&app, "a.txt", "a").await;
        let response = app
            .send(request(
                Method::GET,
                &format!("{deposit}/metadata"),
                &[],
                Body::empty(),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn fileset_put_replaces_and_post_appends() {
        let app = test_app().await;
        let deposit = binary_deposit(&app, "a.txt", "a").await;
        let fileset = format!("{deposit}/fileset");

        let response = app
            .send(request(
                Method::POST,
                &fileset,
                &[
                    ("content-disposition", "attachment; filename=b.txt"),
                    ("content-type", "text/plain"),
                    ("in-progress", "true"),
                ],
                "b",
            ))
            .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(fileset_keys(&status(&app, &deposit).await), vec!["a.txt", "b.txt"]);

        let response = app
            .send(request(
                Method::PUT,
                &fileset,
                &[
                    ("content-disposition", "attachment; filename=c.txt"),
                    ("content-type", "text/plain"),
                    ("in-progress", "true"),
                ],
                "c",
            ))
            .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(fileset_keys(&status(&app, &deposit).await), vec!["c.txt"]);

        let response = app
            .send(request(Method::GET, &format!("{deposit}/file/a.txt"), &[], Body::empty()))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn by_reference_deposit_schedules_one_fetch() {
        let app = test_app().await;
        let document = json!({
            "@context": SWORD_CONTEXT,
            "@type": "ByReference",
            "byReferenceFiles": [{
                "@id": "http://remote.example/data.bin",
                "contentDisposition": "attachment; filename=data.bin",
                "contentType": "application/octet-stream",
                "dereference": true
            }]
        });
        let response = app
            .send(request(
                Method::POST,
                "/service-document",
                &[
                    ("content-disposition", "attachment; by-reference=true"),
                    ("content-type", "application/ld+json"),
                    ("in-progress", "true"),
                ],
                document.to_string(),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let status = body_json(response).await;

        let tasks = app.scheduler.tasks();
        assert_eq!(tasks.len(), 1);
        assert!(matches!(tasks[0], Task::FetchByReference { .. }));
        let links = status["links"].as_array().unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0]["status"], FileState::Pending.uri());
    }

    #[tokio::test]
    async fn published_deposit_cannot_go_back_in_progress() {
        let app = test_app().await;
        let response = app
            .send(request(Method::POST, "/service-document", &[], Body::empty()))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let deposit = path_of(response.headers()[header::LOCATION].to_str().unwrap()).to_string();

        let response = app
            .send(request(
                Method::POST,
                &deposit,
                &[("in-progress", "true")],
                Body::empty(),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let status = status(&app, &deposit).await;
        assert_eq!(
            status["state"][0]["@id"],
            "http://purl.org/net/sword/3.0/state/ingested"
        );
        assert_eq!(status["actions"]["deleteObject"], false);
    }

    #[tokio::test]
    async fn unknown_deposits_are_not_found() {
        let app = test_app().await;
        for path in ["/deposit/1234", "/deposit/4f1a1c1e-0000-4000-8000-000000000000"] {
            let response = app.send(request(Method::GET, path, &[], Body::empty())).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            assert_eq!(response.headers()[header::CONTENT_TYPE], "application/ld+json");
            assert_eq!(body_json(response).await["@type"], "NotFound");
        }
    }

    #[tokio::test]
    async fn deleted_deposit_is_gone() {
        let app = test_app().await;
        let deposit = binary_deposit(&app, "a.txt", "a").await;
        let response = app
            .send(request(Method::DELETE, &deposit, &[], Body::empty()))
            .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = app.send(request(Method::GET, &deposit, &[], Body::empty())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn single_files_can_be_replaced_and_deleted() {
        let app = test_app().await;
        let deposit = binary_deposit(&app, "a.txt", "old").await;
        let file = format!("{deposit}/file/a.txt");

        let response = app
            .send(request(
                Method::PUT,
                &file,
                &[("content-type", "text/plain"), ("in-progress", "true")],
                "new",
            ))
            .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = app.send(request(Method::GET, &file, &[], Body::empty())).await;
        assert_eq!(body_bytes(response).await, b"new");

        let response = app.send(request(Method::DELETE, &file, &[], Body::empty())).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = app.send(request(Method::GET, &file, &[], Body::empty())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(fileset_keys(&status(&app, &deposit).await).is_empty());
    }

    #[tokio::test]
    async fn segmented_upload_feeds_a_by_reference_deposit() {
        let app = test_app().await;
        let response = app
            .send(request(
                Method::POST,
                "/staging",
                &[(
                    "content-disposition",
                    "segment-init; segment_count=2; segment_size=1024; size=1500",
                )],
                Body::empty(),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let staging_url = response.headers()[header::LOCATION].to_str().unwrap().to_string();
        let staging = path_of(&staging_url).to_string();

        let response = app
            .send(request(
                Method::POST,
                &staging,
                &[("content-disposition", "segment; segment_number=2")],
                vec![b'x'; 10],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["@type"], "InvalidSegmentSize");

        for (number, size) in [(1, 1024), (2, 476)] {
            let disposition = format!("segment; segment_number={number}");
            let response = app
                .send(request(
                    Method::POST,
                    &staging,
                    &[("content-disposition", disposition.as_str())],
                    vec![b'x'; size],
                ))
                .await;
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
        }
        let response = app.send(request(Method::GET, &staging, &[], Body::empty())).await;
        let temporary = body_json(response).await;
        assert_eq!(temporary["@type"], "Temporary");
        assert_eq!(temporary["segments"]["received"], json!([1, 2]));
        assert_eq!(temporary["segments"]["expecting"], json!([]));

        let document = json!({
            "@context": SWORD_CONTEXT,
            "@type": "ByReference",
            "byReferenceFiles": [{
                "@id": staging_url,
                "contentDisposition": "attachment; filename=big.bin",
                "contentType": "application/octet-stream",
                "dereference": true
            }]
        });
        let response = app
            .send(request(
                Method::POST,
                "/service-document",
                &[
                    ("content-disposition", "attachment; by-reference=true"),
                    ("content-type", "application/ld+json"),
                    ("in-progress", "true"),
                ],
                document.to_string(),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(app.scheduler.tasks().is_empty());
        let deposit = path_of(response.headers()[header::LOCATION].to_str().unwrap()).to_string();
        let response = app
            .send(request(Method::GET, &format!("{deposit}/file/big.bin"), &[], Body::empty()))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await.len(), 1500);
    }

    #[tokio::test]
    async fn bad_segment_init_lists_offending_parameters() {
        let app = test_app().await;
        let response = app
            .send(request(
                Method::POST,
                "/staging",
                &[("content-disposition", "segment-init; segment_count=2; size=100")],
                Body::empty(),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["@type"], "BadRequest");
        assert_eq!(body["errors"], json!(["segment_size"]));
    }
}

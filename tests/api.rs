#![cfg(unix)]

use std::{
    collections::HashMap,
    os::unix::fs::PermissionsExt,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
    routing::put,
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use ytdlp_audio_api::{AppState, Settings, build_router, jobs};

const FAKE_YTDLP: &str = r#"#!/bin/sh
state="@STATE@"
out=""; fmt=""; cookies=""; url=""; quality="best"
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    --audio-format) fmt="$2"; shift 2 ;;
    --audio-quality) quality="$2"; shift 2 ;;
    --cookies) cookies="$2"; shift 2 ;;
    --) url="$2"; shift 2 ;;
    *) shift ;;
  esac
done
echo "$url $quality" >> "$state/invocations"
if [ -n "$cookies" ]; then cp "$cookies" "$state/cookies-seen"; fi
marker="$state/running/$$"
touch "$marker"
ls "$state/running" | wc -l >> "$state/concurrency"
case "$url" in
  *fail*) rm -f "$marker"; echo "ERROR: [youtube] fail: Video unavailable" >&2; exit 1 ;;
  *slow*) sleep 0.3 ;;
esac
base="${out%'.%(ext)s'}"
printf 'fake-audio-%s' "$quality" > "$base.$fmt"
rm -f "$marker"
printf '{"title":"Test Clip","duration":212.5,"filepath":"%s"}\n' "$base.$fmt"
"#;

struct Harness {
    _dir: TempDir,
    state_dir: PathBuf,
    output_dir: PathBuf,
    app: Router,
}

impl Harness {
    fn invocations(&self) -> Vec<String> {
        std::fs::read_to_string(self.state_dir.join("invocations"))
            .unwrap_or_default()
            .lines()
            .map(ToString::to_string)
            .collect()
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn post_json(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(
            Request::post(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }
}

/// Builds the app against a fake `yt-dlp` with job workers running.
fn setup(overrides: &[(&str, &str)]) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join("state");
    let output_dir = dir.path().join("downloads");
    std::fs::create_dir_all(state_dir.join("running")).unwrap();
    std::fs::create_dir_all(&output_dir).unwrap();

    let script = dir.path().join("yt-dlp");
    std::fs::write(
        &script,
        FAKE_YTDLP.replace("@STATE@", &state_dir.to_string_lossy()),
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut vars: HashMap<String, String> = HashMap::from([
        ("YT_DLP_BINARY".to_string(), script.to_string_lossy().into_owned()),
        (
            "YT_DLP_OUTPUT_DIR".to_string(),
            output_dir.to_string_lossy().into_owned(),
        ),
        ("MIN_FREE_DISK_MB".to_string(), "0".to_string()),
    ]);
    for (key, value) in overrides {
        vars.insert(key.to_string(), value.to_string());
    }
    let settings = Settings::from_lookup(|name| vars.get(name).cloned()).unwrap();

    let (queue, receiver) = jobs::JobQueue::new();
    let workers = settings.max_concurrent_downloads;
    let state = AppState::new(settings, reqwest::Client::new(), queue).unwrap();
    jobs::spawn_workers(state.clone(), receiver, workers, CancellationToken::new());

    Harness {
        _dir: dir,
        state_dir,
        output_dir,
        app: build_router(state),
    }
}

fn multipart_request(uri: &str, fields: &[(&str, &str)], cookies: Option<&[u8]>) -> Request<Body> {
    let boundary = "----ytdlp-test-boundary";
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    if let Some(cookies) = cookies {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"cookies_file\"; filename=\"cookies.txt\"\r\nContent-Type: text/plain\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(cookies);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

    Request::post(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap()
}

type SeenUris = Arc<Mutex<Vec<String>>>;

async fn spawn_blob_mock() -> (String, SeenUris) {
    let seen: SeenUris = Arc::default();
    let recorder = Arc::clone(&seen);
    let app = Router::new().route(
        "/{*path}",
        put(move |request: axum::extract::Request| {
            let recorder = Arc::clone(&recorder);
            async move {
                let uri = request.uri().to_string();
                let _ = axum::body::to_bytes(request.into_body(), usize::MAX).await;
                let status = if uri.contains("restype=container") {
                    StatusCode::CONFLICT
                } else {
                    StatusCode::CREATED
                };
                recorder.lock().unwrap().push(uri);
                status
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    (format!("http://{addr}"), seen)
}

fn assert_uuid_filename(filename: &str, extension: &str) {
    let (stem, ext) = filename.split_once('.').unwrap();
    assert!(uuid::Uuid::parse_str(stem).is_ok(), "not a uuid stem: {filename}");
    assert_eq!(ext, extension);
}

#[tokio::test]
async fn health_reports_service() {
    let harness = setup(&[]);
    let (status, body) = harness.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "yt-dlp API");
}

#[tokio::test]
async fn download_produces_file_matching_reported_size() {
    let harness = setup(&[]);
    let (status, body) = harness
        .post_json(
            "/download",
            json!({"url": "https://www.youtube.com/watch?v=abc", "format": "mp3", "quality": "high"}),
        )
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["quality"], "high");
    assert_eq!(body["title"], "Test Clip");
    assert_eq!(body["duration"], 212.5);
    assert_eq!(body["blob_uploaded"], Value::Null);

    let filename = body["filename"].as_str().unwrap();
    assert_uuid_filename(filename, "mp3");
    let stored = harness.output_dir.join(filename);
    let content = std::fs::read(&stored).unwrap();
    assert_eq!(content, b"fake-audio-192K");
    assert_eq!(body["file_size"], content.len() as u64);

    assert_eq!(
        harness.invocations(),
        ["https://www.youtube.com/watch?v=abc 192K"]
    );
    let staging = std::fs::read_dir(harness.output_dir.join(".staging")).unwrap();
    assert_eq!(staging.count(), 0);
}

#[tokio::test]
async fn disallowed_domain_and_format_never_reach_the_tool() {
    let harness = setup(&[]);

    let (status, body) = harness
        .post_json("/download", json!({"url": "https://vimeo.com/123"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "URL domain not allowed");

    let (status, body) = harness
        .post_json(
            "/download",
            json!({"url": "https://youtube.com/watch?v=1", "format": "flac"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().starts_with("Format not allowed"));

    let (status, body) = harness
        .send(
            Request::post("/download")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid JSON body");

    assert!(harness.invocations().is_empty());
}

#[tokio::test]
async fn tool_failure_maps_to_extraction_failed() {
    let harness = setup(&[]);
    let (status, body) = harness
        .post_json("/download", json!({"url": "https://youtu.be/fail"}))
        .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "EXTRACTION_FAILED");
    assert!(body["error"].as_str().unwrap().contains("Video unavailable"));
    let produced = std::fs::read_dir(&harness.output_dir)
        .unwrap()
        .filter(|entry| !entry.as_ref().unwrap().file_name().to_string_lossy().starts_with('.'))
        .count();
    assert_eq!(produced, 0);
}

#[tokio::test]
async fn concurrent_extractions_never_exceed_the_limit() {
    let harness = setup(&[("MAX_CONCURRENT_DOWNLOADS", "2")]);

    let mut handles = Vec::new();
    for index in 0..5 {
        let app = harness.app.clone();
        handles.push(tokio::spawn(async move {
            let request = Request::post("/download")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({"url": format!("https://www.youtube.com/watch?v=slow{index}")})
                        .to_string(),
                ))
                .unwrap();
            app.oneshot(request).await.unwrap().status()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), StatusCode::OK);
    }

    let observed: Vec<usize> = std::fs::read_to_string(harness.state_dir.join("concurrency"))
        .unwrap()
        .lines()
        .map(|line| line.trim().parse().unwrap())
        .collect();
    assert_eq!(observed.len(), 5);
    assert!(observed.iter().all(|running| *running <= 2), "{observed:?}");
}

#[tokio::test]
async fn multipart_submission_passes_cookies_file() {
    let harness = setup(&[]);
    let cookies = b"# Netscape HTTP Cookie File\n.youtube.com\tTRUE\t/\tTRUE\t0\tSID\tabc\n";
    let (status, body) = harness
        .send(multipart_request(
            "/download",
            &[("url", "https://www.youtube.com/watch?v=form"), ("format", "M4A")],
            Some(cookies),
        ))
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_uuid_filename(body["filename"].as_str().unwrap(), "m4a");
    assert_eq!(body["quality"], "best");
    let seen = std::fs::read(harness.state_dir.join("cookies-seen")).unwrap();
    assert_eq!(seen, cookies);
}

#[tokio::test]
async fn oversized_cookies_file_is_rejected() {
    let harness = setup(&[]);
    let cookies = vec![b'x'; 64 * 1024 + 1];
    let (status, body) = harness
        .send(multipart_request(
            "/download",
            &[("url", "https://www.youtube.com/watch?v=form")],
            Some(&cookies),
        ))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Cookies file too large (>64KB)");
    assert!(harness.invocations().is_empty());
}

#[tokio::test]
async fn stored_file_can_be_fetched_and_deleted() {
    let harness = setup(&[]);
    let (_, body) = harness
        .post_json("/download", json!({"url": "https://www.youtube.com/watch?v=abc"}))
        .await;
    let filename = body["filename"].as_str().unwrap().to_string();

    let response = harness
        .app
        .clone()
        .oneshot(
            Request::get(format!("/download/{filename}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");
    assert!(
        response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .starts_with("attachment;")
    );
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"fake-audio-best");

    let (status, body) = harness
        .send(
            Request::delete(format!("/download/{filename}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"success": true, "message": "File deleted"}));
    assert!(!harness.output_dir.join(&filename).exists());

    let (status, _) = harness.get(&format!("/download/{filename}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = harness
        .send(
            Request::delete(format!("/download/{filename}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn non_uuid_filenames_are_rejected() {
    let harness = setup(&[]);
    std::fs::write(harness.output_dir.join("notes.mp3"), "x").unwrap();

    let (status, body) = harness.get("/download/notes.mp3").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid filename pattern");
    let (status, _) = harness
        .send(Request::delete("/download/notes.mp3").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(harness.output_dir.join("notes.mp3").exists());
}

#[tokio::test]
async fn upload_with_delete_local_removes_the_file() {
    let (endpoint, seen) = spawn_blob_mock().await;
    let harness = setup(&[
        ("AZURE_UPLOAD_ENABLED", "true"),
        ("AZURE_BLOB_ACCOUNT_URL", endpoint.as_str()),
        ("AZURE_SAS_TOKEN", "?sv=2022-11-02&sig=test"),
        ("AZURE_BLOB_PREFIX", "audio/"),
        ("AZURE_GENERATE_SAS", "true"),
        ("AZURE_DELETE_LOCAL_AFTER_UPLOAD", "true"),
    ]);

    let (status, body) = harness
        .post_json("/download", json!({"url": "https://www.youtube.com/watch?v=abc"}))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["blob_uploaded"], true);
    assert_eq!(body["blob_error"], Value::Null);
    assert_eq!(body["blob_sas_url"], Value::Null);

    let filename = body["filename"].as_str().unwrap();
    assert_eq!(
        body["blob_url"],
        format!("{endpoint}/audio-files/audio/{filename}")
    );
    assert!(
        seen.lock()
            .unwrap()
            .contains(&format!("/audio-files/audio/{filename}?sv=2022-11-02&sig=test"))
    );

    assert!(!harness.output_dir.join(filename).exists());
    let (status, _) = harness.get(&format!("/download/{filename}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn upload_enabled_without_credentials_still_succeeds() {
    let harness = setup(&[("AZURE_UPLOAD_ENABLED", "1")]);
    let (status, body) = harness
        .post_json("/download", json!({"url": "https://www.youtube.com/watch?v=abc"}))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["blob_uploaded"], false);
    assert!(
        body["blob_error"]
            .as_str()
            .unwrap()
            .starts_with("Azure upload enabled but missing credentials")
    );
    assert!(
        harness
            .output_dir
            .join(body["filename"].as_str().unwrap())
            .exists()
    );
}

#[tokio::test]
async fn readiness_follows_free_disk_threshold() {
    let harness = setup(&[]);
    let (status, body) = harness.get("/readiness").await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "ready");
    assert_eq!(body["min_required_mb"], 0);
    assert_eq!(body["concurrency_limit"], 3);
    assert_eq!(body["in_flight"], 0);

    let starved = setup(&[("MIN_FREE_DISK_MB", "999999999999")]);
    let (status, body) = starved.get("/readiness").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "Insufficient disk space");
    assert_eq!(body["code"], "NOT_READY");
}

#[tokio::test]
async fn readiness_fails_when_output_dir_is_unusable() {
    let harness = setup(&[]);
    // A regular file in place of the directory defeats root as well.
    std::fs::remove_dir_all(&harness.output_dir).unwrap();
    std::fs::write(&harness.output_dir, "not a directory").unwrap();

    let (status, body) = harness.get("/readiness").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "NOT_READY");
    assert!(
        body["error"]
            .as_str()
            .unwrap()
            .starts_with("Output directory unavailable"),
        "{body}"
    );
}

#[tokio::test]
async fn async_job_runs_to_completion() {
    let harness = setup(&[]);
    let (status, body) = harness
        .post_json(
            "/download/async",
            json!({"url": "https://www.youtube.com/watch?v=queued", "quality": "low"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let mut record = Value::Null;
    for _ in 0..100 {
        let (_, body) = harness.get(&format!("/download/async/{job_id}")).await;
        if body["status"] == "completed" || body["status"] == "error" {
            record = body;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(record["status"], "completed", "{record}");
    assert_eq!(record["id"], job_id.as_str());
    assert_eq!(record["result"]["quality"], "low");
    let filename = record["result"]["filename"].as_str().unwrap();
    assert!(harness.output_dir.join(filename).exists());

    let (status, list) = harness.get("/download/async?limit=5").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list[0]["id"], job_id.as_str());
}

#[tokio::test]
async fn failed_async_job_reports_error() {
    let harness = setup(&[]);
    let (_, body) = harness
        .send(multipart_request(
            "/download/async/form",
            &[("url", "https://youtu.be/fail")],
            None,
        ))
        .await;
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let mut record = Value::Null;
    for _ in 0..100 {
        let (_, body) = harness.get(&format!("/download/async/{job_id}")).await;
        if body["status"] == "error" {
            record = body;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(record["error"].as_str().unwrap().contains("Video unavailable"));
    assert_eq!(record["result"], Value::Null);
}

#[tokio::test]
async fn async_endpoints_validate_before_enqueueing() {
    let harness = setup(&[]);

    let (status, body) = harness
        .send(multipart_request("/download/async/form", &[("format", "mp3")], None))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "url field required");

    let (status, _) = harness
        .post_json("/download/async", json!({"url": "https://example.org/x"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = harness.get("/download/async/does-not-exist").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Job not found");

    let (_, list) = harness.get("/download/async").await;
    assert_eq!(list, json!([]));
    assert!(harness.invocations().is_empty());
}

#[tokio::test]
async fn form_path_reads_as_unknown_job() {
    let harness = setup(&[]);
    let (status, body) = harness.get("/download/async/form").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Job not found");
}

//! End-to-end HTTP tests with fake pipelines.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::http::{HeaderValue, StatusCode, header};
use axum_test::TestServer;
use musicgen_api::{
    Error, Result,
    api::create_router,
    artifact::ArtifactStore,
    config::{ImageConfig, MusicConfig, ServerConfig},
    manager::GenerationManager,
    pipeline::{AudioParams, GeneratedAudio, GeneratedImage, ImageParams, Pipeline},
    service::{GenerationService, ImageBackend},
};
use serde_json::{Value, json};

/// Returns a short sine burst, or fails when the prompt says so.
struct FakeMusic {
    calls: Arc<AtomicUsize>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl Pipeline for FakeMusic {
    type Params = AudioParams;
    type Output = GeneratedAudio;

    fn generate(&mut self, params: &AudioParams) -> Result<GeneratedAudio> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(params.prompt.clone());
        if params.prompt == "explode" {
            return Err(Error::Generation("decoder diverged".into()));
        }
        let samples = (0..3200).map(|i| (i as f32 * 0.05).sin() * 0.5).collect();
        Ok(GeneratedAudio {
            samples,
            sample_rate: 32000,
            channels: 1,
        })
    }
}

/// Returns a flat grey image of the requested size.
struct FakeImage {
    calls: Arc<AtomicUsize>,
    prompts: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

impl Pipeline for FakeImage {
    type Params = ImageParams;
    type Output = GeneratedImage;

    fn generate(&mut self, params: &ImageParams) -> Result<GeneratedImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap()
            .push((params.prompt.clone(), params.negative_prompt.clone()));
        Ok(GeneratedImage {
            width: params.width as u32,
            height: params.height as u32,
            pixels: vec![128; params.width * params.height * 3],
        })
    }
}

struct Harness {
    server: TestServer,
    music_calls: Arc<AtomicUsize>,
    image_calls: Arc<AtomicUsize>,
    music_prompts: Arc<Mutex<Vec<String>>>,
    image_prompts: Arc<Mutex<Vec<(String, Option<String>)>>>,
    _outputs: tempfile::TempDir,
}

impl Harness {
    fn outputs(&self) -> &Path {
        self._outputs.path()
    }
}

fn harness(image_available: bool) -> Harness {
    let outputs = tempfile::tempdir().unwrap();
    let music_calls = Arc::new(AtomicUsize::new(0));
    let image_calls = Arc::new(AtomicUsize::new(0));
    let music_prompts = Arc::new(Mutex::new(Vec::new()));
    let image_prompts = Arc::new(Mutex::new(Vec::new()));

    let music = GenerationManager::spawn(
        "music",
        FakeMusic {
            calls: music_calls.clone(),
            prompts: music_prompts.clone(),
        },
    )
    .unwrap();
    let image = if image_available {
        ImageBackend::Ready(
            GenerationManager::spawn(
                "image",
                FakeImage {
                    calls: image_calls.clone(),
                    prompts: image_prompts.clone(),
                },
            )
            .unwrap(),
        )
    } else {
        ImageBackend::Unavailable("download failed".into())
    };

    let store = ArtifactStore::new(outputs.path(), "http://localhost:8000/files");
    let service = Arc::new(GenerationService::new(
        music,
        image,
        store,
        MusicConfig::default(),
        ImageConfig::default(),
    ));
    let app = create_router(service, &ServerConfig::default().cors_origins).unwrap();

    Harness {
        server: TestServer::new(app).unwrap(),
        music_calls,
        image_calls,
        music_prompts,
        image_prompts,
        _outputs: outputs,
    }
}

fn content_type(response: &axum_test::TestResponse) -> Option<String> {
    response
        .headers()
        .get("content-type")
        .map(|v| v.to_str().unwrap().to_string())
}

#[tokio::test]
async fn test_root_reports_ok() {
    let h = harness(true);
    let response = h.server.get("/").await;
    response.assert_status(StatusCode::OK);
    response.assert_json(&json!({ "status": "ok", "docs": "/docs" }));

    let docs = h.server.get("/docs").await;
    docs.assert_status(StatusCode::OK);
    assert!(docs.json::<Value>()["endpoints"].as_array().unwrap().len() >= 4);
}

#[tokio::test]
async fn test_blank_prompts_are_rejected_before_inference() {
    let h = harness(true);

    for prompt in ["", "   ", "\n\t"] {
        let response = h
            .server
            .post("/generate-music")
            .json(&json!({ "prompt": prompt }))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
        response.assert_json(&json!({ "detail": "prompt is required" }));

        let response = h
            .server
            .post("/generate-image")
            .json(&json!({ "prompt": prompt }))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }

    assert_eq!(h.music_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.image_calls.load(Ordering::SeqCst), 0);
    assert_eq!(std::fs::read_dir(h.outputs()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_prompts_reach_pipelines_untrimmed() {
    let h = harness(true);

    let response = h
        .server
        .post("/generate-music")
        .json(&json!({ "prompt": "  padded  " }))
        .await;
    response.assert_status(StatusCode::OK);
    assert_eq!(*h.music_prompts.lock().unwrap(), vec!["  padded  ".to_string()]);

    for body in [
        json!({ "prompt": "\tfox ", "negative_prompt": " blurry, low quality " }),
        json!({ "prompt": "fox" }),
    ] {
        h.server
            .post("/generate-image")
            .json(&body)
            .await
            .assert_status(StatusCode::OK);
    }
    assert_eq!(
        *h.image_prompts.lock().unwrap(),
        vec![
            ("\tfox ".to_string(), Some(" blurry, low quality ".to_string())),
            ("fox".to_string(), None),
        ]
    );
}

#[tokio::test]
async fn test_generate_music_writes_readable_wav() {
    let h = harness(true);
    let response = h
        .server
        .post("/generate-music")
        .json(&json!({ "prompt": "lofi hip hop with warm piano" }))
        .await;
    response.assert_status(StatusCode::OK);

    let body = response.json::<Value>();
    assert_eq!(body["seconds"], 10);
    assert!(body["seed"].as_u64().unwrap() <= u32::MAX as u64);

    let filename = body["filename"].as_str().unwrap();
    assert!(filename.starts_with("music_") && filename.ends_with(".wav"));
    assert_eq!(
        body["fileUrl"],
        format!("http://localhost:8000/files/{filename}")
    );

    let reader = hound::WavReader::open(body["file"].as_str().unwrap()).unwrap();
    assert_eq!(reader.spec().sample_rate, 32000);
    assert_eq!(reader.spec().channels, 1);
    assert_eq!(reader.spec().bits_per_sample, 16);
    assert_eq!(reader.len(), 3200);

    let file = h.server.get(&format!("/files/{filename}")).await;
    file.assert_status(StatusCode::OK);
    assert_eq!(content_type(&file).as_deref(), Some("audio/wav"));
    assert_eq!(
        file.headers()
            .get("content-disposition")
            .map(|v| v.to_str().unwrap()),
        Some(format!("attachment; filename=\"{filename}\"").as_str())
    );
    assert_eq!(&file.as_bytes()[0..4], b"RIFF");
}

#[tokio::test]
async fn test_music_failure_is_reported_as_500() {
    let h = harness(true);
    let response = h
        .server
        .post("/generate-music")
        .json(&json!({ "prompt": "explode" }))
        .await;
    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    response.assert_json(&json!({ "detail": "Error generating music: decoder diverged" }));

    // The worker keeps serving afterwards.
    let response = h
        .server
        .post("/generate-music")
        .json(&json!({ "prompt": "calm" }))
        .await;
    response.assert_status(StatusCode::OK);
    assert_eq!(h.music_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_generate_image_writes_png() {
    let h = harness(true);
    let response = h
        .server
        .post("/generate-image")
        .json(&json!({ "prompt": "a watercolor fox", "negative_prompt": "blurry" }))
        .await;
    response.assert_status(StatusCode::OK);

    let body = response.json::<Value>();
    assert_eq!(body["width"], 256);
    assert_eq!(body["height"], 256);
    assert_eq!(body["steps"], 8);

    let filename = body["filename"].as_str().unwrap();
    let seed = body["seed"].as_u64().unwrap();
    assert!(filename.starts_with("img_") && filename.ends_with(&format!("_{seed}.png")));

    let decoded = image::open(body["file"].as_str().unwrap()).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (256, 256));

    let file = h.server.get(&format!("/files/{filename}")).await;
    file.assert_status(StatusCode::OK);
    assert_eq!(content_type(&file).as_deref(), Some("image/png"));
}

#[tokio::test]
async fn test_rapid_image_requests_get_distinct_files() {
    let h = harness(true);
    let mut names = Vec::new();
    for _ in 0..2 {
        let response = h
            .server
            .post("/generate-image")
            .json(&json!({ "prompt": "a lighthouse at dusk" }))
            .await;
        response.assert_status(StatusCode::OK);
        names.push(response.json::<Value>()["filename"].as_str().unwrap().to_string());
    }
    assert_ne!(names[0], names[1]);
    for name in &names {
        assert!(h.outputs().join(name).is_file());
    }
}

#[tokio::test]
async fn test_unavailable_image_model_never_invokes_inference() {
    let h = harness(false);
    for _ in 0..2 {
        let response = h
            .server
            .post("/generate-image")
            .json(&json!({ "prompt": "a cat" }))
            .await;
        response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        let detail = response.json::<Value>()["detail"].as_str().unwrap().to_string();
        assert!(detail.starts_with("Image model not loaded"), "{detail}");
    }
    assert_eq!(h.image_calls.load(Ordering::SeqCst), 0);

    // Music is unaffected.
    let response = h
        .server
        .post("/generate-music")
        .json(&json!({ "prompt": "still works" }))
        .await;
    response.assert_status(StatusCode::OK);
}

#[tokio::test]
async fn test_files_not_found() {
    let h = harness(true);
    for path in ["/files/missing.wav", "/files/..%2Fsecret.wav"] {
        let response = h.server.get(path).await;
        response.assert_status(StatusCode::NOT_FOUND);
    }
    let response = h.server.get("/files/missing.png").await;
    response.assert_json(&json!({ "detail": "File not found" }));
}

#[tokio::test]
async fn test_files_media_types() {
    let h = harness(true);
    std::fs::write(h.outputs().join("cover.jpg"), b"jpeg").unwrap();
    std::fs::write(h.outputs().join("notes.txt"), b"text").unwrap();

    let response = h.server.get("/files/cover.jpg").await;
    response.assert_status(StatusCode::OK);
    assert_eq!(content_type(&response).as_deref(), Some("image/jpeg"));

    let response = h.server.get("/files/notes.txt").await;
    response.assert_status(StatusCode::OK);
    assert_eq!(
        content_type(&response).as_deref(),
        Some("application/octet-stream")
    );
    assert_eq!(response.text(), "text");
}

#[tokio::test]
async fn test_cors_allows_frontend_origin() {
    let h = harness(true);
    let response = h
        .server
        .get("/")
        .add_header(header::ORIGIN, HeaderValue::from_static("http://localhost:3000"))
        .await;
    response.assert_status(StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .map(|v| v.to_str().unwrap()),
        Some("http://localhost:3000")
    );
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-credentials")
            .map(|v| v.to_str().unwrap()),
        Some("true")
    );

    let response = h
        .server
        .get("/")
        .add_header(header::ORIGIN, HeaderValue::from_static("http://evil.example"))
        .await;
    assert!(response.headers().get("access-control-allow-origin").is_none());
}

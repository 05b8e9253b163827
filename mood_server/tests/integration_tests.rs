use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{bail, Result};
use axum::{
    extract::{Path, Query},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use common::protocol::{
    DetectReport, ErrorBody, Expression, ExpressionScores, Song, SongsResponse, SongsView,
    StatusView,
};
use image::{Rgb, RgbImage};
use mood_server::{
    app::{MoodApp, FAILURE_MESSAGE, NO_FACE_MESSAGE},
    endpoints::router,
    frames::FrameHub,
    nn::{ExpressionDetector, FaceExpression},
    player::{AudioOutput, PlayerEvent},
    playlist::PlaybackToken,
    songs::SongsClient,
};

/// Detector returning a fixed outcome after an optional delay.
struct FakeDetector {
    mood: Option<Expression>,
    delay: Duration,
}

impl ExpressionDetector for FakeDetector {
    fn detect(&self, frame: &RgbImage) -> Result<Option<FaceExpression>> {
        assert!(frame.width() > 0);
        std::thread::sleep(self.delay);

        Ok(self.mood.map(|mood| {
            let mut scores = ExpressionScores::new([0.05; 7]);
            scores.set(mood, 0.7);
            FaceExpression {
                bbox: [0.25, 0.25, 0.75, 0.75],
                confidence: 0.9,
                scores,
            }
        }))
    }
}

#[derive(Debug, PartialEq)]
enum OutputCall {
    Play(PlaybackToken, Bytes),
    Stop,
}

#[derive(Default)]
struct FakeOutput {
    calls: Mutex<Vec<OutputCall>>,
}

impl FakeOutput {
    fn played_token(&self) -> Option<PlaybackToken> {
        self.calls.lock().unwrap().iter().rev().find_map(|call| match call {
            OutputCall::Play(token, _) => Some(*token),
            OutputCall::Stop => None,
        })
    }

    fn plays(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| matches!(call, OutputCall::Play(..)))
            .count()
    }

    fn stops(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| **call == OutputCall::Stop)
            .count()
    }
}

impl AudioOutput for FakeOutput {
    fn play(&self, token: PlaybackToken, audio: Bytes) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(OutputCall::Play(token, audio));
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.calls.lock().unwrap().push(OutputCall::Stop);
        Ok(())
    }
}

async fn serve(app: Router) -> SocketAddr {
    let server = axum::Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0)))
        .serve(app.into_make_service());
    let addr = server.local_addr();
    tokio::spawn(server);

    addr
}

/// Songs backend with two songs per mood and a failing `sad` mood.
///
/// The second `disgusted` song points to audio that does not exist.
async fn spawn_songs_backend() -> SocketAddr {
    let base = Arc::new(Mutex::new(String::new()));

    let songs_base = Arc::clone(&base);
    let app = Router::new()
        .route(
            "/songs",
            get(move |Query(params): Query<HashMap<String, String>>| {
                let base = songs_base.lock().unwrap().clone();
                async move {
                    let mood = params.get("mood").cloned().unwrap_or_default();
                    if mood == "sad" {
                        return Err(StatusCode::INTERNAL_SERVER_ERROR);
                    }
                    let songs = (0..2)
                        .map(|i| {
                            let dir = if mood == "disgusted" && i == 1 {
                                "missing"
                            } else {
                                "audio"
                            };
                            Song {
                                title: format!("{mood} song {i}"),
                                artist: "Band".into(),
                                audio: format!("{base}/{dir}/{mood}-{i}.mp3"),
                            }
                        })
                        .collect();
                    Ok(Json(SongsResponse { songs }))
                }
            }),
        )
        .route(
            "/audio/:name",
            get(|Path(name): Path<String>| async move { format!("audio of {name}") }),
        );

    let addr = serve(app).await;
    *base.lock().unwrap() = format!("http://{addr}");

    addr
}

fn test_jpeg() -> Bytes {
    let frame = RgbImage::from_pixel(64, 48, Rgb([120, 80, 40]));
    let buf = turbojpeg::compress_image(&frame, 90, turbojpeg::Subsamp::Sub2x2).unwrap();
    Bytes::copy_from_slice(&buf)
}

struct TestServer {
    url: String,
    app: Arc<MoodApp>,
    output: Arc<FakeOutput>,
    client: reqwest::Client,
}

async fn spawn_server(mood: Option<Expression>, delay: Duration, with_frame: bool) -> TestServer {
    let backend = spawn_songs_backend().await;

    let frames = FrameHub::new();
    if with_frame {
        frames.publish(test_jpeg());
    }
    let output = Arc::new(FakeOutput::default());
    let app = Arc::new(MoodApp::new(
        Arc::new(FakeDetector { mood, delay }),
        frames,
        SongsClient::new(&format!("http://{backend}")).unwrap(),
        output.clone(),
    ));

    let addr = serve(router(Arc::clone(&app))).await;

    TestServer {
        url: format!("http://{addr}"),
        app,
        output,
        client: reqwest::Client::new(),
    }
}

impl TestServer {
    async fn post(&self, path: &str) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.url, path))
            .send()
            .await
            .unwrap()
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> T {
        self.client
            .get(format!("{}{}", self.url, path))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    /// Wait until the fake output was asked to play.
    async fn wait_for_play(&self) -> Result<PlaybackToken> {
        for _ in 0..100 {
            if let Some(token) = self.output.played_token() {
                return Ok(token);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        bail!("output was never asked to play")
    }

    /// Wait until the song list reports nothing playing.
    async fn wait_for_silence(&self) -> Result<()> {
        for _ in 0..100 {
            if self.app.songs().playing.is_none() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        bail!("a song is still playing")
    }

    async fn wait_for_plays(&self, n: usize) -> Result<()> {
        for _ in 0..100 {
            if self.output.plays() >= n {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        bail!("output was asked to play {} times, not {}", self.output.plays(), n)
    }
}

#[tokio::test]
async fn test_healthcheck_and_index() {
    let server = spawn_server(None, Duration::ZERO, false).await;

    let health = reqwest::get(format!("{}/healthcheck", server.url))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(health, "healthy");

    let index = reqwest::get(format!("{}/", server.url))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(index.contains("Detect Mood"));
    assert!(index.contains("link.href = song.audio"));
}

#[tokio::test]
async fn test_detect_mood_fetches_songs() {
    let server = spawn_server(Some(Expression::Happy), Duration::ZERO, true).await;

    let resp = server.post("/detect").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let report: DetectReport = resp.json().await.unwrap();

    assert_eq!(report.mood, Expression::Happy);
    assert_eq!(report.emoji, "😄");
    assert_eq!(report.songs.len(), 2);
    assert_eq!(report.songs[0].title, "happy song 0");

    let status: StatusView = server.get("/status").await;
    assert_eq!(
        status,
        StatusView {
            loading: false,
            mood: Some(Expression::Happy),
            error: None,
        }
    );

    let songs: SongsView = server.get("/songs").await;
    assert_eq!(songs.songs, report.songs);
    assert_eq!(songs.playing, None);

    let snapshot = server
        .client
        .get(format!("{}/snapshot", server.url))
        .send()
        .await
        .unwrap();
    assert_eq!(snapshot.status(), StatusCode::OK);
    assert_eq!(snapshot.headers()["content-type"], "image/jpeg");
}

#[tokio::test]
async fn test_detect_without_face() {
    let server = spawn_server(None, Duration::ZERO, true).await;

    let resp = server.post("/detect").await;
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: ErrorBody = resp.json().await.unwrap();
    assert_eq!(body.error, NO_FACE_MESSAGE);

    let status: StatusView = server.get("/status").await;
    assert_eq!(status.error.as_deref(), Some(NO_FACE_MESSAGE));
    assert_eq!(status.mood, None);
    assert!(!status.loading);

    let snapshot = server
        .client
        .get(format!("{}/snapshot", server.url))
        .send()
        .await
        .unwrap();
    assert_eq!(snapshot.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_detect_without_frame_fails() {
    let server = spawn_server(Some(Expression::Happy), Duration::ZERO, false).await;

    let resp = server.post("/detect").await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body: ErrorBody = resp.json().await.unwrap();
    assert_eq!(body.error, FAILURE_MESSAGE);
}

#[tokio::test]
async fn test_backend_failure_keeps_mood() {
    let server = spawn_server(Some(Expression::Sad), Duration::ZERO, true).await;

    let resp = server.post("/detect").await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

    let status: StatusView = server.get("/status").await;
    assert_eq!(status.mood, Some(Expression::Sad));
    assert_eq!(status.error.as_deref(), Some(FAILURE_MESSAGE));

    let songs: SongsView = server.get("/songs").await;
    assert!(songs.songs.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_detection_is_rejected() {
    let server = Arc::new(
        spawn_server(
            Some(Expression::Neutral),
            Duration::from_millis(500),
            true,
        )
        .await,
    );

    let first = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.post("/detect").await.status() })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status: StatusView = server.get("/status").await;
    assert!(status.loading);

    let second = server.post("/detect").await;
    assert_eq!(second.status(), StatusCode::CONFLICT);

    assert_eq!(first.await.unwrap(), StatusCode::OK);
    let status: StatusView = server.get("/status").await;
    assert!(!status.loading);
}

#[tokio::test]
async fn test_toggle_plays_and_pauses() -> Result<()> {
    let server = spawn_server(Some(Expression::Angry), Duration::ZERO, true).await;
    assert_eq!(server.post("/detect").await.status(), StatusCode::OK);

    let resp = server.post("/songs/1/toggle").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let view: SongsView = resp.json().await?;
    assert_eq!(view.playing, Some(1));

    server.wait_for_play().await?;
    {
        let calls = server.output.calls.lock().unwrap();
        let Some(OutputCall::Play(_, audio)) = calls.last() else {
            bail!("expected a play call, got {:?}", calls);
        };
        assert_eq!(&audio[..], b"audio of angry-1.mp3");
    }

    let view: SongsView = server.post("/songs/1/toggle").await.json().await?;
    assert_eq!(view.playing, None);
    assert_eq!(server.output.stops(), 1);

    let resp = server.post("/songs/5/toggle").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn test_song_end_clears_playing() -> Result<()> {
    let server = spawn_server(Some(Expression::Surprised), Duration::ZERO, true).await;
    server.app.detect_mood().await?;

    server.app.toggle(0)?;
    let token = server.wait_for_play().await?;

    // A stale event leaves the current song alone
    server
        .app
        .handle_player_event(PlayerEvent::Ended { token: token + 7 });
    assert_eq!(server.app.songs().playing, Some(0));

    server.app.handle_player_event(PlayerEvent::Ended { token });
    assert_eq!(server.app.songs().playing, None);

    Ok(())
}

#[tokio::test]
async fn test_new_detection_stops_playback() -> Result<()> {
    let server = spawn_server(Some(Expression::Fearful), Duration::ZERO, true).await;
    server.app.detect_mood().await?;

    server.app.toggle(0)?;
    server.wait_for_play().await?;

    let report = server.app.detect_mood().await?;
    assert_eq!(report.songs.len(), 2);
    assert_eq!(server.app.songs().playing, None);
    assert_eq!(server.output.stops(), 1);

    Ok(())
}

#[tokio::test]
async fn test_switching_songs_stops_previous() -> Result<()> {
    let server = spawn_server(Some(Expression::Happy), Duration::ZERO, true).await;
    server.app.detect_mood().await?;

    server.app.toggle(0)?;
    let first = server.wait_for_play().await?;

    let view = server.app.toggle(1)?;
    assert_eq!(view.playing, Some(1));
    server.wait_for_plays(2).await?;

    let calls = server.output.calls.lock().unwrap();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0], OutputCall::Play(first, Bytes::from("audio of happy-0.mp3")));
    assert_eq!(calls[1], OutputCall::Stop);
    assert_eq!(
        calls[2],
        OutputCall::Play(first + 1, Bytes::from("audio of happy-1.mp3"))
    );

    Ok(())
}

#[tokio::test]
async fn test_missing_audio_clears_playing() -> Result<()> {
    let server = spawn_server(Some(Expression::Disgusted), Duration::ZERO, true).await;
    server.app.detect_mood().await?;

    let view = server.app.toggle(1)?;
    assert_eq!(view.playing, Some(1));
    server.wait_for_silence().await?;
    assert_eq!(server.output.plays(), 0);

    Ok(())
}

#[tokio::test]
async fn test_missing_audio_silences_previous_song() -> Result<()> {
    let server = spawn_server(Some(Expression::Disgusted), Duration::ZERO, true).await;
    server.app.detect_mood().await?;

    server.app.toggle(0)?;
    server.wait_for_play().await?;

    server.app.toggle(1)?;
    server.wait_for_silence().await?;

    assert_eq!(server.output.plays(), 1);
    assert!(server.output.stops() >= 1);
    assert_eq!(
        server.output.calls.lock().unwrap().last(),
        Some(&OutputCall::Stop)
    );

    let view: SongsView = server.get("/songs").await;
    assert_eq!(view.playing, None);

    Ok(())
}

#[tokio::test]
async fn test_playback_failure_clears_playing() -> Result<()> {
    let server = spawn_server(Some(Expression::Neutral), Duration::ZERO, true).await;
    server.app.detect_mood().await?;

    server.app.toggle(1)?;
    let token = server.wait_for_play().await?;

    server.app.handle_player_event(PlayerEvent::Failed {
        token: token - 1,
        reason: "stale".into(),
    });
    assert_eq!(server.app.songs().playing, Some(1));

    server.app.handle_player_event(PlayerEvent::Failed {
        token,
        reason: "unsupported format".into(),
    });
    assert_eq!(server.app.songs().playing, None);

    Ok(())
}

//! Client of the songs backend.
//!
use anyhow::{Context, Result};
use bytes::Bytes;
use common::protocol::{Expression, Song, SongsResponse};
use reqwest::{Client, Url};

/// Base URL used when none is configured.
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:3000";

#[derive(Clone, Debug)]
pub struct SongsClient {
    client: Client,
    songs_url: Url,
}

impl SongsClient {
    pub fn new(api_base_url: &str) -> Result<Self> {
        Self::with_client(Client::new(), api_base_url)
    }

    pub fn with_client(client: Client, api_base_url: &str) -> Result<Self> {
        let base = Url::parse(api_base_url)
            .with_context(|| format!("invalid API base URL {api_base_url:?}"))?;
        // `join` would drop the last path segment of a base without trailing slash
        let songs_url = Url::parse(&format!("{}/songs", base.as_str().trim_end_matches('/')))?;

        Ok(Self { client, songs_url })
    }

    /// Fetch the songs tagged with the given mood.
    pub async fn fetch(&self, mood: Expression) -> Result<Vec<Song>> {
        log::info!("Requesting songs for mood {}", mood);

        let response: SongsResponse = self
            .client
            .get(self.songs_url.clone())
            .query(&[("mood", mood.label())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("malformed songs response")?;

        log::debug!("Received {} songs for mood {}", response.songs.len(), mood);

        Ok(response.songs)
    }

    /// Download the audio resource of a song.
    pub async fn fetch_audio(&self, song: &Song) -> Result<Bytes> {
        let audio = self
            .client
            .get(&song.audio)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        log::debug!("Fetched {} bytes of audio for {:?}", audio.len(), song.title);

        Ok(audio)
    }
}

//! Song list with single-track playback state.
//!
use anyhow::{bail, Result};
use common::protocol::{Song, SongsView};

/// Identifies one start of a song, so late events of an earlier start can be told apart.
pub type PlaybackToken = u64;

/// Outcome of toggling a song.
#[derive(Clone, Debug, PartialEq)]
pub enum Toggle {
    /// The song was not playing and is now.
    Started { token: PlaybackToken, song: Song },
    /// The song was playing and is stopped.
    Stopped,
}

/// Recommended songs and the index of the one playing.
///
/// At most one song plays at a time, and the playing index always refers to an element of
/// `songs`.
#[derive(Debug, Default)]
pub struct SongList {
    songs: Vec<Song>,
    playing: Option<usize>,
    token: PlaybackToken,
}

impl SongList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the list and clear playback. Returns `true` if a song was playing.
    pub fn replace(&mut self, songs: Vec<Song>) -> bool {
        self.songs = songs;
        self.playing.take().is_some()
    }

    /// Start the song at `index`, or stop it if it is the one playing.
    ///
    /// Starting a song implicitly stops any other.
    pub fn toggle(&mut self, index: usize) -> Result<Toggle> {
        let Some(song) = self.songs.get(index) else {
            bail!("no song at index {} of {}", index, self.songs.len());
        };

        if self.playing == Some(index) {
            self.playing = None;
            return Ok(Toggle::Stopped);
        }

        let song = song.clone();
        self.token += 1;
        self.playing = Some(index);

        Ok(Toggle::Started {
            token: self.token,
            song,
        })
    }

    /// Whether `token` belongs to the song playing right now.
    pub fn is_current(&self, token: PlaybackToken) -> bool {
        self.playing.is_some() && self.token == token
    }

    /// Mark the playback started with `token` as over. Returns `true` if that cleared the state.
    pub fn finished(&mut self, token: PlaybackToken) -> bool {
        if self.is_current(token) {
            self.playing = None;
            true
        } else {
            false
        }
    }

    pub fn playing(&self) -> Option<usize> {
        self.playing
    }

    pub fn view(&self) -> SongsView {
        SongsView {
            songs: self.songs.clone(),
            playing: self.playing,
        }
    }
}

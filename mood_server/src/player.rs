//! Audio output for the selected song.
//!
use std::{
    io::Cursor,
    sync::{mpsc, Mutex},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};
use tokio::sync::mpsc::UnboundedSender;

use crate::playlist::PlaybackToken;

/// How often the audio thread checks whether the current song ran out.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Events reported by an audio output.
#[derive(Clone, Debug, PartialEq)]
pub enum PlayerEvent {
    /// The song played to its end.
    Ended { token: PlaybackToken },
    /// The song could not be played.
    Failed {
        token: PlaybackToken,
        reason: String,
    },
}

pub trait AudioOutput: Send + Sync {
    /// Play encoded audio, replacing whatever is playing.
    fn play(&self, token: PlaybackToken, audio: Bytes) -> Result<()>;

    /// Stop playback.
    fn stop(&self) -> Result<()>;
}

enum PlayerCommand {
    Play { token: PlaybackToken, audio: Bytes },
    Stop,
}

/// Audio output on the default device.
///
/// The output stream of `rodio` must stay on the thread it was created on, so it is owned by a
/// dedicated audio thread which receives commands over a channel.
pub struct RodioOutput {
    commands: Mutex<mpsc::Sender<PlayerCommand>>,
}

impl RodioOutput {
    /// Open the default output device and start the audio thread.
    pub fn spawn(events: UnboundedSender<PlayerEvent>) -> Result<Self> {
        let (commands_tx, commands_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        thread::Builder::new()
            .name("audio".into())
            .spawn(move || {
                let (_stream, handle) = match OutputStream::try_default() {
                    Ok(output) => {
                        ready_tx.send(Ok(())).ok();
                        output
                    }
                    Err(e) => {
                        ready_tx.send(Err(e.to_string())).ok();
                        return;
                    }
                };
                run_audio_thread(&handle, commands_rx, events);
                log::debug!("Audio thread finished");
            })?;

        ready_rx
            .recv()?
            .map_err(|e| anyhow!("failed to open audio output: {e}"))?;
        log::info!("Opened default audio output");

        Ok(Self {
            commands: Mutex::new(commands_tx),
        })
    }

    fn send(&self, command: PlayerCommand) -> Result<()> {
        self.commands
            .lock()
            .unwrap()
            .send(command)
            .map_err(|_| anyhow!("audio thread stopped"))
    }
}

impl AudioOutput for RodioOutput {
    fn play(&self, token: PlaybackToken, audio: Bytes) -> Result<()> {
        self.send(PlayerCommand::Play { token, audio })
    }

    fn stop(&self) -> Result<()> {
        self.send(PlayerCommand::Stop)
    }
}

fn run_audio_thread(
    handle: &OutputStreamHandle,
    commands: mpsc::Receiver<PlayerCommand>,
    events: UnboundedSender<PlayerEvent>,
) {
    let mut current: Option<(PlaybackToken, Sink)> = None;

    loop {
        match commands.recv_timeout(POLL_INTERVAL) {
            Ok(PlayerCommand::Play { token, audio }) => {
                if let Some((_, sink)) = current.take() {
                    sink.stop();
                }
                match start_sink(handle, audio) {
                    Ok(sink) => current = Some((token, sink)),
                    Err(e) => {
                        log::warn!("Unable to play song: {e}");
                        events
                            .send(PlayerEvent::Failed {
                                token,
                                reason: e.to_string(),
                            })
                            .ok();
                    }
                }
            }
            Ok(PlayerCommand::Stop) => {
                if let Some((_, sink)) = current.take() {
                    sink.stop();
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => (),
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        if let Some((token, sink)) = current.take() {
            if sink.empty() {
                events.send(PlayerEvent::Ended { token }).ok();
            } else {
                current = Some((token, sink));
            }
        }
    }
}

fn start_sink(handle: &OutputStreamHandle, audio: Bytes) -> Result<Sink> {
    let source = Decoder::new(Cursor::new(audio))?;
    let sink = Sink::try_new(handle)?;
    sink.append(source);

    Ok(sink)
}

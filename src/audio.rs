//! Hearing and speech seams consumed by the conversation loop.

use async_trait::async_trait;
use tracing::debug;

/// Streaming speech recognizer. `poll` is lossy: it returns at most one
/// utterance per call and `None` when nothing was recognized since the last
/// poll. While paused the engine keeps draining audio but emits nothing.
pub trait SpeechToText: Send {
    fn pause(&self);
    fn resume(&self);
    fn stop(&self);
    fn poll(&mut self) -> Option<String>;
}

/// Speech synthesis. `speak` blocks until the utterance has been rendered;
/// the engine bounds its own duration and is never interrupted mid-phrase.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn speak(&self, text: &str) -> anyhow::Result<()>;
}

/// One-shot sound effects (the interact cue).
pub trait SoundPlayer: Send + Sync {
    fn play(&self, clip: &str) -> anyhow::Result<()>;
}

/// Silent recognizer used when no microphone is attached.
#[derive(Debug, Default)]
pub struct NullSpeechToText;

impl SpeechToText for NullSpeechToText {
    fn pause(&self) {}
    fn resume(&self) {}
    fn stop(&self) {}
    fn poll(&mut self) -> Option<String> {
        None
    }
}

/// Log-only synthesizer.
#[derive(Debug, Default)]
pub struct LoggingTextToSpeech;

#[async_trait]
impl TextToSpeech for LoggingTextToSpeech {
    async fn speak(&self, text: &str) -> anyhow::Result<()> {
        debug!(%text, "tts");
        Ok(())
    }
}

/// Log-only sound player.
#[derive(Debug, Default)]
pub struct LoggingSoundPlayer;

impl SoundPlayer for LoggingSoundPlayer {
    fn play(&self, clip: &str) -> anyhow::Result<()> {
        debug!(%clip, "sfx");
        Ok(())
    }
}

// Voice input: level-based speech segmentation feeding a transcriber.
use std::sync::Arc;

use async_trait::async_trait;

use crate::agent_engine::engine::SessionHandle;
use crate::agent_engine::state::ConnectionState;
use crate::config::InputConfig;
use crate::errors::DeskPilotResult;

/// 16-bit mono PCM from a capture device. `Ok(None)` means the device closed.
#[async_trait]
pub trait AudioSource: Send {
    async fn next_chunk(&mut self) -> DeskPilotResult<Option<Vec<i16>>>;
}

/// Speech-to-text. `Ok(None)` when nothing intelligible was heard.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, pcm: &[i16]) -> DeskPilotResult<Option<String>>;
}

/// Buffers chunks while they are loud and hands back the utterance on the
/// first quiet chunk.
pub struct SpeechSegmenter {
    level_threshold: f64,
    min_chunks: usize,
    buffer: Vec<i16>,
    chunks: usize,
}

impl SpeechSegmenter {
    /// `silence_threshold` is a fraction of full scale.
    pub fn new(silence_threshold: f64, min_chunks: usize) -> Self {
        Self {
            level_threshold: silence_threshold * i16::MAX as f64,
            min_chunks,
            buffer: Vec::new(),
            chunks: 0,
        }
    }

    pub fn from_config(config: &InputConfig) -> Self {
        Self::new(config.silence_threshold, config.min_speech_chunks)
    }

    pub fn push(&mut self, chunk: &[i16]) -> Option<Vec<i16>> {
        if level(chunk) > self.level_threshold {
            self.buffer.extend_from_slice(chunk);
            self.chunks += 1;
            return None;
        }
        self.flush()
    }

    /// Ends the current utterance. Utterances of `min_chunks` chunks or fewer
    /// are discarded as noise.
    pub fn flush(&mut self) -> Option<Vec<i16>> {
        let chunks = std::mem::take(&mut self.chunks);
        let utterance = std::mem::take(&mut self.buffer);
        (chunks > self.min_chunks).then_some(utterance)
    }
}

/// Mean absolute sample value.
fn level(chunk: &[i16]) -> f64 {
    if chunk.is_empty() {
        return 0.0;
    }
    let sum: f64 = chunk.iter().map(|s| (*s as f64).abs()).sum();
    sum / chunk.len() as f64
}

/// Listens until the device closes or the session stops, sending every
/// recognised utterance through `handle`.
pub async fn run_voice_input(
    handle: SessionHandle,
    mut source: Box<dyn AudioSource>,
    transcriber: Arc<dyn Transcriber>,
    config: &InputConfig,
) -> DeskPilotResult<()> {
    if handle.wait_ready().await != ConnectionState::Active {
        return Ok(());
    }
    let mut segmenter = SpeechSegmenter::from_config(config);
    tracing::info!("listening for speech");

    loop {
        let chunk = tokio::select! {
            _ = handle.stopped() => break,
            chunk = source.next_chunk() => chunk?,
        };
        let utterance = match chunk {
            Some(chunk) => segmenter.push(&chunk),
            None => {
                tracing::info!("audio source closed");
                let rest = segmenter.flush();
                if let Some(pcm) = rest {
                    deliver(&handle, transcriber.as_ref(), &pcm).await;
                }
                break;
            }
        };
        if let Some(pcm) = utterance {
            deliver(&handle, transcriber.as_ref(), &pcm).await;
        }
    }
    Ok(())
}

async fn deliver(handle: &SessionHandle, transcriber: &dyn Transcriber, pcm: &[i16]) {
    tracing::debug!(samples = pcm.len(), "utterance captured");
    match transcriber.transcribe(pcm).await {
        Ok(Some(text)) if !text.trim().is_empty() => {
            println!("You said: {text}");
            if let Err(e) = handle.send_text(&text).await {
                tracing::warn!(error = %e, "transcript not sent");
            }
        }
        Ok(_) => tracing::debug!("nothing recognised"),
        Err(e) => tracing::warn!(error = %e, "transcription failed"),
    }
}

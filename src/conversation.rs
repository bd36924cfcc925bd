//! Wake-word driven conversation loop: STT → LLM → TTS.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::audio::{SpeechToText, TextToSpeech};
use crate::clock::{self, wait_with_cancel};
use crate::led::{LedService, LedState};
use crate::llm::{ChatMessage, LlmClient};

pub const MAX_REPLY_CHARS: usize = 220;
pub const ATTENTION_TTL_SEC: f64 = 15.0;
pub const ATTN_BONUS_AFTER_SPEAK: f64 = 5.0;
pub const SPEAK_COOLDOWN_SEC: f64 = 1.5;

/// Where the conversation currently is. Published as a snapshot for the
/// behavior coordinator; only the FSM task ever changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationPhase {
    Wake,
    AttentiveListen,
    Think,
    Speak,
}

impl ConversationPhase {
    fn led_state(self) -> LedState {
        match self {
            ConversationPhase::Wake => LedState::Wake,
            ConversationPhase::AttentiveListen => LedState::Listen,
            ConversationPhase::Think => LedState::Processing,
            ConversationPhase::Speak => LedState::Speaking,
        }
    }
}

/// Timing and retry knobs, defaulting to the values the robot ships with.
#[derive(Debug, Clone)]
pub struct ConversationTuning {
    pub attention_ttl: f64,
    pub attn_bonus_after_speak: f64,
    pub speak_cooldown: f64,
    pub max_reply_chars: usize,
    pub stt_poll_interval: f64,
    pub llm_retry_max_attempts: u32,
    pub llm_retry_initial_delay: f64,
    pub llm_retry_backoff: f64,
    pub llm_retry_max_delay: Option<f64>,
}

impl Default for ConversationTuning {
    fn default() -> Self {
        Self {
            attention_ttl: ATTENTION_TTL_SEC,
            attn_bonus_after_speak: ATTN_BONUS_AFTER_SPEAK,
            speak_cooldown: SPEAK_COOLDOWN_SEC,
            max_reply_chars: MAX_REPLY_CHARS,
            stt_poll_interval: 0.02,
            llm_retry_max_attempts: 3,
            llm_retry_initial_delay: 0.5,
            llm_retry_backoff: 2.0,
            llm_retry_max_delay: None,
        }
    }
}

/// Rolling window of the last N user/assistant turn pairs.
pub struct ConversationMemory {
    last_n: usize,
    turns: VecDeque<(String, String)>,
}

impl ConversationMemory {
    pub fn new(last_n: usize) -> Self {
        Self {
            last_n,
            turns: VecDeque::new(),
        }
    }

    pub fn add_turn(&mut self, user: &str, reply: &str) {
        self.turns.push_back((user.to_string(), reply.to_string()));
        while self.turns.len() > self.last_n {
            self.turns.pop_front();
        }
    }

    pub fn build_messages(&self, system: &str, user: &str) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(system)];
        for (asked, answered) in &self.turns {
            messages.push(ChatMessage::user(asked));
            messages.push(ChatMessage::assistant(answered));
        }
        messages.push(ChatMessage::user(user));
        messages
    }
}

/// Timing counters logged as the conversation progresses.
#[derive(Debug, Default)]
pub struct ConversationMetrics {
    pub llm_calls: u32,
    pub llm_retries: u32,
    pub llm_total_latency: f64,
    listen_started_at: Option<f64>,
    pub total_listen_time: f64,
}

impl ConversationMetrics {
    fn start_listen(&mut self, now: f64) {
        if self.listen_started_at.is_none() {
            self.listen_started_at = Some(now);
            info!(at = now, "listen window started");
        }
    }

    fn stop_listen(&mut self, now: f64) {
        if let Some(started) = self.listen_started_at.take() {
            let elapsed = (now - started).max(0.0);
            self.total_listen_time += elapsed;
            info!(
                elapsed,
                cumulative = self.total_listen_time,
                "listen window closed"
            );
        }
    }

    fn record_llm(&mut self, latency: f64, retries: u32) {
        self.llm_calls += 1;
        self.llm_retries += retries;
        self.llm_total_latency += latency;
        let avg = self.llm_total_latency / f64::from(self.llm_calls);
        info!(
            latency,
            retries,
            total_retries = self.llm_retries,
            avg_latency = avg,
            "llm call"
        );
    }
}

/// Single-task conversation state machine.
///
/// The loop polls the recognizer, feeds accepted commands through the LLM
/// with retry and backoff, and speaks replies. Every wait goes through
/// [`wait_with_cancel`], so setting the stop token makes `run` return
/// within one poll interval plus at most one retry delay.
pub struct ConversationFsm {
    stt: Box<dyn SpeechToText>,
    tts: Arc<dyn TextToSpeech>,
    llm: Arc<dyn LlmClient>,
    led: Arc<LedService>,
    wake_words: Vec<String>,
    system_prompt: String,
    tuning: ConversationTuning,
    memory: ConversationMemory,
    pub metrics: ConversationMetrics,

    phase: ConversationPhase,
    phase_tx: watch::Sender<ConversationPhase>,
    pending: String,
    reply: Option<String>,
    attentive_until: f64,
    last_speak_end: f64,

    stop: CancellationToken,
    extra_stops: Vec<CancellationToken>,
}

impl ConversationFsm {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stt: Box<dyn SpeechToText>,
        tts: Arc<dyn TextToSpeech>,
        llm: Arc<dyn LlmClient>,
        led: Arc<LedService>,
        wake_words: Vec<String>,
        system_prompt: String,
        tuning: ConversationTuning,
        stop: CancellationToken,
        extra_stops: Vec<CancellationToken>,
    ) -> Self {
        let (phase_tx, _) = watch::channel(ConversationPhase::Wake);
        led.set_state(LedState::Wake);
        Self {
            stt,
            tts,
            llm,
            led,
            wake_words: wake_words
                .into_iter()
                .map(|w| w.to_lowercase())
                .collect(),
            system_prompt,
            tuning,
            memory: ConversationMemory::new(3),
            metrics: ConversationMetrics::default(),
            phase: ConversationPhase::Wake,
            phase_tx,
            pending: String::new(),
            reply: None,
            attentive_until: 0.0,
            last_speak_end: clock::now(),
            stop,
            extra_stops,
        }
    }

    /// Snapshot channel observed by the behavior coordinator.
    pub fn phase_rx(&self) -> watch::Receiver<ConversationPhase> {
        self.phase_tx.subscribe()
    }

    pub fn contains_wake_word(&self, text: &str) -> bool {
        let lowered = text.to_lowercase();
        self.wake_words.iter().any(|w| lowered.contains(w))
    }

    fn should_stop(&self) -> bool {
        if self.stop.is_cancelled() {
            return true;
        }
        if self.extra_stops.iter().any(|t| t.is_cancelled()) {
            self.stop.cancel();
            return true;
        }
        false
    }

    fn set_phase(&mut self, phase: ConversationPhase) {
        if phase == self.phase {
            return;
        }
        info!(from = ?self.phase, to = ?phase, "conversation state");
        self.phase = phase;
        self.phase_tx.send_replace(phase);
        self.led.set_state(phase.led_state());
    }

    pub async fn run(mut self) {
        info!("conversation loop starting");
        let poll = Duration::from_secs_f64(self.tuning.stt_poll_interval.max(0.0));

        loop {
            if self.should_stop() {
                break;
            }

            let utterance = self.stt.poll().filter(|u| !u.trim().is_empty());
            let now = clock::now();

            match self.phase {
                ConversationPhase::Wake => {
                    if let Some(utterance) = utterance {
                        info!(%utterance, "heard");
                        if self.contains_wake_word(&utterance) {
                            info!("wake word detected, attentive");
                            self.attentive_until = now + self.tuning.attention_ttl;
                            self.metrics.start_listen(now);
                            self.set_phase(ConversationPhase::AttentiveListen);
                        }
                    }
                }
                ConversationPhase::AttentiveListen => {
                    if now > self.attentive_until {
                        info!("attention window expired");
                        self.metrics.stop_listen(now);
                        self.set_phase(ConversationPhase::Wake);
                    } else if let Some(utterance) = utterance {
                        info!(%utterance, "command accepted");
                        self.pending = utterance;
                        self.attentive_until = now + self.tuning.attention_ttl;
                        self.metrics.stop_listen(now);
                        self.stt.pause();
                        self.set_phase(ConversationPhase::Think);
                    }
                }
                ConversationPhase::Think => match self.query_llm().await {
                    Ok(Some(reply)) => {
                        self.reply = Some(reply);
                        self.set_phase(ConversationPhase::Speak);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = ?e, "llm processing failed");
                        self.stt.resume();
                        self.set_phase(ConversationPhase::Wake);
                    }
                },
                ConversationPhase::Speak => {
                    if let Some(reply) = self.reply.take() {
                        info!(%reply, "speaking");
                        if let Err(e) = self.tts.speak(&reply).await {
                            error!(error = ?e, "tts failed");
                        }
                        self.last_speak_end = clock::now();
                        self.attentive_until = self.last_speak_end
                            + self.tuning.attention_ttl
                            + self.tuning.attn_bonus_after_speak;
                    }
                    if clock::now() - self.last_speak_end >= self.tuning.speak_cooldown {
                        self.stt.resume();
                        self.metrics.start_listen(clock::now());
                        self.set_phase(ConversationPhase::AttentiveListen);
                    }
                }
            }

            if wait_with_cancel(poll, &self.stop).await {
                break;
            }
        }

        self.cleanup();
        info!("conversation loop stopped");
    }

    /// Queries the LLM with retry and exponential backoff. `Ok(None)` means
    /// a stop was requested mid-retry.
    async fn query_llm(&mut self) -> Result<Option<String>> {
        let max_attempts = self.tuning.llm_retry_max_attempts.max(1);
        let mut delay = self.tuning.llm_retry_initial_delay.max(0.0);
        let mut retries = 0u32;

        for attempt in 1..=max_attempts {
            let messages = self.memory.build_messages(&self.system_prompt, &self.pending);
            let started = Instant::now();
            match self
                .llm
                .query(&messages, self.tuning.max_reply_chars)
                .await
            {
                Ok(reply) => {
                    self.metrics
                        .record_llm(started.elapsed().as_secs_f64(), retries);
                    self.memory.add_turn(&self.pending, &reply);
                    return Ok(Some(reply));
                }
                Err(e) => {
                    warn!(attempt, max_attempts, error = ?e, "llm error");
                    if attempt >= max_attempts {
                        return Err(e);
                    }
                    retries += 1;
                    let mut wait = delay;
                    if let Some(cap) = self.tuning.llm_retry_max_delay {
                        wait = wait.min(cap);
                    }
                    if wait_with_cancel(Duration::from_secs_f64(wait), &self.stop).await {
                        return Ok(None);
                    }
                    delay *= self.tuning.llm_retry_backoff.max(1.0);
                }
            }
        }
        bail!("llm retry configuration invalid")
    }

    fn cleanup(&mut self) {
        self.metrics.stop_listen(clock::now());
        self.stt.pause();
        while self.stt.poll().is_some() {}
        self.led.set_state(LedState::Off);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::LoggingTextToSpeech;
    use crate::led::LoggingLedStrip;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct ScriptedStt {
        script: Mutex<VecDeque<Option<String>>>,
    }

    impl ScriptedStt {
        fn new(lines: &[Option<&str>]) -> Self {
            Self {
                script: Mutex::new(
                    lines
                        .iter()
                        .copied()
                        .map(|l| l.map(str::to_string))
                        .collect(),
                ),
            }
        }
    }

    impl SpeechToText for ScriptedStt {
        fn pause(&self) {}
        fn resume(&self) {}
        fn stop(&self) {}
        fn poll(&mut self) -> Option<String> {
            self.script.lock().unwrap().pop_front().flatten()
        }
    }

    struct FlakyLlm {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl LlmClient for FlakyLlm {
        async fn query(
            &self,
            messages: &[ChatMessage],
            _max_reply_chars: usize,
        ) -> Result<String> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                bail!("llm unavailable");
            }
            Ok(messages.last().unwrap().content.clone())
        }
    }

    fn fsm_with(
        stt: Box<dyn SpeechToText>,
        llm: Arc<dyn LlmClient>,
        tuning: ConversationTuning,
        stop: CancellationToken,
    ) -> ConversationFsm {
        let led = Arc::new(LedService::spawn(Arc::new(LoggingLedStrip)));
        ConversationFsm::new(
            stt,
            Arc::new(LoggingTextToSpeech),
            llm,
            led,
            vec!["humo".into()],
            "sistema".into(),
            tuning,
            stop,
            Vec::new(),
        )
    }

    #[test]
    fn wake_word_is_case_insensitive_substring() {
        let stop = CancellationToken::new();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let fsm = fsm_with(
            Box::new(ScriptedStt::new(&[])),
            Arc::new(FlakyLlm {
                failures_left: AtomicU32::new(0),
            }),
            ConversationTuning::default(),
            stop,
        );
        assert!(fsm.contains_wake_word("Hola HUMO, ¿qué tal?"));
        assert!(!fsm.contains_wake_word("hola"));
    }

    #[test]
    fn memory_keeps_last_n_turns() {
        let mut memory = ConversationMemory::new(2);
        memory.add_turn("uno", "1");
        memory.add_turn("dos", "2");
        memory.add_turn("tres", "3");
        let messages = memory.build_messages("sys", "cuatro");
        // system + 2 retained pairs + new user message
        assert_eq!(messages.len(), 6);
        assert_eq!(messages[1].content, "dos");
        assert_eq!(messages.last().unwrap().content, "cuatro");
    }

    #[tokio::test]
    async fn stop_interrupts_retry_backoff() {
        let stop = CancellationToken::new();
        let tuning = ConversationTuning {
            stt_poll_interval: 0.01,
            llm_retry_max_attempts: 5,
            llm_retry_initial_delay: 30.0,
            ..ConversationTuning::default()
        };
        let fsm = fsm_with(
            Box::new(ScriptedStt::new(&[
                Some("hola humo"),
                Some("prende la luz"),
            ])),
            Arc::new(FlakyLlm {
                failures_left: AtomicU32::new(100),
            }),
            tuning,
            stop.clone(),
        );
        let task = tokio::spawn(fsm.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.cancel();
        // One poll interval plus the aborted retry wait, nowhere near 30 s.
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("run did not return after stop")
            .unwrap();
    }

    #[tokio::test]
    async fn exhausted_retries_fall_back_to_wake() {
        let stop = CancellationToken::new();
        let tuning = ConversationTuning {
            stt_poll_interval: 0.005,
            llm_retry_max_attempts: 2,
            llm_retry_initial_delay: 0.05,
            ..ConversationTuning::default()
        };
        let fsm = fsm_with(
            Box::new(ScriptedStt::new(&[
                Some("hola humo"),
                Some("prende la luz"),
            ])),
            Arc::new(FlakyLlm {
                failures_left: AtomicU32::new(100),
            }),
            tuning,
            stop.clone(),
        );
        let mut phase_rx = fsm.phase_rx();
        let task = tokio::spawn(fsm.run());
        let mut saw_think = false;
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if *phase_rx.borrow() == ConversationPhase::Think {
                saw_think = true;
            }
            if saw_think && *phase_rx.borrow() == ConversationPhase::Wake {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(saw_think);
        assert_eq!(*phase_rx.borrow(), ConversationPhase::Wake);
        stop.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    }
}

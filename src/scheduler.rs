use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveTime};
use rand::Rng;
use tokio::sync::watch;

use crate::config::AgentConfig;
use crate::llm_client::{CompletionRequest, LlmClient};
use crate::memory::{Content, MemoryStore, Role};
use crate::storage::StorageError;

/// Literal reply the model uses to decline an initiation.
pub const SILENCE_SENTINEL: &str = "[silence]";

const NUDGE: &str = "(No one has said anything for a while. This message is not from \
your counterpart. If you genuinely feel like reaching out right now, write a short, \
natural message. If not, reply with exactly [silence].)";

/// Side effects leaving the autonomy loop. The receiver decides how to
/// surface them (notification, UI, log).
#[derive(Debug, Clone)]
pub enum AgentEvent {
    SelfInitiated { text: String },
    DiaryWritten { date: NaiveDate },
    Notify { title: String, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// No API key configured. Nothing happens, mood untouched.
    Idle,
    WriteDiary,
    /// Our message is already the newest one. Never pile on; mood untouched.
    Suppressed,
    StaySilent(SilenceReason),
    Initiate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SilenceReason {
    WindowNotMet,
    DrawLost,
}

/// The whole per-tick decision, pure so it can be tested without a clock,
/// a network or a random source.
pub fn tick_action(
    has_key: bool,
    diary_due: bool,
    last_was_agent: bool,
    elapsed_secs: Option<u64>,
    min_silence_secs: u64,
    mood: f64,
    draw: f64,
) -> TickAction {
    if !has_key {
        return TickAction::Idle;
    }
    if diary_due {
        return TickAction::WriteDiary;
    }
    if last_was_agent {
        return TickAction::Suppressed;
    }
    if let Some(elapsed) = elapsed_secs {
        if elapsed < min_silence_secs {
            return TickAction::StaySilent(SilenceReason::WindowNotMet);
        }
    }
    if draw < mood {
        TickAction::Initiate
    } else {
        TickAction::StaySilent(SilenceReason::DrawLost)
    }
}

pub fn mood_after_speaking(mood: f64, step_down: f64, floor: f64) -> f64 {
    (mood - step_down).max(floor)
}

pub fn mood_after_silence(mood: f64, step_up: f64) -> f64 {
    (mood + step_up).min(1.0)
}

fn parse_diary_time(raw: &str) -> NaiveTime {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .unwrap_or_else(|_| NaiveTime::from_hms_opt(23, 0, 0).unwrap_or_default())
}

pub fn diary_is_due(now: NaiveTime, diary_time: &str, has_entry_today: bool) -> bool {
    !has_entry_today && now >= parse_diary_time(diary_time)
}

pub struct Scheduler {
    memory: Arc<MemoryStore>,
    config: AgentConfig,
    events: flume::Sender<AgentEvent>,
}

impl Scheduler {
    pub fn new(
        memory: Arc<MemoryStore>,
        config: AgentConfig,
        events: flume::Sender<AgentEvent>,
    ) -> Self {
        Self {
            memory,
            config,
            events,
        }
    }

    /// Tick loop. The shutdown signal is only observed between ticks, so a
    /// tick in flight always finishes its writes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.check_interval_secs.max(1));
        tracing::info!("Scheduler started, tick every {}s", interval.as_secs());
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.tick().await {
                if e.downcast_ref::<StorageError>().is_some() {
                    tracing::error!("Storage failure in scheduler, stopping: {:#}", e);
                    return;
                }
                tracing::warn!("Tick failed, retrying next interval: {:#}", e);
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("Scheduler stopped");
    }

    async fn tick(&self) -> Result<()> {
        // Re-read every tick so a key dropped into the data dir takes
        // effect without a restart.
        let Some(key) = self.memory.api_key()? else {
            tracing::debug!("No API key configured, idling this tick");
            return Ok(());
        };
        let state = self.memory.get_state()?;
        let now = Local::now();
        let diary_due = diary_is_due(
            now.time(),
            &self.config.diary_time,
            self.memory.has_diary_for(now.date_naive())?,
        );
        let last_was_agent = self.memory.last_message_was_agent()?;
        let elapsed = self
            .memory
            .time_since_last_message()?
            .map(|d| d.num_seconds().max(0) as u64);
        let draw = rand::thread_rng().gen::<f64>();

        let action = tick_action(
            true,
            diary_due,
            last_was_agent,
            elapsed,
            self.config.min_silence_secs,
            state.mood,
            draw,
        );

        let client = LlmClient::new(
            &self.config.api_url,
            key,
            Duration::from_secs(self.config.request_timeout_secs),
        );

        match action {
            TickAction::Idle => {}
            TickAction::Suppressed => {
                tracing::debug!("Last message was mine, staying out of the way");
            }
            TickAction::WriteDiary => {
                self.write_diary(&client, now.date_naive()).await?;
            }
            TickAction::StaySilent(reason) => {
                tracing::debug!("Staying silent ({:?})", reason);
                self.memory
                    .record_mood(mood_after_silence(state.mood, self.config.mood_step_up))?;
            }
            TickAction::Initiate => {
                let spoke = self.initiate(&client).await?;
                let next = if spoke {
                    mood_after_speaking(
                        state.mood,
                        self.config.mood_step_down,
                        self.config.mood_floor,
                    )
                } else {
                    mood_after_silence(state.mood, self.config.mood_step_up)
                };
                self.memory.record_mood(next)?;
            }
        }
        Ok(())
    }

    /// Ask the model whether it wants to reach out. The nudge is a private
    /// prompt turn and is never written to memory; only a real reply is.
    async fn initiate(&self, client: &LlmClient) -> Result<bool> {
        let mut messages = self
            .memory
            .context_for_request(self.config.context_messages)?;
        messages.push((Role::User, Content::text(NUDGE)));

        let system = format!("{}\n\n{}", self.config.system_prompt, self.memory.summary()?);
        let request = CompletionRequest {
            model: self.config.model.clone(),
            system,
            messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };
        let result = client
            .complete(&request)
            .await
            .context("self-initiation request failed")?;

        let text = result.text.trim().to_string();
        if text.is_empty() || text.contains(SILENCE_SENTINEL) {
            tracing::debug!("Model chose to stay silent");
            return Ok(false);
        }

        self.memory.append_initiated(Content::text(&text))?;
        tracing::info!("Self-initiated: {}", truncate(&text, 80));
        let _ = self.events.send(AgentEvent::SelfInitiated { text: text.clone() });
        let _ = self.events.send(AgentEvent::Notify {
            title: "hearth".to_string(),
            body: truncate(&text, 120),
        });
        Ok(true)
    }

    async fn write_diary(&self, client: &LlmClient, date: NaiveDate) -> Result<()> {
        let day_messages = self.memory.messages_for_day(date)?;
        let context = if day_messages.is_empty() {
            "(a quiet day, no conversation)".to_string()
        } else {
            day_messages
                .iter()
                .rev()
                .take(15)
                .rev()
                .map(|m| format!("[{}] {}", m.role.as_str(), truncate(&m.content.as_text(), 200)))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let request = CompletionRequest {
            model: self.config.model.clone(),
            system: self.config.system_prompt.clone(),
            messages: vec![(
                Role::User,
                Content::text(format!(
                    "{}\n\nToday's conversation:\n{}",
                    self.config.diary_prompt, context
                )),
            )],
            max_tokens: self.config.diary_max_tokens,
            temperature: 0.7,
        };
        let result = client
            .complete(&request)
            .await
            .context("diary request failed")?;

        let text = result.text.trim();
        if text.is_empty() {
            tracing::warn!("Diary completion came back empty, will retry next tick");
            return Ok(());
        }

        self.memory.write_diary_on(date, text)?;
        self.memory
            .update_state(|s| s.last_thought = Some(truncate(text, 200)))?;
        let _ = self.events.send(AgentEvent::DiaryWritten { date });
        Ok(())
    }
}

fn truncate(input: &str, max_chars: usize) -> String {
    let mut out = String::new();
    for (idx, ch) in input.chars().enumerate() {
        if idx >= max_chars {
            out.push_str("...");
            break;
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN_SILENCE: u64 = 600;

    #[test]
    fn no_key_idles_before_anything_else() {
        let action = tick_action(false, true, false, Some(10_000), MIN_SILENCE, 0.9, 0.0);
        assert_eq!(action, TickAction::Idle);
    }

    #[test]
    fn diary_takes_priority_over_initiation() {
        let action = tick_action(true, true, false, Some(10_000), MIN_SILENCE, 0.9, 0.0);
        assert_eq!(action, TickAction::WriteDiary);
    }

    #[test]
    fn never_initiates_on_top_of_own_message() {
        // Regardless of how favorable everything else looks.
        let action = tick_action(true, false, true, Some(10_000), MIN_SILENCE, 1.0, 0.0);
        assert_eq!(action, TickAction::Suppressed);
    }

    #[test]
    fn short_silence_counts_as_staying_silent() {
        let action = tick_action(true, false, false, Some(30), MIN_SILENCE, 1.0, 0.0);
        assert_eq!(action, TickAction::StaySilent(SilenceReason::WindowNotMet));
    }

    #[test]
    fn draw_below_mood_initiates() {
        let action = tick_action(true, false, false, Some(10_000), MIN_SILENCE, 0.6, 0.3);
        assert_eq!(action, TickAction::Initiate);
        let action = tick_action(true, false, false, Some(10_000), MIN_SILENCE, 0.6, 0.9);
        assert_eq!(action, TickAction::StaySilent(SilenceReason::DrawLost));
    }

    #[test]
    fn empty_history_passes_the_silence_window() {
        let action = tick_action(true, false, false, None, MIN_SILENCE, 0.9, 0.1);
        assert_eq!(action, TickAction::Initiate);
    }

    #[test]
    fn mood_saturates_at_one_under_repeated_silence() {
        let mut mood = 0.5;
        for _ in 0..100 {
            mood = mood_after_silence(mood, 0.03);
        }
        assert_eq!(mood, 1.0);
    }

    #[test]
    fn mood_floors_under_repeated_speaking() {
        let mut mood = 0.5;
        for _ in 0..100 {
            mood = mood_after_speaking(mood, 0.15, 0.1);
        }
        assert_eq!(mood, 0.1);
    }

    #[test]
    fn diary_due_only_after_the_hour_and_once() {
        let early = NaiveTime::from_hms_opt(12, 0, 0).unwrap();
        let late = NaiveTime::from_hms_opt(23, 30, 0).unwrap();
        assert!(!diary_is_due(early, "23:00", false));
        assert!(diary_is_due(late, "23:00", false));
        assert!(!diary_is_due(late, "23:00", true));
    }

    #[test]
    fn unparseable_diary_time_falls_back_to_late_evening() {
        let t = parse_diary_time("not a time");
        assert_eq!(t, NaiveTime::from_hms_opt(23, 0, 0).unwrap());
    }
}

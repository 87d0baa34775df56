//! Dialogue pipeline.
//!
//! A bounded priority queue feeds one strictly serial worker (the generator
//! backend is not thread-safe). The worker enforces per-speaker per-channel
//! cooldowns, a sliding-window rate ceiling (deferral, not loss), and a
//! duplicate cache; generator failures degrade to a template table rather
//! than blocking the queue.

use crate::bridge::protocol::{ActionRequest, WireMessage};
use crate::bridge::SensorBridge;
use crate::config::DialogueConfig;
use crate::memory::{ContextSnapshot, ConversationRecord, MemoryStore, WriteOp};
use crate::util::now_ts_millis;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub mod generator;

use generator::{ChatGenerator, ChatMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Global,
    Local,
    Whisper,
}

impl Channel {
    fn cooldown_ms(self, config: &DialogueConfig) -> u64 {
        match self {
            Channel::Global => config.cooldown_global_ms,
            Channel::Local => config.cooldown_local_ms,
            Channel::Whisper => config.cooldown_whisper_ms,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Global => "global",
            Channel::Local => "local",
            Channel::Whisper => "whisper",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextTag {
    /// Somebody addressed this agent directly; answered on the private
    /// channel.
    DirectMention,
    NameMention,
    Greeting,
    CallForHelp,
    ShareLocation,
    /// Agent-to-agent background chatter.
    Ambient,
}

impl ContextTag {
    pub fn default_priority(self) -> u8 {
        match self {
            ContextTag::DirectMention => 10,
            ContextTag::CallForHelp => 8,
            ContextTag::NameMention => 5,
            ContextTag::Greeting => 3,
            ContextTag::ShareLocation => 2,
            ContextTag::Ambient => 1,
        }
    }

    pub fn channel(self) -> Channel {
        match self {
            ContextTag::DirectMention => Channel::Whisper,
            ContextTag::CallForHelp | ContextTag::ShareLocation => Channel::Global,
            ContextTag::NameMention | ContextTag::Greeting | ContextTag::Ambient => Channel::Local,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            ContextTag::DirectMention => "direct_mention",
            ContextTag::NameMention => "name_mention",
            ContextTag::Greeting => "greeting",
            ContextTag::CallForHelp => "call_for_help",
            ContextTag::ShareLocation => "share_location",
            ContextTag::Ambient => "ambient",
        }
    }

    fn templates(self) -> &'static [&'static str] {
        match self {
            ContextTag::DirectMention => &[
                "Yes {listener}?",
                "I hear you, {listener}.",
                "What do you need, {listener}?",
            ],
            ContextTag::NameMention => &[
                "Someone called? {speaker} here.",
                "{speaker}, reporting in.",
            ],
            ContextTag::Greeting => &[
                "Hey {listener}!",
                "Hello there, {listener}.",
                "Good to see you, {listener}.",
            ],
            ContextTag::CallForHelp => &[
                "Need a hand over here!",
                "Trouble at my position, come quick!",
            ],
            ContextTag::ShareLocation => &[
                "I marked a spot worth checking.",
                "Found something useful nearby.",
            ],
            ContextTag::Ambient => &[
                "Busy day out here.",
                "Anyone seen iron around?",
                "This biome keeps surprising me.",
                "Watch the creepers after dark.",
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct DialogueRequest {
    pub id: u64,
    pub speaker: String,
    pub listener: String,
    pub tag: ContextTag,
    pub priority: u8,
    pub enqueued_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub speaker: String,
    pub listener: String,
    pub channel: Channel,
    pub text: String,
}

/// Where committed utterances go.
pub enum ChatSink {
    Bridge(Arc<SensorBridge>),
    #[cfg(test)]
    Collect(std::sync::Mutex<Vec<Utterance>>),
}

#[derive(Debug, Clone, Default)]
pub struct DialogueStats {
    pub queue_depth: usize,
    pub emitted: u64,
    pub dropped_duplicates: u64,
    pub dropped_overflow: u64,
    pub template_fallbacks: u64,
}

/// Outcome of one worker iteration.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Step {
    Emitted,
    DroppedDuplicate,
    /// Rate ceiling reached or every pending speaker is cooling down.
    Deferred,
    Idle,
}

pub struct DialoguePipeline {
    config: DialogueConfig,
    generator: ChatGenerator,
    store: Arc<MemoryStore>,
    sink: ChatSink,
    queue: Mutex<Vec<DialogueRequest>>,
    cooldowns: Mutex<HashMap<(String, Channel), u64>>,
    dedup: Mutex<HashMap<String, VecDeque<String>>>,
    emitted_window: Mutex<VecDeque<u64>>,
    next_id: AtomicU64,
    rng: Mutex<StdRng>,
    notify: Notify,
    emitted: AtomicU64,
    dropped_duplicates: AtomicU64,
    dropped_overflow: AtomicU64,
    template_fallbacks: AtomicU64,
}

impl DialoguePipeline {
    pub fn new(
        config: DialogueConfig,
        generator: ChatGenerator,
        store: Arc<MemoryStore>,
        sink: ChatSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            generator,
            store,
            sink,
            queue: Mutex::new(Vec::new()),
            cooldowns: Mutex::new(HashMap::new()),
            dedup: Mutex::new(HashMap::new()),
            emitted_window: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            rng: Mutex::new(StdRng::seed_from_u64(now_ts_millis())),
            notify: Notify::new(),
            emitted: AtomicU64::new(0),
            dropped_duplicates: AtomicU64::new(0),
            dropped_overflow: AtomicU64::new(0),
            template_fallbacks: AtomicU64::new(0),
        })
    }

    /// Queues a request and returns immediately. Ambient chatter is gated by
    /// the configured reply probability; a full queue evicts the
    /// lowest-priority pending item.
    pub async fn enqueue(&self, speaker: &str, listener: &str, tag: ContextTag, priority: u8) {
        if tag == ContextTag::Ambient {
            let roll: f64 = self.rng.lock().await.random();
            if roll >= self.config.ambient_reply_probability {
                return;
            }
        }
        let request = DialogueRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            speaker: speaker.to_string(),
            listener: listener.to_string(),
            tag,
            priority,
            enqueued_at: now_ts_millis(),
        };
        let mut queue = self.queue.lock().await;
        if queue.len() >= self.config.queue_capacity {
            // Drop the lowest-priority pending item (oldest among equals).
            if let Some(lowest) = queue
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| (r.priority, r.enqueued_at))
                .map(|(i, _)| i)
            {
                queue.remove(lowest);
                self.dropped_overflow.fetch_add(1, Ordering::Relaxed);
            }
        }
        queue.push(request);
        drop(queue);
        self.notify.notify_one();
    }

    pub async fn enqueue_tagged(&self, speaker: &str, listener: &str, tag: ContextTag) {
        self.enqueue(speaker, listener, tag, tag.default_priority())
            .await;
    }

    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let pipeline = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = pipeline.notify.notified() => {}
                    _ = tokio::time::sleep(std::time::Duration::from_millis(250)) => {}
                }
                loop {
                    match pipeline.process_one(now_ts_millis()).await {
                        Step::Emitted | Step::DroppedDuplicate => continue,
                        Step::Deferred | Step::Idle => break,
                    }
                }
            }
        });
    }

    pub async fn stats(&self) -> DialogueStats {
        DialogueStats {
            queue_depth: self.queue.lock().await.len(),
            emitted: self.emitted.load(Ordering::Relaxed),
            dropped_duplicates: self.dropped_duplicates.load(Ordering::Relaxed),
            dropped_overflow: self.dropped_overflow.load(Ordering::Relaxed),
            template_fallbacks: self.template_fallbacks.load(Ordering::Relaxed),
        }
    }

    /// One serial worker iteration at wall-clock `now_ms`.
    pub(crate) async fn process_one(&self, now_ms: u64) -> Step {
        // Rate ceiling first: over the limit nothing is popped, nothing lost.
        {
            let mut window = self.emitted_window.lock().await;
            while window
                .front()
                .map(|t| now_ms.saturating_sub(*t) >= 60_000)
                .unwrap_or(false)
            {
                window.pop_front();
            }
            if window.len() >= self.config.rate_limit_per_min {
                return Step::Deferred;
            }
        }

        let request = {
            let mut queue = self.queue.lock().await;
            if queue.is_empty() {
                return Step::Idle;
            }
            let cooldowns = self.cooldowns.lock().await;
            let eligible = queue
                .iter()
                .enumerate()
                .filter(|(_, r)| {
                    let key = (r.speaker.clone(), r.tag.channel());
                    let cooldown = r.tag.channel().cooldown_ms(&self.config);
                    cooldowns
                        .get(&key)
                        .map(|last| now_ms.saturating_sub(*last) >= cooldown)
                        .unwrap_or(true)
                })
                .max_by_key(|(_, r)| (r.priority, std::cmp::Reverse(r.enqueued_at)))
                .map(|(i, _)| i);
            match eligible {
                Some(index) => queue.remove(index),
                None => return Step::Deferred,
            }
        };

        let (text, source) = self.produce_text(&request).await;
        let text = sanitize(&text);
        if text.is_empty() {
            self.dropped_duplicates.fetch_add(1, Ordering::Relaxed);
            return Step::DroppedDuplicate;
        }

        // Duplicate cache: identical (speaker, text) pairs inside the window
        // are dropped, whatever produced them.
        {
            let mut dedup = self.dedup.lock().await;
            let cache = dedup.entry(request.speaker.clone()).or_default();
            if cache.contains(&text) {
                debug!("{}: dropped duplicate utterance", request.speaker);
                self.dropped_duplicates.fetch_add(1, Ordering::Relaxed);
                return Step::DroppedDuplicate;
            }
            cache.push_back(text.clone());
            while cache.len() > self.config.dedup_window {
                cache.pop_front();
            }
        }

        let channel = request.tag.channel();
        self.commit(&request, channel, &text, source, now_ms).await;
        Step::Emitted
    }

    async fn produce_text(&self, request: &DialogueRequest) -> (String, &'static str) {
        let prompt = self.build_prompt(request);
        match self.generator.generate(&prompt).await {
            Ok(text) if !sanitize(&text).is_empty() => (text, "oracle"),
            Ok(_) => (self.template_for(request), "template"),
            Err(e) => {
                debug!("Generator failed for {}: {e}", request.speaker);
                self.template_fallbacks.fetch_add(1, Ordering::Relaxed);
                (self.template_for(request), "template")
            }
        }
    }

    fn build_prompt(&self, request: &DialogueRequest) -> Vec<ChatMessage> {
        let persona = self
            .store
            .prompt_template("persona")
            .unwrap_or_else(|| {
                "You are {speaker}, a villager working in a shared Minecraft world. \
                 Reply with one or two short, plain sentences. No markup."
                    .to_string()
            })
            .replace("{speaker}", &request.speaker);
        let mut messages = vec![ChatMessage::system(persona)];
        for past in self.store.recent_conversations(&request.speaker, 3) {
            messages.push(ChatMessage::user(format!(
                "{} said earlier: {}",
                past.listener, past.text
            )));
        }
        messages.push(ChatMessage::user(format!(
            "Context: {}. Say something to {}.",
            request.tag.as_str(),
            request.listener
        )));
        messages
    }

    /// Deterministic context-to-template draw: the same (speaker, listener,
    /// tag) always yields the same line, which lets the dedup cache collapse
    /// repeated requests.
    fn template_for(&self, request: &DialogueRequest) -> String {
        use std::hash::{Hash, Hasher};
        let templates = request.tag.templates();
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        request.speaker.hash(&mut hasher);
        request.listener.hash(&mut hasher);
        request.tag.as_str().hash(&mut hasher);
        let index = hasher.finish() as usize % templates.len();
        templates[index]
            .replace("{speaker}", &request.speaker)
            .replace("{listener}", &request.listener)
    }

    async fn commit(
        &self,
        request: &DialogueRequest,
        channel: Channel,
        text: &str,
        source: &'static str,
        now_ms: u64,
    ) {
        match &self.sink {
            ChatSink::Bridge(bridge) => {
                let mut params = serde_json::Map::new();
                params.insert("message".to_string(), text.into());
                params.insert("channel".to_string(), channel.as_str().into());
                params.insert("listener".to_string(), request.listener.clone().into());
                let msg = WireMessage::Action(ActionRequest {
                    target: request.speaker.clone(),
                    action: "chat".to_string(),
                    params,
                });
                if let Err(e) = bridge.send(msg) {
                    warn!("Chat commit failed for {}: {e}", request.speaker);
                }
            }
            #[cfg(test)]
            ChatSink::Collect(collected) => {
                if let Ok(mut out) = collected.lock() {
                    out.push(Utterance {
                        speaker: request.speaker.clone(),
                        listener: request.listener.clone(),
                        channel,
                        text: text.to_string(),
                    });
                }
            }
        }

        self.cooldowns
            .lock()
            .await
            .insert((request.speaker.clone(), channel), now_ms);
        self.emitted_window.lock().await.push_back(now_ms);
        self.emitted.fetch_add(1, Ordering::Relaxed);

        self.store.enqueue(WriteOp::Conversation(ConversationRecord {
            speaker: request.speaker.clone(),
            listener: request.listener.clone(),
            channel: channel.as_str().to_string(),
            text: text.to_string(),
            ts: now_ms,
        }));
        self.store
            .enqueue(WriteOp::ContextSnapshot(ContextSnapshot {
                speaker: request.speaker.clone(),
                listener: request.listener.clone(),
                context_tag: request.tag.as_str().to_string(),
                source: source.to_string(),
                prompt: request.tag.as_str().to_string(),
                response: text.to_string(),
                ts: now_ms,
            }));
    }
}

/// Strips chat-template markers and leaked scaffolding, collapses
/// whitespace, and truncates to at most two sentences.
pub fn sanitize(raw: &str) -> String {
    let mut text = raw.to_string();
    for marker in [
        "<|im_start|>",
        "<|im_end|>",
        "<|endoftext|>",
        "<s>",
        "</s>",
        "[INST]",
        "[/INST]",
        "###",
    ] {
        text = text.replace(marker, " ");
    }
    let mut kept: Vec<&str> = Vec::new();
    for line in text.lines() {
        let mut line = line.trim();
        let lower = line.to_lowercase();
        // Leaked persona/system fragments go entirely; role prefixes are
        // stripped but their content survives.
        if lower.starts_with("you are ") || lower.starts_with("system:") {
            continue;
        }
        if lower.starts_with("assistant:") {
            line = line["assistant:".len()..].trim();
        }
        kept.push(line);
    }
    let text = kept.join(" ");
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_matches(|c| c == '"' || c == '\'').trim();

    // Keep at most two sentences.
    let mut out = String::new();
    let mut sentences = 0;
    for ch in trimmed.chars() {
        out.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            sentences += 1;
            if sentences >= 2 {
                break;
            }
        }
        if out.len() >= 240 {
            break;
        }
    }
    out.trim().to_string()
}

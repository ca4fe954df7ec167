//! Scripted backend for orchestrator and pipeline tests

use super::client::{BackendReply, ChatBackend};
use super::models::{Model, Usage};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// A `ChatBackend` that replays a fixed script of replies.
///
/// `Ok(text)` becomes a successful reply; `Err(message)` becomes a
/// transport failure. Every user prompt is recorded for assertions.
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<Result<String, String>>>,
    prompts: Mutex<Vec<String>>,
    usage: Option<(u32, u32)>,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<Result<String, String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
            usage: None,
        }
    }

    /// Attach fixed usage numbers to every reply.
    pub fn usage_per_reply(&mut self, prompt_tokens: u32, completion_tokens: u32) {
        self.usage = Some((prompt_tokens, completion_tokens));
    }

    /// User prompts seen so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn complete(
        &self,
        _system: &str,
        user: &str,
        _model: Model,
        _json_mode: bool,
    ) -> anyhow::Result<BackendReply> {
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(user.to_string());

        let next = self
            .replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("scripted backend exhausted"))?;

        match next {
            Ok(content) => Ok(BackendReply {
                content,
                usage: self.usage.map(|(p, c)| Usage {
                    prompt_tokens: p,
                    completion_tokens: c,
                    total_tokens: p + c,
                    cost: None,
                }),
            }),
            Err(message) => Err(anyhow::anyhow!("{}", message)),
        }
    }
}

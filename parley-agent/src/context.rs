//! Context builder for assembling generation requests

use parley_core::config::ChatConfig;
use parley_core::session::{Attachment, Message, Mode, Role};
use parley_providers::{Content, GenerationConfig, InlineData, Part, Tool};

/// Builds the wire history and per-turn settings for a session
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    chat: ChatConfig,
}

impl ContextBuilder {
    /// Create a new context builder
    pub fn new(chat: ChatConfig) -> Self {
        Self { chat }
    }

    pub fn chat_config(&self) -> &ChatConfig {
        &self.chat
    }

    /// Text every new or cleared session is seeded with
    pub fn welcome_message(&self) -> &str {
        &self.chat.welcome_message
    }

    /// Re-express prior messages as role/content pairs.
    ///
    /// Model messages before the first user message (the welcome seed) and
    /// messages still streaming are left out. Failed replies contribute only
    /// the text produced before the failure.
    pub fn history_view(&self, messages: &[Message]) -> Vec<Content> {
        messages
            .iter()
            .skip_while(|m| m.role == Role::Model)
            .filter(|m| !m.streaming)
            .filter_map(|m| match m.role {
                Role::User => {
                    let parts = user_parts(&m.text, &m.attachments);
                    (!parts.is_empty()).then(|| Content::user(parts))
                }
                Role::Model => {
                    let text = m.partial_text();
                    (!text.is_empty()).then(|| Content::model(text))
                }
            })
            .collect()
    }

    /// Content for the submission being sent
    pub fn new_turn(&self, text: &str, attachments: &[Attachment]) -> Content {
        Content::user(user_parts(text, attachments))
    }

    /// Generation settings for a session in `mode`
    pub fn turn_config(&self, mode: Mode) -> GenerationConfig {
        let mut instruction = self.chat.system_instruction.trim().to_string();
        let mode_prompt = self.chat.modes.for_mode(mode).trim();
        if !mode_prompt.is_empty() {
            if !instruction.is_empty() {
                instruction.push_str("\n\n");
            }
            instruction.push_str(mode_prompt);
        }

        let tools = match mode {
            Mode::Research => vec![Tool::GoogleSearch],
            Mode::Default => Vec::new(),
        };

        GenerationConfig {
            system_instruction: (!instruction.is_empty()).then_some(instruction),
            tools,
            thinking_budget: self.chat.thinking_budget,
        }
    }
}

fn user_parts(text: &str, attachments: &[Attachment]) -> Vec<Part> {
    let mut parts = Vec::with_capacity(attachments.len() + 1);
    if !text.is_empty() {
        parts.push(Part::Text(text.to_string()));
    }
    parts.extend(attachments.iter().map(|a| {
        Part::InlineData(InlineData {
            mime_type: a.mime_type.clone(),
            data: a.to_base64(),
        })
    }));
    parts
}

//! Consultation orchestrator: the consult / continue / end state machine
//! around provider calls.
//!
//! Both entry points (REST one-shot and the socket ops) run through this
//! type, so they share store writes and hub events.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::ConfigService;
use crate::conversations::ConversationService;
use crate::error::{DaemonError, Result};
use crate::provider::client::ProviderEndpoint;
use crate::provider::{model_spec, ChatTurn, CompletionRequest, ProviderClient};
use crate::rag::{RagPipeline, RetrieveFilters};
use crate::store::schema::{EndReason, Role};

/// Consultation modes and their canned system prompts.
pub const MODES: &[(&str, &str)] = &[
    ("debug", DEBUG_PROMPT),
    ("analyzeCode", ANALYZE_CODE_PROMPT),
    ("reviewArchitecture", REVIEW_ARCHITECTURE_PROMPT),
    ("validatePlan", VALIDATE_PLAN_PROMPT),
    ("explainConcept", EXPLAIN_CONCEPT_PROMPT),
    ("general", GENERAL_PROMPT),
];

const DEBUG_PROMPT: &str = "You are a senior debugging specialist giving a second opinion. \
Work from the evidence in the question: reconstruct the failure, name the most likely root \
causes in order of probability, and propose the smallest experiment that discriminates \
between them. Be explicit about what you would need to see to change your mind.";

const ANALYZE_CODE_PROMPT: &str = "You are a senior engineer reviewing code that another \
assistant produced or modified. Judge correctness first, then clarity, then performance. \
Point at concrete lines or constructs, state what is wrong or fragile and why, and suggest \
the minimal change that fixes it.";

const REVIEW_ARCHITECTURE_PROMPT: &str = "You are a software architect giving a second \
opinion on a design. Evaluate the proposed structure against the stated constraints: data \
ownership, failure modes, coupling, and how the design evolves under likely change. Name \
the decisions that are hard to reverse and whether they are justified.";

const VALIDATE_PLAN_PROMPT: &str = "You are validating an implementation plan before work \
starts. Check that the steps are ordered safely, that each step is verifiable, and that \
rollback exists where a step can fail halfway. Call out missing steps and hidden \
assumptions, and say clearly whether you would proceed with the plan as written.";

const EXPLAIN_CONCEPT_PROMPT: &str = "You are explaining a technical concept to a \
competent engineer who is new to this particular area. Start from what the concept is \
for, build up the mechanism with a concrete example, and flag the misconceptions people \
usually carry into it. Prefer precision over breadth.";

const GENERAL_PROMPT: &str = "You are a senior engineer consulted for a second opinion. \
Answer directly and concretely, state your confidence and the assumptions you are making, \
and say what additional context would improve the answer.";

pub const DEFAULT_MODE: &str = "general";
/// Cap on the thinking summary surfaced to clients.
const THINKING_SUMMARY_LIMIT: usize = 500;
const TRUNCATION_MARKER: &str = "...";

pub fn mode_prompt(mode: &str) -> Option<&'static str> {
    MODES
        .iter()
        .find(|(name, _)| *name == mode)
        .map(|(_, prompt)| *prompt)
}

#[derive(Debug, Clone, Default)]
pub struct ConsultOptions {
    pub question: String,
    pub mode: Option<String>,
    pub context: Option<String>,
    pub doc_ids: Option<Vec<String>>,
    pub doc_titles: Option<Vec<String>>,
    pub folder: Option<String>,
    pub model: Option<String>,
    /// Overrides the mode prompt when set (REST one-shot surface).
    pub system_prompt: Option<String>,
    /// Skip retrieval entirely when false.
    pub use_rag: bool,
}

impl ConsultOptions {
    pub fn question(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            use_rag: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingSummary {
    pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsultMetadata {
    pub response_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsultOutcome {
    pub conversation_id: String,
    pub answer: String,
    pub model: String,
    pub mode: String,
    pub message_count: usize,
    pub can_continue: bool,
    pub metadata: ConsultMetadata,
    /// The context paragraph used for this turn; never persisted and not
    /// part of the socket response shape.
    #[serde(skip)]
    pub rag_context: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndOutcome {
    pub status: &'static str,
    pub conversation_id: String,
    pub total_messages: usize,
}

pub struct ConsultationOrchestrator {
    conversations: Arc<ConversationService>,
    config: Arc<ConfigService>,
    rag: Arc<RagPipeline>,
    provider: ProviderClient,
}

impl ConsultationOrchestrator {
    pub fn new(
        conversations: Arc<ConversationService>,
        config: Arc<ConfigService>,
        rag: Arc<RagPipeline>,
    ) -> Self {
        Self {
            conversations,
            config,
            rag,
            provider: ProviderClient::new(),
        }
    }

    /// Start a consultation: new conversation, first exchange.
    pub async fn consult(&self, options: ConsultOptions) -> Result<ConsultOutcome> {
        if options.question.trim().is_empty() {
            return Err(DaemonError::validation("question", "must not be empty"));
        }

        let config = self.config.load()?;
        let model = options
            .model
            .clone()
            .unwrap_or_else(|| config.default_model.clone());
        let spec = model_spec(&model)
            .ok_or_else(|| DaemonError::validation("model", format!("unknown model '{}'", model)))?;
        let endpoint = self.resolve_endpoint(&config, spec)?;

        let mode = options
            .mode
            .clone()
            .unwrap_or_else(|| DEFAULT_MODE.to_string());
        let base_prompt = match options.system_prompt.as_deref() {
            Some(custom) => custom.to_string(),
            None => mode_prompt(&mode)
                .ok_or_else(|| {
                    DaemonError::validation("mode", format!("unknown mode '{}'", mode))
                })?
                .to_string(),
        };

        let rag_context = self.resolve_rag_context(&options).await;
        let system_prompt = match &rag_context {
            Some(context) => format!("{}\n\n{}", base_prompt, context),
            None => base_prompt.clone(),
        };

        let conversation = self.conversations.create(&model, Some(&base_prompt))?;
        let user_turn = render_user_turn(options.context.as_deref(), &options.question);
        self.conversations
            .add_message(&conversation.id, Role::User, &user_turn)?;

        let outcome = self
            .run_exchange(&conversation.id, spec, &endpoint, &system_prompt, &mode, config.request_timeout)
            .await?;
        info!(
            "consult done: conversation {} via {} ({}ms)",
            conversation.id, model, outcome.metadata.response_time
        );
        Ok(ConsultOutcome {
            rag_context,
            ..outcome
        })
    }

    /// Continue an existing consultation with one more exchange. The RAG
    /// context for this turn is resolved from the new message and merged
    /// only for the call, never persisted.
    pub async fn continue_conversation(
        &self,
        conversation_id: &str,
        message: &str,
        filters: RetrieveFilters,
    ) -> Result<ConsultOutcome> {
        if message.trim().is_empty() {
            return Err(DaemonError::validation("message", "must not be empty"));
        }

        let config = self.config.load()?;
        let (conversation, _messages) = self.conversations.get(conversation_id)?;
        if conversation.status == crate::store::schema::ConversationStatus::Archived {
            return Err(DaemonError::validation(
                "conversationId",
                format!(
                    "conversation is archived ({})",
                    conversation
                        .end_reason
                        .map(|r| r.as_str())
                        .unwrap_or("unknown")
                ),
            ));
        }
        let spec = model_spec(&conversation.model).ok_or_else(|| {
            DaemonError::validation(
                "model",
                format!("conversation uses unknown model '{}'", conversation.model),
            )
        })?;
        let endpoint = self.resolve_endpoint(&config, spec)?;

        let base_prompt = conversation.system_prompt.clone().unwrap_or_default();
        let rag_context = {
            let options = ConsultOptions {
                question: message.to_string(),
                doc_ids: filters.doc_ids.clone(),
                doc_titles: filters.doc_titles.clone(),
                folder: filters.folder.clone(),
                use_rag: true,
                ..Default::default()
            };
            self.resolve_rag_context(&options).await
        };
        let system_prompt = match &rag_context {
            Some(context) if !base_prompt.is_empty() => format!("{}\n\n{}", base_prompt, context),
            Some(context) => context.clone(),
            None => base_prompt,
        };

        match self
            .conversations
            .add_message(conversation_id, Role::User, message)
        {
            Ok(_) => {}
            Err(DaemonError::LimitExceeded(_)) => {
                // Cap hit: the conversation is done; archive it as a timeout
                // and tell the caller why.
                self.conversations
                    .archive(conversation_id, EndReason::Timeout)?;
                return Err(DaemonError::LimitExceeded(
                    "message limit reached; conversation archived as timeout".to_string(),
                ));
            }
            Err(e) => return Err(e),
        }

        let mode = DEFAULT_MODE.to_string();
        let outcome = self
            .run_exchange(conversation_id, spec, &endpoint, &system_prompt, &mode, config.request_timeout)
            .await?;
        Ok(ConsultOutcome {
            rag_context,
            ..outcome
        })
    }

    /// End a consultation as completed.
    pub fn end(&self, conversation_id: &str) -> Result<EndOutcome> {
        let changed = self
            .conversations
            .archive(conversation_id, EndReason::Completed)?;
        if !changed {
            let (conversation, _) = self.conversations.get(conversation_id)?;
            return Err(DaemonError::validation(
                "conversationId",
                format!(
                    "conversation already archived ({})",
                    conversation
                        .end_reason
                        .map(|r| r.as_str())
                        .unwrap_or("unknown")
                ),
            ));
        }
        let total_messages = self.conversations.message_count(conversation_id)?;
        Ok(EndOutcome {
            status: "ended",
            conversation_id: conversation_id.to_string(),
            total_messages,
        })
    }

    /// One provider round trip plus the assistant append and response
    /// assembly shared by consult and continue.
    async fn run_exchange(
        &self,
        conversation_id: &str,
        spec: &'static crate::provider::ModelSpec,
        endpoint: &ProviderEndpoint,
        system_prompt: &str,
        mode: &str,
        request_timeout: u64,
    ) -> Result<ConsultOutcome> {
        let (_, messages) = self.conversations.get(conversation_id)?;
        let turns: Vec<ChatTurn> = messages
            .iter()
            .map(|m| ChatTurn::new(m.role.as_str(), m.content.clone()))
            .collect();

        let response = self
            .provider
            .complete(
                endpoint,
                spec,
                CompletionRequest {
                    messages: turns,
                    system_prompt: (!system_prompt.is_empty())
                        .then(|| system_prompt.to_string()),
                    max_tokens: spec.max_output_tokens,
                    timeout_ms: request_timeout,
                },
            )
            .await?;

        self.conversations
            .add_message(conversation_id, Role::Assistant, &response.content)?;

        let config = self.config.load()?;
        let message_count = self.conversations.message_count(conversation_id)?;
        let can_continue = message_count < config.message_cap();
        let (conversation, _) = self.conversations.get(conversation_id)?;

        debug!(
            "exchange complete: {} messages, can_continue={}",
            message_count, can_continue
        );
        Ok(ConsultOutcome {
            conversation_id: conversation_id.to_string(),
            answer: response.content,
            model: conversation.model,
            mode: mode.to_string(),
            message_count,
            can_continue,
            metadata: ConsultMetadata {
                response_time: response.response_time_ms,
                tokens_used: response.usage.map(|u| u.total_tokens),
                thinking: response
                    .reasoning_content
                    .as_deref()
                    .map(|content| ThinkingSummary {
                        summary: summarize_thinking(content),
                    }),
            },
            rag_context: None,
        })
    }

    fn resolve_endpoint(
        &self,
        config: &crate::config::DaemonConfig,
        spec: &crate::provider::ModelSpec,
    ) -> Result<ProviderEndpoint> {
        let settings = config.providers.get(spec.provider);
        let api_key = settings
            .api_key
            .clone()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                DaemonError::auth(format!(
                    "no API key configured for provider '{}'",
                    spec.provider.as_str()
                ))
            })?;
        Ok(ProviderEndpoint {
            api_key,
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| spec.provider.default_base_url().to_string()),
        })
    }

    async fn resolve_rag_context(&self, options: &ConsultOptions) -> Option<String> {
        if !options.use_rag {
            return None;
        }
        let filters = RetrieveFilters {
            doc_ids: options.doc_ids.clone(),
            doc_titles: options.doc_titles.clone(),
            folder: options.folder.clone(),
            ..Default::default()
        };
        // Retrieval failures must not block a consultation; an unreachable
        // embedding service just means no context this turn.
        match self.rag.retrieve(&options.question, &filters).await {
            Ok(retrieval) => retrieval.context,
            Err(e) => {
                debug!("rag retrieval skipped: {}", e);
                None
            }
        }
    }
}

/// The persisted user turn, with caller-supplied context folded in.
fn render_user_turn(context: Option<&str>, question: &str) -> String {
    match context {
        Some(context) if !context.is_empty() => {
            format!("Context:\n{}\n\nQuestion:\n{}", context, question)
        }
        _ => question.to_string(),
    }
}

/// First lines of the reasoning content, cut at 500 characters with a
/// trailing marker when shortened.
fn summarize_thinking(reasoning: &str) -> String {
    let mut summary = String::new();
    let mut truncated = false;
    for line in reasoning.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let candidate_len = if summary.is_empty() {
            line.chars().count()
        } else {
            summary.chars().count() + 1 + line.chars().count()
        };
        if candidate_len > THINKING_SUMMARY_LIMIT {
            truncated = true;
            break;
        }
        if !summary.is_empty() {
            summary.push(' ');
        }
        summary.push_str(line);
    }

    if summary.is_empty() {
        // One unbroken long line: hard cut.
        summary = reasoning.chars().take(THINKING_SUMMARY_LIMIT).collect();
        truncated = summary.chars().count() < reasoning.chars().count();
    }

    if truncated {
        summary.push_str(TRUNCATION_MARKER);
    }
    summary
}

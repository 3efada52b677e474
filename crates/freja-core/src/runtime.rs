// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use freja_config::ApprovalMode;
use freja_model::{
    stream::StreamAssembler, CompletionRequest, FinishReason, Message, StreamEvent, ToolSchema,
};
use freja_team::{parse_transfer_args, transfer_tool, Team, TRANSFER_TOOL_NAME};
use freja_tools::Tool;

use crate::events::{AgentEvent, ResumeRequest};
use crate::prompts::system_prompt;
use crate::session::Session;

/// Result body recorded when the user rejects a tool call.
pub const REJECTED_RESULT: &str = "(tool call rejected by user)";

/// Capacity of the per-turn event channel.  Bounded so a stalled consumer
/// applies backpressure to the loop instead of buffering without limit.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Control surface of one running turn.
#[derive(Clone)]
pub struct TurnHandle {
    resume: mpsc::Sender<ResumeRequest>,
    cancel: CancellationToken,
}

impl TurnHandle {
    /// Deliver an answer into a paused turn.  Returns false when the turn
    /// already ended.
    pub async fn resume(&self, request: ResumeRequest) -> bool {
        self.resume.send(request).await.is_ok()
    }

    /// End the turn.  Distinct from a Reject resume: cancel ends the whole
    /// turn, reject ends one tool call.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Drives one agent team against one session.
pub struct Runtime {
    team: Arc<Team>,
    /// The agent the next iteration runs as; `transfer_task` repoints it.
    current_agent: Mutex<String>,
    /// Tools approved for the rest of the session via ApproveSession.
    approved_tools: Mutex<HashSet<String>>,
}

impl Runtime {
    pub fn new(team: Arc<Team>) -> Arc<Self> {
        let root = team.root().to_string();
        Arc::new(Self {
            team,
            current_agent: Mutex::new(root),
            approved_tools: Mutex::new(HashSet::new()),
        })
    }

    pub fn team(&self) -> &Arc<Team> {
        &self.team
    }

    pub async fn current_agent(&self) -> String {
        self.current_agent.lock().await.clone()
    }

    /// Run the current agent's turn.  Non-blocking: the turn runs on its own
    /// task, events arrive on the returned receiver, and the receiver closes
    /// when the turn terminates.
    pub fn run_stream(
        self: &Arc<Self>,
        session: Arc<Mutex<Session>>,
    ) -> (mpsc::Receiver<AgentEvent>, TurnHandle) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (resume_tx, resume_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = TurnHandle { resume: resume_tx, cancel: cancel.clone() };

        let rt = self.clone();
        tokio::spawn(async move {
            rt.run_turn(session, tx, resume_rx, cancel).await;
        });

        (rx, handle)
    }

    async fn run_turn(
        self: Arc<Self>,
        session: Arc<Mutex<Session>>,
        tx: mpsc::Sender<AgentEvent>,
        mut resume_rx: mpsc::Receiver<ResumeRequest>,
        cancel: CancellationToken,
    ) {
        let mut agent_name = self.current_agent().await;
        let original_bound = match self.team.get(&agent_name) {
            Some(a) => a.config.max_iterations.max(1),
            None => {
                let _ = tx.send(AgentEvent::Error(format!("unknown agent: {agent_name}"))).await;
                return;
            }
        };
        let mut bound = original_bound;
        let mut iterations = 0u32;

        loop {
            if cancel.is_cancelled() {
                return;
            }
            iterations += 1;

            let agent = match self.team.get(&agent_name) {
                Some(a) => a,
                None => {
                    let _ = tx
                        .send(AgentEvent::Error(format!("unknown agent: {agent_name}")))
                        .await;
                    return;
                }
            };

            // Collect tools: the agent's toolsets plus the handoff tool when
            // it has sub-agents.  Lazy toolset start happens inside.
            let mut tools = agent.toolsets.tools().await;
            if let Some(t) = transfer_tool(&self.team, &agent_name) {
                tools.push(t);
            }
            let schemas: Vec<ToolSchema> = tools
                .iter()
                .map(|t| ToolSchema {
                    name: t.def.name.clone(),
                    description: t.def.description.clone(),
                    parameters: t.def.parameters.clone(),
                })
                .collect();

            let instructions = agent.toolsets.instructions().await;
            let system = system_prompt(&agent.config, &instructions, Utc::now());

            let request = {
                let session = session.lock().await;
                let mut messages = Vec::with_capacity(session.messages.len() + 1);
                if !system.is_empty() {
                    messages.push(Message::system(system));
                }
                messages.extend(session.messages.iter().cloned());
                CompletionRequest { messages, tools: schemas, stream: true }
            };

            debug!(
                agent = %agent_name,
                iteration = iterations,
                tool_count = tools.len(),
                "model call"
            );

            let mut stream = match agent.provider.complete(request).await {
                Ok(s) => s,
                Err(e) => {
                    let _ = tx.send(AgentEvent::Error(format!("{e:#}"))).await;
                    return;
                }
            };

            // Consume the stream, emitting text/reasoning incrementally and
            // reassembling tool calls.  Cancellation is checked between
            // chunks.
            let mut assembler = StreamAssembler::new();
            loop {
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    item = futures::StreamExt::next(&mut stream) => item,
                };
                let event = match item {
                    None => break,
                    Some(Ok(ev)) => ev,
                    Some(Err(e)) => {
                        let _ = tx.send(AgentEvent::Error(format!("{e:#}"))).await;
                        return;
                    }
                };
                match &event {
                    StreamEvent::TextDelta(t) => {
                        if tx.send(AgentEvent::Choice(t.clone())).await.is_err() {
                            return;
                        }
                    }
                    StreamEvent::ReasoningDelta(t) => {
                        if tx.send(AgentEvent::ChoiceReasoning(t.clone())).await.is_err() {
                            return;
                        }
                    }
                    StreamEvent::Done => {
                        assembler.absorb(&event);
                        break;
                    }
                    _ => {}
                }
                assembler.absorb(&event);
            }

            let turn = assembler.finish();
            let finish = turn.finish;
            let tool_calls = turn.tool_calls.clone();
            let assistant = turn.into_message();

            if !assistant.content.is_empty()
                || !assistant.tool_calls.is_empty()
                || assistant.reasoning_content.is_some()
            {
                session.lock().await.push(assistant);
            }

            if tool_calls.is_empty() || finish == FinishReason::Stop {
                return;
            }

            // Dispatch tool calls strictly in the order the assistant message
            // lists them; results are appended in that same order.
            for call in tool_calls {
                if cancel.is_cancelled() {
                    return;
                }
                match self
                    .dispatch_tool_call(&tools, &agent.config.approval, &call, &session, &tx, &mut resume_rx, &cancel)
                    .await
                {
                    DispatchOutcome::Continue => {}
                    DispatchOutcome::Transfer(target) => {
                        debug!(from = %agent_name, to = %target, "task transferred");
                        agent_name = target.clone();
                        *self.current_agent.lock().await = target;
                    }
                    DispatchOutcome::EndTurn => return,
                }
            }

            if iterations >= bound {
                if tx.send(AgentEvent::MaxIterationsReached(bound)).await.is_err() {
                    return;
                }
                match wait_resume(&mut resume_rx, &cancel).await {
                    Some(ResumeRequest::Approve) | Some(ResumeRequest::ApproveSession) => {
                        bound += original_bound;
                    }
                    Some(ResumeRequest::Reject) => {
                        session.lock().await.push(Message::assistant(format!(
                            "Stopped after {bound} iterations at the user's request."
                        )));
                        return;
                    }
                    None => return,
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_tool_call(
        &self,
        tools: &[Tool],
        approval: &ApprovalMode,
        call: &freja_model::ToolCall,
        session: &Arc<Mutex<Session>>,
        tx: &mpsc::Sender<AgentEvent>,
        resume_rx: &mut mpsc::Receiver<ResumeRequest>,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let tool = match tools.iter().find(|t| t.name() == call.name) {
            Some(t) => t.clone(),
            None => {
                // Unknown tool: answer the model instead of failing the turn.
                let msg = format!("unknown tool: {}", call.name);
                warn!(tool = %call.name, "model requested unknown tool");
                return self
                    .finish_tool_call(call, msg, true, None, session, tx)
                    .await;
            }
        };

        // Consent gate: destructive or not-known-read-only tools pause the
        // loop under an asking policy, unless already approved for the
        // session.
        let needs_confirmation = *approval == ApprovalMode::Ask
            && tool.def.annotations.requires_confirmation()
            && !self.approved_tools.lock().await.contains(&call.name);
        if needs_confirmation {
            let ev = AgentEvent::ToolCallConfirmation {
                call: call.clone(),
                def: tool.def.clone(),
            };
            if tx.send(ev).await.is_err() {
                return DispatchOutcome::EndTurn;
            }
            match wait_resume(resume_rx, cancel).await {
                Some(ResumeRequest::Approve) => {}
                Some(ResumeRequest::ApproveSession) => {
                    self.approved_tools.lock().await.insert(call.name.clone());
                }
                Some(ResumeRequest::Reject) => {
                    return self
                        .finish_tool_call(call, REJECTED_RESULT.to_string(), true, None, session, tx)
                        .await;
                }
                None => return DispatchOutcome::EndTurn,
            }
        }

        let started = AgentEvent::ToolCallStarted { call: call.clone(), def: tool.def.clone() };
        if tx.send(started).await.is_err() {
            return DispatchOutcome::EndTurn;
        }

        // Arguments were streamed as raw text; they are parsed only here.
        // Empty arguments mean "no parameters".
        let args: Value = if call.arguments.trim().is_empty() {
            json!({})
        } else {
            match serde_json::from_str(&call.arguments) {
                Ok(v) => v,
                Err(e) => {
                    let msg = format!("invalid tool arguments: {e}");
                    return self.finish_tool_call(call, msg, true, None, session, tx).await;
                }
            }
        };

        // The handoff tool is interpreted by the loop itself: validate the
        // target, record the result, and repoint the current agent.
        if call.name == TRANSFER_TOOL_NAME {
            let target = match parse_transfer_args(&args) {
                Ok(t) => t,
                Err(e) => {
                    return self
                        .finish_tool_call(call, e.to_string(), true, None, session, tx)
                        .await;
                }
            };
            if self.team.get(&target.agent).is_none() {
                let msg = format!("unknown agent: {}", target.agent);
                return self.finish_tool_call(call, msg, true, None, session, tx).await;
            }
            let content = format!("Task transferred to agent '{}'.", target.agent);
            let outcome = self
                .finish_tool_call(call, content, false, None, session, tx)
                .await;
            return match outcome {
                DispatchOutcome::EndTurn => DispatchOutcome::EndTurn,
                _ => DispatchOutcome::Transfer(target.agent),
            };
        }

        let tool_call = freja_tools::ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            args,
        };
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return DispatchOutcome::EndTurn,
            out = tool.handler.call(&tool_call) => out,
        };

        self.finish_tool_call(call, output.content, output.is_error, output.meta, session, tx)
            .await
    }

    /// Append the tool-role message and emit the response event.
    async fn finish_tool_call(
        &self,
        call: &freja_model::ToolCall,
        response: String,
        is_error: bool,
        meta: Option<Value>,
        session: &Arc<Mutex<Session>>,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> DispatchOutcome {
        session
            .lock()
            .await
            .push(Message::tool_result(&call.id, &call.name, &response));
        let ev = AgentEvent::ToolCallResponse {
            call: call.clone(),
            response,
            is_error,
            meta,
        };
        if tx.send(ev).await.is_err() {
            return DispatchOutcome::EndTurn;
        }
        DispatchOutcome::Continue
    }
}

enum DispatchOutcome {
    Continue,
    Transfer(String),
    EndTurn,
}

/// Block at a rendezvous point until the client answers or the turn is
/// cancelled.  A dropped resume sender counts as cancellation.
async fn wait_resume(
    resume_rx: &mut mpsc::Receiver<ResumeRequest>,
    cancel: &CancellationToken,
) -> Option<ResumeRequest> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        request = resume_rx.recv() => request,
    }
}

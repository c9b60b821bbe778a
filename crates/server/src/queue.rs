//! Prompt queue
//!
//! Persisted FIFO with a strict single-in-flight policy. The driver is
//! re-entered from three places: enqueue, sandbox connect, and
//! execution completion. Completion attributes by the event-carried
//! message id first and only falls back to the currently-processing row
//! when the event omits it.

use serde_json::Value;
use tracing::{debug, error, info, warn};

use slipway_protocol::{
    new_id, MessageSource, MessageStatus, PromptAuthor, SandboxCommand, ServerMessage,
};
use slipway_ports::CompletionCallback;

use crate::clock::now_ms;
use crate::core::{SessionCore, SessionHandle};
use crate::sandbox_mgr;
use crate::store::MessageRow;

/// Insert a pending prompt and return (message id, queue position).
/// Position counts pending + processing messages after the insert.
pub fn enqueue(
    core: &mut SessionCore,
    author_id: &str,
    content: &str,
    source: MessageSource,
    model: Option<String>,
    attachments: Vec<Value>,
    callback_context: Option<Value>,
) -> anyhow::Result<(String, u64)> {
    let id = new_id();
    let now = now_ms();
    core.store.insert_message(&MessageRow {
        id: id.clone(),
        author_id: author_id.to_string(),
        content: content.to_string(),
        source,
        model,
        attachments,
        status: MessageStatus::Pending,
        error: None,
        callback_context,
        created_at: now,
        started_at: None,
        completed_at: None,
    })?;
    let position = core.store.active_message_count()?;
    info!(
        component = "queue",
        event = "queue.enqueued",
        session = %core.name,
        message_id = %id,
        position = position,
        source = source.as_str(),
        "Prompt enqueued"
    );
    core.broadcast(&ServerMessage::PromptQueued {
        message_id: id.clone(),
        position,
    });
    Ok((id, position))
}

/// Drive the queue: dispatch the oldest pending prompt when nothing is
/// in flight and a sandbox is connected; otherwise initiate a spawn and
/// leave the prompt pending.
pub async fn process_next(core: &mut SessionCore, handle: &SessionHandle) -> anyhow::Result<()> {
    if core.store.processing_message()?.is_some() {
        // A completion event re-triggers the driver.
        return Ok(());
    }

    let Some(message) = core.store.oldest_pending()? else {
        return Ok(());
    };

    if !core.sandbox_socket_open() {
        debug!(
            component = "queue",
            event = "queue.awaiting_sandbox",
            session = %core.name,
            message_id = %message.id,
            "No sandbox socket; initiating spawn"
        );
        sandbox_mgr::ensure_sandbox(core, handle).await?;
        return Ok(());
    }

    let now = now_ms();
    if !core.store.mark_processing(&message.id, now)? {
        // Raced with another transition; the next trigger re-drives.
        return Ok(());
    }
    core.store.touch_activity(now)?;

    let session = core.store.session()?;
    let model = message
        .model
        .clone()
        .or_else(|| session.as_ref().and_then(|s| s.model.clone()))
        .unwrap_or_else(|| core.deps.config.default_model.clone());

    let author = core
        .store
        .participant(&message.author_id)?
        .map(|p| PromptAuthor {
            user_id: p.user_id,
            github_login: p.github_login,
            github_name: p.github_name,
        })
        .unwrap_or_else(|| PromptAuthor {
            user_id: message.author_id.clone(),
            github_login: None,
            github_name: None,
        });

    info!(
        component = "queue",
        event = "queue.dispatched",
        session = %core.name,
        message_id = %message.id,
        model = %model,
        "Dispatching prompt to sandbox"
    );

    let sent = core.send_to_sandbox(&SandboxCommand::Prompt {
        message_id: message.id.clone(),
        content: message.content.clone(),
        model,
        author,
        attachments: message.attachments.clone(),
    });
    if !sent {
        error!(
            component = "queue",
            event = "queue.dispatch_failed",
            session = %core.name,
            message_id = %message.id,
            "Sandbox socket vanished during dispatch"
        );
    }
    Ok(())
}

/// Resolve a finished prompt, fire the completion snapshot, reschedule
/// the inactivity alarm, and re-enter the driver.
pub async fn handle_execution_complete(
    core: &mut SessionCore,
    handle: &SessionHandle,
    success: bool,
    event_message_id: Option<&str>,
) -> anyhow::Result<()> {
    let now = now_ms();

    let target = match event_message_id {
        Some(id) => core.store.message(id)?,
        None => {
            // Legacy sandboxes omit the message id; attribute to the
            // in-flight row and make the raciness observable.
            warn!(
                component = "queue",
                event = "queue.completion.fallback_attribution",
                session = %core.name,
                "execution_complete without messageId; using processing row"
            );
            core.store.processing_message()?
        }
    };

    if let Some(message) = target {
        let error = (!success).then(|| "execution failed".to_string());
        let updated = core
            .store
            .complete_message(&message.id, success, error.as_deref(), now)?;
        if updated {
            info!(
                component = "queue",
                event = "queue.completed",
                session = %core.name,
                message_id = %message.id,
                success = success,
                "Prompt resolved"
            );
            if let Some(context) = message.callback_context.clone() {
                notify_completion(core, &message.id, success, context, now);
            }
        } else {
            warn!(
                component = "queue",
                event = "queue.completion.not_processing",
                session = %core.name,
                message_id = %message.id,
                status = message.status.as_str(),
                "Completion for a message that is not processing; ignored"
            );
        }
    } else {
        warn!(
            component = "queue",
            event = "queue.completion.unmatched",
            session = %core.name,
            "execution_complete with no matching message"
        );
    }

    sandbox_mgr::snapshot(core, sandbox_mgr::REASON_EXECUTION_COMPLETE).await?;
    core.store.touch_activity(now_ms())?;
    sandbox_mgr::reschedule_inactivity(core, handle);
    process_next(core, handle).await
}

/// Fire-and-forget signed callback to the configured endpoint.
fn notify_completion(
    core: &SessionCore,
    message_id: &str,
    success: bool,
    context: Value,
    now: i64,
) {
    let Some(notifier) = core.deps.callback.clone() else {
        debug!(
            component = "queue",
            event = "callback.unconfigured",
            session = %core.name,
            message_id = %message_id,
            "Message carries callback context but no endpoint is configured"
        );
        return;
    };
    let session_id = match core.store.session() {
        Ok(Some(s)) => s.id,
        _ => return,
    };
    let body = CompletionCallback {
        session_id,
        message_id: message_id.to_string(),
        success,
        timestamp: now,
        context,
    };
    tokio::spawn(async move {
        notifier.notify(&body).await;
    });
}

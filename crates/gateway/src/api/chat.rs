//! `POST /chat` — run one turn of the continuum.

use axum::extract::State;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use mira_domain::message::{ContentBlock, MessageContent};
use mira_domain::Error;

use crate::images::{document_block, transcode_image};
use crate::orchestrator::ProcessParams;
use crate::state::{AppState, BASE_PROMPT};

use super::{error_response, success};

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub image_type: Option<String>,
    #[serde(default)]
    pub document: Option<String>,
    #[serde(default)]
    pub document_type: Option<String>,
}

pub async fn chat(State(state): State<AppState>, Json(body): Json<ChatRequest>) -> Response {
    match run_chat(state, body).await {
        Ok(response) => response,
        Err(e) => error_response(&e),
    }
}

async fn run_chat(state: AppState, body: ChatRequest) -> Result<Response, Error> {
    let has_attachment = body.image.is_some() || body.document.is_some();
    if body.message.trim().is_empty() && !has_attachment {
        return Err(Error::Validation("message must not be empty".into()));
    }

    // Build the two content tiers.
    let (user_message, storage_content) = build_content(&state, &body)?;

    // One in-flight turn per user; a second request is rejected, and the
    // lease releases on every exit path.
    let _lease = state.chat_lock.acquire(&state.user.user_id)?;

    let mut continuum = state.repo.load_or_create(state.user.user_id)?;
    state.segments.ensure_active_sentinel(&mut continuum);
    // Real user messages increment the segment turn counter here, before
    // the orchestrator sees the message. Synthetic continuations do not.
    continuum.segment_turn_number += 1;
    let segment_turn_number = continuum.segment_turn_number;

    let outcome = state
        .orchestrator
        .process_message(
            &mut continuum,
            ProcessParams {
                user: state.user.clone(),
                user_message,
                storage_content,
                system_prompt: BASE_PROMPT.to_string(),
                segment_turn_number,
                events: None,
            },
        )
        .await?;

    Ok(success(json!({
        "continuum_id": continuum.id,
        "response": outcome.response,
        "metadata": outcome.metadata,
    })))
}

fn build_content(
    state: &AppState,
    body: &ChatRequest,
) -> Result<(MessageContent, Option<MessageContent>), Error> {
    let mut inference_blocks: Vec<ContentBlock> = Vec::new();
    let mut storage_blocks: Vec<ContentBlock> = Vec::new();

    if let Some(image) = &body.image {
        let mime = body
            .image_type
            .as_deref()
            .ok_or_else(|| Error::Validation("image_type is required with image".into()))?;
        let tiers = transcode_image(
            image,
            mime,
            state.cfg.server.image_max_bytes,
            &state.cfg.server.image_mime_allowlist,
        )?;
        inference_blocks.push(tiers.inference);
        storage_blocks.push(tiers.storage);
    }

    if let Some(document) = &body.document {
        let mime = body
            .document_type
            .as_deref()
            .ok_or_else(|| Error::Validation("document_type is required with document".into()))?;
        let block = document_block(
            document,
            mime,
            state.cfg.server.document_max_mb * 1024 * 1024,
            &state.cfg.server.document_mime_allowlist,
        )?;
        inference_blocks.push(block.clone());
        storage_blocks.push(block);
    }

    if inference_blocks.is_empty() {
        return Ok((MessageContent::Text(body.message.clone()), None));
    }

    if !body.message.trim().is_empty() {
        inference_blocks.push(ContentBlock::text(body.message.clone()));
        storage_blocks.push(ContentBlock::text(body.message.clone()));
    }

    let has_image = body.image.is_some();
    Ok((
        MessageContent::Blocks(inference_blocks),
        // Storage tier only differs (and is only required) for images.
        has_image.then_some(MessageContent::Blocks(storage_blocks)),
    ))
}

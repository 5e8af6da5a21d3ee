//! `POST /actions` — `{domain, action, data}` envelope dispatched to
//! domain handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use mira_domain::Error;
use mira_memory::{MemoryEntity, MemoryRecord, MemoryStore, StoredMemory};

use crate::state::AppState;

use super::error_response;

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub domain: String,
    pub action: String,
    #[serde(default)]
    pub data: Value,
}

pub async fn actions(State(state): State<AppState>, Json(body): Json<ActionRequest>) -> Response {
    let domain = body.domain.clone();
    let action = body.action.clone();
    let result = dispatch(state, &body).await;
    match result {
        Ok(ActionOutcome::Done(data)) => Json(json!({
            "success": true,
            "data": data,
            "meta": {
                "domain": domain,
                "action": action,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            },
        }))
        .into_response(),
        Ok(ActionOutcome::Unimplemented) => (
            StatusCode::NOT_IMPLEMENTED,
            Json(json!({
                "success": false,
                "error": {
                    "code": "NOT_IMPLEMENTED",
                    "message": format!("action '{action}' is not implemented for domain '{domain}'"),
                },
                "meta": {
                    "domain": domain,
                    "action": action,
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                },
            })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

enum ActionOutcome {
    Done(Value),
    Unimplemented,
}

async fn dispatch(state: AppState, body: &ActionRequest) -> Result<ActionOutcome, Error> {
    match body.domain.as_str() {
        "reminders" => reminders(&state, &body.action, &body.data),
        "memories" => memories(&state, &body.action, &body.data).await,
        "domaindocs" => domaindocs(&state, &body.action, &body.data),
        "continuum" => continuum(&state, &body.action, &body.data).await,
        other => Err(Error::Validation(format!("unknown domain: {other}"))),
    }
}

// ── Helpers ────────────────────────────────────────────────────────

fn required_str<'a>(data: &'a Value, field: &str) -> Result<&'a str, Error> {
    data.get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| Error::Validation(format!("missing required field: {field}")))
}

fn required_uuid(data: &Value, field: &str) -> Result<Uuid, Error> {
    required_str(data, field)?
        .parse()
        .map_err(|_| Error::Validation(format!("{field} must be a UUID")))
}

// ── Domains ────────────────────────────────────────────────────────

fn reminders(state: &AppState, action: &str, data: &Value) -> Result<ActionOutcome, Error> {
    match action {
        "add" => {
            let text = required_str(data, "text")?;
            let due_at: DateTime<Utc> = required_str(data, "due_at")?
                .parse()
                .map_err(|_| Error::Validation("due_at must be an RFC3339 timestamp".into()))?;
            let reminder = state.reminders.add(state.user.user_id, text, due_at);
            Ok(ActionOutcome::Done(serde_json::to_value(reminder)?))
        }
        "remove" => {
            let id = required_uuid(data, "id")?;
            state.reminders.remove(&id)?;
            Ok(ActionOutcome::Done(json!({"removed": id})))
        }
        "list" => {
            let list = state.reminders.for_user(&state.user.user_id);
            Ok(ActionOutcome::Done(serde_json::to_value(list)?))
        }
        _ => Ok(ActionOutcome::Unimplemented),
    }
}

async fn memories(state: &AppState, action: &str, data: &Value) -> Result<ActionOutcome, Error> {
    match action {
        "add" => {
            let text = required_str(data, "text")?;
            let importance = data
                .get("importance_score")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.5) as f32;
            let entities: Vec<MemoryEntity> = data
                .get("entities")
                .and_then(|v| v.as_array())
                .map(|list| {
                    list.iter()
                        .filter_map(|e| {
                            Some(MemoryEntity {
                                text: e.get("text")?.as_str()?.to_string(),
                                entity_type: e
                                    .get("entity_type")
                                    .and_then(|t| t.as_str())
                                    .unwrap_or("UNKNOWN")
                                    .to_string(),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();

            let embedding = state.embeddings.encode_deep(text).await?;
            let record = MemoryRecord {
                id: Uuid::new_v4(),
                text: text.to_string(),
                importance_score: importance.clamp(0.0, 1.0),
                confidence: None,
                created_at: Utc::now(),
                happens_at: None,
                expires_at: None,
                access_count: 0,
                is_refined: false,
                linked_memories: vec![],
            };
            let id = record.id;
            state.memory_store.add(StoredMemory { record, embedding, entities });
            Ok(ActionOutcome::Done(json!({"id": id})))
        }
        "list" => {
            let all = state.memory_store.candidates();
            let list: Vec<Value> = all
                .iter()
                .map(|m| {
                    json!({
                        "id": m.record.id,
                        "text": m.record.text,
                        "importance_score": m.record.importance_score,
                        "created_at": m.record.created_at,
                    })
                })
                .collect();
            Ok(ActionOutcome::Done(json!({"memories": list, "count": list.len()})))
        }
        _ => Ok(ActionOutcome::Unimplemented),
    }
}

fn domaindocs(state: &AppState, action: &str, data: &Value) -> Result<ActionOutcome, Error> {
    match action {
        "add" => {
            let label = required_str(data, "label")?;
            let content = required_str(data, "content")?;
            let doc = state.domaindocs.add(state.user.user_id, label, content);
            Ok(ActionOutcome::Done(serde_json::to_value(doc)?))
        }
        "remove" => {
            let id = required_uuid(data, "id")?;
            state.domaindocs.remove(&id)?;
            Ok(ActionOutcome::Done(json!({"removed": id})))
        }
        "list" => {
            let list = state.domaindocs.for_user(&state.user.user_id);
            Ok(ActionOutcome::Done(serde_json::to_value(list)?))
        }
        _ => Ok(ActionOutcome::Unimplemented),
    }
}

async fn continuum(state: &AppState, action: &str, data: &Value) -> Result<ActionOutcome, Error> {
    let mut continuum = state.repo.load_or_create(state.user.user_id)?;
    match action {
        "collapse" => {
            let outcome = state.segments.collapse(&mut continuum).await?;
            state.repo.persist(&continuum)?;
            Ok(ActionOutcome::Done(json!({
                "segment_id": outcome.segment_id,
                "display_title": outcome.display_title,
                "summary": outcome.summary,
            })))
        }
        "postpone" => {
            let minutes = data
                .get("minutes")
                .and_then(|v| v.as_i64())
                .filter(|m| *m > 0)
                .ok_or_else(|| Error::Validation("minutes must be a positive integer".into()))?;
            let until = state.segments.postpone(&mut continuum, minutes)?;
            state.repo.persist(&continuum)?;
            Ok(ActionOutcome::Done(json!({"postponed_until": until})))
        }
        "status" => {
            let segments = mira_continuum::SegmentService::list_segments(
                &continuum,
                state.cfg.segments.manifest_limit,
            );
            let active = segments.iter().find(|s| {
                matches!(s.status, mira_domain::message::SegmentStatus::Active)
            });
            Ok(ActionOutcome::Done(json!({
                "continuum_id": continuum.id,
                "message_count": continuum.messages.len(),
                "segment_turn_number": continuum.segment_turn_number,
                "active_segment": active.map(|s| json!({
                    "segment_id": s.segment_id,
                    "started_at": s.start_time,
                })),
                "segment_count": segments.len(),
            })))
        }
        _ => Ok(ActionOutcome::Unimplemented),
    }
}

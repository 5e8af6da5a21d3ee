//! `GET /data` — unified read endpoint keyed by a small type enum, with a
//! paginated envelope.

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::{json, Value};

use mira_domain::Error;
use mira_memory::MemoryStore;

use crate::state::AppState;

use super::error_response;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    History,
    Memories,
    Dashboard,
    User,
    Domaindocs,
    WorkingMemory,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Regular,
    Summaries,
    All,
}

#[derive(Debug, Deserialize)]
pub struct DataQuery {
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub start_date: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub end_date: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub message_type: Option<MessageType>,
    #[serde(default)]
    pub section: Option<String>,
}

const DEFAULT_LIMIT: usize = 50;

pub async fn data(State(state): State<AppState>, Query(query): Query<DataQuery>) -> Response {
    match fetch(state, &query) {
        Ok(response) => response,
        Err(e) => error_response(&e),
    }
}

fn paginated(items: Vec<Value>, offset: usize, limit: usize) -> Response {
    let total = items.len();
    let page: Vec<Value> = items.into_iter().skip(offset).take(limit).collect();
    let has_more = offset + page.len() < total;
    Json(json!({
        "success": true,
        "data": page,
        "meta": {
            "total": total,
            "has_more": has_more,
            "next_offset": if has_more { Some(offset + limit) } else { None },
            "timestamp": chrono::Utc::now().to_rfc3339(),
        },
    }))
    .into_response()
}

fn fetch(state: AppState, query: &DataQuery) -> Result<Response, Error> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).max(1);
    let offset = query.offset.unwrap_or(0);
    let search = query.search.as_deref().map(str::to_lowercase);

    match query.data_type {
        DataType::History => {
            let continuum = state.repo.load_or_create(state.user.user_id)?;
            let message_type = query.message_type.unwrap_or_default();
            let items: Vec<Value> = continuum
                .messages
                .iter()
                .filter(|m| match message_type {
                    MessageType::Regular => !m.metadata.is_segment_boundary(),
                    MessageType::Summaries => m.metadata.is_segment_boundary(),
                    MessageType::All => true,
                })
                .filter(|m| match &search {
                    Some(needle) => {
                        m.content.text_for_context().to_lowercase().contains(needle)
                    }
                    None => true,
                })
                .filter(|m| query.start_date.map_or(true, |d| m.created_at >= d))
                .filter(|m| query.end_date.map_or(true, |d| m.created_at <= d))
                .map(|m| serde_json::to_value(m).unwrap_or(Value::Null))
                .collect();
            Ok(paginated(items, offset, limit))
        }

        DataType::Memories => {
            let items: Vec<Value> = state
                .memory_store
                .candidates()
                .iter()
                .filter(|m| match &search {
                    Some(needle) => m.record.text.to_lowercase().contains(needle),
                    None => true,
                })
                .map(|m| {
                    json!({
                        "id": m.record.id,
                        "text": m.record.text,
                        "importance_score": m.record.importance_score,
                        "created_at": m.record.created_at,
                        "access_count": m.record.access_count,
                    })
                })
                .collect();
            Ok(paginated(items, offset, limit))
        }

        DataType::Dashboard => {
            let continuum = state.repo.load_or_create(state.user.user_id)?;
            Ok(super::success(json!({
                "continuum_id": continuum.id,
                "message_count": continuum.messages.len(),
                "turn_number": continuum.turn_number(),
                "memory_count": state.memory_store.len(),
                "reminder_count": state.reminders.for_user(&state.user.user_id).len(),
                "uptime_secs": state.started_at.elapsed().as_secs(),
            })))
        }

        DataType::User => Ok(super::success(json!({
            "user_id": state.user.user_id,
            "first_name": state.user.first_name,
            "timezone": state.user.timezone,
        }))),

        DataType::Domaindocs => {
            let items: Vec<Value> = state
                .domaindocs
                .for_user(&state.user.user_id)
                .iter()
                .map(|d| serde_json::to_value(d).unwrap_or(Value::Null))
                .collect();
            Ok(paginated(items, offset, limit))
        }

        DataType::WorkingMemory => match &query.section {
            Some(section) => {
                let section_state = state
                    .working_memory
                    .trinket_state(&state.user.user_id, section)?
                    .ok_or_else(|| Error::NotFound(format!("section {section}")))?;
                Ok(super::success(section_state))
            }
            None => {
                let all = state.working_memory.all_trinket_states(&state.user.user_id);
                Ok(super::success(json!({"trinkets": all, "count": all.len()})))
            }
        },
    }
}

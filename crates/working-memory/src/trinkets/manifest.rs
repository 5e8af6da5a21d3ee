//! Conversation manifest: recent segments grouped by relative date, with
//! time-range markers. Gives the model a map of where past topics live.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::sync::Arc;

use mira_continuum::{ContinuumRepository, SegmentInfo, SegmentService};
use mira_domain::message::SegmentStatus;
use mira_domain::Result;

use crate::events::TrinketContext;
use crate::trinkets::Trinket;

pub struct ManifestTrinket {
    repo: Arc<ContinuumRepository>,
    limit: usize,
}

impl ManifestTrinket {
    pub fn new(repo: Arc<ContinuumRepository>, limit: usize) -> Self {
        Self { repo, limit }
    }
}

impl Trinket for ManifestTrinket {
    fn name(&self) -> &'static str {
        "ManifestTrinket"
    }

    fn variable_name(&self) -> &'static str {
        "conversation_manifest"
    }

    fn generate_content(&self, context: &TrinketContext) -> Result<String> {
        let continuum = self.repo.load_or_create(context.user.user_id)?;
        let segments = SegmentService::list_segments(&continuum, self.limit);
        if segments.is_empty() {
            return Ok(String::new());
        }
        let tz: Tz = context.user.timezone.parse().unwrap_or(chrono_tz::UTC);
        Ok(format_manifest(&segments, tz))
    }
}

fn format_manifest(segments: &[SegmentInfo], tz: Tz) -> String {
    let mut lines = vec!["<conversation_manifest>".to_string()];

    // Group consecutive segments by date label, oldest first.
    let mut current_label: Option<String> = None;
    for segment in segments {
        let label = date_label(segment.start_time, tz);
        if current_label.as_deref() != Some(label.as_str()) {
            if current_label.is_some() {
                lines.push("</date_group>".into());
            }
            lines.push(format!("<date_group label=\"{label}\">"));
            current_label = Some(label);
        }

        let time_range = format_time_range(segment, tz);
        let title = segment.display_title.as_deref().unwrap_or("Conversation");
        let status = match segment.status {
            SegmentStatus::Active => "active",
            SegmentStatus::Collapsed => "collapsed",
        };
        lines.push(format!(
            "<segment time=\"{time_range}\" status=\"{status}\">{title}</segment>"
        ));
    }
    if current_label.is_some() {
        lines.push("</date_group>".into());
    }
    lines.push("</conversation_manifest>".into());
    lines.join("\n")
}

fn date_label(start: DateTime<Utc>, tz: Tz) -> String {
    let today = Utc::now().with_timezone(&tz).date_naive();
    let yesterday = today - Duration::days(1);
    let date = start.with_timezone(&tz).date_naive();
    if date == today {
        "TODAY".into()
    } else if date == yesterday {
        "YESTERDAY".into()
    } else {
        date.format("%b %d").to_string().to_uppercase()
    }
}

fn format_time_range(segment: &SegmentInfo, tz: Tz) -> String {
    let start = segment
        .start_time
        .with_timezone(&tz)
        .format("%-I:%M%p")
        .to_string()
        .to_uppercase();
    match segment.status {
        SegmentStatus::Active => format!("[{start} - ACTIVE]"),
        SegmentStatus::Collapsed => match segment.end_time {
            Some(end) => {
                let end = end.with_timezone(&tz).format("%-I:%M%p").to_string().to_uppercase();
                format!("[{start} - {end}]")
            }
            None => format!("[{start}]"),
        },
    }
}

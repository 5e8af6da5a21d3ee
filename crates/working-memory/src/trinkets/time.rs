//! Current date/time for the notification center. Always regenerated.

use chrono::Utc;
use chrono_tz::Tz;

use mira_domain::Result;

use crate::events::TrinketContext;
use crate::trinkets::Trinket;

#[derive(Default)]
pub struct TimeManager;

impl Trinket for TimeManager {
    fn name(&self) -> &'static str {
        "TimeManager"
    }

    fn variable_name(&self) -> &'static str {
        "datetime_section"
    }

    fn generate_content(&self, context: &TrinketContext) -> Result<String> {
        let tz: Tz = context.user.timezone.parse().unwrap_or(chrono_tz::UTC);
        let local = Utc::now().with_timezone(&tz);

        let day_of_week = local.format("%A").to_string().to_uppercase();
        let date_part = local.format("%B %d, %Y").to_string().to_uppercase();
        let time_part = local.format("%-I:%M %p").to_string().to_uppercase();
        let tz_name = local.format("%Z").to_string();

        Ok(format!(
            "<current_datetime>TODAY IS {day_of_week}, {date_part} AT {time_part} \
             {tz_name}.</current_datetime>"
        ))
    }
}

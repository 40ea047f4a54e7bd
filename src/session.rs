//! GPU usage sessions: the row layout, validation rules, and message text.

use std::fmt;

use chrono::Local;

/// `YYYY-MM-DD HH:MM:SS`, local clock.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Minimum purpose length, in characters.
pub const MIN_PURPOSE_LEN: usize = 10;

/// Custom id of the "end session" button. Stable across restarts so buttons
/// posted before a restart still route here.
pub const END_SESSION_BUTTON_ID: &str = "check_button";

/// 1-based spreadsheet columns of a session row.
pub mod column {
    pub const TEAM_NAME: u32 = 1;
    pub const START_TIME: u32 = 2;
    pub const END_TIME: u32 = 3;
    pub const PURPOSE: u32 = 4;
}

/// Current local time in [`TIMESTAMP_FORMAT`].
pub fn now_timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

// ---------------------------------------------------------------------------
// Session record
// ---------------------------------------------------------------------------

/// One spreadsheet row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub team_name: String,
    pub start_time: String,
    /// Empty while the session is open.
    pub end_time: String,
    pub purpose: String,
}

impl SessionRecord {
    /// A freshly started session.
    pub fn open(
        team_name: impl Into<String>,
        start_time: impl Into<String>,
        purpose: impl Into<String>,
    ) -> Self {
        Self {
            team_name: team_name.into(),
            start_time: start_time.into(),
            end_time: String::new(),
            purpose: purpose.into(),
        }
    }

    /// Cell values in column order.
    pub fn to_row(&self) -> Vec<String> {
        vec![
            self.team_name.clone(),
            self.start_time.clone(),
            self.end_time.clone(),
            self.purpose.clone(),
        ]
    }

    /// Parse a row read back from the sheet. The API drops trailing empty
    /// cells, so short rows are padded with empty strings.
    pub fn from_row(row: &[String]) -> Self {
        let cell = |col: u32| row.get(col as usize - 1).cloned().unwrap_or_default();
        Self {
            team_name: cell(column::TEAM_NAME),
            start_time: cell(column::START_TIME),
            end_time: cell(column::END_TIME),
            purpose: cell(column::PURPOSE),
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Team roster
// ---------------------------------------------------------------------------

/// The team names offered as command choices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamRoster {
    teams: Vec<String>,
}

impl TeamRoster {
    /// Teams offered when none are configured.
    pub const DEFAULT_TEAMS: [&'static str; 6] = [
        "retrieval-augmented-generation",
        "memory-enhanced-agent",
        "gpteacher",
        "multimodal-generation",
        "video-llama-drive",
        "video-captioning",
    ];

    /// Build a roster, trimming names and dropping blanks and duplicates.
    pub fn new<I, S>(teams: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out: Vec<String> = Vec::new();
        for team in teams {
            let team = team.as_ref().trim();
            if !team.is_empty() && !out.iter().any(|t| t == team) {
                out.push(team.to_string());
            }
        }
        Self { teams: out }
    }

    /// Parse a comma-separated list.
    pub fn parse(list: &str) -> Self {
        Self::new(list.split(','))
    }

    pub fn contains(&self, team: &str) -> bool {
        self.teams.iter().any(|t| t == team)
    }

    pub fn teams(&self) -> &[String] {
        &self.teams
    }

    pub fn is_empty(&self) -> bool {
        self.teams.is_empty()
    }
}

impl Default for TeamRoster {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TEAMS)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Why a start request was refused before touching any state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartRejection {
    /// Invoked outside the designated channel.
    WrongChannel { required: String },
    UnknownTeam(String),
    PurposeTooShort { len: usize },
    MissingOption(&'static str),
}

impl fmt::Display for StartRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartRejection::WrongChannel { required } => {
                write!(f, "'{}' 채널에서 이용해주세요.", required)
            }
            StartRejection::UnknownTeam(team) => {
                write!(f, "등록되지 않은 팀명입니다: {}", team)
            }
            StartRejection::PurposeTooShort { len } => write!(
                f,
                "사용 목적은 {}자 이상 입력해주세요. (현재 {}자)",
                MIN_PURPOSE_LEN, len
            ),
            StartRejection::MissingOption(name) => {
                write!(f, "'{}' 옵션을 입력해주세요.", name)
            }
        }
    }
}

/// Check the usage purpose against [`MIN_PURPOSE_LEN`].
///
/// Surrounding whitespace does not count towards the length, but the purpose
/// is returned exactly as entered.
pub fn validate_purpose(purpose: &str) -> Result<&str, StartRejection> {
    let len = purpose.trim().chars().count();
    if len < MIN_PURPOSE_LEN {
        return Err(StartRejection::PurposeTooShort { len });
    }
    Ok(purpose)
}

// ---------------------------------------------------------------------------
// Message text
// ---------------------------------------------------------------------------

/// Public message posted when a session starts.
pub fn format_started(record: &SessionRecord) -> String {
    format!(
        "## **{} 팀 GPU 이용 시작 🔥**\n\
         📍 **이용 시작:**  {}\n\
         📍 **사용 목적:**  {}\n\
         \n\
         *GPU 이용이 완료되면, 종료 시각이 기록되도록 꼭 아래 버튼을 클릭해주세요.*",
        record.team_name, record.start_time, record.purpose
    )
}

/// Replacement text once the session has been closed.
pub fn format_finished(record: &SessionRecord) -> String {
    format!(
        "## **{} 팀 GPU 이용 기록 🔥**\n\
         📍 **이용 시작:**  {}\n\
         📍 **이용 종료:**  {}\n\
         📍 **사용 목적:**  {}",
        record.team_name, record.start_time, record.end_time, record.purpose
    )
}

pub const END_BUTTON_LABEL: &str = "사용 종료";
pub const ALREADY_HANDLED: &str = "이미 처리된 요청이거나 확인할 수 없는 요청입니다.";
pub const END_RECORDED: &str = "GPU 이용 종료 시각이 기록됐습니다!";
pub const START_FAILED: &str = "스프레드시트 기록에 실패했습니다. 잠시 후 다시 시도해주세요.";
pub const END_FAILED: &str = "종료 시각 기록에 실패했습니다. 잠시 후 다시 버튼을 눌러주세요.";
pub const END_NOT_SHOWN: &str = "종료 시각은 기록됐지만 세션 메시지를 갱신하지 못했습니다.";

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    #[test]
    fn purpose_of_nine_chars_is_rejected() {
        assert_eq!(
            validate_purpose("123456789"),
            Err(StartRejection::PurposeTooShort { len: 9 })
        );
    }

    #[test]
    fn purpose_of_ten_chars_is_accepted() {
        assert_eq!(validate_purpose("1234567890"), Ok("1234567890"));
    }

    #[test]
    fn purpose_length_counts_characters_not_bytes() {
        // Ten Hangul syllables: 30 bytes, 10 characters.
        assert!(validate_purpose("모델학습실험진행중입").is_ok());
        assert!(validate_purpose("모델학습실험진행중").is_err());
    }

    #[test]
    fn purpose_is_trimmed_before_counting() {
        assert!(validate_purpose("   short     ").is_err());
    }

    #[test]
    fn accepted_purpose_keeps_its_whitespace() {
        assert_eq!(
            validate_purpose("  fine-tuning run  "),
            Ok("  fine-tuning run  ")
        );
    }

    #[test]
    fn timestamp_has_the_sheet_format() {
        let ts = now_timestamp();
        assert_eq!(ts.len(), 19);
        assert!(NaiveDateTime::parse_from_str(&ts, TIMESTAMP_FORMAT).is_ok());
    }

    #[test]
    fn open_record_has_blank_end_time() {
        let record = SessionRecord::open("search", "2026-10-16 09:00:00", "testing the pipeline end to end");
        assert_eq!(
            record.to_row(),
            vec![
                "search".to_string(),
                "2026-10-16 09:00:00".to_string(),
                String::new(),
                "testing the pipeline end to end".to_string(),
            ]
        );
        assert!(record.is_open());
    }

    #[test]
    fn short_rows_are_padded() {
        let row = vec!["search".to_string(), "2026-10-16 09:00:00".to_string()];
        let record = SessionRecord::from_row(&row);
        assert_eq!(record.team_name, "search");
        assert_eq!(record.end_time, "");
        assert_eq!(record.purpose, "");
    }

    #[test]
    fn roster_parses_and_dedups() {
        let roster = TeamRoster::parse(" search, vision ,,search");
        assert_eq!(roster.teams(), &["search".to_string(), "vision".to_string()]);
        assert!(roster.contains("vision"));
        assert!(!roster.contains("audio"));
    }

    #[test]
    fn default_roster_has_six_teams() {
        let roster = TeamRoster::default();
        assert_eq!(roster.teams().len(), 6);
        assert!(roster.contains("gpteacher"));
    }

    #[test]
    fn finished_text_includes_both_timestamps() {
        let record = SessionRecord {
            team_name: "search".into(),
            start_time: "2026-10-16 09:00:00".into(),
            end_time: "2026-10-16 11:30:00".into(),
            purpose: "testing the pipeline end to end".into(),
        };
        let text = format_finished(&record);
        assert!(text.contains("search"));
        assert!(text.contains("2026-10-16 09:00:00"));
        assert!(text.contains("2026-10-16 11:30:00"));
        assert!(text.contains("testing the pipeline end to end"));
    }

    #[test]
    fn wrong_channel_message_names_the_channel() {
        let rejection = StartRejection::WrongChannel {
            required: "서버사용-hardware".into(),
        };
        assert!(rejection.to_string().contains("서버사용-hardware"));
    }
}

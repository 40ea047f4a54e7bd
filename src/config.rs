//! Process configuration, read once at startup from the environment.

use std::fmt;
use std::path::PathBuf;

use crate::session::TeamRoster;
use crate::types::Snowflake;

pub const DEFAULT_SPREADSHEET_ID: &str = "1XRZl3_TEYgBJ5-g60uglEZjU1B_McvWd7yq36Gsod48";
pub const DEFAULT_SHEET_NAME: &str = "Sheet1";
pub const DEFAULT_ALLOWED_CHANNEL: &str = "서버사용-hardware";
pub const DEFAULT_ADMIN_USERNAME: &str = "aschung01";
pub const DEFAULT_LEDGER_PATH: &str = "message_ids.json";

/// Discord's limits on the choices of one command option.
const MAX_TEAM_CHOICES: usize = 25;
const MAX_TEAM_NAME_LEN: usize = 100;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    /// A required variable is unset or empty.
    Missing(&'static str),
    Invalid { key: &'static str, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "{} environment variable not set", key),
            ConfigError::Invalid { key, reason } => write!(f, "invalid {}: {}", key, reason),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Pieces
// ---------------------------------------------------------------------------

/// Where slash commands are registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandScope {
    /// Application-wide; can take a while to propagate.
    Global,
    /// Per guild; visible immediately.
    Guilds(Vec<Snowflake>),
}

/// Who may start sessions, where, and for which teams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPolicy {
    /// Channel name sessions must be started from.
    pub allowed_channel: String,
    /// Username exempt from the channel restriction.
    pub admin_username: String,
    pub roster: TeamRoster,
}

impl AccessPolicy {
    pub fn is_admin(&self, username: Option<&str>) -> bool {
        username == Some(self.admin_username.as_str())
    }

    /// A channel whose name could not be determined never matches.
    pub fn allows_channel(&self, channel_name: Option<&str>) -> bool {
        channel_name == Some(self.allowed_channel.as_str())
    }
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            allowed_channel: DEFAULT_ALLOWED_CHANNEL.to_string(),
            admin_username: DEFAULT_ADMIN_USERNAME.to_string(),
            roster: TeamRoster::default(),
        }
    }
}

/// The service-account key, inline or on disk.
#[derive(Clone)]
pub enum ServiceAccountSource {
    Inline(String),
    File(PathBuf),
}

impl ServiceAccountSource {
    /// The key's JSON text.
    pub fn read(&self) -> Result<String, ConfigError> {
        match self {
            ServiceAccountSource::Inline(json) => Ok(json.clone()),
            ServiceAccountSource::File(path) => {
                std::fs::read_to_string(path).map_err(|e| ConfigError::Invalid {
                    key: "GOOGLE_SERVICE_ACCOUNT_KEY_FILE",
                    reason: format!("{}: {}", path.display(), e),
                })
            }
        }
    }
}

impl fmt::Debug for ServiceAccountSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceAccountSource::Inline(_) => f.write_str("Inline(<redacted>)"),
            ServiceAccountSource::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// BotConfig
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct BotConfig {
    pub discord_token: String,
    pub service_account: ServiceAccountSource,
    pub spreadsheet_id: String,
    pub sheet_name: String,
    pub ledger_path: PathBuf,
    pub command_scope: CommandScope,
    pub access: AccessPolicy,
}

impl BotConfig {
    /// Read the process environment. Call `dotenv` first to pick up `.env`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let discord_token = get("DISCORD_TOKEN")
            .or_else(|| get("DISCORD_BOT_TOKEN"))
            .ok_or(ConfigError::Missing("DISCORD_TOKEN"))?;

        let service_account = match (
            get("GOOGLE_SERVICE_ACCOUNT_KEY"),
            get("GOOGLE_SERVICE_ACCOUNT_KEY_FILE"),
        ) {
            (Some(json), _) => ServiceAccountSource::Inline(json),
            (None, Some(path)) => ServiceAccountSource::File(PathBuf::from(path)),
            (None, None) => return Err(ConfigError::Missing("GOOGLE_SERVICE_ACCOUNT_KEY")),
        };

        let roster = match get("TEAM_NAMES") {
            Some(list) => TeamRoster::parse(&list),
            None => TeamRoster::default(),
        };
        if roster.is_empty() {
            return Err(ConfigError::Invalid {
                key: "TEAM_NAMES",
                reason: "no team names given".to_string(),
            });
        }
        if roster.teams().len() > MAX_TEAM_CHOICES {
            return Err(ConfigError::Invalid {
                key: "TEAM_NAMES",
                reason: format!(
                    "{} teams given, Discord allows at most {} choices",
                    roster.teams().len(),
                    MAX_TEAM_CHOICES
                ),
            });
        }
        if let Some(long) = roster
            .teams()
            .iter()
            .find(|t| t.chars().count() > MAX_TEAM_NAME_LEN)
        {
            return Err(ConfigError::Invalid {
                key: "TEAM_NAMES",
                reason: format!("'{}' is longer than {} characters", long, MAX_TEAM_NAME_LEN),
            });
        }

        let command_scope = match get("SLASH_COMMAND_MODE").as_deref() {
            None | Some("global") => CommandScope::Global,
            Some("guild") => {
                let guilds: Vec<Snowflake> = get("GUILD_IDS")
                    .unwrap_or_default()
                    .split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect();
                if guilds.is_empty() {
                    return Err(ConfigError::Invalid {
                        key: "GUILD_IDS",
                        reason: "guild mode needs at least one guild id".to_string(),
                    });
                }
                CommandScope::Guilds(guilds)
            }
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "SLASH_COMMAND_MODE",
                    reason: format!("expected `global` or `guild`, got `{}`", other),
                })
            }
        };

        Ok(Self {
            discord_token,
            service_account,
            spreadsheet_id: get("SPREADSHEET_ID")
                .unwrap_or_else(|| DEFAULT_SPREADSHEET_ID.to_string()),
            sheet_name: get("SHEET_NAME").unwrap_or_else(|| DEFAULT_SHEET_NAME.to_string()),
            ledger_path: PathBuf::from(
                get("LEDGER_PATH").unwrap_or_else(|| DEFAULT_LEDGER_PATH.to_string()),
            ),
            command_scope,
            access: AccessPolicy {
                allowed_channel: get("ALLOWED_CHANNEL")
                    .unwrap_or_else(|| DEFAULT_ALLOWED_CHANNEL.to_string()),
                admin_username: get("ADMIN_USERNAME")
                    .unwrap_or_else(|| DEFAULT_ADMIN_USERNAME.to_string()),
                roster,
            },
        })
    }
}

impl fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotConfig")
            .field("discord_token", &"<redacted>")
            .field("service_account", &self.service_account)
            .field("spreadsheet_id", &self.spreadsheet_id)
            .field("sheet_name", &self.sheet_name)
            .field("ledger_path", &self.ledger_path)
            .field("command_scope", &self.command_scope)
            .field("access", &self.access)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<BotConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BotConfig::from_lookup(|key| vars.get(key).cloned())
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("DISCORD_TOKEN", "bot-token"),
        ("GOOGLE_SERVICE_ACCOUNT_KEY", "{}"),
    ];

    #[test]
    fn defaults_match_the_deployed_bot() {
        let cfg = config(&REQUIRED).unwrap();
        assert_eq!(cfg.spreadsheet_id, DEFAULT_SPREADSHEET_ID);
        assert_eq!(cfg.sheet_name, "Sheet1");
        assert_eq!(cfg.ledger_path, PathBuf::from("message_ids.json"));
        assert_eq!(cfg.command_scope, CommandScope::Global);
        assert_eq!(cfg.access, AccessPolicy::default());
    }

    #[test]
    fn token_is_required() {
        let err = config(&[("GOOGLE_SERVICE_ACCOUNT_KEY", "{}")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DISCORD_TOKEN")));
    }

    #[test]
    fn legacy_token_name_is_accepted() {
        let cfg = config(&[
            ("DISCORD_BOT_TOKEN", "legacy"),
            ("GOOGLE_SERVICE_ACCOUNT_KEY", "{}"),
        ])
        .unwrap();
        assert_eq!(cfg.discord_token, "legacy");
    }

    #[test]
    fn key_file_is_used_when_no_inline_key() {
        let cfg = config(&[
            ("DISCORD_TOKEN", "t"),
            ("GOOGLE_SERVICE_ACCOUNT_KEY_FILE", "/etc/bot/key.json"),
        ])
        .unwrap();
        assert!(matches!(
            cfg.service_account,
            ServiceAccountSource::File(ref p) if p == &PathBuf::from("/etc/bot/key.json")
        ));
    }

    #[test]
    fn service_account_is_required() {
        let err = config(&[("DISCORD_TOKEN", "t")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("GOOGLE_SERVICE_ACCOUNT_KEY")));
    }

    #[test]
    fn guild_mode_reads_guild_ids() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("SLASH_COMMAND_MODE", "guild"));
        vars.push(("GUILD_IDS", "111, 222,"));
        let cfg = config(&vars).unwrap();
        assert_eq!(
            cfg.command_scope,
            CommandScope::Guilds(vec!["111".to_string(), "222".to_string()])
        );
    }

    #[test]
    fn guild_mode_without_ids_is_invalid() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("SLASH_COMMAND_MODE", "guild"));
        assert!(matches!(
            config(&vars).unwrap_err(),
            ConfigError::Invalid { key: "GUILD_IDS", .. }
        ));
    }

    #[test]
    fn blank_roster_is_invalid() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("TEAM_NAMES", " , ,"));
        assert!(matches!(
            config(&vars).unwrap_err(),
            ConfigError::Invalid { key: "TEAM_NAMES", .. }
        ));
    }

    #[test]
    fn roster_beyond_discord_choice_limits_is_invalid() {
        let too_many = (1..=26).map(|i| format!("team-{}", i)).collect::<Vec<_>>().join(",");
        let vars = [REQUIRED[0], REQUIRED[1], ("TEAM_NAMES", too_many.as_str())];
        assert!(matches!(
            config(&vars).unwrap_err(),
            ConfigError::Invalid { key: "TEAM_NAMES", .. }
        ));

        let long_name = "x".repeat(101);
        let vars = [REQUIRED[0], REQUIRED[1], ("TEAM_NAMES", long_name.as_str())];
        assert!(matches!(
            config(&vars).unwrap_err(),
            ConfigError::Invalid { key: "TEAM_NAMES", .. }
        ));

        let at_limit = (1..=25).map(|i| format!("team-{}", i)).collect::<Vec<_>>().join(",");
        let vars = [REQUIRED[0], REQUIRED[1], ("TEAM_NAMES", at_limit.as_str())];
        assert_eq!(config(&vars).unwrap().access.roster.teams().len(), 25);
    }

    #[test]
    fn debug_redacts_secrets() {
        let cfg = config(&[
            ("DISCORD_TOKEN", "super-secret"),
            ("GOOGLE_SERVICE_ACCOUNT_KEY", "{\"private_key\":\"pem\"}"),
        ])
        .unwrap();
        let debug = format!("{:?}", cfg);
        assert!(!debug.contains("super-secret"));
        assert!(!debug.contains("pem"));
    }

    #[test]
    fn admin_and_channel_checks() {
        let policy = AccessPolicy::default();
        assert!(policy.is_admin(Some("aschung01")));
        assert!(!policy.is_admin(None));
        assert!(policy.allows_channel(Some("서버사용-hardware")));
        assert!(!policy.allows_channel(Some("general")));
        assert!(!policy.allows_channel(None));
    }
}

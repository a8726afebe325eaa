use crate::call::{CallConfig, CallTimings, SipCredential};
use anyhow::{anyhow, Error, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const USER_AGENT: &str = "gatecall";

/// Every flag can also be set through a `GATECALL_`-prefixed environment variable.
#[derive(Parser, Debug, Default)]
#[command(
    name = "gatecall",
    version,
    long_version = crate::version::get_version_info(),
    about = "SIP client that rings a number for a fixed time and hangs up"
)]
pub struct Cli {
    #[clap(long, env = "GATECALL_CONF")]
    pub conf: Option<String>,
    /// SIP user (account id at the provider)
    #[clap(long, env = "GATECALL_SIP_USER")]
    pub sip_user: Option<String>,
    #[clap(long, env = "GATECALL_SIP_PASS", hide_env_values = true)]
    pub sip_pass: Option<String>,
    #[clap(long, env = "GATECALL_SIP_DOMAIN")]
    pub sip_domain: Option<String>,
    /// Number to call
    #[clap(long, env = "GATECALL_DESTINATION")]
    pub destination: Option<String>,
    /// If set, a P-Asserted-Identity header carries this value
    #[clap(long, env = "GATECALL_OUTGOING_NUMBER")]
    pub outgoing_number: Option<String>,
    /// Token required by the /call websocket
    #[clap(long, env = "GATECALL_CALL_TOKEN", hide_env_values = true)]
    pub call_token: Option<String>,
    #[clap(long, env = "GATECALL_HTTP_ADDR")]
    pub http_addr: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Serve the control page and the /call websocket (default)
    Serve,
    /// Place a single call right away and exit when it ends
    Dial,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub http_addr: String,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    pub call_token: Option<String>,
    pub sip: SipAccountConfig,
    pub ua: UseragentConfig,
    pub lookup: LookupConfig,
    pub timers: TimerConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SipAccountConfig {
    pub username: String,
    pub password: String,
    pub domain: String,
    pub destination: String,
    pub outgoing_number: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UseragentConfig {
    /// Local bind address; empty means the first non-loopback interface.
    pub addr: String,
    /// 0 lets the OS pick a port.
    pub udp_port: u16,
    /// Skips public address discovery when set.
    pub external_ip: Option<String>,
    pub useragent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LookupConfig {
    pub endpoints: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimerConfig {
    pub provisional_timeout_ms: u64,
    pub call_duration_ms: u64,
    pub max_auth_attempts: u32,
    pub cleanup_linger_ms: u64,
}

impl Default for UseragentConfig {
    fn default() -> Self {
        Self {
            addr: String::new(),
            udp_port: 0,
            external_ip: None,
            useragent: Some(USER_AGENT.to_string()),
        }
    }
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            endpoints: crate::net_tool::DEFAULT_LOOKUP_ENDPOINTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            timeout_secs: 8,
        }
    }
}

impl LookupConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        let timings = CallTimings::default();
        Self {
            provisional_timeout_ms: timings.provisional_timeout.as_millis() as u64,
            call_duration_ms: timings.call_duration.as_millis() as u64,
            max_auth_attempts: timings.max_auth_attempts,
            cleanup_linger_ms: timings.cleanup_linger.as_millis() as u64,
        }
    }
}

impl From<&TimerConfig> for CallTimings {
    fn from(timers: &TimerConfig) -> Self {
        Self {
            provisional_timeout: Duration::from_millis(timers.provisional_timeout_ms),
            call_duration: Duration::from_millis(timers.call_duration_ms),
            max_auth_attempts: timers.max_auth_attempts,
            cleanup_linger: Duration::from_millis(timers.cleanup_linger_ms),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            log_level: Some("info".to_string()),
            log_file: None,
            call_token: None,
            sip: SipAccountConfig::default(),
            ua: UseragentConfig::default(),
            lookup: LookupConfig::default(),
            timers: TimerConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }

    /// Loads the file named by `--conf` (if any), then lets flags and env override it.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mut config = match cli.conf {
            Some(ref path) => Config::load(path)?,
            None => Config::default(),
        };
        config.apply_cli(cli);
        Ok(config)
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(ref v) = cli.sip_user {
            self.sip.username = v.clone();
        }
        if let Some(ref v) = cli.sip_pass {
            self.sip.password = v.clone();
        }
        if let Some(ref v) = cli.sip_domain {
            self.sip.domain = v.clone();
        }
        if let Some(ref v) = cli.destination {
            self.sip.destination = v.clone();
        }
        if cli.outgoing_number.is_some() {
            self.sip.outgoing_number = cli.outgoing_number.clone();
        }
        if cli.call_token.is_some() {
            self.call_token = cli.call_token.clone();
        }
        if let Some(ref v) = cli.http_addr {
            self.http_addr = v.clone();
        }
    }

    /// The token a `/call` client must present; an unset token only matches an empty one.
    pub fn expected_token(&self) -> &str {
        self.call_token.as_deref().unwrap_or_default()
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("sip user", &self.sip.username),
            ("sip password", &self.sip.password),
            ("sip domain", &self.sip.domain),
            ("destination", &self.sip.destination),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow!("missing required setting: {}", name));
            }
        }
        if self.ua.external_ip.is_none() && self.lookup.endpoints.is_empty() {
            return Err(anyhow!(
                "no address lookup endpoints configured and no ua.external_ip set"
            ));
        }
        for endpoint in self.lookup.endpoints.iter() {
            url::Url::parse(endpoint)
                .map_err(|e| anyhow!("invalid lookup endpoint {}: {}", endpoint, e))?;
        }
        if self.timers.max_auth_attempts == 0 {
            return Err(anyhow!("timers.max_auth_attempts must be at least 1"));
        }
        Ok(())
    }

    pub fn call_config(&self) -> Result<CallConfig> {
        self.validate()?;
        let outgoing = self
            .sip
            .outgoing_number
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Ok(CallConfig {
            username: self.sip.username.clone(),
            credential: SipCredential {
                username: self.sip.username.clone(),
                password: self.sip.password.clone(),
            },
            domain: self.sip.domain.clone(),
            destination: self.sip.destination.clone(),
            asserted_identity: outgoing,
            useragent: self.ua.useragent.clone(),
            timings: CallTimings::from(&self.timers),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled() -> Config {
        let mut config = Config::default();
        config.sip.username = "1234".to_string();
        config.sip.password = "secret".to_string();
        config.sip.domain = "sip.example.com".to_string();
        config.sip.destination = "+15550100".to_string();
        config
    }

    #[test]
    fn test_default_timers() {
        let timings = CallTimings::from(&TimerConfig::default());
        assert_eq!(timings.provisional_timeout, Duration::from_secs(2));
        assert_eq!(timings.call_duration, Duration::from_secs(12));
        assert_eq!(timings.max_auth_attempts, 3);
        assert_eq!(timings.cleanup_linger, Duration::from_millis(500));
    }

    #[test]
    fn test_missing_required_fields() {
        let mut config = filled();
        config.sip.destination = "  ".to_string();
        let err = config.call_config().unwrap_err();
        assert!(err.to_string().contains("destination"));
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = filled();
        let cli = Cli::parse_from([
            "gatecall",
            "--destination",
            "+15550199",
            "--outgoing-number",
            "+15550111",
            "--call-token",
            "tok",
            "dial",
        ]);
        config.apply_cli(&cli);
        assert_eq!(cli.command, Some(Command::Dial));
        assert_eq!(config.sip.destination, "+15550199");
        assert_eq!(config.expected_token(), "tok");
        let call = config.call_config().unwrap();
        assert_eq!(call.asserted_identity.as_deref(), Some("+15550111"));
        assert_eq!(call.credential.username, "1234");
    }

    #[test]
    fn test_blank_outgoing_number_is_ignored() {
        let mut config = filled();
        config.sip.outgoing_number = Some(" ".to_string());
        assert!(config.call_config().unwrap().asserted_identity.is_none());
    }

    #[test]
    fn test_invalid_lookup_endpoint() {
        let mut config = filled();
        config.lookup.endpoints = vec!["not a url".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unset_token_matches_empty() {
        assert_eq!(Config::default().expected_token(), "");
    }
}

use chatbridge_browser::BrowserOptions;
use chatbridge_core::{BridgeSettings, ChatMode, Selectors, Timings};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_CONFIG_FILE: &str = "chatbridge.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub browser: BrowserSection,
    #[serde(default)]
    pub chat: ChatSection,
    #[serde(default)]
    pub selectors: Selectors,
    #[serde(default)]
    pub timing: Timings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserSection {
    #[serde(default = "default_target_url")]
    pub target_url: String,
    #[serde(default = "default_debug_port")]
    pub debug_port: u16,
    /// Chrome profile holding the logged-in session.
    #[serde(default = "default_user_data_dir")]
    pub user_data_dir: PathBuf,
    #[serde(default)]
    pub headless: bool,
    #[serde(default)]
    pub executable: Option<PathBuf>,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            target_url: default_target_url(),
            debug_port: default_debug_port(),
            user_data_dir: default_user_data_dir(),
            headless: false,
            executable: None,
            startup_timeout_secs: default_startup_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSection {
    /// Force temporary chat and start every turn from a fresh page.
    #[serde(default = "default_use_temporary_chat")]
    pub use_temporary_chat: bool,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default = "default_reset_token")]
    pub reset_token: String,
}

impl Default for ChatSection {
    fn default() -> Self {
        Self {
            use_temporary_chat: default_use_temporary_chat(),
            model_name: default_model_name(),
            reset_token: default_reset_token(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_target_url() -> String {
    "https://gemini.google.com/app".to_string()
}

fn default_debug_port() -> u16 {
    9333
}

fn default_user_data_dir() -> PathBuf {
    PathBuf::from("./ChromeBotData")
}

fn default_startup_timeout_secs() -> u64 {
    30
}

fn default_use_temporary_chat() -> bool {
    true
}

fn default_model_name() -> String {
    "gemini-web-agent".to_string()
}

fn default_reset_token() -> String {
    "/reset".to_string()
}

impl AppConfig {
    /// Load `CHATBRIDGE_CONFIG` or `./chatbridge.toml`. Without a file, use
    /// defaults with environment overrides and write the defaults out for
    /// the user to edit.
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var("CHATBRIDGE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::load_from(&path, |key| env::var(key).ok())
    }

    pub fn load_from(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .map_err(|err| anyhow::anyhow!("Failed to read config {}: {}", path.display(), err))?;
            let parsed: AppConfig = toml::from_str(&contents)
                .map_err(|err| anyhow::anyhow!("Failed to parse config {}: {}", path.display(), err))?;
            info!("Loaded config from {}", path.display());
            return Ok(parsed);
        }

        match Self::default().write_to(path) {
            Ok(()) => info!("No config found, wrote defaults to {}", path.display()),
            Err(err) => warn!("Failed to write default config {}: {}", path.display(), err),
        }
        Ok(Self::from_env(lookup))
    }

    fn from_env(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(host) = lookup("CHATBRIDGE_HOST") {
            config.server.host = host;
        }
        if let Some(port) = lookup("CHATBRIDGE_PORT").and_then(|value| value.parse::<u16>().ok()) {
            config.server.port = port;
        }
        if let Some(url) = lookup("CHATBRIDGE_TARGET_URL") {
            config.browser.target_url = url;
        }
        if let Some(port) =
            lookup("CHATBRIDGE_DEBUG_PORT").and_then(|value| value.parse::<u16>().ok())
        {
            config.browser.debug_port = port;
        }
        if let Some(dir) = lookup("CHATBRIDGE_USER_DATA_DIR") {
            config.browser.user_data_dir = PathBuf::from(dir);
        }
        if let Some(flag) = lookup("CHATBRIDGE_TEMPORARY_CHAT").and_then(|value| parse_flag(&value)) {
            config.chat.use_temporary_chat = flag;
        }
        config
    }

    pub fn write_to(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn mode(&self) -> ChatMode {
        ChatMode::from_temporary_flag(self.chat.use_temporary_chat)
    }

    pub fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            target_url: self.browser.target_url.clone(),
            mode: self.mode(),
            model_name: self.chat.model_name.clone(),
            reset_token: self.chat.reset_token.clone(),
            selectors: self.selectors.clone(),
            timings: self.timing.clone(),
        }
    }

    pub fn browser_options(&self) -> BrowserOptions {
        BrowserOptions {
            executable: self.browser.executable.clone(),
            user_data_dir: self.browser.user_data_dir.clone(),
            debug_port: self.browser.debug_port,
            headless: self.browser.headless,
            target_url: self.browser.target_url.clone(),
            startup_timeout: Duration::from_secs(self.browser.startup_timeout_secs),
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

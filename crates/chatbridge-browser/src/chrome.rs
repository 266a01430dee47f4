//! Chrome bootstrap: attach to a running DevTools endpoint or launch one.

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::cdp::CdpConnection;
use crate::page::CdpSurface;
use crate::surface::UiSurface;

const EXECUTABLE_CANDIDATES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "chrome",
    "msedge",
];

const WELL_KNOWN_PATHS: &[&str] = &[
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "C:\\Program Files\\Google\\Chrome\\Application\\chrome.exe",
    "C:\\Program Files (x86)\\Google\\Chrome\\Application\\chrome.exe",
];

#[derive(Debug, Clone)]
pub struct BrowserOptions {
    /// Explicit Chrome binary; discovered from `PATH` when unset.
    pub executable: Option<PathBuf>,
    /// Profile directory holding cookies and the logged-in session.
    pub user_data_dir: PathBuf,
    pub debug_port: u16,
    pub headless: bool,
    pub target_url: String,
    pub startup_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetInfo {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    url: String,
    web_socket_debugger_url: Option<String>,
}

/// A live page session plus the Chrome process we started, if any.
pub struct ChromeSession {
    surface: Arc<CdpSurface>,
    // Kept so the browser is killed when the session is dropped.
    _process: Option<Child>,
}

impl ChromeSession {
    pub fn surface(&self) -> Arc<dyn UiSurface> {
        self.surface.clone()
    }
}

/// Attach to Chrome on `debug_port` or launch it, then open the target page.
pub async fn launch_or_attach(options: &BrowserOptions) -> Result<ChromeSession> {
    let endpoint = format!("http://127.0.0.1:{}", options.debug_port);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;

    let process = if endpoint_alive(&client, &endpoint).await {
        info!("Attaching to running browser on port {}", options.debug_port);
        None
    } else {
        std::fs::create_dir_all(&options.user_data_dir).with_context(|| {
            format!(
                "Failed to create user data dir {}",
                options.user_data_dir.display()
            )
        })?;
        let executable = resolve_executable(options.executable.as_deref())?;
        info!(
            "Launching {} (port {}, profile {})",
            executable.display(),
            options.debug_port,
            options.user_data_dir.display()
        );

        let child = Command::new(&executable)
            .args(launch_args(options))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {}", executable.display()))?;

        wait_for_endpoint(&client, &endpoint, options.startup_timeout).await?;
        Some(child)
    };

    let ws_url = page_target(&client, &endpoint).await?;
    debug!("Connecting to page target {}", ws_url);
    let surface = Arc::new(CdpSurface::new(CdpConnection::connect(&ws_url).await?));
    surface.navigate(&options.target_url).await?;

    Ok(ChromeSession {
        surface,
        _process: process,
    })
}

pub fn launch_args(options: &BrowserOptions) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", options.debug_port),
        format!("--user-data-dir={}", options.user_data_dir.display()),
        "--remote-allow-origins=*".to_string(),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
    ];
    if options.headless {
        args.push("--headless=new".to_string());
    }
    args.push(options.target_url.clone());
    args
}

fn resolve_executable(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        bail!("Configured browser executable not found: {}", path.display());
    }

    if let Some(found) = EXECUTABLE_CANDIDATES
        .iter()
        .find_map(|name| which::which(name).ok())
    {
        return Ok(found);
    }

    WELL_KNOWN_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
        .ok_or_else(|| anyhow!("No Chrome/Chromium executable found; set browser.executable"))
}

async fn endpoint_alive(client: &reqwest::Client, endpoint: &str) -> bool {
    client
        .get(format!("{}/json/version", endpoint))
        .send()
        .await
        .map(|response| response.status().is_success())
        .unwrap_or(false)
}

async fn wait_for_endpoint(
    client: &reqwest::Client,
    endpoint: &str,
    timeout: Duration,
) -> Result<()> {
    let started = Instant::now();
    while started.elapsed() < timeout {
        if endpoint_alive(client, endpoint).await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    bail!(
        "DevTools endpoint {} did not come up within {}s",
        endpoint,
        timeout.as_secs()
    )
}

async fn page_target(client: &reqwest::Client, endpoint: &str) -> Result<String> {
    let targets: Vec<TargetInfo> = client
        .get(format!("{}/json/list", endpoint))
        .send()
        .await?
        .json()
        .await
        .context("Failed to list DevTools targets")?;

    if let Some(ws_url) = pick_page_target(&targets) {
        return Ok(ws_url);
    }

    let created: TargetInfo = client
        .put(format!("{}/json/new?about:blank", endpoint))
        .send()
        .await?
        .json()
        .await
        .context("Failed to open a new page target")?;
    created
        .web_socket_debugger_url
        .ok_or_else(|| anyhow!("New page target has no debugger URL"))
}

/// Prefer a regular web page over devtools/extension pages.
fn pick_page_target(targets: &[TargetInfo]) -> Option<String> {
    targets
        .iter()
        .filter(|target| target.kind == "page")
        .filter(|target| !target.url.starts_with("devtools://"))
        .find_map(|target| target.web_socket_debugger_url.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(headless: bool) -> BrowserOptions {
        BrowserOptions {
            executable: None,
            user_data_dir: PathBuf::from("/tmp/profile"),
            debug_port: 9333,
            headless,
            target_url: "https://gemini.google.com/app".to_string(),
            startup_timeout: Duration::from_secs(20),
        }
    }

    #[test]
    fn launch_args_include_port_and_profile() {
        let args = launch_args(&options(false));
        assert!(args.contains(&"--remote-debugging-port=9333".to_string()));
        assert!(args.contains(&"--user-data-dir=/tmp/profile".to_string()));
        assert!(!args.iter().any(|arg| arg.starts_with("--headless")));
        assert_eq!(args.last().unwrap(), "https://gemini.google.com/app");
    }

    #[test]
    fn headless_flag_is_opt_in() {
        assert!(launch_args(&options(true)).contains(&"--headless=new".to_string()));
    }

    #[test]
    fn page_target_skips_devtools_and_workers() {
        let targets: Vec<TargetInfo> = serde_json::from_str(
            r#"[
                {"type": "service_worker", "url": "https://x", "webSocketDebuggerUrl": "ws://sw"},
                {"type": "page", "url": "devtools://devtools/inspector.html", "webSocketDebuggerUrl": "ws://dt"},
                {"type": "page", "url": "https://gemini.google.com/app", "webSocketDebuggerUrl": "ws://page"}
            ]"#,
        )
        .unwrap();
        assert_eq!(pick_page_target(&targets).as_deref(), Some("ws://page"));
    }

    #[test]
    fn missing_configured_executable_is_an_error() {
        let err = resolve_executable(Some(Path::new("/definitely/not/chrome"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use super::connection::CdpConnection;

/// Launch flags for the session browser: new headless mode, tuned for the
/// small VMs sessions run on, recording-sized window. The debugging port is
/// auto-assigned and read back from stderr.
const LAUNCH_FLAGS: &[&str] = &[
    "--headless=new",
    "--disable-gpu",
    "--no-sandbox",
    "--disable-dev-shm-usage",
    "--no-first-run",
    "--no-default-browser-check",
    "--disable-extensions",
    "--disable-background-networking",
    "--disable-background-timer-throttling",
    "--disable-backgrounding-occluded-windows",
    "--disable-renderer-backgrounding",
    "--disable-ipc-flooding-protection",
    "--disable-sync",
    "--disable-translate",
    "--mute-audio",
    "--hide-scrollbars",
    "--window-size=1920,1080",
    "--remote-debugging-port=0",
];

/// How long Chrome gets to announce its DevTools endpoint on stderr.
const DEVTOOLS_DEADLINE: Duration = Duration::from_secs(10);

/// The session's page: target id plus the connected per-target WebSocket.
/// One engine owns one of these for the life of the session. Closing goes
/// through the browser's HTTP endpoint, so the handle keeps the host:port
/// it was minted from.
pub struct PageTarget {
    pub conn: CdpConnection,
    target_id: String,
    host_port: String,
}

impl PageTarget {
    /// Close the tab. The WebSocket is dropped first so Chrome does not see
    /// a client on a dying target.
    pub async fn close(self) -> Result<()> {
        let Self {
            conn,
            target_id,
            host_port,
        } = self;
        drop(conn);
        let url = format!("http://{host_port}/json/close/{target_id}");
        reqwest::get(&url)
            .await
            .with_context(|| format!("GET /json/close/{target_id} failed"))?;
        debug!(target_id = %target_id, "page target closed");
        Ok(())
    }
}

/// The Chrome process behind a session: either one we spawned (killed and
/// profile-wiped on drop) or a remote one we attached to and leave alone.
pub struct Chrome {
    child: Option<Child>,
    host_port: String,
    profile_dir: Option<PathBuf>,
}

impl Chrome {
    /// Spawn Chrome for one session. The profile dir is keyed by the
    /// session tag, so leftovers from crashed runs are identifiable in the
    /// temp dir. `HTTPS_PROXY`/`HTTP_PROXY` are forwarded as
    /// `--proxy-server`.
    pub async fn launch(session_tag: &str) -> Result<Self> {
        let profile_dir = std::env::temp_dir().join(format!(
            "rabbitize-profile-{}-{session_tag}",
            std::process::id()
        ));
        let binary = chrome_binary()?;
        info!(binary = %binary, "launching Chrome");

        let mut cmd = Command::new(&binary);
        cmd.args(LAUNCH_FLAGS)
            .arg(format!("--user-data-dir={}", profile_dir.display()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(proxy) = proxy_from_env() {
            info!(proxy = %proxy, "forwarding proxy to Chrome");
            cmd.arg(format!("--proxy-server={proxy}"));
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {binary}"))?;
        let host_port = wait_for_devtools(&mut child).await?;
        debug!(host_port = %host_port, "DevTools endpoint up");

        Ok(Self {
            child: Some(child),
            host_port,
            profile_dir: Some(profile_dir),
        })
    }

    /// Attach to a remote Chrome (`http://host:port`, e.g. in Docker).
    /// `/json/version` is probed once so a bad URL fails the session start
    /// instead of its first command.
    pub async fn attach(base_url: &str) -> Result<Self> {
        let host_port = strip_scheme(base_url.trim_end_matches('/'))?.to_string();
        let version_url = format!("http://{host_port}/json/version");
        info!(url = %version_url, "attaching to remote Chrome");
        reqwest::get(&version_url)
            .await
            .with_context(|| format!("Failed to reach Chrome at {version_url}"))?
            .error_for_status()
            .context("Chrome /json/version returned error")?;

        Ok(Self {
            child: None,
            host_port,
            profile_dir: None,
        })
    }

    /// Open the session's page: a fresh tab over the HTTP JSON API, then the
    /// per-target WebSocket, returned already connected.
    pub async fn open_page(&self) -> Result<PageTarget> {
        let new_tab = format!("http://{}/json/new?about:blank", self.host_port);
        debug!(url = %new_tab, "PUT /json/new");
        let resp: serde_json::Value = reqwest::Client::new()
            .put(&new_tab)
            .send()
            .await
            .context("PUT /json/new failed")?
            .json()
            .await
            .context("Unparseable /json/new response")?;
        let target_id = resp["id"]
            .as_str()
            .context("No target id in /json/new response")?
            .to_string();

        let ws_url = format!("ws://{}/devtools/page/{target_id}", self.host_port);
        let conn = CdpConnection::connect(&ws_url).await?;
        debug!(target_id = %target_id, "page target ready");

        Ok(PageTarget {
            conn,
            target_id,
            host_port: self.host_port.clone(),
        })
    }

    /// Kill the Chrome process (no-op when attached to a remote one).
    pub fn kill(&mut self) {
        if let Some(ref mut child) = self.child {
            let _ = child.start_kill();
        }
    }
}

impl Drop for Chrome {
    fn drop(&mut self) {
        self.kill();
        if let Some(dir) = self.profile_dir.take() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                debug!(dir = %dir.display(), error = %e, "profile dir cleanup skipped");
            }
        }
    }
}

/// Read Chrome's stderr until the `DevTools listening on ws://…` line and
/// return the endpoint's host:port.
async fn wait_for_devtools(child: &mut Child) -> Result<String> {
    let stderr = child.stderr.take().context("No stderr from Chrome")?;
    let mut lines = tokio::io::BufReader::new(stderr).lines();

    let ws_url = tokio::time::timeout(DEVTOOLS_DEADLINE, async {
        while let Some(line) = lines
            .next_line()
            .await
            .context("Failed to read Chrome stderr")?
        {
            if let Some(rest) = line.split("DevTools listening on ").nth(1) {
                return Ok(rest.trim().to_string());
            }
        }
        bail!("Chrome exited before announcing its DevTools endpoint")
    })
    .await
    .context("Timed out waiting for the DevTools endpoint")??;

    host_port_of(&ws_url)
}

/// First proxy found in `HTTPS_PROXY`/`HTTP_PROXY` (either case).
fn proxy_from_env() -> Option<String> {
    ["HTTPS_PROXY", "https_proxy", "HTTP_PROXY", "http_proxy"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
}

/// `scheme://rest` -> `rest`.
fn strip_scheme(url: &str) -> Result<&str> {
    url.split_once("://")
        .map(|(_, rest)| rest)
        .with_context(|| format!("No scheme in {url}"))
}

/// host:port of a DevTools URL like `ws://127.0.0.1:9222/devtools/browser/…`.
fn host_port_of(ws_url: &str) -> Result<String> {
    let rest = strip_scheme(ws_url)?;
    let host_port = rest.split('/').next().unwrap_or(rest);
    if host_port.is_empty() {
        bail!("No host:port in {ws_url}");
    }
    Ok(host_port.to_string())
}

/// Resolve the Chrome binary: `RABBITIZE_BROWSER` wins (service deployments
/// pin it), then the usual install locations for the platform.
fn chrome_binary() -> Result<String> {
    if let Ok(path) = std::env::var("RABBITIZE_BROWSER")
        && !path.is_empty()
    {
        return Ok(path);
    }

    let candidates: &[&str] = if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ]
    } else {
        &[
            "google-chrome",
            "google-chrome-stable",
            "chromium",
            "chromium-browser",
        ]
    };

    candidates
        .iter()
        .find(|name| binary_resolves(name))
        .map(|s| s.to_string())
        .ok_or_else(|| {
            anyhow!(
                "No Chrome binary found (set RABBITIZE_BROWSER). Tried: {}",
                candidates.join(", ")
            )
        })
}

/// Absolute candidates must exist; bare names must resolve on PATH.
fn binary_resolves(name: &str) -> bool {
    if name.contains('/') {
        return Path::new(name).exists();
    }
    std::process::Command::new("which")
        .arg(name)
        .output()
        .is_ok_and(|o| o.status.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_extracted_from_devtools_url() {
        let hp = host_port_of("ws://127.0.0.1:9222/devtools/browser/abc-def").unwrap();
        assert_eq!(hp, "127.0.0.1:9222");
    }

    #[test]
    fn bare_host_port_after_scheme_is_accepted() {
        assert_eq!(host_port_of("http://localhost:9222").unwrap(), "localhost:9222");
    }

    #[test]
    fn urls_without_scheme_are_rejected() {
        assert!(strip_scheme("127.0.0.1:9222").is_err());
        assert!(host_port_of("127.0.0.1:9222").is_err());
    }
}

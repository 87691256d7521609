//! Transports used to reach the remote services
//!
//! Two ways of getting a response body for a URL:
//!
//! - [`DirectHttpFetcher`]: a plain HTTP GET through `reqwest`.
//! - [`RenderedPageFetcher`]: loads the URL in a headless rendering engine and takes
//!   the text content of the rendered page. Some networks filter or rewrite direct API
//!   traffic but let a browser through; this path is the fallback for those.
//!
//! Both implement [`PageFetcher`] so the resolver (and tests) can swap them freely.

use crate::{EngineError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

/// Browser binaries probed on `PATH` when none is configured
const BROWSER_CANDIDATES: [&str; 6] = [
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
    "chrome-headless-shell",
    "headless_shell",
];

/// Something that can turn a URL into a response body
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

/// Plain HTTP GET with fixed connect and read timeouts
#[derive(Debug, Clone)]
pub struct DirectHttpFetcher {
    client: reqwest::Client,
}

impl DirectHttpFetcher {
    pub fn new(connect_timeout: Duration, read_timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(connect_timeout + read_timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for DirectHttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.text().await?)
    }
}

/// Fetch through a headless Chromium-family browser (`--dump-dom`)
///
/// The whole load is bounded by `timeout`; on expiry the browser process is killed.
#[derive(Debug, Clone)]
pub struct RenderedPageFetcher {
    browser: Option<PathBuf>,
    timeout: Duration,
}

impl RenderedPageFetcher {
    pub fn new(browser: Option<PathBuf>, timeout: Duration) -> Self {
        Self { browser, timeout }
    }

    /// Use `browser` if given, otherwise the first known browser found on `PATH`
    pub fn detect(browser: Option<PathBuf>, timeout: Duration) -> Self {
        let browser = browser.or_else(find_browser_on_path);
        match &browser {
            Some(path) => tracing::info!("Rendering engine: {}", path.display()),
            None => tracing::info!("Rendering engine: none found, rendered transport disabled"),
        }
        Self::new(browser, timeout)
    }

    pub fn browser(&self) -> Option<&Path> {
        self.browser.as_deref()
    }

    async fn render(&self, browser: &Path, url: &str) -> Result<String> {
        let child = tokio::process::Command::new(browser)
            .args([
                "--headless",
                "--disable-gpu",
                "--no-first-run",
                "--blink-settings=imagesEnabled=false",
                "--dump-dom",
                url,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        // Dropping the future on timeout drops the child, which kills it
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| EngineError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(EngineError::Network(format!(
                "rendering engine exited with {}",
                output.status
            )));
        }

        let dom = String::from_utf8_lossy(&output.stdout);
        let text = extract_body_text(&dom);
        if text.trim().is_empty() {
            return Err(EngineError::Network("rendered page is empty".to_string()));
        }
        Ok(text)
    }
}

#[async_trait]
impl PageFetcher for RenderedPageFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        let Some(browser) = &self.browser else {
            return Err(EngineError::Network(
                "no rendering engine available".to_string(),
            ));
        };
        self.render(browser, url).await
    }
}

fn find_browser_on_path() -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .flat_map(|dir| BROWSER_CANDIDATES.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

/// Text content of an HTML document's body, the way a browser's `innerText` sees it
/// for the simple documents returned by JSON APIs (`<pre>{...}</pre>`)
///
/// Tags are dropped, `<script>`/`<style>` contents are skipped and entities decoded.
pub fn extract_body_text(html: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let body = match lower.find("<body") {
        Some(start) => {
            let content_start = lower[start..]
                .find('>')
                .map(|i| start + i + 1)
                .unwrap_or(html.len());
            let content_end = lower[content_start..]
                .find("</body")
                .map(|i| content_start + i)
                .unwrap_or(html.len());
            &html[content_start..content_end]
        }
        None => html,
    };

    let mut text = String::with_capacity(body.len());
    let mut rest = body;
    while let Some(open) = rest.find('<') {
        text.push_str(&rest[..open]);
        let after = &rest[open..];
        let Some(close) = after.find('>') else {
            // Unterminated tag: keep the remainder as text
            text.push_str(after);
            rest = "";
            break;
        };
        let tag = after[1..close].trim().to_ascii_lowercase();
        rest = &after[close + 1..];

        for skipped in ["script", "style"] {
            if tag == skipped || tag.starts_with(&format!("{skipped} ")) {
                let end_tag = format!("</{skipped}");
                let end = rest.to_ascii_lowercase().find(&end_tag);
                rest = match end {
                    Some(i) => rest[i..].find('>').map(|j| &rest[i + j + 1..]).unwrap_or(""),
                    None => "",
                };
            }
        }
    }
    text.push_str(rest);

    decode_entities(&text)
}

fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp..];
        let decoded = after
            .find(';')
            .filter(|&semi| semi <= 10)
            .and_then(|semi| decode_entity(&after[1..semi]).map(|c| (c, semi)));
        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &after[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &after[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        _ => {
            let code = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok()?
            } else {
                name.strip_prefix('#')?.parse().ok()?
            };
            char::from_u32(code)
        }
    }
}

//! [`UiSurface`] backed by a DevTools page connection.

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::cdp::CdpConnection;
use crate::surface::{ElementHandle, Locator, UiSurface};

const OBJECT_GROUP: &str = "chatbridge";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);

const READ_TEXT_FN: &str = "function() { if (!this.isConnected) { throw new Error('element detached'); } return this.innerText ?? this.textContent ?? ''; }";
const GET_ATTRIBUTE_FN: &str = "function(name) { return this.getAttribute(name); }";
const CLICK_FN: &str = "function() { this.scrollIntoView({ block: 'center', inline: 'center' }); this.click(); }";
const FOCUS_FN: &str = "function() { this.focus(); }";

pub struct CdpSurface {
    conn: CdpConnection,
    poll_interval: Duration,
    navigation_timeout: Duration,
}

impl CdpSurface {
    pub fn new(conn: CdpConnection) -> Self {
        Self {
            conn,
            poll_interval: DEFAULT_POLL_INTERVAL,
            navigation_timeout: DEFAULT_NAVIGATION_TIMEOUT,
        }
    }

    pub fn with_navigation_timeout(mut self, timeout: Duration) -> Self {
        self.navigation_timeout = timeout;
        self
    }

    /// Evaluate an expression and return the raw `RemoteObject`.
    async fn evaluate(&self, expression: &str, by_value: bool) -> Result<Value> {
        let reply = self
            .conn
            .call(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "objectGroup": OBJECT_GROUP,
                    "returnByValue": by_value,
                    "awaitPromise": true,
                }),
            )
            .await?;
        remote_object(reply)
    }

    async fn call_on(&self, element: &ElementHandle, function: &str, args: Value) -> Result<Value> {
        let reply = self
            .conn
            .call(
                "Runtime.callFunctionOn",
                json!({
                    "objectId": element.id(),
                    "functionDeclaration": function,
                    "arguments": args,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        let object = remote_object(reply)?;
        Ok(object.get("value").cloned().unwrap_or(Value::Null))
    }

    async fn wait_for_ready(&self) -> Result<()> {
        let deadline = Instant::now() + self.navigation_timeout;
        sleep(self.poll_interval).await;
        loop {
            // The execution context is torn down mid-navigation; treat errors as "not yet".
            match self.evaluate("document.readyState", true).await {
                Ok(state) if state.get("value").and_then(Value::as_str) == Some("complete") => {
                    break;
                }
                Ok(_) => {}
                Err(e) => debug!("readyState probe failed during navigation: {}", e),
            }
            if Instant::now() >= deadline {
                bail!(
                    "Page did not finish loading within {}s",
                    self.navigation_timeout.as_secs()
                );
            }
            sleep(self.poll_interval).await;
        }

        // Handles from the previous document are dead now.
        if let Err(e) = self.release_handles().await {
            debug!("Releasing handles after navigation failed: {}", e);
        }
        Ok(())
    }

    async fn count(&self, locator: &str) -> Result<usize> {
        let expression = format!("({}).length", matches_expression(locator)?);
        let object = self.evaluate(&expression, true).await?;
        Ok(object.get("value").and_then(Value::as_u64).unwrap_or(0) as usize)
    }
}

#[async_trait]
impl UiSurface for CdpSurface {
    async fn navigate(&self, url: &str) -> Result<()> {
        let reply = self.conn.call("Page.navigate", json!({ "url": url })).await?;
        if let Some(error) = reply.get("errorText").and_then(Value::as_str) {
            bail!("Navigation to {} failed: {}", url, error);
        }
        self.wait_for_ready().await
    }

    async fn reload(&self) -> Result<()> {
        self.conn
            .call("Page.reload", json!({ "ignoreCache": false }))
            .await?;
        self.wait_for_ready().await
    }

    async fn current_url(&self) -> Result<String> {
        let object = self.evaluate("window.location.href", true).await?;
        object
            .get("value")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("location.href is not a string"))
    }

    async fn locate(&self, locator: &str, timeout: Duration) -> Result<Option<ElementHandle>> {
        let expression = format!("({})[0] ?? null", matches_expression(locator)?);
        let deadline = Instant::now() + timeout;
        loop {
            let object = self.evaluate(&expression, false).await?;
            if let Some(handle) = element_handle(&object) {
                return Ok(Some(handle));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn locate_all(&self, locator: &str, timeout: Duration) -> Result<Vec<ElementHandle>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.count(locator).await? > 0 {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }

        let array = self.evaluate(&matches_expression(locator)?, false).await?;
        let Some(array_id) = array.get("objectId").and_then(Value::as_str) else {
            return Ok(Vec::new());
        };

        let properties = self
            .conn
            .call(
                "Runtime.getProperties",
                json!({ "objectId": array_id, "ownProperties": true }),
            )
            .await?;
        let _ = self
            .conn
            .call("Runtime.releaseObject", json!({ "objectId": array_id }))
            .await;

        let mut indexed: Vec<(usize, ElementHandle)> = properties
            .get("result")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let index = entry.get("name")?.as_str()?.parse::<usize>().ok()?;
                        let handle = element_handle(entry.get("value")?)?;
                        Some((index, handle))
                    })
                    .collect()
            })
            .unwrap_or_default();
        indexed.sort_by_key(|(index, _)| *index);

        Ok(indexed.into_iter().map(|(_, handle)| handle).collect())
    }

    async fn text(&self, element: &ElementHandle) -> Result<String> {
        let value = self.call_on(element, READ_TEXT_FN, json!([])).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn attribute(&self, element: &ElementHandle, name: &str) -> Result<Option<String>> {
        let value = self
            .call_on(element, GET_ATTRIBUTE_FN, json!([{ "value": name }]))
            .await?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn click(&self, element: &ElementHandle) -> Result<()> {
        self.call_on(element, CLICK_FN, json!([])).await?;
        Ok(())
    }

    async fn type_text(&self, element: &ElementHandle, text: &str) -> Result<()> {
        self.call_on(element, FOCUS_FN, json!([])).await?;
        if !text.is_empty() {
            self.conn
                .call("Input.insertText", json!({ "text": text }))
                .await?;
        }
        Ok(())
    }

    async fn press_enter(&self, element: &ElementHandle) -> Result<()> {
        self.call_on(element, FOCUS_FN, json!([])).await?;
        for event_type in ["keyDown", "keyUp"] {
            self.conn
                .call(
                    "Input.dispatchKeyEvent",
                    json!({
                        "type": event_type,
                        "key": "Enter",
                        "code": "Enter",
                        "windowsVirtualKeyCode": 13,
                        "nativeVirtualKeyCode": 13,
                        "text": "\r",
                    }),
                )
                .await?;
        }
        Ok(())
    }

    async fn run_script(&self, code: &str) -> Result<Value> {
        let expression = format!("(async () => {{\n{}\n}})()", code);
        let object = self.evaluate(&expression, true).await?;
        Ok(object.get("value").cloned().unwrap_or(Value::Null))
    }

    async fn release_handles(&self) -> Result<()> {
        self.conn
            .call(
                "Runtime.releaseObjectGroup",
                json!({ "objectGroup": OBJECT_GROUP }),
            )
            .await?;
        Ok(())
    }
}

/// JavaScript expression evaluating to an array of the elements `raw` matches.
fn matches_expression(raw: &str) -> Result<String> {
    Ok(match Locator::parse(raw) {
        Locator::Css(selector) => format!(
            "Array.from(document.querySelectorAll({}))",
            serde_json::to_string(selector)?
        ),
        Locator::Text(fragment) => format!(
            "Array.from(document.querySelectorAll('body *')).filter((el) => Array.from(el.childNodes).some((n) => n.nodeType === 3 && n.textContent.includes({})))",
            serde_json::to_string(fragment)?
        ),
    })
}

/// Unwrap `{result, exceptionDetails}` from `Runtime.evaluate`/`callFunctionOn`.
fn remote_object(reply: Value) -> Result<Value> {
    if let Some(details) = reply.get("exceptionDetails") {
        let message = details
            .get("exception")
            .and_then(|exception| exception.get("description"))
            .and_then(Value::as_str)
            .or_else(|| details.get("text").and_then(Value::as_str))
            .unwrap_or("script threw");
        bail!("Script error: {}", message);
    }
    Ok(reply.get("result").cloned().unwrap_or(Value::Null))
}

fn element_handle(object: &Value) -> Option<ElementHandle> {
    if object.get("subtype").and_then(Value::as_str) == Some("null") {
        return None;
    }
    object
        .get("objectId")
        .and_then(Value::as_str)
        .map(ElementHandle::new)
}

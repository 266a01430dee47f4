//! Delivering prompt text and image attachments into the chat input.

use chatbridge_browser::{ElementHandle, UiSurface};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{Selectors, Timings};
use crate::error::{BridgeError, Result};
use crate::images::ImagePayload;
use crate::projector::ProjectedPrompt;

pub struct InputComposer<'a> {
    selectors: &'a Selectors,
    timings: &'a Timings,
}

impl<'a> InputComposer<'a> {
    pub fn new(selectors: &'a Selectors, timings: &'a Timings) -> Self {
        Self { selectors, timings }
    }

    /// Paste every image, then type the text. An image the page refuses
    /// aborts the whole composition before any text is entered.
    pub async fn compose(
        &self,
        surface: &dyn UiSurface,
        input: &ElementHandle,
        prompt: &ProjectedPrompt,
    ) -> Result<()> {
        if !prompt.images.is_empty() {
            info!("Injecting {} image(s)", prompt.images.len());
        }
        for (index, image) in prompt.images.iter().enumerate() {
            let script = paste_script(image, &self.selectors.paste_target)?;
            let outcome = surface.run_script(&script).await?;
            match outcome.as_str() {
                Some("success") => {
                    debug!("Image {} pasted ({} bytes)", index + 1, image.data.len());
                    sleep(self.timings.image_settle()).await;
                }
                Some(other) => return Err(BridgeError::ImageInjectionFailed(other.to_string())),
                None => return Err(BridgeError::ImageInjectionFailed(outcome.to_string())),
            }
        }

        if !prompt.text.is_empty() {
            surface.type_text(input, &prompt.text).await?;
        }
        sleep(self.timings.text_settle()).await;
        Ok(())
    }
}

/// `img_<millis>_<suffix>.<ext>`, unique per injection.
fn attachment_name(mime_type: &str) -> String {
    let ext = mime_type
        .split('/')
        .nth(1)
        .filter(|ext| !ext.is_empty())
        .unwrap_or("png");
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "img_{}_{}.{}",
        chrono::Utc::now().timestamp_millis(),
        &suffix[..8],
        ext
    )
}

/// Script that rebuilds the image as a `File` inside the page and dispatches
/// a synthetic paste carrying it at the paste target. Resolves to `success`,
/// `not_found`, or `error: <message>`.
fn paste_script(image: &ImagePayload, paste_target: &str) -> Result<String> {
    let quote = |value: &str| -> Result<String> {
        serde_json::to_string(&Value::from(value))
            .map_err(|e| BridgeError::Automation(e.into()))
    };
    let data = quote(&image.to_base64())?;
    let mime = quote(&image.mime_type)?;
    let name = quote(&attachment_name(&image.mime_type))?;
    let target = quote(paste_target)?;

    Ok(format!(
        r#"try {{
  const bytes = Uint8Array.from(atob({data}), (c) => c.charCodeAt(0));
  const file = new File([new Blob([bytes], {{ type: {mime} }})], {name}, {{ type: {mime} }});
  const transfer = new DataTransfer();
  transfer.items.add(file);
  const target = document.querySelector({target});
  if (!target) {{ return "not_found"; }}
  target.focus();
  target.dispatchEvent(new ClipboardEvent("paste", {{ bubbles: true, cancelable: true, clipboardData: transfer }}));
  return "success";
}} catch (e) {{
  return "error: " + e.message;
}}"#
    ))
}

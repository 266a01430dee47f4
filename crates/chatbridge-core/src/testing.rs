//! Scripted, in-memory [`UiSurface`] for exercising the turn engine without a
//! browser.
//!
//! The surface models just enough of the chat page: an input box, a send
//! button, a temporary-chat toggle behind an optional side menu, reply
//! containers whose text grows read by read, a stop control that is visible
//! for a fixed number of probes, and an error indicator.

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chatbridge_browser::{ElementHandle, UiSurface};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::config::Selectors;
use crate::images::{ImagePayload, ImageResolver, decode_data_uri};

/// Interaction recorded by the surface, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceCall {
    Navigate(String),
    Reload,
    Click(String),
    Type(String),
    Enter,
    Script(String),
    ReleaseHandles,
}

/// Reply the page produces once the prompt is submitted.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    /// Text returned by successive reads; the last frame repeats forever.
    pub frames: Vec<String>,
    /// Number of stop-control probes that find the control visible.
    pub stop_probes: usize,
    /// Replace the reply node with a fresh one after this many reads.
    pub detach_after_reads: Option<usize>,
}

impl ScriptedReply {
    pub fn new<S: Into<String>>(frames: impl IntoIterator<Item = S>) -> Self {
        Self {
            frames: frames.into_iter().map(Into::into).collect(),
            stop_probes: 0,
            detach_after_reads: None,
        }
    }

    pub fn with_stop_probes(mut self, probes: usize) -> Self {
        self.stop_probes = probes;
        self
    }

    pub fn with_detach_after(mut self, reads: usize) -> Self {
        self.detach_after_reads = Some(reads);
        self
    }
}

#[derive(Debug)]
struct Node {
    locator: String,
    frames: VecDeque<String>,
    attributes: HashMap<String, String>,
    detached: bool,
    reads: usize,
    detach_after_reads: Option<usize>,
}

impl Node {
    fn new(locator: &str) -> Self {
        Self {
            locator: locator.to_string(),
            frames: VecDeque::from([String::new()]),
            attributes: HashMap::new(),
            detached: false,
            reads: 0,
            detach_after_reads: None,
        }
    }

    fn with_text(mut self, text: &str) -> Self {
        self.frames = VecDeque::from([text.to_string()]);
        self
    }
}

#[derive(Debug)]
struct ScriptState {
    url: String,
    nodes: Vec<Node>,
    reply: Option<ScriptedReply>,
    stop_probes: usize,
    upstream_error: Option<String>,
    script_result: Value,
    input_hidden_loads: usize,
    temp_button_behind_menu: bool,
    menu_open: bool,
    calls: Vec<SurfaceCall>,
}

pub struct ScriptedSurface {
    selectors: Selectors,
    state: Mutex<ScriptState>,
}

impl ScriptedSurface {
    /// A loaded chat page in persistent mode with an empty history.
    pub fn new(selectors: Selectors) -> Self {
        let mut temp_button = Node::new(&selectors.temp_chat_button);
        temp_button
            .attributes
            .insert("class".to_string(), "mat-button".to_string());

        let nodes = vec![
            Node::new(&selectors.input),
            Node::new(&selectors.paste_target),
            Node::new(&selectors.send_button),
            Node::new(&selectors.side_menu_button),
            temp_button,
        ];

        Self {
            selectors,
            state: Mutex::new(ScriptState {
                url: "https://gemini.google.com/app".to_string(),
                nodes,
                reply: None,
                stop_probes: 0,
                upstream_error: None,
                script_result: json!("success"),
                input_hidden_loads: 0,
                temp_button_behind_menu: false,
                menu_open: false,
                calls: Vec::new(),
            }),
        }
    }

    pub fn with_url(self, url: &str) -> Self {
        self.state().url = url.to_string();
        self
    }

    pub fn with_reply(self, reply: ScriptedReply) -> Self {
        self.state().reply = Some(reply);
        self
    }

    /// Replies already on the page before the turn starts.
    pub fn with_history(self, replies: &[&str]) -> Self {
        {
            let locator = self.selectors.responses[0].clone();
            let mut state = self.state();
            for reply in replies {
                state.nodes.push(Node::new(&locator).with_text(reply));
            }
        }
        self
    }

    pub fn with_temp_chat(self, active: bool) -> Self {
        {
            let class = if active {
                format!("mat-button {}", self.selectors.temp_chat_active_class)
            } else {
                "mat-button".to_string()
            };
            let locator = self.selectors.temp_chat_button.clone();
            let mut state = self.state();
            if let Some(node) = state.nodes.iter_mut().find(|node| node.locator == locator) {
                node.attributes.insert("class".to_string(), class);
            }
        }
        self
    }

    /// The toggle only appears once the side menu is opened.
    pub fn with_temp_button_behind_menu(self) -> Self {
        self.state().temp_button_behind_menu = true;
        self
    }

    pub fn without_element(self, locator: &str) -> Self {
        self.state().nodes.retain(|node| node.locator != locator);
        self
    }

    /// Hide the input box for the next `loads` page loads (the current one included).
    pub fn with_missing_input(self, loads: usize) -> Self {
        self.state().input_hidden_loads = loads;
        self
    }

    pub fn with_upstream_error(self, text: &str) -> Self {
        self.state().upstream_error = Some(text.to_string());
        self
    }

    pub fn with_script_result(self, result: Value) -> Self {
        self.state().script_result = result;
        self
    }

    pub fn calls(&self) -> Vec<SurfaceCall> {
        self.state().calls.clone()
    }

    pub fn typed_text(&self) -> String {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                SurfaceCall::Type(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn temp_chat_active(&self) -> bool {
        let state = self.state();
        state
            .nodes
            .iter()
            .find(|node| node.locator == self.selectors.temp_chat_button)
            .and_then(|node| node.attributes.get("class"))
            .is_some_and(|class| class.contains(&self.selectors.temp_chat_active_class))
    }

    pub fn menu_open(&self) -> bool {
        self.state().menu_open
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn visible(&self, state: &ScriptState, node: &Node) -> bool {
        if node.detached {
            return false;
        }
        if node.locator == self.selectors.input {
            return state.input_hidden_loads == 0;
        }
        if node.locator == self.selectors.temp_chat_button {
            return !state.temp_button_behind_menu || state.menu_open;
        }
        true
    }

    fn matching(&self, state: &ScriptState, locator: &str) -> Vec<ElementHandle> {
        state
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.locator == locator && self.visible(state, node))
            .map(|(index, _)| ElementHandle::new(index.to_string()))
            .collect()
    }

    fn page_load(&self, state: &mut ScriptState) {
        state.input_hidden_loads = state.input_hidden_loads.saturating_sub(1);
        state.menu_open = false;
    }

    fn submit(&self, state: &mut ScriptState) {
        if let Some(text) = state.upstream_error.clone() {
            let locator = self.selectors.error_indicators[0].clone();
            state.nodes.push(Node::new(&locator).with_text(&text));
            return;
        }
        if let Some(reply) = state.reply.take() {
            let mut node = Node::new(&self.selectors.responses[0]);
            node.frames = reply.frames.into_iter().collect();
            if node.frames.is_empty() {
                node.frames.push_back(String::new());
            }
            node.detach_after_reads = reply.detach_after_reads;
            state.nodes.push(node);
            state.stop_probes = reply.stop_probes;
        }
    }
}

fn node_index(element: &ElementHandle) -> Result<usize> {
    element
        .id()
        .parse::<usize>()
        .map_err(|_| anyhow!("unknown element handle {}", element))
}

#[async_trait]
impl UiSurface for ScriptedSurface {
    async fn navigate(&self, url: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(SurfaceCall::Navigate(url.to_string()));
        state.url = url.to_string();
        self.page_load(&mut state);
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        let mut state = self.state();
        state.calls.push(SurfaceCall::Reload);
        self.page_load(&mut state);
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.state().url.clone())
    }

    async fn locate(&self, locator: &str, _timeout: Duration) -> Result<Option<ElementHandle>> {
        let mut state = self.state();
        if locator == self.selectors.stop_button {
            if state.stop_probes == 0 {
                return Ok(None);
            }
            state.stop_probes -= 1;
            return Ok(Some(ElementHandle::new("stop")));
        }
        Ok(self.matching(&state, locator).into_iter().next())
    }

    async fn locate_all(&self, locator: &str, _timeout: Duration) -> Result<Vec<ElementHandle>> {
        let state = self.state();
        Ok(self.matching(&state, locator))
    }

    async fn text(&self, element: &ElementHandle) -> Result<String> {
        let index = node_index(element)?;
        let mut state = self.state();
        let node = state
            .nodes
            .get_mut(index)
            .ok_or_else(|| anyhow!("no node {}", index))?;
        if node.detached {
            bail!("element detached");
        }

        node.reads += 1;
        let text = if node.frames.len() > 1 {
            node.frames.pop_front().unwrap_or_default()
        } else {
            node.frames.front().cloned().unwrap_or_default()
        };

        if node.detach_after_reads == Some(node.reads) {
            // The page re-renders the reply into a new node carrying the remaining frames.
            node.detached = true;
            let mut replacement = Node::new(&node.locator.clone());
            replacement.frames = std::mem::take(&mut node.frames);
            if replacement.frames.is_empty() {
                replacement.frames.push_back(text.clone());
            }
            state.nodes.push(replacement);
        }

        Ok(text)
    }

    async fn attribute(&self, element: &ElementHandle, name: &str) -> Result<Option<String>> {
        let index = node_index(element)?;
        let state = self.state();
        let node = state
            .nodes
            .get(index)
            .ok_or_else(|| anyhow!("no node {}", index))?;
        Ok(node.attributes.get(name).cloned())
    }

    async fn click(&self, element: &ElementHandle) -> Result<()> {
        let index = node_index(element)?;
        let mut state = self.state();
        let locator = state
            .nodes
            .get(index)
            .map(|node| node.locator.clone())
            .ok_or_else(|| anyhow!("no node {}", index))?;
        state.calls.push(SurfaceCall::Click(locator.clone()));

        if locator == self.selectors.send_button {
            self.submit(&mut state);
        } else if locator == self.selectors.side_menu_button {
            state.menu_open = !state.menu_open;
        } else if locator == self.selectors.temp_chat_button {
            let active_class = self.selectors.temp_chat_active_class.clone();
            if let Some(node) = state.nodes.get_mut(index) {
                let class = node.attributes.entry("class".to_string()).or_default();
                *class = if class.contains(&active_class) {
                    "mat-button".to_string()
                } else {
                    format!("mat-button {}", active_class)
                };
            }
        }
        Ok(())
    }

    async fn type_text(&self, element: &ElementHandle, text: &str) -> Result<()> {
        node_index(element)?;
        self.state().calls.push(SurfaceCall::Type(text.to_string()));
        Ok(())
    }

    async fn press_enter(&self, element: &ElementHandle) -> Result<()> {
        let index = node_index(element)?;
        let mut state = self.state();
        state.calls.push(SurfaceCall::Enter);
        let is_input = state
            .nodes
            .get(index)
            .is_some_and(|node| node.locator == self.selectors.input);
        if is_input {
            self.submit(&mut state);
        }
        Ok(())
    }

    async fn run_script(&self, code: &str) -> Result<Value> {
        let mut state = self.state();
        state.calls.push(SurfaceCall::Script(code.to_string()));
        Ok(state.script_result.clone())
    }
    async fn release_handles(&self) -> Result<()> {
        self.state().calls.push(SurfaceCall::ReleaseHandles);
        Ok(())
    }
}

/// Resolves inline `data:` images only; anything remote fails.
pub struct OfflineResolver;

#[async_trait]
impl ImageResolver for OfflineResolver {
    async fn resolve(&self, reference: &str) -> Result<ImagePayload> {
        if reference.starts_with("data:") {
            decode_data_uri(reference)
        } else {
            bail!("offline: {}", reference)
        }
    }
}

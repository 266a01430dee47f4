//! Keeps the chat UI in the configured conversation-persistence mode.

use chatbridge_browser::{ElementHandle, UiSurface};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::{ChatMode, Selectors, Timings};

/// Mode the UI was observed in. Never cached; re-read on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeState {
    Persistent,
    Temporary,
    Unknown,
}

impl From<ChatMode> for ModeState {
    fn from(mode: ChatMode) -> Self {
        match mode {
            ChatMode::Persistent => ModeState::Persistent,
            ChatMode::Temporary => ModeState::Temporary,
        }
    }
}

pub struct ModeController<'a> {
    selectors: &'a Selectors,
    timings: &'a Timings,
}

impl<'a> ModeController<'a> {
    pub fn new(selectors: &'a Selectors, timings: &'a Timings) -> Self {
        Self { selectors, timings }
    }

    /// Observe the mode indicator and toggle once if it disagrees with
    /// `target`. Best effort: a missing control or a failed click is logged
    /// and the UI is left as it is.
    pub async fn ensure_mode(&self, surface: &dyn UiSurface, target: ChatMode) -> ModeState {
        let (toggle, opened_menu) = match self.find_toggle(surface).await {
            Some(found) => found,
            None => {
                error!("Cannot locate the temporary chat toggle; continuing in the current mode");
                return ModeState::Unknown;
            }
        };

        let mut state = self.observe(surface, &toggle).await;
        let wanted = ModeState::from(target);
        if state != ModeState::Unknown && state != wanted {
            info!("Switching chat mode: {:?} -> {:?}", state, wanted);
            match surface.click(&toggle).await {
                Ok(()) => {
                    sleep(self.timings.toggle_settle()).await;
                    state = self.reobserve(surface, &toggle).await;
                    if state != wanted {
                        warn!("Chat mode still {:?} after toggling", state);
                    }
                }
                Err(e) => warn!("Failed to click the temporary chat toggle: {}", e),
            }
        } else {
            debug!("Chat mode already {:?}", state);
        }

        if opened_menu {
            self.close_menu(surface).await;
        }
        state
    }

    /// The toggle, and whether the side menu had to be opened to reach it.
    async fn find_toggle(&self, surface: &dyn UiSurface) -> Option<(ElementHandle, bool)> {
        if let Ok(Some(toggle)) = surface
            .locate(&self.selectors.temp_chat_button, self.timings.toggle_probe())
            .await
        {
            return Some((toggle, false));
        }

        let menu = match surface
            .locate(&self.selectors.side_menu_button, self.timings.menu_timeout())
            .await
        {
            Ok(Some(menu)) => menu,
            Ok(None) => return None,
            Err(e) => {
                debug!("Side menu lookup failed: {}", e);
                return None;
            }
        };
        if let Err(e) = surface.click(&menu).await {
            warn!("Failed to open the side menu: {}", e);
            return None;
        }

        match surface
            .locate(&self.selectors.temp_chat_button, self.timings.menu_timeout())
            .await
        {
            Ok(Some(toggle)) => Some((toggle, true)),
            _ => {
                // Leave the page the way we found it.
                self.close_menu(surface).await;
                None
            }
        }
    }

    async fn observe(&self, surface: &dyn UiSurface, toggle: &ElementHandle) -> ModeState {
        match surface.attribute(toggle, "class").await {
            Ok(class) => {
                let class = class.unwrap_or_default();
                if class.contains(&self.selectors.temp_chat_active_class) {
                    ModeState::Temporary
                } else {
                    ModeState::Persistent
                }
            }
            Err(e) => {
                warn!("Cannot read the temporary chat toggle state: {}", e);
                ModeState::Unknown
            }
        }
    }

    /// The toggle may be re-rendered by the click; look it up again first.
    async fn reobserve(&self, surface: &dyn UiSurface, stale: &ElementHandle) -> ModeState {
        match surface
            .locate(&self.selectors.temp_chat_button, self.timings.toggle_probe())
            .await
        {
            Ok(Some(toggle)) => self.observe(surface, &toggle).await,
            _ => self.observe(surface, stale).await,
        }
    }

    async fn close_menu(&self, surface: &dyn UiSurface) {
        let closed = match surface
            .locate(&self.selectors.side_menu_button, self.timings.menu_timeout())
            .await
        {
            Ok(Some(menu)) => surface.click(&menu).await.is_ok(),
            _ => false,
        };
        if closed {
            sleep(self.timings.menu_close_settle()).await;
        } else {
            debug!("Side menu left open");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedSurface, SurfaceCall};

    fn toggle_clicks(surface: &ScriptedSurface, selectors: &Selectors) -> usize {
        surface
            .calls()
            .iter()
            .filter(|call| **call == SurfaceCall::Click(selectors.temp_chat_button.clone()))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn matching_mode_is_left_alone() {
        let selectors = Selectors::default();
        let surface = ScriptedSurface::new(selectors.clone()).with_temp_chat(true);

        let state = ModeController::new(&selectors, &Timings::default())
            .ensure_mode(&surface, ChatMode::Temporary)
            .await;

        assert_eq!(state, ModeState::Temporary);
        assert_eq!(toggle_clicks(&surface, &selectors), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn mismatch_toggles_exactly_once() {
        let selectors = Selectors::default();
        let surface = ScriptedSurface::new(selectors.clone()).with_temp_chat(false);

        let state = ModeController::new(&selectors, &Timings::default())
            .ensure_mode(&surface, ChatMode::Temporary)
            .await;

        assert_eq!(state, ModeState::Temporary);
        assert!(surface.temp_chat_active());
        assert_eq!(toggle_clicks(&surface, &selectors), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn opens_and_closes_the_side_menu() {
        let selectors = Selectors::default();
        let surface = ScriptedSurface::new(selectors.clone())
            .with_temp_chat(true)
            .with_temp_button_behind_menu();

        let state = ModeController::new(&selectors, &Timings::default())
            .ensure_mode(&surface, ChatMode::Persistent)
            .await;

        assert_eq!(state, ModeState::Persistent);
        assert!(!surface.temp_chat_active());
        assert!(!surface.menu_open());
    }

    #[tokio::test(start_paused = true)]
    async fn settle_delays_follow_timings() {
        let selectors = Selectors::default();
        let timings = Timings {
            toggle_settle_ms: 3000,
            menu_close_settle_ms: 1000,
            ..Timings::default()
        };
        let surface = ScriptedSurface::new(selectors.clone())
            .with_temp_chat(false)
            .with_temp_button_behind_menu();

        let started = tokio::time::Instant::now();
        let state = ModeController::new(&selectors, &timings)
            .ensure_mode(&surface, ChatMode::Temporary)
            .await;

        assert_eq!(state, ModeState::Temporary);
        assert!(started.elapsed() >= std::time::Duration::from_millis(4000));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_toggle_is_not_fatal() {
        let selectors = Selectors::default();
        let surface = ScriptedSurface::new(selectors.clone())
            .without_element(&selectors.temp_chat_button);

        let state = ModeController::new(&selectors, &Timings::default())
            .ensure_mode(&surface, ChatMode::Temporary)
            .await;

        assert_eq!(state, ModeState::Unknown);
        assert!(!surface.menu_open());
    }
}

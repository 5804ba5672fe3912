//! Input callbacks, component UI elements and on-screen messages.
//!
//! [`HostEvents`] is shared between the host and the simulation thread.
//! Devices register callbacks during initialization; the host injects input
//! through [`crate::host::HostInterface`], which dispatches on the simulation
//! thread. Callbacks are cloned out of the registry before being invoked, so a
//! callback may register or remove callbacks itself.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default on-screen message lifetime.
pub const DEFAULT_OSD_DURATION: f32 = 2.0;

const MAX_OSD_MESSAGES: usize = 32;

/// Generic keyboard scan code, independent of the guest keyboard controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanCode(pub u16);

impl ScanCode {
    pub const ESCAPE: ScanCode = ScanCode(0x01);
    pub const ENTER: ScanCode = ScanCode(0x1C);
    pub const LEFT_CONTROL: ScanCode = ScanCode(0x1D);
    pub const LEFT_SHIFT: ScanCode = ScanCode(0x2A);
    pub const LEFT_ALT: ScanCode = ScanCode(0x38);
    pub const SPACE: ScanCode = ScanCode(0x39);
    pub const DELETE: ScanCode = ScanCode(0xE053);
}

/// Identifies whoever registered a group of callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(u32);

/// Handle to one registered input callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackToken(u32);

/// Emulated component that owns UI elements.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComponentId(pub String);

impl From<&str> for ComponentId {
    fn from(name: &str) -> Self {
        ComponentId(name.to_string())
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IndicatorType {
    #[default]
    None,
    Fdd,
    Hdd,
    CdRom,
    Serial,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IndicatorState {
    #[default]
    Off,
    Reading,
    Writing,
}

pub type KeyboardCallback = Arc<dyn Fn(ScanCode, bool) + Send + Sync>;
pub type MousePositionChangeCallback = Arc<dyn Fn(i32, i32) + Send + Sync>;
pub type MouseButtonChangeCallback = Arc<dyn Fn(u32, bool) + Send + Sync>;
pub type UiCallback = Arc<dyn Fn() + Send + Sync>;
pub type UiFileCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct Registered<C> {
    token: CallbackToken,
    owner: OwnerId,
    callback: C,
}

struct UiElement {
    component: ComponentId,
    callbacks: Vec<(String, UiCallback)>,
    file_callbacks: Vec<(String, UiFileCallback)>,
    indicator_type: IndicatorType,
    indicator_state: IndicatorState,
}

impl UiElement {
    fn new(component: ComponentId) -> Self {
        Self {
            component,
            callbacks: Vec::new(),
            file_callbacks: Vec::new(),
            indicator_type: IndicatorType::None,
            indicator_state: IndicatorState::Off,
        }
    }
}

/// Snapshot of a component's UI element for presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiElementInfo {
    pub component: ComponentId,
    pub indicator_type: IndicatorType,
    pub indicator_state: IndicatorState,
    pub callback_labels: Vec<String>,
    pub file_callback_labels: Vec<String>,
}

struct OsdMessage {
    text: String,
    created: Instant,
    duration: Duration,
}

#[derive(Default)]
struct Registry {
    keyboard: Vec<Registered<KeyboardCallback>>,
    mouse_position: Vec<Registered<MousePositionChangeCallback>>,
    mouse_button: Vec<Registered<MouseButtonChangeCallback>>,
    ui_elements: Vec<UiElement>,
    osd_messages: VecDeque<OsdMessage>,
}

impl Registry {
    fn ui_element_mut(&mut self, component: &ComponentId) -> &mut UiElement {
        let index = match self.ui_elements.iter().position(|e| &e.component == component) {
            Some(index) => index,
            None => {
                self.ui_elements.push(UiElement::new(component.clone()));
                self.ui_elements.len() - 1
            }
        };
        &mut self.ui_elements[index]
    }
}

#[derive(Default)]
pub struct HostEvents {
    registry: Mutex<Registry>,
    next_owner: AtomicU32,
    next_token: AtomicU32,
}

impl HostEvents {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn token(&self) -> CallbackToken {
        CallbackToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub fn new_owner(&self) -> OwnerId {
        OwnerId(self.next_owner.fetch_add(1, Ordering::Relaxed))
    }

    // ========== Input callbacks ==========

    pub fn add_keyboard_callback<F>(&self, owner: OwnerId, callback: F) -> CallbackToken
    where
        F: Fn(ScanCode, bool) + Send + Sync + 'static,
    {
        let token = self.token();
        self.lock().keyboard.push(Registered {
            token,
            owner,
            callback: Arc::new(callback),
        });
        token
    }

    pub fn add_mouse_position_change_callback<F>(&self, owner: OwnerId, callback: F) -> CallbackToken
    where
        F: Fn(i32, i32) + Send + Sync + 'static,
    {
        let token = self.token();
        self.lock().mouse_position.push(Registered {
            token,
            owner,
            callback: Arc::new(callback),
        });
        token
    }

    pub fn add_mouse_button_change_callback<F>(&self, owner: OwnerId, callback: F) -> CallbackToken
    where
        F: Fn(u32, bool) + Send + Sync + 'static,
    {
        let token = self.token();
        self.lock().mouse_button.push(Registered {
            token,
            owner,
            callback: Arc::new(callback),
        });
        token
    }

    pub fn remove_callback(&self, token: CallbackToken) -> bool {
        let mut registry = self.lock();
        let before = registry.keyboard.len() + registry.mouse_position.len() + registry.mouse_button.len();
        registry.keyboard.retain(|r| r.token != token);
        registry.mouse_position.retain(|r| r.token != token);
        registry.mouse_button.retain(|r| r.token != token);
        before != registry.keyboard.len() + registry.mouse_position.len() + registry.mouse_button.len()
    }

    pub fn remove_all_callbacks(&self, owner: OwnerId) {
        let mut registry = self.lock();
        registry.keyboard.retain(|r| r.owner != owner);
        registry.mouse_position.retain(|r| r.owner != owner);
        registry.mouse_button.retain(|r| r.owner != owner);
    }

    pub fn execute_keyboard_callbacks(&self, scancode: ScanCode, key_down: bool) {
        let callbacks: Vec<_> = self.lock().keyboard.iter().map(|r| r.callback.clone()).collect();
        log::trace!("[Events] Key {:#06x} {}", scancode.0, if key_down { "down" } else { "up" });
        for callback in callbacks {
            callback(scancode, key_down);
        }
    }

    pub fn execute_mouse_position_change_callbacks(&self, dx: i32, dy: i32) {
        let callbacks: Vec<_> = self.lock().mouse_position.iter().map(|r| r.callback.clone()).collect();
        for callback in callbacks {
            callback(dx, dy);
        }
    }

    pub fn execute_mouse_button_change_callbacks(&self, button: u32, state: bool) {
        let callbacks: Vec<_> = self.lock().mouse_button.iter().map(|r| r.callback.clone()).collect();
        for callback in callbacks {
            callback(button, state);
        }
    }

    // ========== UI elements ==========

    pub fn add_ui_indicator(&self, component: &ComponentId, indicator_type: IndicatorType) {
        self.lock().ui_element_mut(component).indicator_type = indicator_type;
    }

    pub fn set_ui_indicator_state(&self, component: &ComponentId, state: IndicatorState) {
        self.lock().ui_element_mut(component).indicator_state = state;
    }

    pub fn add_ui_callback<F>(&self, component: &ComponentId, label: &str, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.lock()
            .ui_element_mut(component)
            .callbacks
            .push((label.to_string(), Arc::new(callback)));
    }

    pub fn add_ui_file_callback<F>(&self, component: &ComponentId, label: &str, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.lock()
            .ui_element_mut(component)
            .file_callbacks
            .push((label.to_string(), Arc::new(callback)));
    }

    pub fn ui_callback(&self, component: &ComponentId, label: &str) -> Option<UiCallback> {
        let registry = self.lock();
        let element = registry.ui_elements.iter().find(|e| &e.component == component)?;
        element
            .callbacks
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, c)| c.clone())
    }

    pub fn ui_file_callback(&self, component: &ComponentId, label: &str) -> Option<UiFileCallback> {
        let registry = self.lock();
        let element = registry.ui_elements.iter().find(|e| &e.component == component)?;
        element
            .file_callbacks
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, c)| c.clone())
    }

    pub fn ui_elements(&self) -> Vec<UiElementInfo> {
        self.lock()
            .ui_elements
            .iter()
            .map(|e| UiElementInfo {
                component: e.component.clone(),
                indicator_type: e.indicator_type,
                indicator_state: e.indicator_state,
                callback_labels: e.callbacks.iter().map(|(l, _)| l.clone()).collect(),
                file_callback_labels: e.file_callbacks.iter().map(|(l, _)| l.clone()).collect(),
            })
            .collect()
    }

    pub fn clear_ui_elements(&self) {
        self.lock().ui_elements.clear();
    }

    // ========== OSD ==========

    /// Queue an on-screen message shown for `duration` seconds.
    pub fn add_osd_message(&self, text: &str, duration: f32) {
        log::info!("[OSD] {}", text);
        let duration = Duration::try_from_secs_f32(duration).unwrap_or(Duration::ZERO);
        let mut registry = self.lock();
        if registry.osd_messages.len() >= MAX_OSD_MESSAGES {
            registry.osd_messages.pop_front();
        }
        registry.osd_messages.push_back(OsdMessage {
            text: text.to_string(),
            created: Instant::now(),
            duration,
        });
    }

    /// Drop expired messages and return the live ones, oldest first.
    pub fn active_osd_messages(&self) -> Vec<String> {
        let mut registry = self.lock();
        registry.osd_messages.retain(|m| m.created.elapsed() < m.duration);
        registry.osd_messages.iter().map(|m| m.text.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn keyboard_callbacks_receive_events() {
        let events = HostEvents::new();
        let owner = events.new_owner();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        events.add_keyboard_callback(owner, move |sc, down| sink.lock().unwrap().push((sc, down)));

        events.execute_keyboard_callbacks(ScanCode::ENTER, true);
        events.execute_keyboard_callbacks(ScanCode::ENTER, false);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(ScanCode::ENTER, true), (ScanCode::ENTER, false)]
        );
    }

    #[test]
    fn remove_by_token_and_owner() {
        let events = HostEvents::new();
        let a = events.new_owner();
        let b = events.new_owner();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let token = events.add_mouse_position_change_callback(a, move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = count.clone();
        events.add_mouse_position_change_callback(b, move |_, _| {
            c.fetch_add(10, Ordering::SeqCst);
        });
        let c = count.clone();
        events.add_mouse_button_change_callback(b, move |_, _| {
            c.fetch_add(100, Ordering::SeqCst);
        });

        events.execute_mouse_position_change_callbacks(1, 1);
        assert_eq!(count.load(Ordering::SeqCst), 11);

        assert!(events.remove_callback(token));
        assert!(!events.remove_callback(token));
        events.execute_mouse_position_change_callbacks(1, 1);
        assert_eq!(count.load(Ordering::SeqCst), 21);

        events.remove_all_callbacks(b);
        events.execute_mouse_position_change_callbacks(1, 1);
        events.execute_mouse_button_change_callbacks(0, true);
        assert_eq!(count.load(Ordering::SeqCst), 21);
    }

    #[test]
    fn callback_may_register_another() {
        let events = Arc::new(HostEvents::new());
        let owner = events.new_owner();
        let inner = events.clone();
        events.add_keyboard_callback(owner, move |_, _| {
            inner.add_keyboard_callback(owner, |_, _| {});
        });
        events.execute_keyboard_callbacks(ScanCode::SPACE, true);
        events.remove_all_callbacks(owner);
    }

    #[test]
    fn ui_elements_are_grouped_by_component() {
        let events = HostEvents::new();
        let fdd = ComponentId::from("FDD0");
        let fired = Arc::new(AtomicUsize::new(0));

        events.add_ui_indicator(&fdd, IndicatorType::Fdd);
        events.set_ui_indicator_state(&fdd, IndicatorState::Reading);
        let f = fired.clone();
        events.add_ui_callback(&fdd, "Eject", move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let f = fired.clone();
        events.add_ui_file_callback(&fdd, "Insert", move |path| {
            assert_eq!(path, "disk.img");
            f.fetch_add(10, Ordering::SeqCst);
        });

        let elements = events.ui_elements();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].indicator_type, IndicatorType::Fdd);
        assert_eq!(elements[0].indicator_state, IndicatorState::Reading);
        assert_eq!(elements[0].callback_labels, vec!["Eject".to_string()]);
        assert_eq!(elements[0].file_callback_labels, vec!["Insert".to_string()]);

        events.ui_callback(&fdd, "Eject").unwrap()();
        events.ui_file_callback(&fdd, "Insert").unwrap()("disk.img");
        assert!(events.ui_callback(&fdd, "Insert").is_none());
        assert!(events.ui_callback(&ComponentId::from("HDD0"), "Eject").is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn osd_messages_expire() {
        let events = HostEvents::new();
        events.add_osd_message("gone", 0.0);
        events.add_osd_message("State saved", DEFAULT_OSD_DURATION);
        events.add_osd_message("bogus", f32::NAN);
        assert_eq!(events.active_osd_messages(), vec!["State saved".to_string()]);
    }
}

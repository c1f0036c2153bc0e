//! 模拟页面：内存中的 Actuator + ContextProvider（用于测试与演示，无需浏览器）
//!
//! 页面按地址注册（元素、链接、表单提交地址、可提取数据）；每个标签页有自己的地址栈、焦点与输入内容。
//! 支持故障注入：让某类动作接下来 N 次失败或卡住一段时间、让上下文抓取接下来 N 次失败。

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::actuator::{
    Action, ActionKind, ActionOutcome, Actuator, ActuatorError, ContextError, ContextProvider,
    ContextSnapshot, ElementSignature, TargetId, TargetInfo,
};

/// 模拟页面上的元素
#[derive(Clone, Debug)]
pub struct SimElement {
    pub role: String,
    pub text: String,
    pub center: (i32, i32),
    /// 点击后跳转的地址
    pub link: Option<String>,
    /// 纵向滚动到该值后才可见
    pub reveal_at: i32,
}

impl SimElement {
    pub fn new(role: impl Into<String>, text: impl Into<String>, x: i32, y: i32) -> Self {
        Self {
            role: role.into(),
            text: text.into(),
            center: (x, y),
            link: None,
            reveal_at: 0,
        }
    }

    pub fn link_to(mut self, address: impl Into<String>) -> Self {
        self.link = Some(address.into());
        self
    }

    pub fn below_fold(mut self, reveal_at: i32) -> Self {
        self.reveal_at = reveal_at;
        self
    }

    fn is_input(&self) -> bool {
        ElementSignature::new(self.role.clone(), "").is_input()
    }
}

/// 模拟页面
#[derive(Clone, Debug, Default)]
pub struct SimPage {
    pub title: String,
    pub elements: Vec<SimElement>,
    /// 在输入框中按 Enter 后跳转的地址
    pub submit_to: Option<String>,
    /// ExtractText 可取到的数据
    pub data: BTreeMap<String, String>,
}

impl SimPage {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn element(mut self, element: SimElement) -> Self {
        self.elements.push(element);
        self
    }

    pub fn submits_to(mut self, address: impl Into<String>) -> Self {
        self.submit_to = Some(address.into());
        self
    }

    pub fn data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

#[derive(Clone, Debug)]
struct SimTab {
    address: String,
    back: Vec<String>,
    forward: Vec<String>,
    focused: Option<usize>,
    typed: String,
    scroll_y: i32,
    dialogs_dismissed: bool,
}

impl SimTab {
    fn at(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            back: Vec::new(),
            forward: Vec::new(),
            focused: None,
            typed: String::new(),
            scroll_y: 0,
            dialogs_dismissed: false,
        }
    }

    fn go(&mut self, address: String) {
        let previous = std::mem::replace(&mut self.address, address);
        self.back.push(previous);
        self.forward.clear();
        self.reset_page_state();
    }

    fn reset_page_state(&mut self) {
        self.focused = None;
        self.typed.clear();
        self.scroll_y = 0;
        self.dialogs_dismissed = false;
    }
}

#[derive(Debug, Default)]
struct SurfaceState {
    pages: HashMap<String, SimPage>,
    tabs: BTreeMap<TargetId, SimTab>,
    active: Option<TargetId>,
    next_tab: usize,
    fail_kinds: HashMap<ActionKind, usize>,
    stall_kinds: HashMap<ActionKind, (usize, Duration)>,
    capture_failures: usize,
    performed: Vec<Action>,
}

impl SurfaceState {
    fn page(&self, address: &str) -> SimPage {
        self.pages
            .get(address)
            .cloned()
            .unwrap_or_else(|| SimPage::new(address))
    }

    fn tab(&self, target: &TargetId) -> Result<SimTab, ActuatorError> {
        self.tabs
            .get(target)
            .cloned()
            .ok_or_else(|| ActuatorError::TargetNotFound(target.clone()))
    }

    fn tab_mut(&mut self, target: &TargetId) -> Result<&mut SimTab, ActuatorError> {
        self.tabs
            .get_mut(target)
            .ok_or_else(|| ActuatorError::TargetNotFound(target.clone()))
    }

    fn visible_elements(&self, tab: &SimTab) -> Vec<SimElement> {
        self.page(&tab.address)
            .elements
            .into_iter()
            .filter(|e| e.reveal_at <= tab.scroll_y)
            .filter(|e| !(tab.dialogs_dismissed && e.role.eq_ignore_ascii_case("dialog")))
            .collect()
    }

    fn new_tab_id(&mut self) -> TargetId {
        let id = TargetId::new(format!("tab-{}", self.next_tab));
        self.next_tab += 1;
        id
    }
}

/// 模拟页面，同时实现 Actuator 与 ContextProvider
#[derive(Debug)]
pub struct SimulatedSurface {
    state: Mutex<SurfaceState>,
}

impl Default for SimulatedSurface {
    fn default() -> Self {
        Self::new("about:blank")
    }
}

impl SimulatedSurface {
    /// 创建带一个初始标签页（tab-0）的模拟页面
    pub fn new(start_address: impl Into<String>) -> Self {
        let mut state = SurfaceState::default();
        let id = state.new_tab_id();
        state.tabs.insert(id.clone(), SimTab::at(start_address));
        state.active = Some(id);
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn with_page(self, address: impl Into<String>, page: SimPage) -> Self {
        self.lock().pages.insert(address.into(), page);
        self
    }

    /// 让某类动作接下来 n 次执行失败
    pub fn fail_next(&self, kind: ActionKind, n: usize) {
        self.lock().fail_kinds.insert(kind, n);
    }

    /// 让某类动作接下来 n 次先卡住 delay 再执行
    pub fn stall_next(&self, kind: ActionKind, n: usize, delay: Duration) {
        self.lock().stall_kinds.insert(kind, (n, delay));
    }

    /// 让上下文抓取接下来 n 次失败
    pub fn fail_captures(&self, n: usize) {
        self.lock().capture_failures = n;
    }

    /// 已成功分派的动作（按顺序）
    pub fn performed(&self) -> Vec<Action> {
        self.lock().performed.clone()
    }

    pub fn open_tabs(&self) -> Vec<TargetId> {
        self.lock().tabs.keys().cloned().collect()
    }

    pub fn address_of(&self, target: &TargetId) -> Option<String> {
        self.lock().tabs.get(target).map(|t| t.address.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SurfaceState> {
        // 模拟状态没有跨锁不变量，中毒后继续使用
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_stall(&self, kind: ActionKind) -> Option<Duration> {
        let mut state = self.lock();
        let (remaining, delay) = state.stall_kinds.get_mut(&kind)?;
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(*delay)
    }

    fn apply(
        state: &mut SurfaceState,
        target: &TargetId,
        action: &Action,
    ) -> Result<ActionOutcome, ActuatorError> {
        let mut outcome = ActionOutcome::default();
        match action {
            Action::MouseMove { .. } | Action::Drag { .. } | Action::Wait { .. } => {}
            Action::Click { x, y, element } | Action::DoubleClick { x, y, element } => {
                let tab = state.tab(target)?;
                let visible = state.visible_elements(&tab);
                let hit = match element {
                    Some(label) => {
                        let label = label.to_lowercase();
                        visible.iter().position(|e| e.text.to_lowercase().contains(&label))
                    }
                    None => visible.iter().position(|e| {
                        (e.center.0 - x).abs() <= 20 && (e.center.1 - y).abs() <= 20
                    }),
                };
                let Some(idx) = hit else {
                    return Err(ActuatorError::ElementNotFound(
                        element.clone().unwrap_or_else(|| format!("({x}, {y})")),
                    ));
                };
                let el = visible[idx].clone();
                let tab = state.tab_mut(target)?;
                if let Some(link) = el.link {
                    tab.go(link);
                } else if el.is_input() {
                    tab.focused = Some(idx);
                    tab.typed.clear();
                }
            }
            Action::KeyPress { key } => {
                let address = state.tab_mut(target)?.address.clone();
                let submit_to = state.page(&address).submit_to;
                let tab = state.tab_mut(target)?;
                match key.to_lowercase().as_str() {
                    "enter" => {
                        if let (Some(_), Some(next)) = (tab.focused, submit_to) {
                            tab.go(next);
                        }
                    }
                    "escape" => tab.dialogs_dismissed = true,
                    _ => {}
                }
            }
            Action::Type { text, element } => {
                let tab = state.tab(target)?;
                let visible = state.visible_elements(&tab);
                let focus = match element {
                    Some(label) => {
                        let label = label.to_lowercase();
                        visible
                            .iter()
                            .position(|e| e.is_input() && e.text.to_lowercase().contains(&label))
                    }
                    None => tab.focused,
                };
                let Some(idx) = focus else {
                    return Err(ActuatorError::Failed("no focused input".to_string()));
                };
                let tab = state.tab_mut(target)?;
                if tab.focused != Some(idx) {
                    tab.focused = Some(idx);
                    tab.typed.clear();
                }
                tab.typed.push_str(text);
            }
            Action::Scroll { direction, amount } => {
                let tab = state.tab_mut(target)?;
                match direction {
                    crate::actuator::ScrollDirection::Down => tab.scroll_y += amount,
                    crate::actuator::ScrollDirection::Up => {
                        tab.scroll_y = (tab.scroll_y - amount).max(0)
                    }
                    _ => {}
                }
            }
            Action::Navigate { url } => state.tab_mut(target)?.go(url.clone()),
            Action::NavigateBack => {
                let tab = state.tab_mut(target)?;
                if let Some(prev) = tab.back.pop() {
                    let current = std::mem::replace(&mut tab.address, prev);
                    tab.forward.push(current);
                    tab.reset_page_state();
                }
            }
            Action::NavigateForward => {
                let tab = state.tab_mut(target)?;
                if let Some(next) = tab.forward.pop() {
                    let current = std::mem::replace(&mut tab.address, next);
                    tab.back.push(current);
                    tab.reset_page_state();
                }
            }
            Action::Refresh => state.tab_mut(target)?.reset_page_state(),
            Action::OpenTarget { url, .. } => {
                let id = state.new_tab_id();
                let address = url.clone().unwrap_or_else(|| "about:blank".to_string());
                let title = state.page(&address).title;
                state.tabs.insert(id.clone(), SimTab::at(address.clone()));
                state.active = Some(id.clone());
                outcome.opened_target = Some(TargetInfo {
                    id: id.clone(),
                    address,
                    title,
                    active: true,
                });
                outcome.active_target = Some(id);
            }
            Action::CloseTarget { target_id } => {
                let closing = target_id.clone().unwrap_or_else(|| target.clone());
                if state.tabs.remove(&closing).is_none() {
                    return Err(ActuatorError::TargetNotFound(closing));
                }
                if state.active.as_ref() == Some(&closing) {
                    state.active = state.tabs.keys().next_back().cloned();
                }
                outcome.closed_target = Some(closing);
                outcome.active_target = state.active.clone();
            }
            Action::SwitchTarget { target_id } => {
                if !state.tabs.contains_key(target_id) {
                    return Err(ActuatorError::TargetNotFound(target_id.clone()));
                }
                state.active = Some(target_id.clone());
                outcome.active_target = Some(target_id.clone());
            }
            Action::ExtractText { key, element } => {
                let tab = state.tab(target)?;
                let value = match element {
                    Some(label) => {
                        let label = label.to_lowercase();
                        state
                            .visible_elements(&tab)
                            .into_iter()
                            .find(|e| e.text.to_lowercase().contains(&label))
                            .map(|e| e.text)
                    }
                    None => state.page(&tab.address).data.get(key).cloned(),
                };
                let value = value.ok_or_else(|| ActuatorError::ElementNotFound(key.clone()))?;
                outcome.output = Some(value.clone());
                outcome.extracted.push((key.clone(), value));
            }
            Action::Message { text } => outcome.output = Some(text.clone()),
            Action::Deliver { filename, .. } => outcome.deliverable = Some(filename.clone()),
        }
        Ok(outcome)
    }
}

#[async_trait]
impl Actuator for SimulatedSurface {
    async fn perform(
        &self,
        target: &TargetId,
        action: &Action,
    ) -> Result<ActionOutcome, ActuatorError> {
        if let Some(delay) = self.take_stall(action.kind()) {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        if let Some(remaining) = state.fail_kinds.get_mut(&action.kind()) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ActuatorError::Failed(format!("injected {} failure", action.kind())));
            }
        }
        let outcome = Self::apply(&mut state, target, action)?;
        state.performed.push(action.clone());
        Ok(outcome)
    }
}

#[async_trait]
impl ContextProvider for SimulatedSurface {
    async fn capture(&self, target: &TargetId) -> Result<ContextSnapshot, ContextError> {
        let mut state = self.lock();
        if state.capture_failures > 0 {
            state.capture_failures -= 1;
            return Err(ContextError::Unavailable("injected capture failure".to_string()));
        }
        let tab = state
            .tabs
            .get(target)
            .cloned()
            .ok_or_else(|| ContextError::TargetNotFound(target.clone()))?;
        let page = state.page(&tab.address);
        let visible = state.visible_elements(&tab);
        let elements = visible
            .iter()
            .map(|e| {
                ElementSignature::new(e.role.clone(), e.text.clone()).at(e.center.0, e.center.1)
            })
            .collect();
        let mut snapshot = ContextSnapshot::new(target.clone(), tab.address.clone(), page.title)
            .with_elements(elements);
        if tab.focused.is_some() {
            snapshot.focused_value = Some(tab.typed.clone());
        }
        Ok(snapshot)
    }

    async fn list_targets(&self) -> Result<Vec<TargetInfo>, ContextError> {
        let state = self.lock();
        Ok(state
            .tabs
            .iter()
            .map(|(id, tab)| TargetInfo {
                id: id.clone(),
                address: tab.address.clone(),
                title: state.page(&tab.address).title,
                active: state.active.as_ref() == Some(id),
            })
            .collect())
    }
}

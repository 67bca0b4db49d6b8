// src/engine/violation.rs

//! Maps raw client integrity signals to verdicts.
//!
//! Clipboard and context-menu attempts can be intercepted reliably, so they are
//! blocked and never counted. Fullscreen exits, tab switches and focus loss
//! cannot be blocked, so they are counted as violations.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipboardAction {
    Copy,
    Cut,
    Paste,
}

/// A raw signal observed by the exam client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    FullscreenExited,
    FullscreenEntered,
    DocumentHidden,
    WindowBlurred { in_fullscreen: bool },
    Clipboard(ClipboardAction),
    ContextMenu,
}

/// Reason attached to a counted violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationReason {
    FullscreenExit,
    TabSwitch,
    WindowBlur,
}

impl ViolationReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FullscreenExit => "fullscreen_exit",
            Self::TabSwitch => "tab_switch",
            Self::WindowBlur => "window_blur",
        }
    }
}

impl fmt::Display for ViolationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Count a violation.
    Penalize(ViolationReason),
    /// Block the action; nothing is counted.
    Prevent,
    /// The re-entry gesture that lifts a temporary lock.
    Restore,
    Ignore,
}

/// Detector scoped to one attempt. Nothing is observed until [`attach`](Self::attach)
/// and after [`detach`](Self::detach).
#[derive(Debug, Default, Clone)]
pub struct ViolationDetector {
    attached: bool,
    suppressed: bool,
    prevented: u32,
}

impl ViolationDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self) {
        self.attached = true;
        self.suppressed = false;
    }

    pub fn detach(&mut self) {
        self.attached = false;
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Stops penalizing while a submission is in flight or time is up.
    /// Blocking of clipboard actions continues.
    pub fn suppress(&mut self) {
        self.suppressed = true;
    }

    pub fn resume(&mut self) {
        self.suppressed = false;
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    /// Number of blocked clipboard and context-menu attempts.
    pub fn prevented(&self) -> u32 {
        self.prevented
    }

    pub fn observe(&mut self, signal: Signal) -> Verdict {
        if !self.attached {
            return Verdict::Ignore;
        }

        match signal {
            Signal::Clipboard(_) | Signal::ContextMenu => {
                self.prevented += 1;
                Verdict::Prevent
            }
            Signal::FullscreenEntered => Verdict::Restore,
            _ if self.suppressed => Verdict::Ignore,
            Signal::FullscreenExited => Verdict::Penalize(ViolationReason::FullscreenExit),
            Signal::DocumentHidden => Verdict::Penalize(ViolationReason::TabSwitch),
            Signal::WindowBlurred { in_fullscreen: true } => {
                Verdict::Penalize(ViolationReason::WindowBlur)
            }
            Signal::WindowBlurred { in_fullscreen: false } => Verdict::Ignore,
        }
    }
}

//! Input Module
//!
//! Window events are queued here by the message loop and drained once per
//! frame by the frame driver, so input timing never reaches into GPU
//! submission.

use std::collections::VecDeque;

use glam::Vec3;
use tracing::trace;

use crate::camera::Camera;

/// Radians of rotation per raw mouse count.
pub const MOUSE_SENSITIVITY: f32 = 0.001;

/// Keys the engine reacts to. Movement uses an AZERTY layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Z,
    Q,
    S,
    D,
    A,
    E,
    F11,
    Escape,
    Other(u32),
}

impl Key {
    /// Map a Win32 virtual-key code.
    pub fn from_virtual_key(code: u32) -> Self {
        match code {
            0x5A => Key::Z,
            0x51 => Key::Q,
            0x53 => Key::S,
            0x44 => Key::D,
            0x41 => Key::A,
            0x45 => Key::E,
            0x7A => Key::F11,
            0x1B => Key::Escape,
            other => Key::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    Resize { width: u32, height: u32 },
    Key { key: Key, pressed: bool },
    /// Raw mouse motion in device counts.
    MouseMotion { dx: i32, dy: i32 },
    Focus(bool),
    ToggleFullscreen,
    CloseRequested,
}

/// Input events waiting for the next frame.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<InputEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: InputEvent) {
        trace!("input event {:?}", event);
        self.events.push_back(event);
    }

    pub fn drain(&mut self) -> impl Iterator<Item = InputEvent> + '_ {
        self.events.drain(..)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Applies key and mouse events to a camera.
#[derive(Debug)]
pub struct CameraControl {
    focused: bool,
}

impl Default for CameraControl {
    fn default() -> Self {
        Self { focused: true }
    }
}

impl CameraControl {
    pub fn focused(&self) -> bool {
        self.focused
    }

    /// Returns whether the camera changed.
    pub fn apply(&mut self, camera: &mut Camera, event: &InputEvent) -> bool {
        match *event {
            InputEvent::Focus(focused) => {
                self.focused = focused;
                false
            }
            InputEvent::Key { key, pressed: true } => {
                let direction = match key {
                    Key::Z => camera.forward,
                    Key::S => -camera.forward,
                    Key::D => camera.right,
                    Key::Q => -camera.right,
                    Key::A => Vec3::Y,
                    Key::E => -Vec3::Y,
                    _ => return false,
                };
                camera.step(direction);
                true
            }
            InputEvent::MouseMotion { dx, dy } if self.focused => {
                if dx == 0 && dy == 0 {
                    return false;
                }
                camera.rotate(Vec3::Y, dx as f32 * MOUSE_SENSITIVITY);
                let right = camera.right;
                camera.rotate(right, -(dy as f32) * MOUSE_SENSITIVITY);
                true
            }
            _ => false,
        }
    }
}

//! Low-level pointer and keyboard backends.
//!
//! Two methods are implemented:
//! - Native: Win32 `SendInput` with absolute coordinates and scan-code keys,
//!   which DirectX games read through their raw input layer
//! - Universal: `enigo`, available wherever it builds

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::capture::Point;

/// Available input backends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputBackend {
    #[default]
    Native,
    Universal,
}

impl InputBackend {
    pub fn is_available(self) -> bool {
        match self {
            InputBackend::Native => cfg!(windows),
            InputBackend::Universal => cfg!(feature = "desktop"),
        }
    }

    /// The requested backend if present, otherwise the other one.
    pub fn negotiate(self) -> Option<InputBackend> {
        let fallback = match self {
            InputBackend::Native => InputBackend::Universal,
            InputBackend::Universal => InputBackend::Native,
        };
        [self, fallback].into_iter().find(|b| b.is_available())
    }
}

impl fmt::Display for InputBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputBackend::Native => write!(f, "native"),
            InputBackend::Universal => write!(f, "universal"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

impl FromStr for MouseButton {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" => Ok(MouseButton::Left),
            "right" => Ok(MouseButton::Right),
            "middle" => Ok(MouseButton::Middle),
            other => Err(anyhow!("Unknown mouse button '{}'", other)),
        }
    }
}

/// Keys the simulator can press.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Key {
    Escape,
    Enter,
    Space,
    Tab,
    Backspace,
    Up,
    Down,
    Left,
    Right,
    /// F1 to F12.
    Function(u8),
    /// Lowercase ASCII letter or digit.
    Char(char),
}

impl FromStr for Key {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_lowercase();
        let key = match name.as_str() {
            "esc" | "escape" => Key::Escape,
            "enter" | "return" => Key::Enter,
            "space" => Key::Space,
            "tab" => Key::Tab,
            "backspace" => Key::Backspace,
            "up" => Key::Up,
            "down" => Key::Down,
            "left" => Key::Left,
            "right" => Key::Right,
            _ => {
                if let Some(n) = name.strip_prefix('f').and_then(|n| n.parse::<u8>().ok()) {
                    if (1..=12).contains(&n) {
                        return Ok(Key::Function(n));
                    }
                }
                let mut chars = name.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) if c.is_ascii_alphanumeric() => Key::Char(c),
                    _ => bail!("Unknown key '{}'", s),
                }
            }
        };
        Ok(key)
    }
}

/// Raw pointer and keyboard events.
///
/// Implementations report failures as errors; the simulator turns them into
/// a `false` result.
pub trait InputDevice: Send {
    fn cursor_position(&mut self) -> Result<Point>;

    /// Primary screen size in pixels.
    fn screen_size(&mut self) -> Result<(u32, u32)>;

    /// Moves the pointer to an absolute screen position.
    fn move_to(&mut self, x: i32, y: i32) -> Result<()>;

    fn button(&mut self, button: MouseButton, down: bool) -> Result<()>;

    fn key(&mut self, key: Key, down: bool) -> Result<()>;
}

/// Builds the device for a negotiated backend.
pub fn open_device(backend: InputBackend) -> Result<Box<dyn InputDevice>> {
    match backend {
        #[cfg(windows)]
        InputBackend::Native => Ok(Box::new(native::SendInputDevice::new())),
        #[cfg(feature = "desktop")]
        InputBackend::Universal => Ok(Box::new(universal::EnigoDevice::new()?)),
        #[allow(unreachable_patterns)]
        other => bail!("Input backend '{}' is not available in this build", other),
    }
}

#[cfg(windows)]
mod native {
    use super::{InputDevice, Key, MouseButton};
    use crate::capture::Point;
    use anyhow::{anyhow, Result};

    use windows::Win32::Foundation::POINT;
    use windows::Win32::UI::Input::KeyboardAndMouse::{
        SendInput, INPUT, INPUT_0, INPUT_KEYBOARD, INPUT_MOUSE, KEYBDINPUT, KEYBD_EVENT_FLAGS,
        KEYEVENTF_EXTENDEDKEY, KEYEVENTF_KEYUP, KEYEVENTF_SCANCODE, MOUSEEVENTF_ABSOLUTE,
        MOUSEEVENTF_LEFTDOWN, MOUSEEVENTF_LEFTUP, MOUSEEVENTF_MIDDLEDOWN, MOUSEEVENTF_MIDDLEUP,
        MOUSEEVENTF_MOVE, MOUSEEVENTF_RIGHTDOWN, MOUSEEVENTF_RIGHTUP, MOUSEINPUT,
        MOUSE_EVENT_FLAGS,
    };
    use windows::Win32::UI::WindowsAndMessaging::{
        GetCursorPos, GetSystemMetrics, SM_CXSCREEN, SM_CYSCREEN,
    };

    pub struct SendInputDevice;

    impl SendInputDevice {
        pub fn new() -> Self {
            Self
        }
    }

    /// Set 1 scan code and whether it needs the extended-key flag.
    fn scan_code(key: Key) -> Option<(u16, bool)> {
        let code = match key {
            Key::Escape => (0x01, false),
            Key::Enter => (0x1C, false),
            Key::Space => (0x39, false),
            Key::Tab => (0x0F, false),
            Key::Backspace => (0x0E, false),
            Key::Up => (0x48, true),
            Key::Down => (0x50, true),
            Key::Left => (0x4B, true),
            Key::Right => (0x4D, true),
            Key::Function(n @ 1..=10) => (0x3B + u16::from(n) - 1, false),
            Key::Function(11) => (0x57, false),
            Key::Function(12) => (0x58, false),
            Key::Function(_) => return None,
            Key::Char(c) => {
                const ROWS: [(&str, u16); 4] = [
                    ("1234567890", 0x02),
                    ("qwertyuiop", 0x10),
                    ("asdfghjkl", 0x1E),
                    ("zxcvbnm", 0x2C),
                ];
                let c = c.to_ascii_lowercase();
                let (row, base) = ROWS.iter().find(|(row, _)| row.contains(c))?;
                let offset = row.find(c)? as u16;
                (base + offset, false)
            }
        };
        Some(code)
    }

    fn send(input: INPUT) -> Result<()> {
        let sent = unsafe { SendInput(&[input], std::mem::size_of::<INPUT>() as i32) };
        if sent == 1 {
            Ok(())
        } else {
            Err(anyhow!("SendInput rejected the event"))
        }
    }

    fn screen() -> (i32, i32) {
        unsafe { (GetSystemMetrics(SM_CXSCREEN), GetSystemMetrics(SM_CYSCREEN)) }
    }

    /// Absolute position normalized to the 0-65535 range `MOUSEEVENTF_ABSOLUTE` expects.
    fn normalized(x: i32, y: i32) -> (i32, i32) {
        let (w, h) = screen();
        let nx = (i64::from(x) * 65535 / i64::from((w - 1).max(1))) as i32;
        let ny = (i64::from(y) * 65535 / i64::from((h - 1).max(1))) as i32;
        (nx, ny)
    }

    fn mouse_input(flags: MOUSE_EVENT_FLAGS, dx: i32, dy: i32) -> INPUT {
        INPUT {
            r#type: INPUT_MOUSE,
            Anonymous: INPUT_0 {
                mi: MOUSEINPUT {
                    dx,
                    dy,
                    dwFlags: flags,
                    ..Default::default()
                },
            },
        }
    }

    impl InputDevice for SendInputDevice {
        fn cursor_position(&mut self) -> Result<Point> {
            let mut p = POINT::default();
            unsafe { GetCursorPos(&mut p)? };
            Ok(Point::new(p.x, p.y))
        }

        fn screen_size(&mut self) -> Result<(u32, u32)> {
            let (w, h) = screen();
            if w <= 0 || h <= 0 {
                return Err(anyhow!("GetSystemMetrics returned {}x{}", w, h));
            }
            Ok((w as u32, h as u32))
        }

        fn move_to(&mut self, x: i32, y: i32) -> Result<()> {
            let (nx, ny) = normalized(x, y);
            send(mouse_input(MOUSEEVENTF_MOVE | MOUSEEVENTF_ABSOLUTE, nx, ny))
        }

        fn button(&mut self, button: MouseButton, down: bool) -> Result<()> {
            let flags = match (button, down) {
                (MouseButton::Left, true) => MOUSEEVENTF_LEFTDOWN,
                (MouseButton::Left, false) => MOUSEEVENTF_LEFTUP,
                (MouseButton::Right, true) => MOUSEEVENTF_RIGHTDOWN,
                (MouseButton::Right, false) => MOUSEEVENTF_RIGHTUP,
                (MouseButton::Middle, true) => MOUSEEVENTF_MIDDLEDOWN,
                (MouseButton::Middle, false) => MOUSEEVENTF_MIDDLEUP,
            };
            send(mouse_input(flags, 0, 0))
        }

        fn key(&mut self, key: Key, down: bool) -> Result<()> {
            let (code, extended) =
                scan_code(key).ok_or_else(|| anyhow!("No scan code for {:?}", key))?;
            let mut flags: KEYBD_EVENT_FLAGS = KEYEVENTF_SCANCODE;
            if extended {
                flags |= KEYEVENTF_EXTENDEDKEY;
            }
            if !down {
                flags |= KEYEVENTF_KEYUP;
            }
            send(INPUT {
                r#type: INPUT_KEYBOARD,
                Anonymous: INPUT_0 {
                    ki: KEYBDINPUT {
                        wScan: code,
                        dwFlags: flags,
                        ..Default::default()
                    },
                },
            })
        }
    }

}

#[cfg(feature = "desktop")]
mod universal {
    use super::{InputDevice, Key, MouseButton};
    use crate::capture::Point;
    use anyhow::{anyhow, Result};
    use enigo::{Button, Coordinate, Direction, Enigo, Keyboard, Mouse, Settings};

    pub struct EnigoDevice {
        enigo: Enigo,
    }

    impl EnigoDevice {
        pub fn new() -> Result<Self> {
            let enigo = Enigo::new(&Settings::default())
                .map_err(|e| anyhow!("Failed to open input device: {}", e))?;
            Ok(Self { enigo })
        }
    }

    fn direction(down: bool) -> Direction {
        if down {
            Direction::Press
        } else {
            Direction::Release
        }
    }

    fn enigo_key(key: Key) -> Result<enigo::Key> {
        use enigo::Key as K;
        Ok(match key {
            Key::Escape => K::Escape,
            Key::Enter => K::Return,
            Key::Space => K::Space,
            Key::Tab => K::Tab,
            Key::Backspace => K::Backspace,
            Key::Up => K::UpArrow,
            Key::Down => K::DownArrow,
            Key::Left => K::LeftArrow,
            Key::Right => K::RightArrow,
            Key::Function(n) => match n {
                1 => K::F1,
                2 => K::F2,
                3 => K::F3,
                4 => K::F4,
                5 => K::F5,
                6 => K::F6,
                7 => K::F7,
                8 => K::F8,
                9 => K::F9,
                10 => K::F10,
                11 => K::F11,
                12 => K::F12,
                _ => return Err(anyhow!("Unsupported function key F{}", n)),
            },
            Key::Char(c) => K::Unicode(c),
        })
    }

    impl InputDevice for EnigoDevice {
        fn cursor_position(&mut self) -> Result<Point> {
            let (x, y) = self.enigo.location()?;
            Ok(Point::new(x, y))
        }

        fn screen_size(&mut self) -> Result<(u32, u32)> {
            let (w, h) = self.enigo.main_display()?;
            Ok((w.max(1) as u32, h.max(1) as u32))
        }

        fn move_to(&mut self, x: i32, y: i32) -> Result<()> {
            self.enigo.move_mouse(x, y, Coordinate::Abs)?;
            Ok(())
        }

        fn button(&mut self, button: MouseButton, down: bool) -> Result<()> {
            let button = match button {
                MouseButton::Left => Button::Left,
                MouseButton::Right => Button::Right,
                MouseButton::Middle => Button::Middle,
            };
            self.enigo.button(button, direction(down))?;
            Ok(())
        }

        fn key(&mut self, key: Key, down: bool) -> Result<()> {
            self.enigo.key(enigo_key(key)?, direction(down))?;
            Ok(())
        }
    }
}

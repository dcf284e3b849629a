//! ADB (Android Debug Bridge) helpers for device interaction.

mod connection;
mod device;
mod input;
mod screenshot;

pub use connection::{AdbClient, AdbError};
pub use device::{back, double_tap, get_current_app, home, launch_app, long_press, swipe, tap};
pub use input::{
    clear_text, detect_and_set_adb_keyboard, restore_keyboard, type_text,
    type_text_with_keyboard_handling,
};
pub use screenshot::{fallback_screenshot, get_screenshot};

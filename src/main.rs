// Prevents additional console window on Windows in release
#![cfg_attr(
    all(not(debug_assertions), target_os = "windows"),
    windows_subsystem = "windows"
)]

use remux::desktop::create_app;

fn main() {
    remux::logging::init();

    create_app()
        .run(tauri::generate_context!())
        .expect("error while running remux");
}

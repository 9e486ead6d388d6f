use comfy_table::{Cell, Table};

use crate::error::Result;
use crate::settings::{config_dir, load_settings, load_stored_settings, save_settings};

pub fn show() -> Result<()> {
    let settings = load_settings();
    let mut table = Table::new();
    table.set_header(vec!["Setting", "Value"]);
    for (key, value) in settings.entries() {
        table.add_row(vec![Cell::new(key), Cell::new(value)]);
    }
    println!("Settings ({})\n{table}", config_dir().display());
    Ok(())
}

pub fn set(key: &str, value: &str) -> Result<()> {
    let mut settings = load_stored_settings();
    settings.set(key, value)?;
    save_settings(&settings)?;
    println!("{key} updated.");
    Ok(())
}

//! `portbridge config` - view and change settings.

use anyhow::{bail, Context, Result};
use portbridge_core::SettingsStore;

pub async fn show() -> Result<()> {
    let store = SettingsStore::new().context("failed to locate config directory")?;
    let settings = store.load().await.unwrap_or_default();

    println!("auto-start         {}", settings.auto_start);
    println!("notifications      {}", settings.show_notifications);
    println!("refresh-interval   {}s", settings.refresh_interval_secs);
    Ok(())
}

pub async fn set(key: &str, value: &str) -> Result<()> {
    let store = SettingsStore::new().context("failed to locate config directory")?;
    let mut settings = store.load().await.unwrap_or_default();

    match key {
        "auto-start" => settings.auto_start = parse_bool(value)?,
        "notifications" => settings.show_notifications = parse_bool(value)?,
        "refresh-interval" => {
            let secs: u64 = value
                .parse()
                .with_context(|| format!("'{value}' is not a number of seconds"))?;
            if secs == 0 {
                bail!("refresh-interval must be at least 1 second");
            }
            settings.refresh_interval_secs = secs;
        }
        _ => bail!("unknown setting '{key}'; expected auto-start, notifications, or refresh-interval"),
    }

    store
        .save(&settings)
        .await
        .context("failed to save settings")?;
    println!("Updated {key}");
    Ok(())
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => bail!("'{value}' is not a boolean; use true or false"),
    }
}

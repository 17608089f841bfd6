use std::{collections::HashMap, fs};

#[derive(Debug, Clone)]
pub struct Settings {
    pub api_url: String,
    pub channel_url: String,
    pub session_token: String,
    pub directory_refresh_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8443".into(),
            channel_url: "ws://127.0.0.1:8443".into(),
            session_token: String::new(),
            directory_refresh_secs: 60,
        }
    }
}

/// Defaults, overlaid by `client.toml` in the working directory, overlaid by
/// environment variables. Both the plain and the `APP__` prefixed env forms
/// are accepted.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("api_url") {
                settings.api_url = v.clone();
            }
            if let Some(v) = file_cfg.get("channel_url") {
                settings.channel_url = v.clone();
            }
            if let Some(v) = file_cfg.get("session_token") {
                settings.session_token = v.clone();
            }
            if let Some(v) = file_cfg.get("directory_refresh_secs") {
                if let Ok(parsed) = v.parse::<u64>() {
                    settings.directory_refresh_secs = parsed;
                }
            }
        }
    }

    if let Ok(v) = std::env::var("CHAT_API_URL") {
        settings.api_url = v;
    }
    if let Ok(v) = std::env::var("APP__API_URL") {
        settings.api_url = v;
    }

    if let Ok(v) = std::env::var("CHAT_CHANNEL_URL") {
        settings.channel_url = v;
    }
    if let Ok(v) = std::env::var("APP__CHANNEL_URL") {
        settings.channel_url = v;
    }

    if let Ok(v) = std::env::var("CHAT_SESSION_TOKEN") {
        settings.session_token = v;
    }
    if let Ok(v) = std::env::var("APP__SESSION_TOKEN") {
        settings.session_token = v;
    }

    if let Ok(v) = std::env::var("APP__DIRECTORY_REFRESH_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.directory_refresh_secs = parsed;
        }
    }

    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_loopback() {
        let settings = Settings::default();
        assert!(settings.api_url.starts_with("http://127.0.0.1"));
        assert!(settings.channel_url.starts_with("ws://127.0.0.1"));
        assert_eq!(settings.directory_refresh_secs, 60);
    }
}

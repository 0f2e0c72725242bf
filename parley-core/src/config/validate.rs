//! Configuration validation rules.

use super::schema::Config;

const LOG_FORMATS: [&str; 2] = ["text", "json"];

/// Validate configuration and return aggregated validation errors.
pub fn validate_config(config: &Config) -> crate::Result<()> {
    let mut errors = Vec::new();

    if config.chat.model.trim().is_empty() {
        errors.push("chat.model must not be empty".to_string());
    }
    if config.chat.welcome_message.trim().is_empty() {
        errors.push("chat.welcome_message must not be empty".to_string());
    }
    if let Some(budget) = config.chat.thinking_budget {
        if budget < -1 {
            errors.push("chat.thinking_budget must be >= -1".to_string());
        }
    }

    if config.retry.max_retries > 10 {
        errors.push("retry.max_retries must be <= 10".to_string());
    }
    if config.retry.base_delay_ms == 0 {
        errors.push("retry.base_delay_ms must be > 0".to_string());
    }
    if config.retry.factor == 0 {
        errors.push("retry.factor must be >= 1".to_string());
    }

    if config.storage.dir.trim().is_empty() {
        errors.push("storage.dir must not be empty".to_string());
    }
    if config.user.id.trim().is_empty() {
        errors.push("user.id must not be empty".to_string());
    }

    if let Some(base) = &config.provider.api_base {
        let base = base.trim();
        if !base.is_empty() && !base.starts_with("http://") && !base.starts_with("https://") {
            errors.push("provider.api_base must be an http(s) URL".to_string());
        }
    }

    if !LOG_FORMATS.contains(&config.logging.format.to_lowercase().as_str()) {
        errors.push("logging.format must be one of: text, json".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(crate::Error::Validation(errors.join("; ")))
    }
}

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000")
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Public origin the vision model uses to fetch staged images
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// OpenAI-compatible chat-completions endpoint
    pub ai_api_url: String,

    /// Bearer token for the vision endpoint
    pub ai_api_token: String,

    /// Vision model identifier
    #[serde(default = "default_ai_model")]
    pub ai_model: String,

    /// Directory for uploaded originals
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,

    /// Directory for staged JPEGs served under /temp
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    #[serde(default = "default_temp_url_lifetime_secs")]
    pub temp_url_lifetime_secs: u64,

    #[serde(default = "default_temp_sweep_interval_secs")]
    pub temp_sweep_interval_secs: u64,

    /// Staged files older than this are swept regardless of their timer
    #[serde(default = "default_temp_max_age_secs")]
    pub temp_max_age_secs: u64,

    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    #[serde(default = "default_batch_ttl_secs")]
    pub batch_ttl_secs: u64,

    /// Images an anonymous session may process
    #[serde(default = "default_session_image_quota")]
    pub session_image_quota: usize,

    /// Request body limit for uploads
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    /// Per-image size limit
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,

    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,

    #[serde(default = "default_image_timeout_ms")]
    pub image_timeout_ms: u64,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_ai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("data/uploads")
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("data/temp")
}

fn default_temp_url_lifetime_secs() -> u64 {
    30
}

fn default_temp_sweep_interval_secs() -> u64 {
    30
}

fn default_temp_max_age_secs() -> u64 {
    60
}

fn default_session_ttl_secs() -> u64 {
    3600
}

fn default_batch_ttl_secs() -> u64 {
    3600
}

fn default_session_image_quota() -> usize {
    100
}

fn default_max_upload_bytes() -> usize {
    50 * 1024 * 1024
}

fn default_max_file_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_batch_concurrency() -> usize {
    5
}

fn default_image_timeout_ms() -> u64 {
    30_000
}

fn default_retry_attempts() -> u32 {
    3
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn temp_url_lifetime(&self) -> Duration {
        Duration::from_secs(self.temp_url_lifetime_secs)
    }

    /// Sweep threshold, never shorter than the scheduled lifetime so the
    /// sweep cannot pull an image out from under an in-flight request.
    pub fn temp_max_age(&self) -> Duration {
        Duration::from_secs(self.temp_max_age_secs.max(self.temp_url_lifetime_secs))
    }

    pub fn temp_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.temp_sweep_interval_secs.max(1))
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn batch_ttl(&self) -> Duration {
        Duration::from_secs(self.batch_ttl_secs)
    }

    pub fn image_timeout(&self) -> Duration {
        Duration::from_millis(self.image_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_env() {
        let vars = vec![
            ("AI_API_URL".to_string(), "https://api.example.com/v1/chat/completions".to_string()),
            ("AI_API_TOKEN".to_string(), "secret".to_string()),
            ("TEMP_URL_LIFETIME_SECS".to_string(), "90".to_string()),
        ];
        let config: AppConfig = envy::from_iter(vars).unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.batch_concurrency, 5);
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.image_timeout(), Duration::from_secs(30));
        // Sweep threshold follows a longer lifetime.
        assert_eq!(config.temp_max_age(), Duration::from_secs(90));
    }

    #[test]
    fn test_missing_required_field() {
        let vars = vec![("AI_API_TOKEN".to_string(), "secret".to_string())];
        assert!(envy::from_iter::<_, AppConfig>(vars).is_err());
    }
}

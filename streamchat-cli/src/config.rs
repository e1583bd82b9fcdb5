use thiserror::Error;
use url::Url;

pub const DEFAULT_INSTRUCTIONS: &str = "You are an expert in movie reviews. \
Answer questions about movies, directors and actors, and keep your replies short.";
pub const DEFAULT_HISTORY_LENGTH: usize = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has an invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// How the API key is attached to outbound requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiKeyHeader {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// A provider specific header, e.g. `api-key: <key>`
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub endpoint: Url,
    pub api_key: String,
    pub api_key_header: ApiKeyHeader,
    pub instructions: String,
    pub history_length: usize,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Blank values count as unset.
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let endpoint_raw = get("STREAMCHAT_ENDPOINT").ok_or(ConfigError::Missing("STREAMCHAT_ENDPOINT"))?;
        let endpoint = Url::parse(endpoint_raw.trim()).map_err(|e| ConfigError::Invalid {
            name: "STREAMCHAT_ENDPOINT",
            value: endpoint_raw.clone(),
            reason: e.to_string(),
        })?;

        let api_key = get("STREAMCHAT_API_KEY").ok_or(ConfigError::Missing("STREAMCHAT_API_KEY"))?;

        let api_key_header = match get("STREAMCHAT_API_KEY_HEADER") {
            None => ApiKeyHeader::Bearer,
            Some(v) if v.trim().eq_ignore_ascii_case("bearer") => ApiKeyHeader::Bearer,
            Some(v) => ApiKeyHeader::Custom(v.trim().to_string()),
        };

        let instructions = get("STREAMCHAT_INSTRUCTIONS").unwrap_or_else(|| DEFAULT_INSTRUCTIONS.to_string());

        let history_length = match get("STREAMCHAT_HISTORY_LENGTH") {
            None => DEFAULT_HISTORY_LENGTH,
            Some(v) => match v.trim().parse::<usize>().map_err(|e| e.to_string()) {
                Ok(0) => {
                    return Err(ConfigError::Invalid {
                        name: "STREAMCHAT_HISTORY_LENGTH",
                        value: v,
                        reason: "must be at least 1".to_string(),
                    })
                }
                Ok(n) => n,
                Err(reason) => {
                    return Err(ConfigError::Invalid {
                        name: "STREAMCHAT_HISTORY_LENGTH",
                        value: v,
                        reason,
                    })
                }
            },
        };

        let model = get("STREAMCHAT_MODEL").map(|v| v.trim().to_string());

        let temperature = get("STREAMCHAT_TEMPERATURE")
            .map(|v| {
                v.trim().parse::<f32>().map_err(|e| ConfigError::Invalid {
                    name: "STREAMCHAT_TEMPERATURE",
                    value: v.clone(),
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        let max_tokens = get("STREAMCHAT_MAX_TOKENS")
            .map(|v| {
                v.trim().parse::<u32>().map_err(|e| ConfigError::Invalid {
                    name: "STREAMCHAT_MAX_TOKENS",
                    value: v.clone(),
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        Ok(Self {
            endpoint,
            api_key,
            api_key_header,
            instructions,
            history_length,
            model,
            temperature,
            max_tokens,
        })
    }
}

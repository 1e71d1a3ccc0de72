use dotenvy::dotenv;
use std::env;
use std::str::FromStr;

pub const DEFAULT_CLASSIFIER_URL: &str =
    "https://api-inference.huggingface.co/models/facebook/bart-large-mnli";

pub const DEFAULT_UPLOAD_EXPIRES_SECONDS: u64 = 3600;

/// OAuth client registration for Google Calendar
#[derive(Debug, Clone)]
pub struct GoogleOAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

/// Object storage target for presigned uploads
#[derive(Debug, Clone)]
pub struct S3UploadConfig {
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub expires_in_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: Option<String>,
    pub openrouter_api_key: String,
    pub llm_model: String,
    pub llm_base_url: String,
    pub hf_api_token: Option<String>,
    pub classifier_url: String,
    pub google: Option<GoogleOAuthConfig>,
    pub s3: Option<S3UploadConfig>,
    pub cors_origins: Vec<String>,
    pub access_token_ttl_minutes: i64,
    pub share_key_ttl_seconds: i64,
    pub default_timezone: String,
    pub cookie_secure: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8081,
            database_url: None,
            openrouter_api_key: String::new(),
            llm_model: "openai/gpt-4o-mini".to_string(),
            llm_base_url: "https://openrouter.ai/api/v1".to_string(),
            hf_api_token: None,
            classifier_url: DEFAULT_CLASSIFIER_URL.to_string(),
            google: None,
            s3: None,
            cors_origins: vec!["http://localhost:5173".to_string()],
            access_token_ttl_minutes: 30,
            share_key_ttl_seconds: 3600,
            default_timezone: "UTC".to_string(),
            cookie_secure: false,
        }
    }
}

impl Config {
    /// Load from the environment, reading `.env` first when present
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        let defaults = Self::default();

        let openrouter_api_key = env::var("OPENROUTER_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENROUTER_API_KEY not set"))?;

        let google = match (
            non_empty("GOOGLE_CLIENT_ID"),
            non_empty("GOOGLE_CLIENT_SECRET"),
            non_empty("GOOGLE_REDIRECT_URI"),
        ) {
            (Some(client_id), Some(client_secret), Some(redirect_uri)) => Some(GoogleOAuthConfig {
                client_id,
                client_secret,
                redirect_uri,
            }),
            _ => None,
        };

        let s3 = match (
            non_empty("S3_BUCKET_NAME"),
            non_empty("AWS_REGION"),
            non_empty("AWS_ACCESS_KEY_ID"),
            non_empty("AWS_SECRET_ACCESS_KEY"),
        ) {
            (Some(bucket), Some(region), Some(access_key_id), Some(secret_access_key)) => {
                Some(S3UploadConfig {
                    bucket,
                    region,
                    access_key_id,
                    secret_access_key,
                    expires_in_seconds: parsed("S3_UPLOAD_EXPIRES_SECONDS")?
                        .unwrap_or(DEFAULT_UPLOAD_EXPIRES_SECONDS),
                })
            }
            _ => None,
        };

        let cors_origins = match non_empty("CORS_ORIGINS") {
            Some(list) => list
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect(),
            None => defaults.cors_origins,
        };

        Ok(Self {
            port: parsed("PORT")?.unwrap_or(defaults.port),
            database_url: non_empty("DATABASE_URL"),
            openrouter_api_key,
            llm_model: non_empty("LLM_MODEL").unwrap_or(defaults.llm_model),
            llm_base_url: non_empty("LLM_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.llm_base_url),
            hf_api_token: non_empty("HF_API_TOKEN"),
            classifier_url: non_empty("CLASSIFIER_URL").unwrap_or(defaults.classifier_url),
            google,
            s3,
            cors_origins,
            access_token_ttl_minutes: parsed("ACCESS_TOKEN_TTL_MINUTES")?
                .unwrap_or(defaults.access_token_ttl_minutes),
            share_key_ttl_seconds: parsed("SHARE_KEY_TTL_SECONDS")?
                .unwrap_or(defaults.share_key_ttl_seconds),
            default_timezone: non_empty("DEFAULT_TIMEZONE").unwrap_or(defaults.default_timezone),
            cookie_secure: parsed("COOKIE_SECURE")?.unwrap_or(defaults.cookie_secure),
        })
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parsed<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    non_empty(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}"))
        })
        .transpose()
}

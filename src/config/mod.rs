mod settings;

pub use settings::{
    ApiConfig, ChannelsConfig, DatabaseConfig, LoggingConfig, OtelConfig, QueueConfig,
    RateLimitConfig, ServerConfig, Settings, SmtpConfig, TemplateConfig,
};

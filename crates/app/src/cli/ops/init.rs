use clap::Args;
use common::migrate::DomainMapping;

use crate::state::{AppConfig, AppState, RetryConfig, StoreConfig};

#[derive(Args, Debug, Clone)]
pub struct Init {
    /// Account to migrate from
    #[arg(long)]
    pub source_principal: String,

    /// Environment variable that holds the source access token
    #[arg(long, default_value = "FERRY_SOURCE_TOKEN")]
    pub source_token_env: String,

    /// Account to migrate to
    #[arg(long)]
    pub dest_principal: String,

    /// Environment variable that holds the destination access token
    #[arg(long, default_value = "FERRY_DEST_TOKEN")]
    pub dest_token_env: String,

    /// Copy permissions, rewriting this domain ...
    #[arg(long, requires = "target_domain")]
    pub source_domain: Option<String>,

    /// ... into this one
    #[arg(long, requires = "source_domain")]
    pub target_domain: Option<String>,

    /// Default log level
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("init failed: {0}")]
    StateFailed(#[from] crate::state::StateError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Init {
    type Error = InitError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let domains = match (&self.source_domain, &self.target_domain) {
            (Some(source), Some(target)) => Some(DomainMapping::new(source, target)),
            _ => None,
        };
        let config = AppConfig {
            source: StoreConfig::drive(&self.source_principal, &self.source_token_env),
            destination: StoreConfig::drive(&self.dest_principal, &self.dest_token_env),
            domains,
            retry: RetryConfig::default(),
            log_level: self.log_level.clone(),
            keep_staging: false,
        };

        let state = AppState::init(ctx.config_path.clone(), config)?;

        let permissions = match &state.config.domains {
            Some(domains) => format!("{} -> {}", domains.source, domains.target),
            None => "not copied".to_string(),
        };

        let output = format!(
            "Initialized ferry directory at: {}\n\
             - Config: {}\n\
             - Logs: {}\n\
             - Source: {} (token from ${})\n\
             - Destination: {} (token from ${})\n\
             - Permissions: {}",
            state.state_dir.display(),
            state.config_path.display(),
            state.logs_dir.display(),
            state.config.source.principal(),
            self.source_token_env,
            state.config.destination.principal(),
            self.dest_token_env,
            permissions,
        );

        Ok(output)
    }
}

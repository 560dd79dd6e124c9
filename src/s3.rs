use anyhow::Result;
use aws_config::meta::region::RegionProviderChain;
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::{Builder as S3ConfigBuilder, Region},
    Client as S3Client,
};

use crate::config::AppConfig;

/// Object store connection settings taken from [`AppConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Settings {
    pub region: String,
    pub endpoint_url: Option<String>,
    pub static_credentials: Option<(String, String)>,
    /// S3-compatible servers behind a custom endpoint (MinIO, localstack)
    /// only resolve path-style bucket URLs.
    pub force_path_style: bool,
}

impl S3Settings {
    pub fn from_config(config: &AppConfig) -> Self {
        let endpoint_url = config
            .aws_endpoint_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string);

        let static_credentials = match (
            config.aws_access_key_id.as_deref(),
            config.aws_secret_access_key.as_deref(),
        ) {
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => {
                Some((key.to_string(), secret.to_string()))
            }
            _ => None,
        };

        Self {
            region: config.aws_region.clone(),
            force_path_style: endpoint_url.is_some(),
            endpoint_url,
            static_credentials,
        }
    }
}

pub async fn build_client(config: &AppConfig) -> Result<S3Client> {
    let settings = S3Settings::from_config(config);
    tracing::debug!(
        region = %settings.region,
        custom_endpoint = settings.endpoint_url.is_some(),
        static_credentials = settings.static_credentials.is_some(),
        "building S3 client"
    );

    let region_provider = RegionProviderChain::first_try(Some(Region::new(settings.region)))
        .or_default_provider()
        .or_else("us-east-1");

    #[allow(deprecated)]
    let mut loader = aws_config::from_env().region(region_provider);

    if let Some(endpoint) = &settings.endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }

    if let Some((access_key, secret_key)) = settings.static_credentials {
        let credentials = Credentials::new(access_key, secret_key, None, None, "cloudvault-env");
        loader = loader.credentials_provider(credentials);
    }

    let base_config = loader.load().await;
    let s3_config = S3ConfigBuilder::from(&base_config)
        .force_path_style(settings.force_path_style)
        .build();

    Ok(S3Client::from_conf(s3_config))
}

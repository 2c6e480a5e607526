use super::certificate::CertificateBundle;
use crate::{
    config::{interface, ClientConfig},
    APP_USER_AGENT,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{header::ACCEPT, Certificate, Client, Identity};
use secrecy::{ExposeSecret, SecretString};
use std::{fmt, net::IpAddr, time::Duration};
use tracing::{debug, instrument};
use url::Url;

/// Where fresh certificates come from.
#[async_trait]
pub trait CertificateSource: Send + Sync + fmt::Debug {
    /// # Errors
    /// Returns an error if no valid bundle could be obtained.
    async fn fetch_remote(&self) -> Result<CertificateBundle>;
}

/// Fetches `GET <server>/api/v<version>/certificate` from the upstream API.
pub struct HttpCertificateSource {
    client: Client,
    url: Url,
    token: SecretString,
}

impl fmt::Debug for HttpCertificateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpCertificateSource")
            .field("url", &self.url.as_str())
            .finish_non_exhaustive()
    }
}

impl HttpCertificateSource {
    /// # Errors
    /// Returns an error if the server URL, the CA or the client identity is invalid,
    /// or the source interface has no IPv4 address.
    pub fn new(config: &ClientConfig, timeout: Option<Duration>) -> Result<Self> {
        let url = certificate_url(&config.server, config.api_version)?;

        let mut builder = Client::builder().user_agent(APP_USER_AGENT);

        if !config.ca.is_empty() {
            let ca = Certificate::from_pem(config.ca.as_bytes()).context("invalid client CA")?;
            builder = builder.add_root_certificate(ca);
        }

        if !config.certificate.is_empty() && !config.key.expose_secret().is_empty() {
            let pem = format!("{}\n{}", config.certificate, config.key.expose_secret());
            let identity =
                Identity::from_pem(pem.as_bytes()).context("invalid client certificate")?;
            builder = builder.identity(identity);
        }

        if let Some(name) = config.source_interface.as_deref().filter(|n| !n.is_empty()) {
            let address = interface::resolve(name)?;
            debug!(interface = name, ip = %address.ip, "binding API client");
            builder = builder.local_address(IpAddr::V4(address.ip));
        }

        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            url,
            token: config.token.clone(),
        })
    }
}

fn certificate_url(server: &str, api_version: u16) -> Result<Url> {
    let mut base = Url::parse(server).with_context(|| format!("invalid server URL {server}"))?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }

    Ok(base.join(&format!("api/v{api_version}/certificate"))?)
}

#[async_trait]
impl CertificateSource for HttpCertificateSource {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn fetch_remote(&self) -> Result<CertificateBundle> {
        let response = self
            .client
            .get(self.url.clone())
            .header(ACCEPT, "application/json")
            .bearer_auth(self.token.expose_secret())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("{} - {}", self.url, status));
        }

        let mut bundle: CertificateBundle = response
            .json()
            .await
            .context("invalid certificate response")?;

        bundle.validate()?;

        debug!(signature_date = ?bundle.signature_date, "certificate fetched");

        Ok(bundle)
    }
}

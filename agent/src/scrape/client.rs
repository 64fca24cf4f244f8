use std::fs;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};

use common::error::{Error, Result};

use crate::scrape::scrape::Arguments;

/// Builds the HTTP client used for every scrape of a job's targets.
///
/// The scrape deadline bounds both connection establishment and the whole
/// request. Auth material is loaded eagerly so that broken configuration
/// surfaces before the first scrape, not during it.
pub fn new_http_client(cfg: &Arguments) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(cfg.scrape_timeout)
        .connect_timeout(cfg.scrape_timeout);

    if let Some(path) = &cfg.ca_cert {
        let pem = fs::read(path)?;
        let ca = reqwest::Certificate::from_pem(&pem)?;
        // The configured CA becomes the sole trusted root.
        builder = builder
            .tls_built_in_root_certs(false)
            .add_root_certificate(ca);
    }

    if let Some(pair) = &cfg.client_cert {
        let mut pem = fs::read(&pair.cert)?;
        pem.extend(fs::read(&pair.key)?);
        builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
    }

    if let Some(headers) = bearer_auth_headers(cfg)? {
        builder = builder.default_headers(headers);
    }

    builder.build().map_err(Error::from)
}

fn bearer_auth_headers(cfg: &Arguments) -> Result<Option<HeaderMap>> {
    let token = match (&cfg.bearer_token, &cfg.bearer_token_file) {
        (Some(_), Some(_)) => {
            return Err(Error::Config(
                "at most one of bearer_token and bearer_token_file must be configured".into(),
            ))
        }
        (Some(token), None) => token.clone(),
        (None, Some(path)) => fs::read_to_string(path)?.trim().to_string(),
        (None, None) => return Ok(None),
    };

    let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|_| Error::Config("bearer token is not a valid header value".into()))?;
    value.set_sensitive(true);

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, value);
    Ok(Some(headers))
}

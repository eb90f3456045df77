use crate::config::Config;
use crate::error::TransportError;
use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::future::Future;

use super::types::{Request, Response};

/// The network leg. Every strategy talks to the network only through this.
pub trait Transport: Send + Sync + 'static {
  /// Issue the request and read the full response.
  ///
  /// Any HTTP status is a successful send; only a missing response is an error.
  fn send(&self, request: &Request)
    -> impl Future<Output = Result<Response, TransportError>> + Send;
}

/// reqwest-backed transport that attaches bearer credentials when configured.
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
  token: Option<String>,
}

impl HttpClient {
  pub fn new(config: &Config) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(config.network.timeout())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      token: Config::get_api_token(),
    })
  }
}

impl Transport for HttpClient {
  async fn send(&self, request: &Request) -> Result<Response, TransportError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }

    if let Some(token) = &self.token {
      if !request.headers.contains_key("authorization") {
        builder = builder.bearer_auth(token);
      }
    }

    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await?;

    let status = response.status().as_u16();
    let headers: BTreeMap<String, String> = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await?.to_vec();

    Ok(Response::new(status, headers, body))
  }
}

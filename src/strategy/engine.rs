use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use super::classify::{Classifier, Route};
use crate::cache::{Cache, CacheStore, ResourceClass, Served};
use crate::connectivity::Connectivity;
use crate::error::TransportError;
use crate::http::{Request, Response, Transport};

/// Issue a request unless connectivity is known to be down.
pub(crate) async fn fetch_network<T: Transport>(
  transport: &T,
  connectivity: &Connectivity,
  request: &Request,
) -> Result<Response, TransportError> {
  if !connectivity.is_online() {
    return Err(TransportError::Offline);
  }
  transport.send(request).await
}

/// Applies Cache-First, Network-First or Stale-While-Revalidate to GET
/// requests, and the pass-through policies for excluded and cross-origin ones.
///
/// Background refreshes run as detached tasks; their only effect is the cache
/// write on success.
pub struct StrategyEngine<T: Transport> {
  transport: Arc<T>,
  caches: CacheStore,
  classifier: Arc<Classifier>,
  connectivity: Connectivity,
  offline_page: Url,
}

impl<T: Transport> StrategyEngine<T> {
  pub fn new(
    transport: Arc<T>,
    caches: CacheStore,
    classifier: Classifier,
    connectivity: Connectivity,
    offline_page: Url,
  ) -> Self {
    Self {
      transport,
      caches,
      classifier: Arc::new(classifier),
      connectivity,
      offline_page,
    }
  }

  pub fn classify(&self, request: &Request) -> Route {
    self.classifier.classify(request)
  }

  pub fn classifier(&self) -> &Classifier {
    &self.classifier
  }

  /// Network leg shared by every policy.
  pub(crate) async fn fetch(&self, request: &Request) -> Result<Response, TransportError> {
    fetch_network(self.transport.as_ref(), &self.connectivity, request).await
  }

  /// Serve a GET request according to its route.
  pub async fn handle(&self, request: &Request) -> Result<Served> {
    let route = self.classify(request);
    debug!(?route, url = %request.url, "Routing request");

    match route {
      Route::Mutation => Err(eyre!(
        "{} {} is a mutation and cannot be served by a caching strategy",
        request.method,
        request.url
      )),
      Route::CrossOrigin => Ok(self.cross_origin(request).await),
      Route::Bypass => self.bypass(request).await,
      Route::CacheFirst => self.cache_first(request).await,
      Route::NetworkFirst => self.network_first(request).await,
      Route::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
    }
  }

  /// Serve the cached snapshot at once and refresh it in the background.
  ///
  /// 1. Cache hit: return it, refresh detached
  /// 2. Miss: wait for the network and cache a successful response
  /// 3. Miss and network failure: offline page
  pub async fn cache_first(&self, request: &Request) -> Result<Served> {
    let cache = self.caches.for_class(ResourceClass::Static);

    if let Some(entry) = cache.match_request(request)? {
      self.spawn_refresh(cache, request.clone());
      return Ok(Served::from_cache(entry.response, entry.stored_at));
    }

    self.fetch_and_store(&cache, request).await
  }

  /// Prefer the network and fall back to the last cached snapshot.
  pub async fn network_first(&self, request: &Request) -> Result<Served> {
    let cache = self.caches.for_class(ResourceClass::Api);

    match self.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          cache.put(request, &response)?;
        }
        Ok(Served::from_network(response))
      }
      Err(e) => {
        warn!(url = %request.url, "Network failed ({}), falling back to cache", e);
        match cache.match_request(request)? {
          Some(entry) => Ok(Served::from_cache(entry.response, entry.stored_at)),
          None => Ok(Served::synthetic(Response::offline_api())),
        }
      }
    }
  }

  /// Serve the cached snapshot while revalidating it for the next read.
  pub async fn stale_while_revalidate(&self, request: &Request) -> Result<Served> {
    let cache = self.caches.for_class(ResourceClass::Dynamic);

    if let Some(entry) = cache.match_request(request)? {
      self.spawn_refresh(cache, request.clone());
      return Ok(Served::from_cache(entry.response, entry.stored_at));
    }

    self.fetch_and_store(&cache, request).await
  }

  /// Never cached; a network failure propagates unchanged.
  pub async fn bypass(&self, request: &Request) -> Result<Served> {
    let response = self.fetch(request).await?;
    Ok(Served::from_network(response))
  }

  /// Never cached; a network failure becomes a plain-text 503.
  pub async fn cross_origin(&self, request: &Request) -> Served {
    match self.fetch(request).await {
      Ok(response) => Served::from_network(response),
      Err(e) => {
        debug!(url = %request.url, "External request failed: {}", e);
        Served::synthetic(Response::unavailable())
      }
    }
  }

  /// Blocking network leg of a cache miss. The write is best effort: a failed
  /// cache write never replaces a good network response.
  async fn fetch_and_store(&self, cache: &Cache, request: &Request) -> Result<Served> {
    match self.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          if let Err(e) = cache.put(request, &response) {
            warn!(cache = cache.name(), "Failed to cache {}: {}", request.url, e);
          }
        }
        Ok(Served::from_network(response))
      }
      Err(e) => {
        warn!(url = %request.url, "Network failed ({}), serving offline page", e);
        self.offline_fallback()
      }
    }
  }

  /// The cached offline page, or a plain 503 when it was never cached.
  pub fn offline_fallback(&self) -> Result<Served> {
    let request = Request::get(self.offline_page.clone());
    let cache = self.caches.for_class(ResourceClass::Static);

    Ok(match cache.match_request(&request)? {
      Some(entry) => Served::fallback(entry.response, entry.stored_at),
      None => Served::synthetic(Response::unavailable()),
    })
  }

  /// Refresh a cache entry without the caller waiting on it.
  pub fn spawn_refresh(&self, cache: Cache, request: Request) -> JoinHandle<()> {
    let transport = Arc::clone(&self.transport);
    let connectivity = self.connectivity.clone();

    tokio::spawn(async move {
      match fetch_network(transport.as_ref(), &connectivity, &request).await {
        Ok(response) if response.is_success() => {
          if let Err(e) = cache.put(&request, &response) {
            warn!(cache = cache.name(), "Failed to store refresh of {}: {}", request.url, e);
          } else {
            debug!(url = %request.url, "Refreshed cache entry");
          }
        }
        Ok(response) => {
          debug!(url = %request.url, status = response.status, "Refresh not cached");
        }
        Err(e) => {
          debug!(url = %request.url, "Background refresh failed: {}", e);
        }
      }
    })
  }
}

impl<T: Transport> Clone for StrategyEngine<T> {
  fn clone(&self) -> Self {
    Self {
      transport: Arc::clone(&self.transport),
      caches: self.caches.clone(),
      classifier: Arc::clone(&self.classifier),
      connectivity: self.connectivity.clone(),
      offline_page: self.offline_page.clone(),
    }
  }
}

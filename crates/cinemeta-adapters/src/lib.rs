//! Movie source contract + the TMDB-backed implementation.

use async_trait::async_trait;
use cinemeta_core::{DiscoverPage, MovieCredits, MovieDetails};
use cinemeta_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "cinemeta-adapters";

pub const DEFAULT_BASE_URL: &str = "https://api.themoviedb.org/3";
pub const DEFAULT_LANGUAGE: &str = "en-US";
pub const DEFAULT_SORT_BY: &str = "popularity.desc";

#[derive(Debug, Error)]
pub enum TmdbError {
    #[error("TMDB_API_KEY is not set")]
    MissingApiKey,
    #[error("invalid TMDB base url `{0}`")]
    InvalidBaseUrl(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Everything the pipelines need from a movie catalogue.
///
/// Each call resolves to `None` when the remote side had nothing usable;
/// the reason has already been logged by then.
#[async_trait]
pub trait MovieSource: Send + Sync {
    async fn discover_page(&self, year: i32, page: u32) -> Option<DiscoverPage>;

    async fn movie_details(&self, movie_id: i64) -> Option<MovieDetails>;

    async fn movie_credits(&self, movie_id: i64) -> Option<MovieCredits>;
}

#[derive(Debug, Clone)]
pub struct TmdbClientConfig {
    pub api_key: String,
    pub base_url: String,
    pub language: String,
    pub sort_by: String,
    /// Policy for discover pages. Discovery does not retry by default.
    pub discover_policy: BackoffPolicy,
    /// Policy for per-movie detail and credits lookups.
    pub lookup_policy: BackoffPolicy,
    pub http: HttpClientConfig,
}

impl TmdbClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            language: DEFAULT_LANGUAGE.to_string(),
            sort_by: DEFAULT_SORT_BY.to_string(),
            discover_policy: BackoffPolicy::single_attempt(),
            lookup_policy: BackoffPolicy::default(),
            http: HttpClientConfig::default(),
        }
    }
}

#[derive(Debug)]
pub struct TmdbClient {
    http: HttpFetcher,
    config: TmdbClientConfig,
}

impl TmdbClient {
    pub fn new(config: TmdbClientConfig) -> Result<Self, TmdbError> {
        if config.api_key.trim().is_empty() {
            return Err(TmdbError::MissingApiKey);
        }
        if !(config.base_url.starts_with("http://") || config.base_url.starts_with("https://")) {
            return Err(TmdbError::InvalidBaseUrl(config.base_url));
        }
        let http = HttpFetcher::new(config.http.clone())?;
        Ok(Self { http, config })
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn base_query(&self) -> Vec<(&'static str, String)> {
        vec![
            ("api_key", self.config.api_key.clone()),
            ("language", self.config.language.clone()),
        ]
    }

    pub fn discover_query(&self, year: i32, page: u32) -> Vec<(&'static str, String)> {
        let mut query = self.base_query();
        query.push(("sort_by", self.config.sort_by.clone()));
        query.push(("primary_release_year", year.to_string()));
        query.push(("page", page.to_string()));
        query
    }
}

#[async_trait]
impl MovieSource for TmdbClient {
    async fn discover_page(&self, year: i32, page: u32) -> Option<DiscoverPage> {
        let url = self.endpoint("discover/movie");
        debug!(year, page, "requesting discover page");
        self.http
            .try_fetch_json(&url, &self.discover_query(year, page), &self.config.discover_policy)
            .await
    }

    async fn movie_details(&self, movie_id: i64) -> Option<MovieDetails> {
        let url = self.endpoint(&format!("movie/{movie_id}"));
        self.http
            .try_fetch_json(&url, &self.base_query(), &self.config.lookup_policy)
            .await
    }

    async fn movie_credits(&self, movie_id: i64) -> Option<MovieCredits> {
        let url = self.endpoint(&format!("movie/{movie_id}/credits"));
        self.http
            .try_fetch_json(&url, &self.base_query(), &self.config.lookup_policy)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn client(base_url: &str) -> TmdbClient {
        let mut config = TmdbClientConfig::new("secret");
        config.base_url = base_url.to_string();
        TmdbClient::new(config).expect("client")
    }

    #[test]
    fn rejects_missing_api_key() {
        let err = TmdbClient::new(TmdbClientConfig::new("  ")).unwrap_err();
        assert!(matches!(err, TmdbError::MissingApiKey));
    }

    #[test]
    fn rejects_non_http_base_url() {
        let mut config = TmdbClientConfig::new("secret");
        config.base_url = "ftp://example.org".into();
        assert!(matches!(
            TmdbClient::new(config).unwrap_err(),
            TmdbError::InvalidBaseUrl(_)
        ));
    }

    #[test]
    fn endpoint_joins_without_double_slashes() {
        let tmdb = client("https://api.themoviedb.org/3/");
        assert_eq!(
            tmdb.endpoint("/movie/42/credits"),
            "https://api.themoviedb.org/3/movie/42/credits"
        );
    }

    #[test]
    fn discover_query_carries_year_page_and_sort() {
        let tmdb = client(DEFAULT_BASE_URL);
        let query = tmdb.discover_query(2019, 3);
        assert_eq!(
            query,
            vec![
                ("api_key", "secret".to_string()),
                ("language", "en-US".to_string()),
                ("sort_by", "popularity.desc".to_string()),
                ("primary_release_year", "2019".to_string()),
                ("page", "3".to_string()),
            ]
        );
    }

    #[test]
    fn detail_and_credit_payloads_decode() {
        let details: MovieDetails = serde_json::from_str(
            r#"{"id": 603, "title": "The Matrix", "budget": 63000000, "revenue": 463517383}"#,
        )
        .unwrap();
        assert_eq!(details.budget, Some(63_000_000.0));

        let credits: MovieCredits = serde_json::from_str(
            r#"{"id": 603,
                "cast": [{"name": "Keanu Reeves", "popularity": 40.5, "order": 0}],
                "crew": [{"name": "Lana Wachowski", "job": "Director", "department": "Directing"}]}"#,
        )
        .unwrap();
        assert_eq!(credits.director().as_deref(), Some("Lana Wachowski"));
        assert_eq!(credits.top_cast_popularity(), Some(40.5));
    }

    #[tokio::test]
    async fn unreachable_api_yields_no_result() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let mut config = TmdbClientConfig::new("secret");
        config.base_url = format!("http://{addr}/3");
        config.lookup_policy = BackoffPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            retry_after_margin: Duration::ZERO,
        };
        let tmdb = TmdbClient::new(config).expect("client");

        assert!(tmdb.discover_page(2015, 1).await.is_none());
        assert!(tmdb.movie_details(42).await.is_none());
        assert!(tmdb.movie_credits(42).await.is_none());
    }
}

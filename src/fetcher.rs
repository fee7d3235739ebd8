use std::time::Duration;

use anyhow::Error;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::limiter::{Cancelled, RateLimiter};
use super::query::{ArticleViewQuery, DateRange};
use super::transport::Transport;

pub const DEFAULT_BASE_URL: &str = "https://wikimedia.org/api/rest_v1";

// per-article endpoint: english wikipedia, every access method and agent type
const ENDPOINT_SEGMENTS: [&str; 6] = [
    "metrics",
    "pageviews",
    "per-article",
    "en.wikipedia",
    "all-access",
    "all-agents",
];
const GRANULARITY: &str = "monthly";

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("request cancelled")]
    Cancelled,

    #[error("failed to get article views after {attempts} attempts")]
    ExhaustedRetries { attempts: u32 },

    #[error("request timed out after {0:?}")]
    TimedOut(Duration),
}

impl From<Cancelled> for FetchError {
    fn from(_: Cancelled) -> Self {
        FetchError::Cancelled
    }
}

/// Reasons a single attempt failed; all of them are retried.
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error("cannot build request url from base {0}")]
    Url(Url),

    #[error("transport failure: {0}")]
    Transport(Error),

    #[error("status code -> {status}, server error message -> {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("failed to deserialize server response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("server response contained no items")]
    NoItems,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    /// Delay slept before the attempt at `attempt_index` (zero-based).
    pub fn backoff(&self, attempt_index: u32) -> Duration {
        if attempt_index == 0 {
            return Duration::ZERO;
        }
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(attempt_index))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetcherSettings {
    pub base_url: String,
    pub retry: RetryPolicy,
    pub rate_limit_period: Duration,
    /// Upper bound on a whole fetch, rate limiter wait included.
    pub request_timeout: Option<Duration>,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        FetcherSettings {
            base_url: DEFAULT_BASE_URL.to_string(),
            retry: RetryPolicy::default(),
            rate_limit_period: Duration::from_secs(1),
            request_timeout: Some(Duration::from_secs(10)),
        }
    }
}

#[derive(Deserialize)]
struct UpstreamResponse {
    items: Vec<MonthlyItem>,
}

#[derive(Deserialize)]
struct MonthlyItem {
    views: u64,
}

fn parse_views(body: &str) -> Result<u64, AttemptError> {
    let response: UpstreamResponse = serde_json::from_str(body)?;
    response
        .items
        .first()
        .map(|item| item.views)
        .ok_or(AttemptError::NoItems)
}

pub struct PageviewFetcher<T: Transport> {
    transport: T,
    limiter: RateLimiter,
    base_url: Url,
    retry: RetryPolicy,
    request_timeout: Option<Duration>,
}

impl<T: Transport> PageviewFetcher<T> {
    pub fn new(transport: T, settings: &FetcherSettings) -> Result<Self, Error> {
        let base_url = Url::parse(&settings.base_url)?;
        let limiter = RateLimiter::new(settings.rate_limit_period)?;

        Ok(PageviewFetcher {
            transport,
            limiter,
            base_url,
            retry: settings.retry,
            request_timeout: settings.request_timeout,
        })
    }

    /// Monthly view count for `query`, retrying transient upstream failures.
    pub async fn fetch(
        &self,
        query: &ArticleViewQuery,
        cancel: &CancellationToken,
    ) -> Result<u64, FetchError> {
        match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, self.fetch_with_retries(query, cancel))
                .await
                .map_err(|_| {
                    tracing::error!("fetching views for {} timed out", query.article());
                    FetchError::TimedOut(limit)
                })?,
            None => self.fetch_with_retries(query, cancel).await,
        }
    }

    async fn fetch_with_retries(
        &self,
        query: &ArticleViewQuery,
        cancel: &CancellationToken,
    ) -> Result<u64, FetchError> {
        self.limiter.acquire(cancel).await?;

        let range = query.date_range();

        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                let delay = self.retry.backoff(attempt);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                outcome = self.attempt(query, &range) => outcome,
            };

            match outcome {
                Ok(views) => {
                    tracing::info!(
                        "fetched views, article: {}, month: {}-{:02}, views: {}",
                        query.article(),
                        query.year(),
                        query.month(),
                        views
                    );
                    return Ok(views);
                }
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        "pageview request failed, reason: {}",
                        e
                    );
                }
            }
        }

        Err(FetchError::ExhaustedRetries {
            attempts: self.retry.max_attempts,
        })
    }

    async fn attempt(&self, query: &ArticleViewQuery, range: &DateRange) -> Result<u64, AttemptError> {
        let url = self.request_url(query, range)?;

        let reply = self
            .transport
            .get(url)
            .await
            .map_err(AttemptError::Transport)?;

        if !reply.status.is_success() {
            return Err(AttemptError::Status {
                status: reply.status,
                body: reply.body,
            });
        }

        parse_views(&reply.body)
    }

    fn request_url(&self, query: &ArticleViewQuery, range: &DateRange) -> Result<Url, AttemptError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AttemptError::Url(self.base_url.clone()))?
            .pop_if_empty()
            .extend(ENDPOINT_SEGMENTS)
            .push(query.article())
            .push(GRANULARITY)
            .push(&range.start_param())
            .push(&range.end_param());

        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::UpstreamReply;
    use axum::async_trait;
    use pretty_assertions::assert_eq;
    use reqwest::StatusCode;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    type Script = VecDeque<Result<UpstreamReply, Error>>;

    /// Plays back canned replies and records every url it was asked for.
    #[derive(Default)]
    struct ScriptedTransport {
        replies: Mutex<Script>,
        requested: Mutex<Vec<(Url, Instant)>>,
    }

    impl ScriptedTransport {
        fn new(replies: impl IntoIterator<Item = Result<UpstreamReply, Error>>) -> Self {
            ScriptedTransport {
                replies: Mutex::new(replies.into_iter().collect()),
                requested: Mutex::default(),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn get(&self, url: Url) -> Result<UpstreamReply, Error> {
            self.requested.lock().unwrap().push((url, Instant::now()));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::msg("script exhausted")))
        }
    }

    fn reply(status: StatusCode, body: &str) -> Result<UpstreamReply, Error> {
        Ok(UpstreamReply {
            status,
            body: body.to_string(),
        })
    }

    fn ok(views: u64) -> Result<UpstreamReply, Error> {
        reply(
            StatusCode::OK,
            &format!(
                r#"{{"items":[{{"project":"en.wikipedia","article":"Go","granularity":"monthly","views":{}}}]}}"#,
                views
            ),
        )
    }

    fn fetcher(transport: ScriptedTransport) -> PageviewFetcher<ScriptedTransport> {
        PageviewFetcher::new(transport, &FetcherSettings::default()).unwrap()
    }

    fn query() -> ArticleViewQuery {
        ArticleViewQuery::new("Go_(programming_language)", 2023, 4).unwrap()
    }

    fn calls(fetcher: &PageviewFetcher<ScriptedTransport>) -> Vec<(Url, Instant)> {
        fetcher.transport.requested.lock().unwrap().clone()
    }

    #[test]
    fn backoff_doubles_from_second_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::ZERO);
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn parse_uses_first_item_and_rejects_empty() {
        assert_eq!(
            parse_views(r#"{"items":[{"views":7},{"views":9}]}"#).unwrap(),
            7
        );
        assert!(matches!(
            parse_views(r#"{"items":[]}"#),
            Err(AttemptError::NoItems)
        ));
        assert!(matches!(
            parse_views("<html>oops</html>"),
            Err(AttemptError::Parse(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_makes_one_call() {
        let fetcher = fetcher(ScriptedTransport::new([ok(123456)]));

        let views = fetcher.fetch(&query(), &CancellationToken::new()).await;

        assert_eq!(views, Ok(123456));
        let calls = calls(&fetcher);
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].0.as_str(),
            "https://wikimedia.org/api/rest_v1/metrics/pageviews/per-article/en.wikipedia/all-access/all-agents/Go_(programming_language)/monthly/20230401/20230430"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_on_third_attempt_after_backoff() {
        let fetcher = fetcher(ScriptedTransport::new([
            reply(StatusCode::SERVICE_UNAVAILABLE, "try later"),
            Err(Error::msg("connection reset")),
            ok(42),
        ]));

        let views = fetcher.fetch(&query(), &CancellationToken::new()).await;

        assert_eq!(views, Ok(42));
        let calls = calls(&fetcher);
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].1 - calls[0].1, Duration::from_millis(200));
        assert_eq!(calls[2].1 - calls[1].1, Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_three_attempts() {
        let fetcher = fetcher(ScriptedTransport::new([
            reply(StatusCode::NOT_FOUND, r#"{"title":"Not found."}"#),
            reply(StatusCode::OK, "not json"),
            reply(StatusCode::OK, r#"{"items":[]}"#),
            ok(1),
        ]));

        let views = fetcher.fetch(&query(), &CancellationToken::new()).await;

        assert_eq!(views, Err(FetchError::ExhaustedRetries { attempts: 3 }));
        assert_eq!(calls(&fetcher).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn honours_configured_attempts() {
        let settings = FetcherSettings {
            retry: RetryPolicy {
                max_attempts: 5,
                backoff_base: Duration::from_millis(10),
            },
            ..FetcherSettings::default()
        };
        let fetcher = PageviewFetcher::new(ScriptedTransport::default(), &settings).unwrap();

        let views = fetcher.fetch(&query(), &CancellationToken::new()).await;

        assert_eq!(views, Err(FetchError::ExhaustedRetries { attempts: 5 }));
        assert_eq!(calls(&fetcher).len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn unbuildable_url_is_retried_without_transport_calls() {
        let settings = FetcherSettings {
            base_url: "data:text/plain,pageviews".to_string(),
            ..FetcherSettings::default()
        };
        let fetcher = PageviewFetcher::new(ScriptedTransport::new([ok(1)]), &settings).unwrap();

        let views = fetcher.fetch(&query(), &CancellationToken::new()).await;

        assert_eq!(views, Err(FetchError::ExhaustedRetries { attempts: 3 }));
        assert!(calls(&fetcher).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn article_is_encoded_as_one_path_segment() {
        let fetcher = fetcher(ScriptedTransport::new([ok(5)]));
        let query = ArticleViewQuery::new("AC/DC discography", 2024, 2).unwrap();

        fetcher.fetch(&query, &CancellationToken::new()).await.unwrap();

        assert_eq!(
            calls(&fetcher)[0].0.path(),
            "/api/rest_v1/metrics/pageviews/per-article/en.wikipedia/all-access/all-agents/AC%2FDC%20discography/monthly/20240201/20240229"
        );
    }

    #[tokio::test]
    async fn consecutive_fetches_wait_for_the_rate_limiter() {
        let fetcher = fetcher(ScriptedTransport::new([ok(1), ok(2)]));
        let cancel = CancellationToken::new();

        assert_eq!(fetcher.fetch(&query(), &cancel).await, Ok(1));
        assert_eq!(fetcher.fetch(&query(), &cancel).await, Ok(2));

        let calls = calls(&fetcher);
        assert_eq!(calls.len(), 2);
        let gap = calls[1].1 - calls[0].1;
        assert!(gap >= Duration::from_millis(900), "{:?}", gap);
    }

    #[tokio::test]
    async fn cancelled_while_waiting_for_admission_makes_no_second_call() {
        let fetcher = fetcher(ScriptedTransport::new([ok(1), ok(2)]));
        fetcher.fetch(&query(), &CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        assert_eq!(fetcher.fetch(&query(), &cancel).await, Err(FetchError::Cancelled));
        assert_eq!(calls(&fetcher).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_admission_makes_no_calls() {
        let fetcher = fetcher(ScriptedTransport::new([ok(1)]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let views = fetcher.fetch(&query(), &cancel).await;

        assert_eq!(views, Err(FetchError::Cancelled));
        assert!(calls(&fetcher).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let fetcher = fetcher(ScriptedTransport::new([
            reply(StatusCode::BAD_GATEWAY, ""),
            ok(1),
        ]));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let views = fetcher.fetch(&query(), &cancel).await;

        assert_eq!(views, Err(FetchError::Cancelled));
        assert_eq!(calls(&fetcher).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overall_timeout_bounds_the_fetch() {
        let settings = FetcherSettings {
            retry: RetryPolicy {
                max_attempts: 3,
                backoff_base: Duration::from_secs(10),
            },
            request_timeout: Some(Duration::from_secs(5)),
            ..FetcherSettings::default()
        };
        let fetcher = PageviewFetcher::new(
            ScriptedTransport::new([reply(StatusCode::INTERNAL_SERVER_ERROR, "boom")]),
            &settings,
        )
        .unwrap();

        let views = fetcher.fetch(&query(), &CancellationToken::new()).await;

        assert_eq!(views, Err(FetchError::TimedOut(Duration::from_secs(5))));
        assert_eq!(calls(&fetcher).len(), 1);
    }
}

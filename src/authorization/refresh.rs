//! Periodic re-authorization of open links.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use url::Url;

use crate::authorization::{self, TokenCredential};
use crate::connection::SharedConnection;
use crate::constants::AUTHORIZATION_REFRESH_TIMEOUT;
use crate::scope::error::Error;

/// Slack added to the stated token expiry when scheduling the next refresh.
/// The next refresh therefore lands past the stated expiry unless the floor
/// below applies.
const TOKEN_REFRESH_BUFFER: Duration = Duration::minutes(5);

/// Lower bound on the delay between two refresh attempts.
const MINIMUM_REFRESH_INTERVAL: Duration = Duration::minutes(4);

/// Delay until the next refresh for a token expiring at `expires_at_utc`.
pub(crate) fn calculate_refresh_interval(
    expires_at_utc: OffsetDateTime,
    now_utc: OffsetDateTime,
) -> StdDuration {
    let interval = expires_at_utc - now_utc + TOKEN_REFRESH_BUFFER;
    if interval < MINIMUM_REFRESH_INTERVAL {
        MINIMUM_REFRESH_INTERVAL.unsigned_abs()
    } else {
        interval.unsigned_abs()
    }
}

/// The CBS exchange a refresh timer performs when it fires.
#[async_trait]
pub(crate) trait RefreshAuthorization: Send + Sync + 'static {
    /// Re-delivers the link's token, returning the new stated expiry.
    async fn refresh(&self) -> Result<OffsetDateTime, Error>;
}

/// Production refresh path: a fresh token from the scope credential, sent
/// over the connection's CBS link.
#[derive(Debug)]
pub(crate) struct LinkAuthorization {
    pub(crate) connection: SharedConnection,
    pub(crate) credential: Arc<dyn TokenCredential>,
    pub(crate) endpoint: Url,
    pub(crate) audience: String,
    pub(crate) claims: &'static [&'static str],
    pub(crate) scope_cancel: CancellationToken,
}

#[async_trait]
impl RefreshAuthorization for LinkAuthorization {
    async fn refresh(&self) -> Result<OffsetDateTime, Error> {
        let cancel = CancellationToken::new();
        authorization::request_authorization(
            &self.connection,
            &self.credential,
            &self.endpoint,
            &self.audience,
            self.claims,
            AUTHORIZATION_REFRESH_TIMEOUT,
            &cancel,
            &self.scope_cancel,
        )
        .await
    }
}

/// Refresh timer for a single tracked link.
///
/// Created disarmed; [`RefreshTimer::arm`] hands it the spawned task once
/// the link is registered. Disarming and disposal are idempotent, so the
/// timer tolerates racing a link-close handler against its own callback.
#[derive(Debug)]
pub(crate) struct RefreshTimer {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RefreshTimer {
    pub(crate) fn disarmed(cancel: CancellationToken) -> Self {
        Self { cancel, task: None }
    }

    pub(crate) fn arm(&mut self, task: JoinHandle<()>) {
        match self.task {
            Some(_) => task.abort(),
            None => self.task = Some(task),
        }
    }

    /// Stops the timer from firing again; the running callback, if any,
    /// completes on its own.
    pub(crate) fn disarm(&self) {
        self.cancel.cancel();
    }

    /// Disarms the timer and tears its task down.
    pub(crate) fn dispose(&self) {
        self.cancel.cancel();
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

/// Spawns the refresh loop for a tracked link.
///
/// The task sleeps for `initial`, re-authorizes, and reschedules itself from
/// the returned expiry. A failed refresh, or one whose returned expiry is
/// already in the past, leaves the timer idle: the link keeps working until
/// its current token lapses and recovery happens at the next link open.
pub(crate) fn spawn_refresh(
    authorization: Arc<dyn RefreshAuthorization>,
    link_identifier: u64,
    initial: StdDuration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut delay = initial;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            debug!(link_identifier, "refreshing link authorization");
            match authorization.refresh().await {
                Ok(expires_at_utc) => {
                    let now_utc = OffsetDateTime::now_utc();
                    if expires_at_utc < now_utc {
                        debug!(
                            link_identifier,
                            %expires_at_utc,
                            "refreshed token already expired, leaving the refresh timer idle"
                        );
                        debug!(link_identifier, "link authorization refresh complete");
                        return;
                    }
                    delay = calculate_refresh_interval(expires_at_utc, now_utc);
                }
                Err(refresh_error) => {
                    error!(
                        link_identifier,
                        error = %refresh_error,
                        "link authorization refresh failed"
                    );
                    debug!(link_identifier, "link authorization refresh complete");
                    return;
                }
            }
            debug!(link_identifier, "link authorization refresh complete");
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn refresh_interval_extends_past_the_stated_expiry() {
        let now = OffsetDateTime::now_utc();
        let interval = calculate_refresh_interval(now + Duration::minutes(10), now);
        assert_eq!(interval, StdDuration::from_secs(15 * 60));
    }

    #[test]
    fn short_lived_tokens_still_clear_the_floor() {
        let now = OffsetDateTime::now_utc();
        let interval = calculate_refresh_interval(now + Duration::seconds(30), now);
        assert_eq!(interval, StdDuration::from_secs(5 * 60 + 30));
    }

    #[test]
    fn refresh_interval_never_drops_below_the_floor() {
        let now = OffsetDateTime::now_utc();
        let floor = StdDuration::from_secs(4 * 60);
        for minutes in [-120, -10, -5, -2, -1, 0] {
            let interval = calculate_refresh_interval(now + Duration::minutes(minutes), now);
            assert_eq!(interval, floor);
        }
    }

    struct ScriptedAuthorization {
        calls: Arc<AtomicUsize>,
        expiry_offset: Duration,
        fail: bool,
    }

    #[async_trait]
    impl RefreshAuthorization for ScriptedAuthorization {
        async fn refresh(&self) -> Result<OffsetDateTime, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Timeout);
            }
            Ok(OffsetDateTime::now_utc() + self.expiry_offset)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timer_reschedules_while_expiries_stay_in_the_future() {
        let calls = Arc::new(AtomicUsize::new(0));
        let authorization = Arc::new(ScriptedAuthorization {
            calls: Arc::clone(&calls),
            expiry_offset: Duration::minutes(10),
            fail: false,
        });
        let cancel = CancellationToken::new();
        let task = spawn_refresh(authorization, 1, StdDuration::from_secs(1), cancel.clone());

        while calls.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(StdDuration::from_secs(60)).await;
        }
        cancel.cancel();
        task.await.unwrap();
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_goes_idle_after_a_failed_refresh() {
        let calls = Arc::new(AtomicUsize::new(0));
        let authorization = Arc::new(ScriptedAuthorization {
            calls: Arc::clone(&calls),
            expiry_offset: Duration::minutes(10),
            fail: true,
        });
        let cancel = CancellationToken::new();
        let task = spawn_refresh(authorization, 2, StdDuration::from_secs(1), cancel);

        task.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_goes_idle_when_the_refreshed_token_is_already_expired() {
        let calls = Arc::new(AtomicUsize::new(0));
        let authorization = Arc::new(ScriptedAuthorization {
            calls: Arc::clone(&calls),
            expiry_offset: Duration::minutes(-1),
            fail: false,
        });
        let cancel = CancellationToken::new();
        let task = spawn_refresh(authorization, 3, StdDuration::from_secs(1), cancel);

        task.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disarming_before_the_first_fire_prevents_any_refresh() {
        let calls = Arc::new(AtomicUsize::new(0));
        let authorization = Arc::new(ScriptedAuthorization {
            calls: Arc::clone(&calls),
            expiry_offset: Duration::minutes(10),
            fail: false,
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let task = spawn_refresh(authorization, 4, StdDuration::from_secs(3600), cancel);

        task.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

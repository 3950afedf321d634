//! Quorum lock protocol across independent authorities.
//!
//! A lock is held when a majority of authorities accepted the same fencing
//! token and enough of the TTL is left after subtracting the time the round
//! took plus the clock-drift allowance. Each call is self-contained: the
//! coordinator keeps no state between calls beyond its authority set.

use std::{fmt, sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::{
    authority::{self, Authority},
    budget::TimeBudget,
    config::QuorumConfig,
    error::{AuthorityError, Error, Result},
    models::MAX_TTL_MS,
    token::FencingToken,
};

/// Minimum number of agreeing authorities out of `authorities`.
pub fn quorum_threshold(authorities: usize) -> usize {
    authorities / 2 + 1
}

/// A lock held across a quorum of authorities.
///
/// The token never changes for the lifetime of the handle. The coordinator
/// does not notify expiry: once `valid_until` passes without a successful
/// renewal the caller must assume the lock is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    resource: String,
    token: FencingToken,
    validity: Duration,
    valid_until: Instant,
}

impl LockHandle {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn token(&self) -> &FencingToken {
        &self.token
    }

    /// Validity left at the end of the last successful acquire or renew.
    pub fn validity(&self) -> Duration {
        self.validity
    }

    pub fn valid_until(&self) -> Instant {
        self.valid_until
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.valid_until
    }
}

#[derive(Debug, Clone, Copy)]
enum Primitive<'a> {
    Acquire { token: &'a str, ttl: Duration },
    Extend { token: &'a str, ttl: Duration },
    Release { token: &'a str },
}

impl Primitive<'_> {
    fn name(&self) -> &'static str {
        match self {
            Primitive::Acquire { .. } => "acquire",
            Primitive::Extend { .. } => "extend",
            Primitive::Release { .. } => "release",
        }
    }

    async fn invoke(self, authority: &dyn Authority, key: &str) -> std::result::Result<bool, AuthorityError> {
        match self {
            Primitive::Acquire { token, ttl } => authority.try_acquire(key, token, ttl).await,
            Primitive::Extend { token, ttl } => authority.try_extend(key, token, ttl).await,
            Primitive::Release { token } => authority.release(key, token).await,
        }
    }
}

/// Run `primitive` on every authority concurrently and count the grants.
///
/// Every call is driven to completion or to `timeout` before this returns;
/// errors and timeouts count as denials.
async fn fan_out(authorities: &[Arc<dyn Authority>], key: &str, primitive: Primitive<'_>, timeout: Duration) -> usize {
    let calls = authorities.iter().map(|authority| async move {
        match time::timeout(timeout, primitive.invoke(authority.as_ref(), key)).await {
            Ok(Ok(granted)) => granted,
            Ok(Err(e)) => {
                warn!("{} {} on {} failed: {}", primitive.name(), key, authority.endpoint(), e);
                false
            }
            Err(_) => {
                warn!("{} {} on {} timed out after {:?}", primitive.name(), key, authority.endpoint(), timeout);
                false
            }
        }
    });

    join_all(calls).await.into_iter().filter(|granted| *granted).count()
}

/// Outcome of one fan-out round.
struct Round {
    granted: usize,
    elapsed: Duration,
    finished: Instant,
}

enum RoundFailure {
    QuorumNotReached { granted: usize, quorum: usize },
    BudgetExhausted { remaining_ms: i64 },
}

impl fmt::Display for RoundFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundFailure::QuorumNotReached { granted, quorum } => {
                write!(f, "quorum not reached ({}/{})", granted, quorum)
            }
            RoundFailure::BudgetExhausted { remaining_ms } => {
                write!(f, "time budget exhausted ({}ms left)", remaining_ms)
            }
        }
    }
}

/// Releases a round's token if the acquire future is dropped mid-round.
struct PendingRelease<'a> {
    coordinator: &'a QuorumCoordinator,
    resource: &'a str,
    token: &'a FencingToken,
    armed: bool,
}

impl<'a> PendingRelease<'a> {
    fn arm(coordinator: &'a QuorumCoordinator, resource: &'a str, token: &'a FencingToken) -> Self {
        Self {
            coordinator,
            resource,
            token,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingRelease<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Acquire of {} abandoned outside a runtime; keys will expire by TTL", self.resource);
            return;
        };

        warn!("Acquire of {} abandoned mid-round, releasing its token", self.resource);
        let authorities = self.coordinator.authorities.clone();
        let resource = self.resource.to_string();
        let token = self.token.clone();
        let timeout = self.coordinator.config.command_timeout;
        runtime.spawn(async move {
            fan_out(&authorities, &resource, Primitive::Release { token: token.as_str() }, timeout).await;
        });
    }
}

/// Acquires, renews and releases locks on a fixed, ordered authority set.
pub struct QuorumCoordinator {
    config: QuorumConfig,
    budget: TimeBudget,
    authorities: Vec<Arc<dyn Authority>>,
}

impl QuorumCoordinator {
    pub fn new(config: QuorumConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            budget: TimeBudget::new(config.drift_factor, config.fixed_slack),
            config,
            authorities: Vec::new(),
        })
    }

    pub fn with_authorities<I>(config: QuorumConfig, authorities: I) -> Result<Self>
    where
        I: IntoIterator<Item = Arc<dyn Authority>>,
    {
        let mut coordinator = Self::new(config)?;
        for authority in authorities {
            coordinator.add_authority(authority)?;
        }
        Ok(coordinator)
    }

    /// Connect to every endpoint with [`authority::connect`].
    pub fn from_endpoints<S: AsRef<str>>(config: QuorumConfig, endpoints: &[S]) -> Result<Self> {
        let mut coordinator = Self::new(config)?;
        for endpoint in endpoints {
            let authority = authority::connect(endpoint.as_ref(), coordinator.config.command_timeout)?;
            coordinator.add_authority(authority)?;
        }
        Ok(coordinator)
    }

    /// Append an authority. Endpoints must be unique.
    pub fn add_authority(&mut self, authority: Arc<dyn Authority>) -> Result<()> {
        if self.authorities.iter().any(|existing| existing.endpoint() == authority.endpoint()) {
            return Err(Error::DuplicateAuthority {
                endpoint: authority.endpoint().to_string(),
            });
        }
        debug!("Added authority {}", authority.endpoint());
        self.authorities.push(authority);
        Ok(())
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &str> {
        self.authorities.iter().map(|authority| authority.endpoint())
    }

    pub fn len(&self) -> usize {
        self.authorities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.authorities.is_empty()
    }

    pub fn quorum(&self) -> usize {
        quorum_threshold(self.authorities.len())
    }

    pub fn config(&self) -> &QuorumConfig {
        &self.config
    }

    /// Acquire `resource` for `ttl`.
    ///
    /// Each attempt mints a new token. A failed attempt releases that token
    /// on every authority before backing off.
    pub async fn acquire(&self, resource: &str, ttl: Duration) -> Result<LockHandle> {
        self.check_call(ttl)?;
        let mut schedule = self.config.retry.schedule();

        while let Some(attempt) = schedule.next_attempt() {
            let token = FencingToken::generate();
            let cleanup = PendingRelease::arm(self, resource, &token);

            let round = self.round(resource, Primitive::Acquire { token: token.as_str(), ttl }).await;
            match self.evaluate(&round, ttl) {
                Ok(validity) => {
                    cleanup.disarm();
                    info!(
                        "Lock acquired: {} on {}/{} authorities, valid for {}ms (attempt {})",
                        resource,
                        round.granted,
                        self.len(),
                        validity.as_millis(),
                        attempt
                    );
                    return Ok(LockHandle {
                        resource: resource.to_string(),
                        token,
                        validity,
                        valid_until: round.finished + validity,
                    });
                }
                Err(failure) => {
                    debug!("Acquire attempt {} for {} failed: {}", attempt, resource, failure);
                    self.release_all(resource, &token).await;
                    cleanup.disarm();
                }
            }

            if let Some(delay) = schedule.backoff() {
                debug!("Retrying acquire of {} in {:?}", resource, delay);
                time::sleep(delay).await;
            }
        }

        warn!("Failed to acquire {} after {} attempts", resource, schedule.attempts());
        Err(Error::AcquisitionFailed {
            resource: resource.to_string(),
            attempts: schedule.attempts(),
        })
    }

    /// Extend a held lock to `ttl` using its existing token.
    ///
    /// Failed rounds are retried without releasing in between, so a round
    /// that missed the quorum does not tear down the keys the next round
    /// tries to extend. Only after the last failed round is the token
    /// released everywhere; the lock must then be considered lost.
    pub async fn renew(&self, handle: &mut LockHandle, ttl: Duration) -> Result<()> {
        self.check_call(ttl)?;
        let mut schedule = self.config.retry.schedule();

        while let Some(attempt) = schedule.next_attempt() {
            let round = self
                .round(&handle.resource, Primitive::Extend { token: handle.token.as_str(), ttl })
                .await;
            match self.evaluate(&round, ttl) {
                Ok(validity) => {
                    handle.validity = validity;
                    handle.valid_until = round.finished + validity;
                    info!(
                        "Lock renewed: {} on {}/{} authorities, valid for {}ms",
                        handle.resource,
                        round.granted,
                        self.len(),
                        validity.as_millis()
                    );
                    return Ok(());
                }
                Err(failure) => {
                    debug!("Renew attempt {} for {} failed: {}", attempt, handle.resource, failure);
                }
            }

            if let Some(delay) = schedule.backoff() {
                time::sleep(delay).await;
            }
        }

        warn!(
            "Failed to renew {} after {} attempts, releasing it",
            handle.resource,
            schedule.attempts()
        );
        self.release_all(&handle.resource, &handle.token).await;
        Err(Error::RenewalFailed {
            resource: handle.resource.clone(),
            attempts: schedule.attempts(),
        })
    }

    /// Release a lock on every authority. Never fails: authorities that miss
    /// the release expire the key on their own.
    pub async fn release(&self, handle: &LockHandle) {
        let released = self.release_all(&handle.resource, &handle.token).await;
        info!("Lock released: {} ({}/{} authorities confirmed)", handle.resource, released, self.len());
    }

    fn check_call(&self, ttl: Duration) -> Result<()> {
        if self.authorities.is_empty() {
            return Err(Error::NoAuthorities);
        }
        if ttl.as_millis() == 0 {
            return Err(Error::InvalidTtl {
                reason: "ttl must be at least 1ms".to_string(),
            });
        }
        if ttl.as_millis() > u128::from(MAX_TTL_MS) {
            return Err(Error::InvalidTtl {
                reason: format!("ttl must be at most {}ms", MAX_TTL_MS),
            });
        }
        Ok(())
    }

    async fn round(&self, resource: &str, primitive: Primitive<'_>) -> Round {
        let started = Instant::now();
        let granted = fan_out(&self.authorities, resource, primitive, self.config.command_timeout).await;
        let finished = Instant::now();
        Round {
            granted,
            elapsed: finished - started,
            finished,
        }
    }

    fn evaluate(&self, round: &Round, ttl: Duration) -> std::result::Result<Duration, RoundFailure> {
        let quorum = self.quorum();
        if round.granted < quorum {
            return Err(RoundFailure::QuorumNotReached {
                granted: round.granted,
                quorum,
            });
        }
        self.budget
            .validity(ttl, round.elapsed)
            .ok_or_else(|| RoundFailure::BudgetExhausted {
                remaining_ms: self.budget.remaining_ms(ttl, round.elapsed),
            })
    }

    async fn release_all(&self, resource: &str, token: &FencingToken) -> usize {
        fan_out(
            &self.authorities,
            resource,
            Primitive::Release { token: token.as_str() },
            self.config.command_timeout,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KeyStore;
    use async_trait::async_trait;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    };

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Acquire,
        Extend,
        Release,
    }

    /// KeyStore with injectable latency and outages that records every call.
    struct TestAuthority {
        store: KeyStore,
        latency: Duration,
        down: AtomicBool,
        calls: Mutex<Vec<(Call, Instant)>>,
    }

    impl TestAuthority {
        fn new(name: &str) -> Arc<Self> {
            Self::with_latency(name, Duration::ZERO)
        }

        fn with_latency(name: &str, latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                store: KeyStore::in_memory(format!("memory://{}", name)),
                latency,
                down: AtomicBool::new(false),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().iter().map(|(call, _)| *call).collect()
        }

        fn call_times(&self, kind: Call) -> Vec<Instant> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(call, _)| *call == kind)
                .map(|(_, at)| *at)
                .collect()
        }

        async fn enter(&self, call: Call) -> std::result::Result<(), AuthorityError> {
            self.calls.lock().unwrap().push((call, Instant::now()));
            if !self.latency.is_zero() {
                time::sleep(self.latency).await;
            }
            if self.down.load(Ordering::SeqCst) {
                return Err(AuthorityError::Unavailable {
                    endpoint: self.store.endpoint().to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Authority for TestAuthority {
        fn endpoint(&self) -> &str {
            self.store.endpoint()
        }

        async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> std::result::Result<bool, AuthorityError> {
            self.enter(Call::Acquire).await?;
            Ok(self.store.try_acquire(key, token, ttl))
        }

        async fn try_extend(&self, key: &str, token: &str, ttl: Duration) -> std::result::Result<bool, AuthorityError> {
            self.enter(Call::Extend).await?;
            Ok(self.store.try_extend(key, token, ttl))
        }

        async fn release(&self, key: &str, token: &str) -> std::result::Result<bool, AuthorityError> {
            self.enter(Call::Release).await?;
            Ok(self.store.release(key, token))
        }
    }

    const TTL: Duration = Duration::from_millis(10_000);

    fn authorities(count: usize) -> Vec<Arc<TestAuthority>> {
        (0..count).map(|i| TestAuthority::new(&format!("node-{}", i))).collect()
    }

    fn coordinator(authorities: &[Arc<TestAuthority>], retry_count: u32) -> QuorumCoordinator {
        let config = QuorumConfig::default().with_retry(retry_count, Duration::from_millis(200));
        QuorumCoordinator::with_authorities(
            config,
            authorities.iter().map(|a| a.clone() as Arc<dyn Authority>),
        )
        .unwrap()
    }

    #[test]
    fn test_quorum_threshold() {
        assert_eq!(quorum_threshold(1), 1);
        assert_eq!(quorum_threshold(2), 2);
        assert_eq!(quorum_threshold(3), 2);
        assert_eq!(quorum_threshold(4), 3);
        assert_eq!(quorum_threshold(5), 3);
        for n in 1..=1_000 {
            assert_eq!(quorum_threshold(n), n / 2 + 1);
            assert!(quorum_threshold(n) * 2 > n);
        }
    }

    #[test]
    fn test_quorum_tracks_authority_set() {
        let nodes = authorities(4);
        let mut coordinator = QuorumCoordinator::new(QuorumConfig::default()).unwrap();
        assert!(coordinator.is_empty());

        for (i, node) in nodes.iter().enumerate() {
            coordinator.add_authority(node.clone()).unwrap();
            assert_eq!(coordinator.len(), i + 1);
            assert_eq!(coordinator.quorum(), (i + 1) / 2 + 1);
        }

        let endpoints: Vec<&str> = coordinator.endpoints().collect();
        assert_eq!(endpoints, vec!["memory://node-0", "memory://node-1", "memory://node-2", "memory://node-3"]);
    }

    #[test]
    fn test_duplicate_authority_rejected() {
        let mut coordinator = QuorumCoordinator::new(QuorumConfig::default()).unwrap();
        coordinator.add_authority(TestAuthority::new("a")).unwrap();

        let result = coordinator.add_authority(TestAuthority::new("a"));
        assert!(matches!(result, Err(Error::DuplicateAuthority { ref endpoint }) if endpoint == "memory://a"));
        assert_eq!(coordinator.len(), 1);

        let result = QuorumCoordinator::from_endpoints(QuorumConfig::default(), &["memory://x", "memory://y", "memory://x"]);
        assert!(matches!(result, Err(Error::DuplicateAuthority { .. })));
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let config = QuorumConfig::default().with_drift(2.0, Duration::ZERO);
        assert!(matches!(QuorumCoordinator::new(config), Err(Error::InvalidConfig { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_calls_fail_before_network() {
        let start = Instant::now();
        let empty = QuorumCoordinator::new(QuorumConfig::default()).unwrap();
        assert!(matches!(empty.acquire("r", TTL).await, Err(Error::NoAuthorities)));

        let nodes = authorities(3);
        let coordinator = coordinator(&nodes, 3);
        assert!(matches!(coordinator.acquire("r", Duration::ZERO).await, Err(Error::InvalidTtl { .. })));
        assert!(matches!(
            coordinator.acquire("r", Duration::from_micros(500)).await,
            Err(Error::InvalidTtl { .. })
        ));

        let too_long = Duration::from_millis(MAX_TTL_MS + 1);
        assert!(matches!(coordinator.acquire("r", too_long).await, Err(Error::InvalidTtl { .. })));

        // never retried, never slept, never reached an authority
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(nodes.iter().all(|node| node.calls().is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_upper_bound_checked_before_network() {
        let nodes = authorities(3);
        let coordinator = coordinator(&nodes, 3);
        let start = Instant::now();

        let mut handle = coordinator.acquire("orders", Duration::from_millis(MAX_TTL_MS)).await.unwrap();
        let result = coordinator.renew(&mut handle, Duration::from_millis(MAX_TTL_MS + 1)).await;
        assert!(matches!(result, Err(Error::InvalidTtl { .. })));

        assert_eq!(start.elapsed(), Duration::ZERO);
        for node in &nodes {
            assert_eq!(node.calls(), vec![Call::Acquire]);
            assert_eq!(node.store.status("orders").unwrap().token, handle.token().as_str());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_reference_validity() {
        let nodes: Vec<_> = (0..3)
            .map(|i| TestAuthority::with_latency(&format!("n{}", i), Duration::from_millis(10)))
            .collect();
        let coordinator = coordinator(&nodes, 3);

        let handle = coordinator.acquire("orders", TTL).await.unwrap();

        // drift = 10000 * 0.01 + 2 = 102; validity = 10000 - 10 - 102
        assert_eq!(handle.validity(), Duration::from_millis(9_888));
        assert_eq!(handle.resource(), "orders");
        assert!(!handle.is_expired());
        for node in &nodes {
            assert_eq!(node.store.status("orders").unwrap().token, handle.token().as_str());
            assert_eq!(node.calls(), vec![Call::Acquire]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_minority_fails_and_releases_everywhere_before_sleeping() {
        let nodes = authorities(3);
        nodes[0].store.try_acquire("orders", "RIVAL", Duration::from_secs(60));
        nodes[1].store.try_acquire("orders", "RIVAL", Duration::from_secs(60));
        let coordinator = coordinator(&nodes, 1);

        let result = coordinator.acquire("orders", TTL).await;
        assert!(matches!(result, Err(Error::AcquisitionFailed { ref resource, attempts: 2 }) if resource == "orders"));

        for node in &nodes {
            // one release per round, issued right after that round's acquire
            assert_eq!(node.calls(), vec![Call::Acquire, Call::Release, Call::Acquire, Call::Release]);

            let acquires = node.call_times(Call::Acquire);
            let releases = node.call_times(Call::Release);
            assert_eq!(releases[0], acquires[0]);
            let backoff = acquires[1] - releases[0];
            assert!(backoff >= Duration::from_millis(100) && backoff <= Duration::from_millis(200));
        }

        // the rival keeps its keys; ours was cleaned up
        assert_eq!(nodes[0].store.status("orders").unwrap().token, "RIVAL");
        assert_eq!(nodes[1].store.status("orders").unwrap().token, "RIVAL");
        assert!(nodes[2].store.status("orders").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_success_releases_each_authority_once() {
        let nodes = authorities(3);
        nodes[1].set_down(true);
        nodes[2].set_down(true);
        let coordinator = coordinator(&nodes, 0);
        let start = Instant::now();

        assert!(coordinator.acquire("orders", TTL).await.is_err());

        for node in &nodes {
            assert_eq!(node.call_times(Call::Release).len(), 1);
        }
        assert!(nodes[0].store.status("orders").is_none());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_count_bounds_rounds_and_sleeps() {
        let nodes = authorities(3);
        for node in &nodes {
            node.set_down(true);
        }
        let coordinator = coordinator(&nodes, 3);
        let start = Instant::now();

        let result = coordinator.acquire("orders", TTL).await;
        assert!(matches!(result, Err(Error::AcquisitionFailed { attempts: 4, .. })));
        let total = start.elapsed();

        for node in &nodes {
            let acquires = node.call_times(Call::Acquire);
            assert_eq!(acquires.len(), 4);
            assert_eq!(node.call_times(Call::Release).len(), 4);

            // exactly three randomized sleeps between the four rounds
            for pair in acquires.windows(2) {
                let gap = pair[1] - pair[0];
                assert!(gap >= Duration::from_millis(100), "gap {:?} too short", gap);
                assert!(gap <= Duration::from_millis(200), "gap {:?} too long", gap);
            }

            // and none after the last round
            assert_eq!(acquires[3] - start, total);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_authority_down_still_acquires() {
        let nodes = authorities(3);
        nodes[2].set_down(true);
        let coordinator = coordinator(&nodes, 0);

        let handle = coordinator.acquire("orders", TTL).await.unwrap();
        assert_eq!(handle.validity(), Duration::from_millis(9_898));
        assert!(nodes[0].store.status("orders").is_some());
        assert!(nodes[1].store.status("orders").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_straggler_bounded_by_command_timeout() {
        let nodes = vec![
            TestAuthority::new("fast-0"),
            TestAuthority::new("fast-1"),
            TestAuthority::with_latency("slow", Duration::from_secs(5)),
        ];
        let coordinator = coordinator(&nodes, 0);

        let handle = coordinator.acquire("orders", TTL).await.unwrap();

        // round took the full 1500ms command timeout
        assert_eq!(handle.validity(), Duration::from_millis(10_000 - 1_500 - 102));
        assert!(nodes[2].store.status("orders").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_is_a_failure() {
        let nodes: Vec<_> = (0..3)
            .map(|i| TestAuthority::with_latency(&format!("n{}", i), Duration::from_millis(200)))
            .collect();
        let coordinator = coordinator(&nodes, 0);

        // every authority grants, but 200 - 200 - 4 <= 0
        let result = coordinator.acquire("orders", Duration::from_millis(200)).await;
        assert!(matches!(result, Err(Error::AcquisitionFailed { attempts: 1, .. })));
        for node in &nodes {
            assert!(node.store.status("orders").is_none());
            assert_eq!(node.calls(), vec![Call::Acquire, Call::Release]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_competing_coordinators() {
        let nodes = authorities(5);
        let first = coordinator(&nodes, 0);
        let second = coordinator(&nodes, 0);

        let handle = first.acquire("orders", TTL).await.unwrap();
        assert!(matches!(second.acquire("orders", TTL).await, Err(Error::AcquisitionFailed { .. })));

        // the loser's cleanup must not touch the winner's keys
        for node in &nodes {
            assert_eq!(node.store.status("orders").unwrap().token, handle.token().as_str());
        }

        first.release(&handle).await;
        let taken = second.acquire("orders", TTL).await.unwrap();
        assert_ne!(taken.token(), handle.token());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_is_idempotent() {
        let nodes = authorities(3);
        let coordinator = coordinator(&nodes, 0);

        let handle = coordinator.acquire("orders", TTL).await.unwrap();
        coordinator.release(&handle).await;
        coordinator.release(&handle).await;
        assert!(nodes.iter().all(|node| node.store.status("orders").is_none()));

        // a token nobody recognizes leaves the real holder alone
        let held = coordinator.acquire("orders", TTL).await.unwrap();
        let stranger = LockHandle {
            token: FencingToken::generate(),
            ..held.clone()
        };
        coordinator.release(&stranger).await;
        assert!(nodes.iter().all(|node| node.store.status("orders").is_some()));

        // release still completes with every authority down
        for node in &nodes {
            node.set_down(true);
        }
        coordinator.release(&held).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_preserves_token() {
        let nodes = authorities(3);
        let coordinator = coordinator(&nodes, 0);

        let mut handle = coordinator.acquire("orders", TTL).await.unwrap();
        let original = handle.token().clone();
        assert_eq!(handle.validity(), Duration::from_millis(9_898));

        time::sleep(Duration::from_secs(5)).await;
        coordinator.renew(&mut handle, Duration::from_millis(20_000)).await.unwrap();

        assert_eq!(handle.token(), &original);
        assert_eq!(handle.validity(), Duration::from_millis(20_000 - 202));
        for node in &nodes {
            assert_eq!(node.store.status("orders").unwrap().token, original.as_str());
            assert!(node.store.status("orders").unwrap().ttl_remaining() > Duration::from_secs(15));
        }

        coordinator.renew(&mut handle, TTL).await.unwrap();
        assert_eq!(handle.token(), &original);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_renewal_releases_lock() {
        let nodes = authorities(3);
        let coordinator = coordinator(&nodes, 2);

        let mut handle = coordinator.acquire("orders", TTL).await.unwrap();
        let token = handle.token().clone();

        // a rival took over two authorities
        for node in &nodes[..2] {
            assert!(node.store.release("orders", token.as_str()));
            assert!(node.store.try_acquire("orders", "RIVAL", Duration::from_secs(60)));
        }

        let result = coordinator.renew(&mut handle, TTL).await;
        assert!(matches!(result, Err(Error::RenewalFailed { attempts: 3, .. })));
        assert_eq!(handle.token(), &token);

        for node in &nodes {
            assert_eq!(node.call_times(Call::Extend).len(), 3);
            assert_eq!(node.call_times(Call::Release).len(), 1);
        }
        assert_eq!(nodes[0].store.status("orders").unwrap().token, "RIVAL");
        assert_eq!(nodes[1].store.status("orders").unwrap().token, "RIVAL");
        assert!(nodes[2].store.status("orders").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_after_expiry_fails() {
        let nodes = authorities(3);
        let coordinator = coordinator(&nodes, 0);

        let mut handle = coordinator.acquire("orders", Duration::from_millis(500)).await.unwrap();
        time::sleep(Duration::from_secs(1)).await;
        assert!(handle.is_expired());

        assert!(matches!(
            coordinator.renew(&mut handle, TTL).await,
            Err(Error::RenewalFailed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_acquire_releases_granted_keys() {
        let nodes = vec![
            TestAuthority::new("fast-0"),
            TestAuthority::new("fast-1"),
            TestAuthority::with_latency("slow", Duration::from_secs(5)),
        ];
        let coordinator = coordinator(&nodes, 0);

        let abandoned = time::timeout(Duration::from_millis(100), coordinator.acquire("orders", TTL)).await;
        assert!(abandoned.is_err());

        time::sleep(Duration::from_millis(10)).await;
        assert!(nodes[0].store.status("orders").is_none());
        assert!(nodes[1].store.status("orders").is_none());
        assert_eq!(nodes[0].call_times(Call::Release).len(), 1);
    }
}

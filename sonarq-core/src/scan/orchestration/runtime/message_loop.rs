use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    task::{JoinError, JoinHandle},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::source::{InboundMessage, MessageSource};
use crate::scan::{
    orchestration::{
        config::MessageLoopConfig,
        orchestrator::ScanRunner,
        outcome::{Disposition, ScanOutcome},
    },
    request::ScanRequest,
};

const MIN_TICK: Duration = Duration::from_millis(10);

/// Pulls scan requests off a [`MessageSource`], runs them, and settles each
/// message according to the configured acknowledgement policy.
///
/// Nothing raised while handling a message escapes the loop. Decode failures,
/// runner panics and settlement errors are logged and turned into an abandon.
///
/// A message stays locked for as long as it is handled; the lock is renewed
/// every `lock_renew_interval_ms`. A request for a project that another run
/// owns is held and retried rather than released straight back to the broker,
/// where it would burn through its delivery count.
pub struct MessageLoop<S: MessageSource + ?Sized> {
    source: Arc<S>,
    runner: Arc<dyn ScanRunner>,
    config: MessageLoopConfig,
    in_flight: Arc<AtomicUsize>,
}

impl<S: MessageSource + ?Sized> Clone for MessageLoop<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            runner: Arc::clone(&self.runner),
            config: self.config.clone(),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<S: MessageSource + ?Sized> fmt::Debug for MessageLoop<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageLoop")
            .field("config", &self.config)
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<S: MessageSource + ?Sized + 'static> MessageLoop<S> {
    pub fn new(source: Arc<S>, runner: Arc<dyn ScanRunner>, config: MessageLoopConfig) -> Self {
        Self {
            source,
            runner,
            config,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Run until `shutdown` fires. Handlers that already hold a message finish
    /// it before this returns.
    pub async fn run(&self, shutdown: CancellationToken) {
        let workers = self.config.concurrency.max(1);
        info!(
            workers,
            ack_policy = ?self.config.ack_policy,
            "message loop starting"
        );

        let heartbeat = self.spawn_heartbeat(shutdown.clone());
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let this = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(
                async move { this.worker(shutdown).await }
                    .instrument(info_span!("message_worker", worker)),
            ));
        }

        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "message worker exited abnormally");
            }
        }
        heartbeat.abort();
        info!("message loop stopped");
    }

    async fn worker(&self, shutdown: CancellationToken) {
        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.source.receive() => received,
            };

            match received {
                Ok(Some(message)) => self.dispatch(message, &shutdown).await,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.idle_poll()) => {}
                    }
                }
                Err(err) => {
                    error!(error = %err, "failed to receive message");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.receive_error_backoff()) => {}
                    }
                }
            }
        }
        debug!("message worker shutting down");
    }

    /// Handle one message on its own task so a panicking run cannot take the
    /// worker down with it.
    async fn dispatch(&self, message: InboundMessage, shutdown: &CancellationToken) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let this = self.clone();
        let owned = message.clone();
        let shutdown = shutdown.clone();
        let mut handler = tokio::spawn(async move { this.handle(owned, shutdown).await });
        let joined = self.renew_until_done(&message, &mut handler).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Err(err) = joined {
            error!(
                message_id = %message.message_id,
                error = %err,
                "message handler panicked; abandoning"
            );
            self.abandon(&message).await;
        }
    }

    async fn renew_until_done<T>(
        &self,
        message: &InboundMessage,
        handler: &mut JoinHandle<T>,
    ) -> Result<T, JoinError> {
        let period = self.config.lock_renew_interval().max(MIN_TICK);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                joined = &mut *handler => return joined,
                _ = ticker.tick() => match self.source.renew(message).await {
                    Ok(()) => debug!(message_id = %message.message_id, "renewed message lock"),
                    Err(err) => warn!(
                        message_id = %message.message_id,
                        error = %err,
                        "failed to renew message lock"
                    ),
                },
            }
        }
    }

    /// Decode, run, and settle one message. Returns the disposition that was
    /// applied.
    pub async fn handle_message(&self, message: InboundMessage) -> Disposition {
        self.handle(message, CancellationToken::new()).await
    }

    async fn handle(&self, message: InboundMessage, shutdown: CancellationToken) -> Disposition {
        let span = info_span!(
            "message",
            message_id = %message.message_id,
            delivery_count = message.delivery_count
        );
        async {
            info!(body = %message.body_text(), "received message");

            let request = match ScanRequest::decode(&message.body) {
                Ok(request) => request,
                Err(err) => {
                    warn!(error = %err, "rejecting scan request");
                    self.abandon(&message).await;
                    return Disposition::Abandon;
                }
            };

            let policy = self.config.ack_policy;
            let mut outcome = self.runner.run_scan(&request).await;
            if matches!(outcome, ScanOutcome::InFlight { .. })
                && outcome.disposition(policy) == Disposition::Abandon
            {
                outcome = self.wait_for_project(&request, outcome, &shutdown).await;
            }
            let disposition = outcome.disposition(policy);
            info!(outcome = %outcome, ?disposition, "scan finished");

            self.settle(&message, disposition).await
        }
        .instrument(span)
        .await
    }

    /// Re-run `request` while its project is owned by another run, for at
    /// most `in_flight_max_wait_ms`. Returns the last outcome.
    async fn wait_for_project(
        &self,
        request: &ScanRequest,
        mut outcome: ScanOutcome,
        shutdown: &CancellationToken,
    ) -> ScanOutcome {
        let retry = self.config.in_flight_retry().max(MIN_TICK);
        let deadline = Instant::now() + self.config.in_flight_max_wait();

        while matches!(outcome, ScanOutcome::InFlight { .. }) && Instant::now() + retry <= deadline
        {
            debug!(retry_ms = retry.as_millis() as u64, "project busy; holding message");
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(retry) => {}
            }
            outcome = self.runner.run_scan(request).await;
        }
        outcome
    }

    async fn settle(&self, message: &InboundMessage, disposition: Disposition) -> Disposition {
        match disposition {
            Disposition::Complete => match self.source.complete(message).await {
                Ok(()) => Disposition::Complete,
                Err(err) => {
                    error!(error = %err, "failed to complete message; abandoning");
                    self.abandon(message).await;
                    Disposition::Abandon
                }
            },
            Disposition::Abandon => {
                self.abandon(message).await;
                Disposition::Abandon
            }
        }
    }

    async fn abandon(&self, message: &InboundMessage) {
        if let Err(err) = self.source.abandon(message).await {
            error!(
                message_id = %message.message_id,
                error = %err,
                "failed to abandon message"
            );
        }
    }

    fn spawn_heartbeat(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = self.config.idle_log_interval().max(MIN_TICK);
        let in_flight = Arc::clone(&self.in_flight);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if in_flight.load(Ordering::Relaxed) == 0 {
                            info!("waiting for messages");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, sync::Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        error::{Result, ScanError},
        scan::orchestration::{config::AckPolicy, outcome::ScanOutcome},
        scan::orchestration::runtime::source::InMemoryMessageSource,
    };

    /// Plays `outcomes` in order, then repeats the last one.
    struct ScriptedRunner {
        outcomes: Mutex<VecDeque<ScanOutcome>>,
        delay: Duration,
        seen: Mutex<Vec<ScanRequest>>,
    }

    impl ScriptedRunner {
        fn new(outcome: ScanOutcome) -> Arc<Self> {
            Self::sequence(vec![outcome], Duration::ZERO)
        }

        fn sequence(outcomes: Vec<ScanOutcome>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                delay,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().expect("seen").len()
        }
    }

    #[async_trait]
    impl ScanRunner for ScriptedRunner {
        async fn run_scan(&self, request: &ScanRequest) -> ScanOutcome {
            self.seen.lock().expect("seen").push(request.clone());
            let outcome = {
                let mut outcomes = self.outcomes.lock().expect("outcomes");
                if outcomes.len() > 1 {
                    outcomes.pop_front()
                } else {
                    outcomes.front().cloned()
                }
            }
            .expect("scripted outcome");
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            outcome
        }
    }

    /// Source whose completions always fail.
    #[derive(Default)]
    struct FlakyCompleteSource {
        inner: InMemoryMessageSource,
    }

    #[async_trait]
    impl MessageSource for FlakyCompleteSource {
        async fn receive(&self) -> Result<Option<InboundMessage>> {
            self.inner.receive().await
        }

        async fn complete(&self, _message: &InboundMessage) -> Result<()> {
            Err(ScanError::Transport("connection reset".into()))
        }

        async fn abandon(&self, message: &InboundMessage) -> Result<()> {
            self.inner.abandon(message).await
        }

        async fn renew(&self, message: &InboundMessage) -> Result<()> {
            self.inner.renew(message).await
        }
    }

    /// In-memory source that counts lock renewals.
    #[derive(Default)]
    struct RenewCountingSource {
        inner: InMemoryMessageSource,
        renewals: AtomicUsize,
    }

    #[async_trait]
    impl MessageSource for RenewCountingSource {
        async fn receive(&self) -> Result<Option<InboundMessage>> {
            self.inner.receive().await
        }

        async fn complete(&self, message: &InboundMessage) -> Result<()> {
            self.inner.complete(message).await
        }

        async fn abandon(&self, message: &InboundMessage) -> Result<()> {
            self.inner.abandon(message).await
        }

        async fn renew(&self, message: &InboundMessage) -> Result<()> {
            self.inner.renew(message).await?;
            self.renewals.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    const VALID: &str = r#"{"scanid":"proj_1.zip","userid":"u1","projectlanguage":"c#"}"#;

    fn config(policy: AckPolicy) -> MessageLoopConfig {
        MessageLoopConfig {
            ack_policy: policy,
            idle_poll_ms: 5,
            receive_error_backoff_ms: 5,
            ..MessageLoopConfig::default()
        }
    }

    async fn deliver<S: MessageSource + ?Sized>(source: &S) -> InboundMessage {
        source
            .receive()
            .await
            .expect("receive")
            .expect("message available")
    }

    #[tokio::test]
    async fn invalid_requests_are_abandoned_without_running() {
        for body in [
            r#"{"scanid":"proj_1.zip","projectlanguage":"c#"}"#,
            r#"{"scanid":"proj_1.zip","userid":"u1","projectlanguage":"python"}"#,
            "not json",
        ] {
            let source = Arc::new(InMemoryMessageSource::default());
            let runner = ScriptedRunner::new(ScanOutcome::Completed);
            let message_loop = MessageLoop::new(
                Arc::clone(&source),
                runner.clone(),
                config(AckPolicy::RetryTransient),
            );

            source.publish(body).await;
            let message = deliver(source.as_ref()).await;
            let disposition = message_loop.handle_message(message).await;

            assert_eq!(disposition, Disposition::Abandon, "body: {body}");
            assert_eq!(runner.calls(), 0);
            assert!(source.completed().await.is_empty());
            assert_eq!(source.ready_count().await, 1);
        }
    }

    #[tokio::test]
    async fn completed_runs_are_acknowledged() {
        let source = Arc::new(InMemoryMessageSource::default());
        let runner = ScriptedRunner::new(ScanOutcome::Completed);
        let message_loop = MessageLoop::new(
            Arc::clone(&source),
            runner.clone(),
            config(AckPolicy::RetryTransient),
        );

        source.publish(VALID).await;
        let message = deliver(source.as_ref()).await;
        assert_eq!(
            message_loop.handle_message(message).await,
            Disposition::Complete
        );
        assert_eq!(runner.calls(), 1);
        assert_eq!(source.completed().await.len(), 1);
    }

    #[tokio::test]
    async fn transient_failures_follow_the_ack_policy() {
        let transient = ScanOutcome::Failed {
            message: "execute step timed out after 10ms".into(),
            retryable: true,
        };

        for (policy, expected) in [
            (AckPolicy::RetryTransient, Disposition::Abandon),
            (AckPolicy::AlwaysComplete, Disposition::Complete),
        ] {
            let source = Arc::new(InMemoryMessageSource::default());
            let message_loop = MessageLoop::new(
                Arc::clone(&source),
                ScriptedRunner::new(transient.clone()),
                config(policy),
            );
            source.publish(VALID).await;
            let message = deliver(source.as_ref()).await;

            assert_eq!(message_loop.handle_message(message).await, expected);
        }
    }

    #[tokio::test]
    async fn failed_completion_falls_back_to_abandon() {
        let source = Arc::new(FlakyCompleteSource::default());
        let message_loop = MessageLoop::new(
            Arc::clone(&source),
            ScriptedRunner::new(ScanOutcome::Completed),
            config(AckPolicy::AlwaysComplete),
        );

        source.inner.publish(VALID).await;
        let message = deliver(source.as_ref()).await;
        assert_eq!(
            message_loop.handle_message(message).await,
            Disposition::Abandon
        );
        assert_eq!(source.inner.ready_count().await, 1);
        assert_eq!(source.inner.locked_count().await, 0);
    }

    fn busy() -> ScanOutcome {
        ScanOutcome::InFlight {
            scan_id: ScanRequest::new("proj_1.zip", "u1").scan_id,
        }
    }

    #[tokio::test]
    async fn busy_project_is_retried_under_the_same_lock() {
        let source = Arc::new(InMemoryMessageSource::default());
        let runner = ScriptedRunner::sequence(
            vec![
                busy(),
                busy(),
                ScanOutcome::AlreadyScanned {
                    scan_id: ScanRequest::new("proj_1.zip", "u1").scan_id,
                },
            ],
            Duration::ZERO,
        );
        let message_loop = MessageLoop::new(
            Arc::clone(&source),
            runner.clone(),
            MessageLoopConfig {
                in_flight_retry_ms: 5,
                ..config(AckPolicy::RetryTransient)
            },
        );

        source.publish(VALID).await;
        let message = deliver(source.as_ref()).await;
        assert_eq!(
            message_loop.handle_message(message).await,
            Disposition::Complete
        );

        assert_eq!(runner.calls(), 3);
        let completed = source.completed().await;
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].delivery_count, 1);
        assert!(source.dead_lettered().await.is_empty());
    }

    #[tokio::test]
    async fn busy_project_is_released_after_the_wait_limit() {
        let source = Arc::new(InMemoryMessageSource::default());
        let runner = ScriptedRunner::new(busy());
        let message_loop = MessageLoop::new(
            Arc::clone(&source),
            runner.clone(),
            MessageLoopConfig {
                in_flight_retry_ms: 10,
                in_flight_max_wait_ms: 35,
                ..config(AckPolicy::RetryTransient)
            },
        );

        source.publish(VALID).await;
        let message = deliver(source.as_ref()).await;
        assert_eq!(
            message_loop.handle_message(message).await,
            Disposition::Abandon
        );
        assert!(runner.calls() >= 2, "calls: {}", runner.calls());
        assert_eq!(source.ready_count().await, 1);
    }

    #[tokio::test]
    async fn busy_project_is_released_on_shutdown() {
        let source = Arc::new(InMemoryMessageSource::default());
        let runner = ScriptedRunner::new(busy());
        let message_loop = MessageLoop::new(
            Arc::clone(&source),
            runner.clone(),
            config(AckPolicy::RetryTransient),
        );
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        source.publish(VALID).await;
        let message = deliver(source.as_ref()).await;
        let disposition = tokio::time::timeout(
            Duration::from_secs(1),
            message_loop.handle(message, shutdown),
        )
        .await
        .expect("no wait once stopping");

        assert_eq!(disposition, Disposition::Abandon);
        assert_eq!(runner.calls(), 1);
    }

    #[tokio::test]
    async fn busy_project_is_dropped_under_always_complete() {
        let source = Arc::new(InMemoryMessageSource::default());
        let runner = ScriptedRunner::new(busy());
        let message_loop = MessageLoop::new(
            Arc::clone(&source),
            runner.clone(),
            config(AckPolicy::AlwaysComplete),
        );

        source.publish(VALID).await;
        let message = deliver(source.as_ref()).await;
        assert_eq!(
            message_loop.handle_message(message).await,
            Disposition::Complete
        );
        assert_eq!(runner.calls(), 1);
    }

    #[tokio::test]
    async fn lock_is_renewed_while_a_scan_runs() {
        let source = Arc::new(RenewCountingSource::default());
        let message_loop = MessageLoop::new(
            Arc::clone(&source),
            ScriptedRunner::sequence(vec![ScanOutcome::Completed], Duration::from_millis(120)),
            MessageLoopConfig {
                lock_renew_interval_ms: 15,
                ..config(AckPolicy::RetryTransient)
            },
        );

        source.inner.publish(VALID).await;
        let message = deliver(source.as_ref()).await;
        message_loop
            .dispatch(message, &CancellationToken::new())
            .await;

        assert!(
            source.renewals.load(Ordering::SeqCst) >= 2,
            "renewals: {}",
            source.renewals.load(Ordering::SeqCst)
        );
        assert_eq!(source.inner.completed().await.len(), 1);
        assert_eq!(source.inner.locked_count().await, 0);
    }

    #[tokio::test]
    async fn run_drains_queue_and_stops_on_cancel() {
        let source = Arc::new(InMemoryMessageSource::default());
        let runner = ScriptedRunner::new(ScanOutcome::Completed);
        let message_loop = MessageLoop::new(
            Arc::clone(&source),
            runner.clone(),
            MessageLoopConfig {
                concurrency: 2,
                ..config(AckPolicy::RetryTransient)
            },
        );

        for n in 0..4 {
            source
                .publish(format!(
                    r#"{{"scanid":"proj_{n}.zip","userid":"u1","projectlanguage":"c#"}}"#
                ))
                .await;
        }

        let shutdown = CancellationToken::new();
        let running = tokio::spawn({
            let message_loop = message_loop.clone();
            let shutdown = shutdown.clone();
            async move { message_loop.run(shutdown).await }
        });

        for _ in 0..200 {
            if source.completed().await.len() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("loop stops after cancel")
            .expect("loop task");

        assert_eq!(source.completed().await.len(), 4);
        assert_eq!(runner.calls(), 4);
        assert_eq!(source.locked_count().await, 0);
    }
}

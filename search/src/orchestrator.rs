use crate::config::SearchConfig;
use crate::error::{SearchError, StrategyError};
use crate::query::SearchQuery;
use crate::strategy::{SearchOptions, SearchSizing, SearchStrategy};
use codescout_protocol::{ProgressCallback, SearchProgress, StrategyId, StrategyResult};
use futures::future::BoxFuture;
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How one strategy attempt ended, when it did not win
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The strategy reported "not applicable right now"
    Declined { id: StrategyId },
    /// The strategy failed with a real error
    Failed { id: StrategyId, message: String },
    /// The strategy was cancelled before it could answer
    Cancelled { id: StrategyId },
}

impl AttemptOutcome {
    fn describe(&self) -> String {
        match self {
            AttemptOutcome::Declined { id } => format!("{}: not applicable", id.as_str()),
            AttemptOutcome::Failed { id, message } => format!("{}: {message}", id.as_str()),
            AttemptOutcome::Cancelled { id } => format!("{}: cancelled", id.as_str()),
        }
    }
}

/// What a race (or a single attempt wrapped as one) produced
#[derive(Debug, Default)]
struct RaceReport {
    winner: Option<(StrategyId, StrategyResult)>,
    /// Attempts that did not produce the winner
    attempts: Vec<AttemptOutcome>,
}

/// Wall-clock spent per stage of a request, for response stats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageTimings {
    pub full_workspace_ms: Option<u64>,
    pub remote_ms: Option<u64>,
    pub local_ms: Option<u64>,
}

/// Lock-free sink the racing futures write their durations into.
///
/// Zero means "never finished"; a strategy cancelled mid-flight leaves no
/// timing behind.
#[derive(Default)]
struct TimingSink {
    full_workspace_ms: AtomicU64,
    remote_ms: AtomicU64,
    local_ms: AtomicU64,
}

impl TimingSink {
    fn record(&self, id: StrategyId, elapsed: Duration) {
        let millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX).max(1);
        let slot = match id {
            StrategyId::FullWorkspace => &self.full_workspace_ms,
            StrategyId::RemoteSearch => &self.remote_ms,
            StrategyId::LocalEmbeddings | StrategyId::LocalLexical => &self.local_ms,
        };
        slot.fetch_max(millis, Ordering::SeqCst);
    }

    fn snapshot(&self) -> StageTimings {
        let get = |slot: &AtomicU64| {
            let value = slot.load(Ordering::SeqCst);
            (value > 0).then_some(value)
        };
        StageTimings {
            full_workspace_ms: get(&self.full_workspace_ms),
            remote_ms: get(&self.remote_ms),
            local_ms: get(&self.local_ms),
        }
    }
}

/// A successfully answered request, before reranking
#[derive(Debug)]
pub struct OrchestratorSuccess {
    /// The strategy whose result was chosen
    pub strategy: StrategyId,

    /// The chosen result
    pub result: StrategyResult,

    /// True when the full-workspace strategy answered; the result then
    /// bypasses reranking entirely
    pub is_full_workspace: bool,

    /// Per-stage wall-clock timings
    pub timings: StageTimings,
}

/// Selects, times out, and falls back between the search strategies.
///
/// The request-level flow is `TryingFullWorkspace -> RacingRemote ->
/// RacingLocalFallback -> Done`. Timeouts never abort the strategy whose
/// timer fired; they only start the next contender, and the slow strategy
/// may still win if it finishes first. Losers are cancelled only once a
/// winner has actually been chosen.
pub struct StrategyOrchestrator {
    full_workspace: Arc<dyn SearchStrategy>,
    remote: Arc<dyn SearchStrategy>,
    embeddings: Arc<dyn SearchStrategy>,
    lexical: Arc<dyn SearchStrategy>,
    config: SearchConfig,
}

impl StrategyOrchestrator {
    /// Create a new orchestrator over the four strategies
    pub fn new(
        full_workspace: Arc<dyn SearchStrategy>,
        remote: Arc<dyn SearchStrategy>,
        embeddings: Arc<dyn SearchStrategy>,
        lexical: Arc<dyn SearchStrategy>,
        config: SearchConfig,
    ) -> Self {
        Self {
            full_workspace,
            remote,
            embeddings,
            lexical,
            config,
        }
    }

    /// Run the full strategy cascade for one request
    pub async fn search(
        &self,
        sizing: &SearchSizing,
        query: &SearchQuery,
        options: &SearchOptions,
        progress: Option<&ProgressCallback>,
        token: &CancellationToken,
    ) -> Result<OrchestratorSuccess, SearchError> {
        if token.is_cancelled() {
            return Err(SearchError::Cancelled);
        }

        let timings = Arc::new(TimingSink::default());
        let mut attempts: Vec<AttemptOutcome> = Vec::new();

        // Stage 1: if everything fits the budget, no ranking is needed and
        // the other strategies never run.
        notify(progress, SearchProgress::TryingStrategy(StrategyId::FullWorkspace));
        let report = self
            .attempt_future(
                &self.full_workspace,
                sizing,
                query,
                options,
                token.child_token(),
                timings.clone(),
            )
            .await;
        if let Some((strategy, result)) = report.winner {
            debug!("full workspace answered; skipping remote and local strategies");
            return Ok(OrchestratorSuccess {
                strategy,
                result,
                is_full_workspace: true,
                timings: timings.snapshot(),
            });
        }
        attempts.extend(report.attempts);
        if token.is_cancelled() {
            return Err(SearchError::Cancelled);
        }

        // Side effects such as auth prompts run before any timeout clock
        // starts ticking.
        self.remote.prepare(token).await;

        // Stage 2: remote against the composite local fallback, which is
        // itself embeddings racing lexical one level down.
        notify(progress, SearchProgress::TryingStrategy(StrategyId::RemoteSearch));
        let remote_grace = Duration::from_millis(self.config.remote_timeout_ms);
        let embeddings_grace = Duration::from_millis(self.config.embeddings_timeout_ms);

        let remote_token = token.child_token();
        let remote_contender = (
            self.attempt_future(
                &self.remote,
                sizing,
                query,
                options,
                remote_token.clone(),
                timings.clone(),
            ),
            remote_token,
        );
        let local_fallback = || {
            notify(progress, SearchProgress::FallingBack(StrategyId::RemoteSearch));
            debug!("starting local fallback while remote continues in the background");
            // One token scopes the whole composite so cancelling the local
            // fallback reaches whichever of its contenders is still running.
            let local_token = token.child_token();
            let embeddings_token = local_token.child_token();
            let embeddings_contender = (
                self.attempt_future(
                    &self.embeddings,
                    sizing,
                    query,
                    options,
                    embeddings_token.clone(),
                    timings.clone(),
                ),
                embeddings_token,
            );
            let lexical_token = local_token.child_token();
            let lexical_fallback = {
                let timings = timings.clone();
                move || {
                    notify(progress, SearchProgress::FallingBack(StrategyId::LocalEmbeddings));
                    (
                        self.attempt_future(
                            &self.lexical,
                            sizing,
                            query,
                            options,
                            lexical_token.clone(),
                            timings.clone(),
                        ),
                        lexical_token,
                    )
                }
            };
            let race: BoxFuture<'_, RaceReport> = Box::pin(race_with_deferred_fallback(
                embeddings_contender,
                lexical_fallback,
                embeddings_grace,
            ));
            (race, local_token)
        };

        let report =
            race_with_deferred_fallback(remote_contender, local_fallback, remote_grace).await;
        attempts.extend(report.attempts);
        if let Some((strategy, result)) = report.winner {
            return Ok(OrchestratorSuccess {
                strategy,
                result,
                is_full_workspace: false,
                timings: timings.snapshot(),
            });
        }

        if token.is_cancelled() {
            return Err(SearchError::Cancelled);
        }
        let reasons: Vec<String> = attempts.iter().map(AttemptOutcome::describe).collect();
        Err(SearchError::NoStrategySucceeded {
            reasons: reasons.join("; "),
        })
    }

    /// The invocation boundary: catches failures into typed outcomes,
    /// records timing, and keeps cancellation distinct
    fn attempt_future<'a>(
        &'a self,
        strategy: &'a Arc<dyn SearchStrategy>,
        sizing: &'a SearchSizing,
        query: &'a SearchQuery,
        options: &'a SearchOptions,
        token: CancellationToken,
        timings: &'a TimingSink,
    ) -> BoxFuture<'a, RaceReport> {
        Box::pin(async move {
            let id = strategy.id();
            let start = Instant::now();
            let outcome = strategy.search(sizing, query, options, None, &token).await;
            timings.record(id, start.elapsed());

            match outcome {
                Ok(Some(result)) => {
                    debug!("{} produced {} chunks", id.as_str(), result.chunks.len());
                    RaceReport {
                        winner: Some((id, result)),
                        attempts: Vec::new(),
                    }
                }
                Ok(None) => {
                    debug!("{} declined", id.as_str());
                    RaceReport {
                        winner: None,
                        attempts: vec![AttemptOutcome::Declined { id }],
                    }
                }
                Err(StrategyError::Cancelled) => RaceReport {
                    winner: None,
                    attempts: vec![AttemptOutcome::Cancelled { id }],
                },
                Err(StrategyError::Failed(message)) => {
                    warn!("{} failed: {message}", id.as_str());
                    RaceReport {
                        winner: None,
                        attempts: vec![AttemptOutcome::Failed { id, message }],
                    }
                }
            }
        })
    }
}

fn notify(progress: Option<&ProgressCallback>, event: SearchProgress) {
    if let Some(progress) = progress {
        progress(event);
    }
}

/// Race a primary contender against a fallback that only starts once the
/// grace period expires or the primary has failed.
///
/// The grace timer firing does NOT cancel the primary: both keep running
/// and the first success wins, at which point the loser's token is
/// cancelled. Each contender brings its own token so a late primary win
/// can still be honored.
async fn race_with_deferred_fallback<'a, F>(
    primary: (BoxFuture<'a, RaceReport>, CancellationToken),
    fallback: F,
    grace: Duration,
) -> RaceReport
where
    F: FnOnce() -> (BoxFuture<'a, RaceReport>, CancellationToken),
{
    let (mut primary_future, primary_cancel) = primary;
    let mut attempts = Vec::new();

    // Phase 1: the primary runs alone until it answers or the grace
    // period expires.
    tokio::select! {
        mut report = &mut primary_future => {
            attempts.append(&mut report.attempts);
            if report.winner.is_some() {
                return RaceReport { winner: report.winner, attempts };
            }
            // The primary is done and lost; the fallback runs alone.
            let (fallback_future, _fallback_cancel) = fallback();
            let mut report = fallback_future.await;
            attempts.append(&mut report.attempts);
            return RaceReport { winner: report.winner, attempts };
        }
        _ = tokio::time::sleep(grace) => {
            debug!("grace period of {grace:?} expired; starting fallback");
        }
    }

    // Phase 2: both contenders run; first success wins and the loser is
    // cancelled only once that happens, then awaited so it unwinds before
    // the winner's result is handed back.
    let (mut fallback_future, fallback_cancel) = fallback();
    let mut primary_done = false;
    let mut fallback_done = false;
    loop {
        tokio::select! {
            mut report = &mut primary_future, if !primary_done => {
                attempts.append(&mut report.attempts);
                if report.winner.is_some() {
                    fallback_cancel.cancel();
                    if !fallback_done {
                        let _ = (&mut fallback_future).await;
                    }
                    return RaceReport { winner: report.winner, attempts };
                }
                primary_done = true;
            }
            mut report = &mut fallback_future, if !fallback_done => {
                attempts.append(&mut report.attempts);
                if report.winner.is_some() {
                    primary_cancel.cancel();
                    if !primary_done {
                        let _ = (&mut primary_future).await;
                    }
                    return RaceReport { winner: report.winner, attempts };
                }
                fallback_done = true;
            }
            else => {
                return RaceReport { winner: None, attempts };
            }
        }
    }
}

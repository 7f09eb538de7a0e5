use super::game::QuizGame;
use super::lock;
use super::scope::CancelScope;
use super::winners::{calculate_winners, down_select};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::messages;
use crate::services::{Backend, Gateway, Persistence, ResultCache};
use crate::types::{Game, GameStatus, Lottery, LotteryStatus, RewardClaim, UserSet};
use crate::utils::new_cut_uuid;
use chrono::Utc;
use rand::rngs::StdRng;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, interval_at};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Finalizing,
    Terminated,
}

struct State<B: Backend> {
    phase: Phase,
    games: Vec<Arc<QuizGame<B>>>,
}

/// Owns the rounds of one lottery and finalizes it once all of them are done.
pub struct QuizLottery<B: Backend> {
    backend: Arc<B>,
    config: Arc<EngineConfig>,
    rng: Arc<Mutex<StdRng>>,
    scope: CancelScope,
    daemon_id: String,
    record: Mutex<Lottery>,
    state: Mutex<State<B>>,
    // Serializes round changes against each other and against the finalize decision.
    changes: tokio::sync::Mutex<()>,
    // Rounds whose task has not completed yet.
    pending: AtomicUsize,
    all_finished: Notify,
}

impl<B: Backend> QuizLottery<B> {
    pub fn new(
        backend: Arc<B>,
        config: Arc<EngineConfig>,
        rng: Arc<Mutex<StdRng>>,
        parent: &CancelScope,
        lottery: Lottery,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            config,
            rng,
            scope: parent.child(),
            daemon_id: new_cut_uuid(),
            record: Mutex::new(lottery),
            state: Mutex::new(State {
                phase: Phase::Running,
                games: Vec::new(),
            }),
            changes: tokio::sync::Mutex::new(()),
            pending: AtomicUsize::new(0),
            all_finished: Notify::new(),
        })
    }

    pub fn lottery_id(&self) -> String {
        lock(&self.record).lottery_id.clone()
    }

    pub fn snapshot(&self) -> Lottery {
        lock(&self.record).clone()
    }

    pub fn is_finished(&self) -> bool {
        lock(&self.record).is_finished()
    }

    pub fn phase(&self) -> Phase {
        lock(&self.state).phase
    }

    pub fn merge_config(&self, update: &Lottery) {
        lock(&self.record).merge_config(update);
    }

    pub fn games(&self) -> Vec<Arc<QuizGame<B>>> {
        lock(&self.state).games.clone()
    }

    pub fn game_count(&self) -> usize {
        lock(&self.state).games.len()
    }

    pub fn pending_games(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn find_game(&self, game_id: &str) -> Option<Arc<QuizGame<B>>> {
        lock(&self.state)
            .games
            .iter()
            .find(|game| game.game_id() == game_id)
            .cloned()
    }

    /// Starts a round, or replaces the running round with the same id. The old
    /// round must terminate for the replacement to go ahead.
    pub async fn add_game(self: &Arc<Self>, game: Game) -> Result<Arc<QuizGame<B>>> {
        let _changes = self.changes.lock().await;
        if self.phase() != Phase::Running {
            return Err(Error::LotteryNotFound(self.lottery_id()));
        }

        let old = self.find_game(&game.game_id);
        if let Some(old) = &old
            && old.status() == GameStatus::Finished
        {
            return Err(Error::GameFinished(game.game_id));
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Some(old) = old {
            if let Err(err) = old.terminate().await {
                self.on_game_done();
                return Err(err);
            }
        }

        let round = QuizGame::new(Arc::clone(&self.backend), &self.scope, game);
        {
            let mut state = lock(&self.state);
            let game_id = round.game_id();
            match state.games.iter().position(|g| g.game_id() == game_id) {
                Some(index) => state.games[index] = Arc::clone(&round),
                None => state.games.push(Arc::clone(&round)),
            }
        }
        self.spawn_game(Arc::clone(&round));
        Ok(round)
    }

    /// Terminates and forgets a round. Unknown ids are a no-op.
    pub async fn remove_game(&self, game_id: &str) -> Result<()> {
        let _changes = self.changes.lock().await;
        let Some(game) = self.find_game(game_id) else {
            return Ok(());
        };
        game.terminate().await?;
        lock(&self.state).games.retain(|g| !Arc::ptr_eq(g, &game));
        Ok(())
    }

    /// Cancels the lottery if it owns no rounds. Returns whether it did.
    pub async fn terminate(&self) -> bool {
        let _changes = self.changes.lock().await;
        {
            let mut state = lock(&self.state);
            if !state.games.is_empty() {
                return false;
            }
            state.phase = Phase::Terminated;
        }
        self.scope.cancel();
        true
    }

    fn spawn_game(self: &Arc<Self>, game: Arc<QuizGame<B>>) {
        let lottery = Arc::clone(self);
        tokio::spawn(async move {
            let game_id = game.game_id();
            if let Err(err) = tokio::spawn(Arc::clone(&game).play()).await {
                error!(%game_id, "quiz game task failed: {err}");
            }
            lottery.on_game_done();
        });
    }

    fn on_game_done(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.all_finished.notify_one();
        }
    }

    /// Orchestrator task body. Returns once the lottery finalized or was cancelled.
    pub(crate) async fn run(self: Arc<Self>) {
        let lottery_id = self.lottery_id();
        info!(daemon = %self.daemon_id, %lottery_id, "quiz game lottery daemon running");

        let period = self.config.idle_check_interval.max(Duration::from_millis(1));
        let mut idle_check = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = self.scope.cancelled() => {
                    warn!(daemon = %self.daemon_id, %lottery_id, "quiz game lottery daemon terminated");
                    lock(&self.state).phase = Phase::Terminated;
                    return;
                }
                _ = idle_check.tick() => {
                    if self.game_count() == 0 && self.terminate().await {
                        warn!(%lottery_id, "quiz game lottery has no games, terminating");
                    }
                }
                _ = self.all_finished.notified() => {
                    if self.try_finalize().await {
                        info!(daemon = %self.daemon_id, %lottery_id, "quiz game lottery daemon finished");
                        return;
                    }
                }
            }
        }
    }

    /// Finalizes once the grace period has passed and, under the change lock,
    /// no round is pending and at least one is owned.
    async fn try_finalize(&self) -> bool {
        let lottery_id = self.lottery_id();
        tokio::select! {
            _ = self.scope.cancelled() => return false,
            _ = tokio::time::sleep(self.config.finalize_grace) => {}
        }
        {
            let _changes = self.changes.lock().await;
            if self.scope.is_cancelled() || self.pending.load(Ordering::SeqCst) != 0 {
                return false;
            }
            let mut state = lock(&self.state);
            if state.phase != Phase::Running || state.games.is_empty() {
                return false;
            }
            state.phase = Phase::Finalizing;
        }

        info!(%lottery_id, "all quiz games finished, calculating lottery winners");
        self.finalize().await;
        lock(&self.state).phase = Phase::Terminated;
        self.scope.cancel();
        true
    }

    async fn finalize(&self) {
        let lottery_id = self.lottery_id();
        let games = self.games();
        let rounds: Vec<UserSet> = games.iter().map(|game| game.winners()).collect();
        let lottery = {
            let mut record = lock(&self.record);
            let total = record.total_quiz_num.min(rounds.len());
            let required = record.winner_required_correct_quiz_num.min(total);
            let computed = calculate_winners(&rounds[..total], required);
            let winners = {
                let mut rng = lock(&self.rng);
                down_select(computed, record.allowed_winner_num, &mut *rng)
            };
            record.total_quiz_num = total;
            record.winner_required_correct_quiz_num = required;
            record.winners = winners;
            record.status = LotteryStatus::Finished;
            record.ended_at = Some(Utc::now());
            record.clone()
        };
        info!(%lottery_id, winners = lottery.winners.len(), "quiz game lottery winners drawn");

        let Some(destination) = games.first().map(|game| game.snapshot().destination()) else {
            return;
        };
        let ended_at = lottery.ended_at.unwrap_or_else(Utc::now);
        let claim = RewardClaim::for_lottery(
            &lottery,
            ended_at,
            self.config.claim_window,
            self.config.claimable_duration_hours,
        );

        let persisted = self
            .retry("persist finished lottery", || {
                self.backend.persistence().finish_lottery(&lottery, &claim)
            })
            .await;
        let announced = self
            .retry("announce lottery winners", || async {
                if !lottery.winners.is_empty() {
                    self.backend
                        .cache()
                        .cache_winners(&lottery.lottery_id, &lottery.winners)
                        .await?;
                }
                self.backend
                    .gateway()
                    .publish(&destination, messages::lottery_announcement(&lottery))
                    .await?;
                Ok::<(), anyhow::Error>(())
            })
            .await;

        if !(persisted && announced) {
            error!(
                %lottery_id,
                persisted, announced, "quiz game lottery degraded finished, needs manual reconciliation"
            );
        }
    }

    async fn retry<F, Fut>(&self, step: &str, mut attempt: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let tries = self.config.finalize_max_tries.max(1);
        for try_no in 1..=tries {
            match attempt().await {
                Ok(()) => return true,
                Err(err) => {
                    warn!(lottery_id = %self.lottery_id(), step, try_no, "{err:#}");
                    if try_no < tries {
                        tokio::time::sleep(self.config.finalize_retry_delay).await;
                    }
                }
            }
        }
        error!(lottery_id = %self.lottery_id(), step, "giving up after {tries} tries");
        false
    }
}

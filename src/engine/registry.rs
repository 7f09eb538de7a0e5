use super::game::{QuizGame, participation_result};
use super::lottery::{Phase, QuizLottery};
use super::scope::CancelScope;
use super::{read, write};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::services::{Backend, Persistence, ResultCache};
use crate::types::{Game, Lottery, ParticipationResult};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{error, info, warn};

struct Index<B: Backend> {
    lotteries: HashMap<String, Arc<QuizLottery<B>>>,
    games: HashMap<String, Arc<QuizGame<B>>>,
}

/// Process-wide index of running lotteries and rounds.
///
/// The index lock only ever guards map operations; every call into a lottery,
/// a round or a collaborator happens after it is released.
pub struct Registry<B: Backend> {
    backend: Arc<B>,
    config: Arc<EngineConfig>,
    rng: Arc<Mutex<StdRng>>,
    scope: CancelScope,
    index: RwLock<Index<B>>,
}

impl<B: Backend> Registry<B> {
    pub fn new(backend: Arc<B>, config: EngineConfig) -> Arc<Self> {
        Self::with_rng(backend, config, StdRng::from_entropy())
    }

    pub fn with_rng(backend: Arc<B>, config: EngineConfig, rng: StdRng) -> Arc<Self> {
        Arc::new(Self {
            backend,
            config: Arc::new(config),
            rng: Arc::new(Mutex::new(rng)),
            scope: CancelScope::root(),
            index: RwLock::new(Index {
                lotteries: HashMap::new(),
                games: HashMap::new(),
            }),
        })
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Replays every unfinished lottery and its rounds from persistence.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let persistence = self.backend.persistence();
        let lotteries = persistence
            .select_unfinished_lotteries()
            .await
            .map_err(Error::Persistence)?;
        let lottery_ids: Vec<String> = lotteries.iter().map(|l| l.lottery_id.clone()).collect();
        let games = persistence
            .select_games_by_lottery_ids(&lottery_ids)
            .await
            .map_err(Error::Persistence)?;
        info!(
            lotteries = lotteries.len(),
            games = games.len(),
            "recovering quiz game lotteries"
        );

        for lottery in lotteries {
            self.add_lottery(lottery);
        }
        for game in games {
            let game_id = game.game_id.clone();
            if let Err(err) = self.add_game(game).await {
                error!(%game_id, "recover quiz game: {err}");
            }
        }
        Ok(())
    }

    /// Tracks a new lottery and starts its daemon, or merges configuration
    /// changes into the one already tracked. A tracked lottery that retired
    /// without finishing is replaced.
    pub fn add_lottery(self: &Arc<Self>, lottery: Lottery) -> Arc<QuizLottery<B>> {
        let live = read(&self.index)
            .lotteries
            .get(&lottery.lottery_id)
            .filter(|existing| is_live(existing))
            .cloned();
        if let Some(existing) = live {
            existing.merge_config(&lottery);
            return existing;
        }

        let lottery_id = lottery.lottery_id.clone();
        let created = QuizLottery::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.config),
            Arc::clone(&self.rng),
            &self.scope,
            lottery.clone(),
        );
        {
            let mut index = write(&self.index);
            if let Some(existing) = index
                .lotteries
                .get(&lottery_id)
                .filter(|existing| is_live(existing))
                .cloned()
            {
                drop(index);
                existing.merge_config(&lottery);
                return existing;
            }
            index.lotteries.insert(lottery_id, Arc::clone(&created));
        }

        let registry = Arc::downgrade(self);
        let daemon = Arc::clone(&created);
        tokio::spawn(async move {
            let lottery_id = daemon.lottery_id();
            if let Err(err) = tokio::spawn(Arc::clone(&daemon).run()).await {
                error!(%lottery_id, "quiz game lottery task failed: {err}");
            }
            if let Some(registry) = registry.upgrade() {
                registry.forget_lottery(&daemon);
            }
        });
        created
    }

    fn forget_lottery(&self, lottery: &Arc<QuizLottery<B>>) {
        let lottery_id = lottery.lottery_id();
        let games = lottery.games();
        let mut index = write(&self.index);
        if index
            .lotteries
            .get(&lottery_id)
            .is_some_and(|tracked| Arc::ptr_eq(tracked, lottery))
        {
            index.lotteries.remove(&lottery_id);
        }
        index
            .games
            .retain(|_, game| !games.iter().any(|owned| Arc::ptr_eq(owned, game)));
    }

    /// Hands a round to its lottery. Same id replaces the running round.
    pub async fn add_game(&self, game: Game) -> Result<()> {
        let lottery_id = game.lottery_id.clone();
        let lottery = self
            .get_lottery(&lottery_id)
            .filter(|lottery| !lottery.is_finished())
            .ok_or_else(|| Error::LotteryNotFound(lottery_id.clone()))?;

        let round = lottery.add_game(game).await?;
        let mut index = write(&self.index);
        if index
            .lotteries
            .get(&lottery_id)
            .is_some_and(|tracked| Arc::ptr_eq(tracked, &lottery))
        {
            index.games.insert(round.game_id(), round);
        }
        Ok(())
    }

    pub async fn remove_game(&self, lottery_id: &str, game_id: &str) -> Result<()> {
        let lottery = self
            .get_lottery(lottery_id)
            .ok_or_else(|| Error::LotteryNotFound(lottery_id.to_string()))?;
        lottery.remove_game(game_id).await?;

        let mut index = write(&self.index);
        if index
            .games
            .get(game_id)
            .is_some_and(|game| game.snapshot().lottery_id == lottery_id)
        {
            index.games.remove(game_id);
        }
        Ok(())
    }

    /// Cancels a lottery that owns no rounds. Untracked lotteries are a no-op.
    pub async fn terminate_lottery(&self, lottery_id: &str) -> Result<()> {
        let Some(lottery) = self.get_lottery(lottery_id) else {
            return Ok(());
        };
        if !lottery.terminate().await {
            return Err(Error::LotteryBusy(lottery_id.to_string()));
        }
        self.forget_lottery(&lottery);
        Ok(())
    }

    pub fn get_game(&self, game_id: &str) -> Option<Arc<QuizGame<B>>> {
        read(&self.index).games.get(game_id).cloned()
    }

    pub fn get_lottery(&self, lottery_id: &str) -> Option<Arc<QuizLottery<B>>> {
        read(&self.index).lotteries.get(lottery_id).cloned()
    }

    pub async fn participate(&self, game_id: &str, user_id: &str, option_id: &str) -> Result<bool> {
        let game = self
            .get_game(game_id)
            .ok_or_else(|| Error::GameNotFound(game_id.to_string()))?;
        game.participate(user_id, option_id).await
    }

    /// A user's outcome in one round, for live rounds and for rounds that are
    /// only left in persistence.
    pub async fn check_game_result(&self, game_id: &str, user_id: &str) -> Result<ParticipationResult> {
        if let Some(game) = self.get_game(game_id) {
            return game.participation_of(user_id).await;
        }
        let game = self
            .backend
            .persistence()
            .select_game(game_id)
            .await
            .map_err(Error::Persistence)?
            .ok_or_else(|| Error::GameNotFound(game_id.to_string()))?;
        participation_result(self.backend.as_ref(), &game, user_id).await
    }

    pub async fn check_lottery_result(&self, lottery_id: &str, user_id: &str) -> Result<bool> {
        self.backend
            .cache()
            .is_winner(lottery_id, user_id)
            .await
            .map_err(Error::Store)
    }

    pub fn lottery_count(&self) -> usize {
        read(&self.index).lotteries.len()
    }

    pub fn game_count(&self) -> usize {
        read(&self.index).games.len()
    }

    /// Cancels every lottery and round. Nothing is retracted or persisted, so
    /// the next start resumes where this one stopped.
    pub fn shutdown(&self) {
        warn!(lotteries = self.lottery_count(), "shutting down quiz game registry");
        self.scope.cancel();
    }
}

fn is_live<B: Backend>(lottery: &QuizLottery<B>) -> bool {
    lottery.phase() != Phase::Terminated || lottery.is_finished()
}

//! Recording collaborators and fixtures shared by the unit tests.

use crate::config::EngineConfig;
use crate::messages::OutboundMessage;
use crate::services::{Gateway, Persistence, Services};
use crate::store::MemoryStore;
use crate::types::{
    Destination, Game, GameStatus, Lottery, LotteryStatus, MessageHandle, RewardClaim, RewardType,
};
use crate::utils::lock;
use anyhow::{Result, bail};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type TestBackend = Services<MockGateway, MockPersistence, MemoryStore, MemoryStore>;

pub fn test_backend() -> Arc<TestBackend> {
    Arc::new(Services {
        gateway: MockGateway::default(),
        persistence: MockPersistence::default(),
        participations: MemoryStore::new(),
        cache: MemoryStore::new(),
    })
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        finalize_grace: Duration::from_millis(10),
        finalize_retry_delay: Duration::from_millis(5),
        ..EngineConfig::default()
    }
}

/// Round one hour ahead with options red/green/blue, "green" (option "2") correct.
pub fn game_fixture(game_id: &str, lottery_id: &str) -> Game {
    Game {
        game_id: game_id.to_string(),
        lottery_id: lottery_id.to_string(),
        guild_id: "guild-1".to_string(),
        channel_id: "channel-1".to_string(),
        time_limit_sec: 30,
        send_quiz_at: Utc::now() + ChronoDuration::hours(1),
        status: GameStatus::NotStarted,
        question_description: "Which colour is grass?".to_string(),
        answer_options: vec!["red".to_string(), "green".to_string(), "blue".to_string()],
        correct_answer_option: "green".to_string(),
        participants: None,
        winners: None,
        question_message_id: None,
        answer_message_id: None,
        deleted_at: None,
    }
}

pub fn lottery_fixture(lottery_id: &str) -> Lottery {
    Lottery {
        lottery_id: lottery_id.to_string(),
        status: LotteryStatus::NotStarted,
        allowed_winner_num: 10,
        reward_type: RewardType::ArcToken,
        reward_amount: 100,
        total_quiz_num: 3,
        winner_required_correct_quiz_num: 2,
        winners: Default::default(),
        created_at: Utc::now(),
        ended_at: None,
        deleted_at: None,
    }
}

#[derive(Default)]
pub struct MockGateway {
    next_id: AtomicUsize,
    fail_retractions: AtomicBool,
    hold_publishes: AtomicBool,
    publish_attempts: AtomicUsize,
    panic_channel: Mutex<Option<String>>,
    published: Mutex<Vec<(Destination, OutboundMessage)>>,
    edited: Mutex<Vec<(MessageHandle, OutboundMessage)>>,
    retracted: Mutex<Vec<MessageHandle>>,
}

impl MockGateway {
    pub fn published(&self) -> Vec<(Destination, OutboundMessage)> {
        lock(&self.published).clone()
    }

    pub fn edited(&self) -> Vec<(MessageHandle, OutboundMessage)> {
        lock(&self.edited).clone()
    }

    pub fn retracted(&self) -> Vec<MessageHandle> {
        lock(&self.retracted).clone()
    }

    pub fn fail_retractions(&self, fail: bool) {
        self.fail_retractions.store(fail, Ordering::SeqCst);
    }

    /// Publishing blocks until released with `hold_publishes(false)`.
    pub fn hold_publishes(&self, hold: bool) {
        self.hold_publishes.store(hold, Ordering::SeqCst);
    }

    pub fn publish_attempts(&self) -> usize {
        self.publish_attempts.load(Ordering::SeqCst)
    }

    /// Publishing to `channel_id` panics.
    pub fn panic_on_channel(&self, channel_id: &str) {
        *lock(&self.panic_channel) = Some(channel_id.to_string());
    }

    pub async fn wait_for_publish(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.published().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("message was never published");
    }
}

impl Gateway for MockGateway {
    async fn publish(
        &self,
        destination: &Destination,
        message: OutboundMessage,
    ) -> Result<MessageHandle> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);
        while self.hold_publishes.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let cursed = lock(&self.panic_channel).as_deref() == Some(destination.channel_id.as_str());
        if cursed {
            panic!("gateway blew up on {}", destination.channel_id);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.published).push((destination.clone(), message));
        Ok(MessageHandle {
            channel_id: destination.channel_id.clone(),
            message_id: format!("message-{id}"),
        })
    }

    async fn edit(&self, handle: &MessageHandle, message: OutboundMessage) -> Result<()> {
        lock(&self.edited).push((handle.clone(), message));
        Ok(())
    }

    async fn retract(&self, handle: &MessageHandle) -> Result<()> {
        if self.fail_retractions.load(Ordering::SeqCst) {
            bail!("retraction refused");
        }
        lock(&self.retracted).push(handle.clone());
        Ok(())
    }
}

/// In-memory persistence whose finish step can be made to fail a few times.
#[derive(Default)]
pub struct MockPersistence {
    lotteries: Mutex<HashMap<String, Lottery>>,
    games: Mutex<HashMap<String, Game>>,
    finished: Mutex<HashMap<String, (Lottery, RewardClaim)>>,
    failing_finishes: AtomicUsize,
    finish_attempts: AtomicUsize,
}

impl MockPersistence {
    pub fn fail_next_finishes(&self, count: usize) {
        self.failing_finishes.store(count, Ordering::SeqCst);
    }

    pub fn finish_attempts(&self) -> usize {
        self.finish_attempts.load(Ordering::SeqCst)
    }

    pub fn stored_game(&self, game_id: &str) -> Option<Game> {
        lock(&self.games).get(game_id).cloned()
    }

    pub fn stored_lottery(&self, lottery_id: &str) -> Option<Lottery> {
        lock(&self.lotteries).get(lottery_id).cloned()
    }

    pub fn finished_lottery(&self, lottery_id: &str) -> Option<(Lottery, RewardClaim)> {
        lock(&self.finished).get(lottery_id).cloned()
    }
}

impl Persistence for MockPersistence {
    async fn save_lottery(&self, lottery: &Lottery) -> Result<()> {
        lock(&self.lotteries).insert(lottery.lottery_id.clone(), lottery.clone());
        Ok(())
    }

    async fn save_game(&self, game: &Game) -> Result<()> {
        lock(&self.games).insert(game.game_id.clone(), game.clone());
        Ok(())
    }

    async fn finish_lottery(&self, lottery: &Lottery, claim: &RewardClaim) -> Result<()> {
        self.finish_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_finishes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_finishes.store(failing - 1, Ordering::SeqCst);
            bail!("database is locked");
        }
        lock(&self.lotteries).insert(lottery.lottery_id.clone(), lottery.clone());
        lock(&self.finished).insert(lottery.lottery_id.clone(), (lottery.clone(), claim.clone()));
        Ok(())
    }

    async fn select_unfinished_lotteries(&self) -> Result<Vec<Lottery>> {
        Ok(lock(&self.lotteries)
            .values()
            .filter(|l| !l.is_finished() && l.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn select_games_by_lottery_ids(&self, lottery_ids: &[String]) -> Result<Vec<Game>> {
        let mut games: Vec<Game> = lock(&self.games)
            .values()
            .filter(|g| lottery_ids.contains(&g.lottery_id) && g.deleted_at.is_none())
            .cloned()
            .collect();
        games.sort_by_key(|g| g.send_quiz_at);
        Ok(games)
    }

    async fn select_lottery(&self, lottery_id: &str) -> Result<Option<Lottery>> {
        Ok(self.stored_lottery(lottery_id))
    }

    async fn select_game(&self, game_id: &str) -> Result<Option<Game>> {
        Ok(self.stored_game(game_id))
    }
}

//! Participation store and result cache implementations.

use crate::services::{ParticipationStore, ResultCache};
use crate::types::{UserSet, Vote};
use crate::utils::lock;
use anyhow::{Context, Result, anyhow};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Mutex;

const PARTICIPANTS_KEY_PREFIX: &str = "quiz_game_participants:";
const LOTTERY_WINNERS_KEY_PREFIX: &str = "quiz_game_lottery_winners:";

/// Process-local store, used when no Redis is configured and in tests.
#[derive(Default)]
pub struct MemoryStore {
    votes: Mutex<HashMap<String, HashMap<String, Vote>>>,
    winners: Mutex<HashMap<String, UserSet>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ParticipationStore for MemoryStore {
    async fn record_vote(&self, game_id: &str, user_id: &str, vote: &Vote) -> Result<()> {
        lock(&self.votes)
            .entry(game_id.to_string())
            .or_default()
            .insert(user_id.to_string(), vote.clone());
        Ok(())
    }

    async fn vote_of(&self, game_id: &str, user_id: &str) -> Result<Option<Vote>> {
        Ok(lock(&self.votes)
            .get(game_id)
            .and_then(|votes| votes.get(user_id))
            .cloned())
    }

    async fn all_votes(&self, game_id: &str) -> Result<HashMap<String, Vote>> {
        Ok(lock(&self.votes).get(game_id).cloned().unwrap_or_default())
    }
}

impl ResultCache for MemoryStore {
    async fn cache_winners(&self, lottery_id: &str, winners: &UserSet) -> Result<()> {
        lock(&self.winners)
            .entry(lottery_id.to_string())
            .or_default()
            .extend(winners.iter().cloned());
        Ok(())
    }

    async fn is_winner(&self, lottery_id: &str, user_id: &str) -> Result<bool> {
        Ok(lock(&self.winners)
            .get(lottery_id)
            .is_some_and(|winners| winners.contains(user_id)))
    }
}

fn encode_vote(vote: &Vote) -> String {
    format!("{}&{}", vote.option_id, vote.voted_at)
}

fn decode_vote(raw: &str) -> Result<Vote> {
    let (option_id, voted_at) = raw
        .split_once('&')
        .ok_or_else(|| anyhow!("malformed participation value {raw:?}"))?;
    Ok(Vote {
        option_id: option_id.to_string(),
        voted_at: voted_at
            .parse()
            .with_context(|| format!("malformed participation time {raw:?}"))?,
    })
}

/// Redis hashes: one per round (user -> `<option>&<millis>`) and one per
/// lottery (winner -> `1`).
pub struct RedisStore {
    client: redis::Client,
    connection: tokio::sync::Mutex<Option<redis::aio::ConnectionManager>>,
}

impl RedisStore {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        Ok(Self {
            client,
            connection: tokio::sync::Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<redis::aio::ConnectionManager> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_connection_manager()
            .await
            .context("connect to redis")?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reset(&self) {
        *self.connection.lock().await = None;
    }

    async fn checked<T>(&self, result: redis::RedisResult<T>, action: &str) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                tracing::warn!("redis {action} failed: {err}");
                self.reset().await;
                Err(anyhow!(err).context(format!("redis {action}")))
            }
        }
    }
}

impl ParticipationStore for RedisStore {
    async fn record_vote(&self, game_id: &str, user_id: &str, vote: &Vote) -> Result<()> {
        let mut conn = self.connection().await?;
        let key = format!("{PARTICIPANTS_KEY_PREFIX}{game_id}");
        let result: redis::RedisResult<()> = conn.hset(key, user_id, encode_vote(vote)).await;
        self.checked(result, "hset").await
    }

    async fn vote_of(&self, game_id: &str, user_id: &str) -> Result<Option<Vote>> {
        let mut conn = self.connection().await?;
        let key = format!("{PARTICIPANTS_KEY_PREFIX}{game_id}");
        let result: redis::RedisResult<Option<String>> = conn.hget(key, user_id).await;
        self.checked(result, "hget")
            .await?
            .as_deref()
            .map(decode_vote)
            .transpose()
    }

    async fn all_votes(&self, game_id: &str) -> Result<HashMap<String, Vote>> {
        let mut conn = self.connection().await?;
        let key = format!("{PARTICIPANTS_KEY_PREFIX}{game_id}");
        let result: redis::RedisResult<HashMap<String, String>> = conn.hgetall(key).await;
        let mut votes = HashMap::new();
        for (user_id, raw) in self.checked(result, "hgetall").await? {
            match decode_vote(&raw) {
                Ok(vote) => {
                    votes.insert(user_id, vote);
                }
                Err(err) => tracing::warn!(%game_id, %user_id, "skipping vote: {err:#}"),
            }
        }
        Ok(votes)
    }
}

impl ResultCache for RedisStore {
    async fn cache_winners(&self, lottery_id: &str, winners: &UserSet) -> Result<()> {
        if winners.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let key = format!("{LOTTERY_WINNERS_KEY_PREFIX}{lottery_id}");
        let fields: Vec<(&str, u8)> = winners.iter().map(|w| (w.as_str(), 1)).collect();
        let result: redis::RedisResult<()> = conn.hset_multiple(key, &fields).await;
        self.checked(result, "hset_multiple").await
    }

    async fn is_winner(&self, lottery_id: &str, user_id: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let key = format!("{LOTTERY_WINNERS_KEY_PREFIX}{lottery_id}");
        let result: redis::RedisResult<bool> = conn.hexists(key, user_id).await;
        self.checked(result, "hexists").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(option_id: &str, voted_at: i64) -> Vote {
        Vote {
            option_id: option_id.to_string(),
            voted_at,
        }
    }

    #[tokio::test]
    async fn test_last_vote_wins() {
        let store = MemoryStore::new();
        store.record_vote("g1", "alice", &vote("1", 10)).await.unwrap();
        store.record_vote("g1", "alice", &vote("3", 20)).await.unwrap();
        store.record_vote("g1", "bob", &vote("2", 15)).await.unwrap();

        assert_eq!(store.vote_of("g1", "alice").await.unwrap(), Some(vote("3", 20)));
        assert_eq!(store.all_votes("g1").await.unwrap().len(), 2);
        assert!(store.all_votes("g2").await.unwrap().is_empty());
        assert_eq!(store.vote_of("g2", "alice").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cached_winners_are_per_lottery() {
        let store = MemoryStore::new();
        let winners: UserSet = ["alice".to_string()].into_iter().collect();
        store.cache_winners("l1", &winners).await.unwrap();

        assert!(store.is_winner("l1", "alice").await.unwrap());
        assert!(!store.is_winner("l1", "bob").await.unwrap());
        assert!(!store.is_winner("l2", "alice").await.unwrap());
    }

    #[test]
    fn test_vote_wire_format() {
        assert_eq!(encode_vote(&vote("2", 1_700_000_000_000)), "2&1700000000000");
        assert_eq!(decode_vote("4&17").unwrap(), vote("4", 17));
        assert!(decode_vote("4").is_err());
        assert!(decode_vote("4&soon").is_err());
    }

    #[test]
    fn test_redis_url_is_validated() {
        assert!(RedisStore::new("redis://127.0.0.1:6379").is_ok());
        assert!(RedisStore::new("not a url").is_err());
    }
}

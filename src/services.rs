//! Collaborators the engine talks to. The engine never owns their state; it only
//! calls them from its round and lottery tasks.

use crate::messages::OutboundMessage;
use crate::types::{Destination, Game, Lottery, MessageHandle, RewardClaim, UserSet, Vote};
use anyhow::Result;
use std::collections::HashMap;
use std::future::Future;

/// Chat platform messaging.
pub trait Gateway: Send + Sync + 'static {
    /// Post a message and return its handle.
    fn publish(
        &self,
        destination: &Destination,
        message: OutboundMessage,
    ) -> impl Future<Output = Result<MessageHandle>> + Send;

    /// Replace the content of a published message.
    fn edit(
        &self,
        handle: &MessageHandle,
        message: OutboundMessage,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delete a published message.
    fn retract(&self, handle: &MessageHandle) -> impl Future<Output = Result<()>> + Send;
}

/// Durable lottery and round records.
pub trait Persistence: Send + Sync + 'static {
    /// Upsert on lottery id. Updates configuration fields and `deleted_at`, never status.
    fn save_lottery(&self, lottery: &Lottery) -> impl Future<Output = Result<()>> + Send;

    /// Upsert on game id.
    fn save_game(&self, game: &Game) -> impl Future<Output = Result<()>> + Send;

    /// Mark the lottery finished and create its reward claim in one transaction.
    fn finish_lottery(
        &self,
        lottery: &Lottery,
        claim: &RewardClaim,
    ) -> impl Future<Output = Result<()>> + Send;

    fn select_unfinished_lotteries(&self) -> impl Future<Output = Result<Vec<Lottery>>> + Send;

    /// Non-deleted games of the given lotteries, in scheduled order.
    fn select_games_by_lottery_ids(
        &self,
        lottery_ids: &[String],
    ) -> impl Future<Output = Result<Vec<Game>>> + Send;

    fn select_lottery(&self, lottery_id: &str)
    -> impl Future<Output = Result<Option<Lottery>>> + Send;

    fn select_game(&self, game_id: &str) -> impl Future<Output = Result<Option<Game>>> + Send;
}

/// Per-round votes, written by user interactions while a round is open.
pub trait ParticipationStore: Send + Sync + 'static {
    /// Overwrites any earlier vote of the same user.
    fn record_vote(
        &self,
        game_id: &str,
        user_id: &str,
        vote: &Vote,
    ) -> impl Future<Output = Result<()>> + Send;

    fn vote_of(
        &self,
        game_id: &str,
        user_id: &str,
    ) -> impl Future<Output = Result<Option<Vote>>> + Send;

    fn all_votes(&self, game_id: &str) -> impl Future<Output = Result<HashMap<String, Vote>>> + Send;
}

/// Fast "did I win" lookups.
pub trait ResultCache: Send + Sync + 'static {
    fn cache_winners(
        &self,
        lottery_id: &str,
        winners: &UserSet,
    ) -> impl Future<Output = Result<()>> + Send;

    fn is_winner(&self, lottery_id: &str, user_id: &str) -> impl Future<Output = Result<bool>> + Send;
}

/// Everything the engine needs from the outside world.
pub trait Backend: Send + Sync + 'static {
    type Gateway: Gateway;
    type Persistence: Persistence;
    type Participations: ParticipationStore;
    type Cache: ResultCache;

    fn gateway(&self) -> &Self::Gateway;
    fn persistence(&self) -> &Self::Persistence;
    fn participations(&self) -> &Self::Participations;
    fn cache(&self) -> &Self::Cache;
}

/// Plain bundle of four collaborator implementations.
pub struct Services<G, P, S, C> {
    pub gateway: G,
    pub persistence: P,
    pub participations: S,
    pub cache: C,
}

impl<G, P, S, C> Backend for Services<G, P, S, C>
where
    G: Gateway,
    P: Persistence,
    S: ParticipationStore,
    C: ResultCache,
{
    type Gateway = G;
    type Persistence = P;
    type Participations = S;
    type Cache = C;

    fn gateway(&self) -> &G {
        &self.gateway
    }

    fn persistence(&self) -> &P {
        &self.persistence
    }

    fn participations(&self) -> &S {
        &self.participations
    }

    fn cache(&self) -> &C {
        &self.cache
    }
}

use super::lock;
use super::scope::CancelScope;
use crate::error::{Error, Result};
use crate::messages;
use crate::services::{Backend, Gateway, ParticipationStore, Persistence};
use crate::types::{Game, GameStatus, ParticipationResult, UserSet, Vote};
use crate::utils::{new_cut_uuid, until};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// One timed question round: NotStarted -> InProgress -> Finished, or
/// cancelled out of either of the first two.
pub struct QuizGame<B: Backend> {
    backend: Arc<B>,
    scope: CancelScope,
    daemon_id: String,
    correct_option_id: String,
    record: Mutex<Game>,
}

impl<B: Backend> QuizGame<B> {
    pub fn new(backend: Arc<B>, parent: &CancelScope, game: Game) -> Arc<Self> {
        let correct_option_id = game.correct_option_id().unwrap_or_else(|| {
            warn!(game_id = %game.game_id, "correct answer missing from answer options");
            String::new()
        });
        Arc::new(Self {
            backend,
            scope: parent.child(),
            daemon_id: new_cut_uuid(),
            correct_option_id,
            record: Mutex::new(game),
        })
    }

    pub fn game_id(&self) -> String {
        lock(&self.record).game_id.clone()
    }

    pub fn status(&self) -> GameStatus {
        lock(&self.record).status
    }

    pub fn snapshot(&self) -> Game {
        lock(&self.record).clone()
    }

    /// Winners written at close; empty when the round never closed.
    pub fn winners(&self) -> UserSet {
        lock(&self.record).winners.clone().unwrap_or_default()
    }

    pub fn correct_option_id(&self) -> &str {
        &self.correct_option_id
    }

    /// Records the user's choice while the round is open. Returns `false` once
    /// the deadline has passed, leaving the store untouched.
    pub async fn participate(&self, user_id: &str, option_id: &str) -> Result<bool> {
        let (game_id, expired, known_option) = {
            let record = lock(&self.record);
            (
                record.game_id.clone(),
                record.expired(Utc::now()),
                record.answer_for_option(option_id).is_some(),
            )
        };
        if expired {
            return Ok(false);
        }
        if !known_option {
            return Err(Error::UnknownOption {
                game_id,
                option_id: option_id.to_string(),
            });
        }

        let vote = Vote {
            option_id: option_id.to_string(),
            voted_at: Utc::now().timestamp_millis(),
        };
        self.backend
            .participations()
            .record_vote(&game_id, user_id, &vote)
            .await
            .map_err(Error::Store)?;
        Ok(true)
    }

    pub async fn participation_of(&self, user_id: &str) -> Result<ParticipationResult> {
        let game = self.snapshot();
        participation_result(self.backend.as_ref(), &game, user_id).await
    }

    /// Stops the round. A started round is only stopped once its question has
    /// been retracted; a finished round never stops.
    pub async fn terminate(&self) -> Result<()> {
        let (game_id, status, question) = {
            let record = lock(&self.record);
            (record.game_id.clone(), record.status, record.question_message())
        };
        match status {
            GameStatus::NotStarted => {
                self.scope.cancel();
                Ok(())
            }
            GameStatus::InProgress => {
                let Some(question) = question else {
                    return Err(Error::Unterminable(game_id));
                };
                if let Err(err) = self.backend.gateway().retract(&question).await {
                    error!(%game_id, "delete quiz game message: {err:#}");
                    return Err(Error::Unterminable(game_id));
                }
                self.scope.cancel();
                Ok(())
            }
            GameStatus::Finished => Err(Error::GameFinished(game_id)),
        }
    }

    /// Round task body. Returns once the round finished or was cancelled.
    pub(crate) async fn play(self: Arc<Self>) {
        let game_id = self.game_id();
        if self.status() == GameStatus::Finished {
            debug!(%game_id, "quiz game already finished");
            return;
        }
        info!(daemon = %self.daemon_id, %game_id, "quiz game daemon running");
        self.upcoming().await;
        self.ongoing().await;
        info!(daemon = %self.daemon_id, %game_id, "quiz game daemon terminated");
    }

    async fn upcoming(&self) {
        let (game_id, send_at) = {
            let record = lock(&self.record);
            if record.status != GameStatus::NotStarted {
                return;
            }
            (record.game_id.clone(), record.send_quiz_at)
        };

        let wait = until(send_at);
        info!(daemon = %self.daemon_id, %game_id, wait_secs = wait.as_secs(), "quiz game upcoming");
        tokio::select! {
            _ = self.scope.cancelled() => {
                warn!(daemon = %self.daemon_id, %game_id, "quiz game terminated before started");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        info!(daemon = %self.daemon_id, %game_id, "quiz game started");
        let game = self.snapshot();
        let handle = match self
            .backend
            .gateway()
            .publish(&game.destination(), messages::question(&game))
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                error!(%game_id, "send quiz game message: {err:#}");
                return;
            }
        };
        if self.scope.is_cancelled() {
            warn!(%game_id, "quiz game terminated while its question was being sent");
            if let Err(err) = self.backend.gateway().retract(&handle).await {
                error!(%game_id, "delete quiz game message: {err:#}");
            }
            return;
        }

        let game = {
            let mut record = lock(&self.record);
            record.question_message_id = Some(handle.message_id);
            record.status = GameStatus::InProgress;
            record.clone()
        };
        if let Err(err) = self.backend.persistence().save_game(&game).await {
            error!(%game_id, "update game started: {err:#}");
        }
    }

    async fn ongoing(&self) {
        let (game_id, question, ends_at) = {
            let record = lock(&self.record);
            if record.status != GameStatus::InProgress {
                return;
            }
            (record.game_id.clone(), record.question_message(), record.ends_at())
        };
        info!(%game_id, "quiz game ongoing");
        let Some(question) = question else {
            error!(%game_id, "game in progress but question message id not found");
            return;
        };

        tokio::select! {
            _ = self.scope.cancelled() => {
                warn!(%game_id, "quiz game terminated when in progress");
                return;
            }
            _ = tokio::time::sleep(until(ends_at)) => {}
        }

        info!(%game_id, "quiz game finished");
        let game = {
            let mut record = lock(&self.record);
            record.status = GameStatus::Finished;
            record.clone()
        };
        if let Err(err) = self
            .backend
            .gateway()
            .edit(&question, messages::closed_question(&game))
            .await
        {
            error!(%game_id, "edit message to finish quiz game: {err:#}");
        }

        let (participants, winners) = match self.tally(&game_id).await {
            Ok(tally) => tally,
            Err(err) => {
                error!(%game_id, "query quiz game participants: {err:#}");
                return;
            }
        };
        let game = {
            let mut record = lock(&self.record);
            record.participants = Some(participants);
            record.winners = Some(winners);
            record.clone()
        };

        match self
            .backend
            .gateway()
            .publish(&game.destination(), messages::answer(&game))
            .await
        {
            Ok(handle) => lock(&self.record).answer_message_id = Some(handle.message_id),
            Err(err) => error!(%game_id, "send quiz game answer message: {err:#}"),
        }

        let game = self.snapshot();
        if let Err(err) = self.backend.persistence().save_game(&game).await {
            error!(%game_id, "update game finished: {err:#}");
        }
    }

    /// Splits the round's votes into participants and winners.
    async fn tally(&self, game_id: &str) -> anyhow::Result<(UserSet, UserSet)> {
        let votes = self.backend.participations().all_votes(game_id).await?;
        let mut participants = UserSet::new();
        let mut winners = UserSet::new();
        for (user_id, vote) in votes {
            if vote.option_id == self.correct_option_id {
                winners.insert(user_id.clone());
            }
            participants.insert(user_id);
        }
        Ok((participants, winners))
    }
}

/// Looks up one user's vote in `game` and grades it.
pub async fn participation_result<B: Backend>(
    backend: &B,
    game: &Game,
    user_id: &str,
) -> Result<ParticipationResult> {
    let mut result = ParticipationResult {
        correct_answer: game.correct_answer_option.clone(),
        ..Default::default()
    };
    let Some(vote) = backend
        .participations()
        .vote_of(&game.game_id, user_id)
        .await
        .map_err(Error::Store)?
    else {
        return Ok(result);
    };

    result.participated = true;
    result.voted_at = Some(vote.voted_at);
    result.chosen_answer = game.answer_for_option(&vote.option_id).map(String::from);
    result.win = result.chosen_answer.as_deref() == Some(game.correct_answer_option.as_str());
    result.chosen_option_id = Some(vote.option_id);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestBackend, game_fixture, test_backend};
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;
    use tokio::time::timeout;

    fn spawn_play(game: &Arc<QuizGame<TestBackend>>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(Arc::clone(game).play())
    }

    fn quick_game(id: &str, start_in_ms: i64, limit_sec: u64) -> Game {
        let mut game = game_fixture(id, "l1");
        game.send_quiz_at = Utc::now() + ChronoDuration::milliseconds(start_in_ms);
        game.time_limit_sec = limit_sec;
        game
    }

    #[tokio::test]
    async fn test_round_runs_to_finish_and_partitions_votes() {
        let backend = test_backend();
        let game = QuizGame::new(Arc::clone(&backend), &CancelScope::root(), quick_game("g1", 50, 1));
        let task = spawn_play(&game);

        // "2" is the correct option of the fixture
        assert!(game.participate("alice", "2").await.unwrap());
        assert!(game.participate("bob", "1").await.unwrap());
        assert!(game.participate("carol", "1").await.unwrap());
        assert!(game.participate("carol", "2").await.unwrap());

        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        let finished = game.snapshot();
        assert_eq!(finished.status, GameStatus::Finished);
        let participants = finished.participants.clone().unwrap();
        assert_eq!(participants.len(), 3);
        let mut winners: Vec<_> = finished.winners.clone().unwrap().into_iter().collect();
        winners.sort();
        assert_eq!(winners, vec!["alice".to_string(), "carol".to_string()]);
        assert!(!participants.contains("dave"));

        let gateway = &backend.gateway;
        assert_eq!(gateway.published().len(), 2);
        assert_eq!(gateway.edited().len(), 1);
        assert!(gateway.edited()[0].1.controls.is_empty());
        let answer = &gateway.published()[1].1;
        assert_eq!(answer.reply_to, finished.question_message());

        let stored = backend.persistence.stored_game("g1").unwrap();
        assert_eq!(stored.status, GameStatus::Finished);
        assert_eq!(stored.winners, game.snapshot().winners);
        assert!(stored.answer_message_id.is_some());
    }

    #[tokio::test]
    async fn test_participate_after_deadline_is_declined() {
        let backend = test_backend();
        let mut record = quick_game("g1", -5_000, 1);
        record.status = GameStatus::Finished;
        let game = QuizGame::new(Arc::clone(&backend), &CancelScope::root(), record);

        assert!(!game.participate("alice", "2").await.unwrap());
        assert!(backend.participations.all_votes("g1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_participate_rejects_unknown_option() {
        let backend = test_backend();
        let game = QuizGame::new(Arc::clone(&backend), &CancelScope::root(), quick_game("g1", 0, 60));
        let err = game.participate("alice", "7").await.unwrap_err();
        assert!(matches!(err, Error::UnknownOption { .. }));
        assert!(backend.participations.all_votes("g1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_terminate_before_start_publishes_nothing() {
        let backend = test_backend();
        let game = QuizGame::new(Arc::clone(&backend), &CancelScope::root(), quick_game("g1", 60_000, 30));
        let task = spawn_play(&game);

        game.terminate().await.unwrap();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        assert_eq!(game.status(), GameStatus::NotStarted);
        assert!(backend.gateway.published().is_empty());
        assert!(game.winners().is_empty());
    }

    #[tokio::test]
    async fn test_terminate_in_progress_retracts_question() {
        let backend = test_backend();
        let game = QuizGame::new(Arc::clone(&backend), &CancelScope::root(), quick_game("g1", 0, 60));
        let task = spawn_play(&game);
        backend.gateway.wait_for_publish(1).await;
        while game.status() != GameStatus::InProgress {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        game.terminate().await.unwrap();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        let question = game.snapshot().question_message().unwrap();
        assert_eq!(backend.gateway.retracted(), vec![question]);
        assert!(game.snapshot().winners.is_none());
    }

    #[tokio::test]
    async fn test_cancel_during_publish_retracts_question() {
        let backend = test_backend();
        backend.gateway.hold_publishes(true);
        let game = QuizGame::new(Arc::clone(&backend), &CancelScope::root(), quick_game("g1", 0, 60));
        let task = spawn_play(&game);
        while backend.gateway.publish_attempts() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        game.terminate().await.unwrap();
        backend.gateway.hold_publishes(false);
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        let published = backend.gateway.published();
        assert_eq!(published.len(), 1);
        let retracted = backend.gateway.retracted();
        assert_eq!(retracted.len(), 1);
        assert_eq!(retracted[0].message_id, "message-0");
        assert_eq!(game.status(), GameStatus::NotStarted);
        assert!(backend.persistence.stored_game("g1").is_none());
    }

    #[tokio::test]
    async fn test_terminate_fails_when_retraction_fails() {
        let backend = test_backend();
        let game = QuizGame::new(Arc::clone(&backend), &CancelScope::root(), quick_game("g1", 0, 60));
        let task = spawn_play(&game);
        backend.gateway.wait_for_publish(1).await;
        while game.status() != GameStatus::InProgress {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        backend.gateway.fail_retractions(true);

        let err = game.terminate().await.unwrap_err();
        assert!(matches!(err, Error::Unterminable(_)));
        assert_eq!(game.status(), GameStatus::InProgress);
        assert!(!task.is_finished());
        task.abort();
    }

    #[tokio::test]
    async fn test_finished_round_cannot_terminate() {
        let backend = test_backend();
        let mut record = quick_game("g1", -5_000, 1);
        record.status = GameStatus::Finished;
        let game = QuizGame::new(backend, &CancelScope::root(), record);
        assert!(matches!(game.terminate().await, Err(Error::GameFinished(_))));
    }

    #[tokio::test]
    async fn test_parent_cancel_stops_round() {
        let backend = test_backend();
        let lottery_scope = CancelScope::root();
        let game = QuizGame::new(Arc::clone(&backend), &lottery_scope, quick_game("g1", 60_000, 30));
        let task = spawn_play(&game);
        lottery_scope.cancel();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(backend.gateway.published().is_empty());
    }

    #[tokio::test]
    async fn test_participation_result_grades_vote() {
        let backend = test_backend();
        let game = QuizGame::new(Arc::clone(&backend), &CancelScope::root(), quick_game("g1", 0, 60));
        game.participate("alice", "1").await.unwrap();

        let result = game.participation_of("alice").await.unwrap();
        assert!(result.participated);
        assert!(!result.win);
        assert_eq!(result.chosen_answer.as_deref(), Some("red"));
        assert_eq!(result.correct_answer, "green");

        let nobody = game.participation_of("bob").await.unwrap();
        assert!(!nobody.participated);
    }
}

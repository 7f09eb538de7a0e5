use anyhow::{Result, anyhow, bail};
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::engine::Registry;
use crate::error::Error;
use crate::messages::lottery_result_reply;
use crate::services::{Backend, Persistence};
use crate::types::{Game, GameStatus, Lottery, LotteryStatus, RewardType};
use crate::utils::{from_millis, new_cut_uuid};

const MAX_ANSWER_OPTIONS: usize = 9;
const MAX_TIME_LIMIT_SEC: i64 = 24 * 3_600;
// 9999-12-31T23:59:59.999Z
const MAX_SEND_QUIZ_AT_MILLIS: i64 = 253_402_300_799_999;

fn str_arg<'a>(arguments: &'a HashMap<String, Value>, key: &str) -> Result<&'a str> {
    arguments
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("Missing {key} parameter"))
}

fn opt_str_arg<'a>(arguments: &'a HashMap<String, Value>, key: &str) -> Option<&'a str> {
    arguments
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
}

fn i64_arg(arguments: &HashMap<String, Value>, key: &str) -> Result<i64> {
    arguments
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| anyhow!("Missing {key} parameter"))
}

/// Admin operations on lotteries and rounds. Requests are validated here,
/// persisted, and only then handed to the registry.
pub struct QuizUseCase<B: Backend> {
    registry: Arc<Registry<B>>,
}

impl<B: Backend> QuizUseCase<B> {
    pub fn new(registry: Arc<Registry<B>>) -> Self {
        Self { registry }
    }

    fn persistence(&self) -> &B::Persistence {
        self.registry.backend().persistence()
    }

    pub async fn save_lottery(&self, arguments: &HashMap<String, Value>) -> Result<String> {
        let lottery_id = str_arg(arguments, "lottery_id")?;
        let winner_num = i64_arg(arguments, "winner_num")?;
        let reward_type = str_arg(arguments, "reward_type")?;
        let reward_amount = i64_arg(arguments, "reward_amount")?;
        let total_quiz_num = i64_arg(arguments, "total_quiz_num")?;
        let required = i64_arg(arguments, "winner_required_correct_quiz_num")?;

        if lottery_id.is_empty() {
            bail!("invalid lottery id");
        }
        if winner_num <= 0 {
            bail!("invalid winner numbers");
        }
        let reward_type = RewardType::parse(reward_type).ok_or_else(|| anyhow!("invalid reward type"))?;
        if reward_amount <= 0 {
            bail!("invalid reward amount");
        }
        if total_quiz_num <= 0 {
            bail!("invalid total quiz num");
        }
        if required <= 0 {
            bail!("invalid correct quiz num");
        }
        if required > total_quiz_num {
            bail!("correct quiz num must not greater than total quiz num");
        }

        let existing = self.persistence().select_lottery(lottery_id).await?;
        if existing.as_ref().is_some_and(|l| l.is_finished()) {
            bail!("lottery already finished");
        }
        let lottery = Lottery {
            lottery_id: lottery_id.to_string(),
            status: LotteryStatus::NotStarted,
            allowed_winner_num: winner_num as usize,
            reward_type,
            reward_amount,
            total_quiz_num: total_quiz_num as usize,
            winner_required_correct_quiz_num: required as usize,
            winners: Default::default(),
            created_at: existing.as_ref().map_or_else(Utc::now, |l| l.created_at),
            ended_at: None,
            deleted_at: None,
        };
        self.persistence().save_lottery(&lottery).await?;
        self.registry.add_lottery(lottery);

        Ok(json!({
            "success": true,
            "lottery_id": lottery_id,
            "message": format!("Successfully saved lottery {}", lottery_id)
        })
        .to_string())
    }

    pub async fn delete_lottery(&self, arguments: &HashMap<String, Value>) -> Result<String> {
        let lottery_id = str_arg(arguments, "lottery_id")?;
        let mut lottery = self
            .persistence()
            .select_lottery(lottery_id)
            .await?
            .filter(|l| l.deleted_at.is_none())
            .ok_or_else(|| anyhow!("unknown lottery"))?;
        if lottery.is_finished() {
            bail!("lottery already finished");
        }
        let games = self
            .persistence()
            .select_games_by_lottery_ids(&[lottery_id.to_string()])
            .await?;
        if !games.is_empty() {
            bail!("lottery still has {} games", games.len());
        }

        lottery.deleted_at = Some(Utc::now());
        self.persistence().save_lottery(&lottery).await?;
        self.registry.terminate_lottery(lottery_id).await?;

        Ok(json!({
            "success": true,
            "lottery_id": lottery_id,
            "message": format!("Successfully deleted lottery {}", lottery_id)
        })
        .to_string())
    }

    pub async fn save_game(&self, arguments: &HashMap<String, Value>) -> Result<String> {
        let (lottery, game) = self.validate_save_game(arguments).await?;
        let game_id = game.game_id.clone();

        self.persistence().save_game(&game).await?;
        // An idle lottery may have been retired since it was saved.
        self.registry.add_lottery(lottery);
        self.registry.add_game(game).await?;

        Ok(json!({
            "success": true,
            "game_id": game_id,
            "message": format!("Successfully saved game {}", game_id)
        })
        .to_string())
    }

    async fn validate_save_game(&self, arguments: &HashMap<String, Value>) -> Result<(Lottery, Game)> {
        let lottery_id = opt_str_arg(arguments, "lottery_id")
            .ok_or_else(|| anyhow!("lottery id not present"))?;
        let lottery = self
            .persistence()
            .select_lottery(lottery_id)
            .await?
            .filter(|l| l.deleted_at.is_none())
            .ok_or_else(|| anyhow!("unknown lottery"))?;
        if lottery.is_finished() {
            bail!("lottery already finished");
        }

        let guild_id = opt_str_arg(arguments, "guild_id").ok_or_else(|| anyhow!("guild id not present"))?;
        let channel_id =
            opt_str_arg(arguments, "channel_id").ok_or_else(|| anyhow!("channel id not present"))?;
        let time_limit_sec = i64_arg(arguments, "time_limit_sec")?;
        if time_limit_sec <= 0 || time_limit_sec > MAX_TIME_LIMIT_SEC {
            bail!("invalid game time limit");
        }
        let send_quiz_at = i64_arg(arguments, "send_quiz_at")?;
        let send_quiz_at = Some(send_quiz_at)
            .filter(|millis| (0..=MAX_SEND_QUIZ_AT_MILLIS).contains(millis))
            .and_then(from_millis)
            .ok_or_else(|| anyhow!("invalid send quiz time"))?;
        let question_description = opt_str_arg(arguments, "question_description")
            .ok_or_else(|| anyhow!("question description not present"))?;

        let answer_options: Vec<String> = arguments
            .get("answer_options")
            .and_then(|v| v.as_array())
            .map(|options| {
                options
                    .iter()
                    .filter_map(|o| o.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        if answer_options.len() < 2 || answer_options.len() > MAX_ANSWER_OPTIONS {
            bail!("answer option size should be [2,{MAX_ANSWER_OPTIONS}]");
        }
        let correct_answer_option = opt_str_arg(arguments, "correct_answer_option")
            .ok_or_else(|| anyhow!("correct answer not present"))?;
        if !answer_options.iter().any(|o| o == correct_answer_option) {
            bail!("correct answer not found in answer options");
        }
        let distinct: HashSet<&String> = answer_options.iter().collect();
        if distinct.len() != answer_options.len() {
            bail!("duplicate answer option found");
        }

        let game_id = match opt_str_arg(arguments, "game_id") {
            Some(game_id) => {
                let stored = self
                    .persistence()
                    .select_game(game_id)
                    .await?
                    .filter(|g| g.deleted_at.is_none())
                    .ok_or_else(|| anyhow!("game not found"))?;
                if stored.status != GameStatus::NotStarted {
                    bail!("game already started");
                }
                if stored.lottery_id != lottery_id {
                    bail!("game belongs to another lottery");
                }
                game_id.to_string()
            }
            None => {
                let games = self
                    .persistence()
                    .select_games_by_lottery_ids(&[lottery_id.to_string()])
                    .await?;
                if games.len() >= lottery.total_quiz_num {
                    bail!("too many games in lottery");
                }
                new_cut_uuid()
            }
        };

        let game = Game {
            game_id,
            lottery_id: lottery_id.to_string(),
            guild_id: guild_id.to_string(),
            channel_id: channel_id.to_string(),
            time_limit_sec: time_limit_sec as u64,
            send_quiz_at,
            status: GameStatus::NotStarted,
            question_description: question_description.to_string(),
            answer_options,
            correct_answer_option: correct_answer_option.to_string(),
            participants: None,
            winners: None,
            question_message_id: None,
            answer_message_id: None,
            deleted_at: None,
        };
        Ok((lottery, game))
    }

    pub async fn delete_game(&self, arguments: &HashMap<String, Value>) -> Result<String> {
        let game_id = opt_str_arg(arguments, "game_id").ok_or_else(|| anyhow!("game id not present"))?;
        let mut game = self
            .persistence()
            .select_game(game_id)
            .await?
            .filter(|g| g.deleted_at.is_none())
            .ok_or_else(|| anyhow!("game not found"))?;
        if game.status != GameStatus::NotStarted {
            bail!("game already started");
        }

        game.deleted_at = Some(Utc::now());
        self.persistence().save_game(&game).await?;
        match self.registry.remove_game(&game.lottery_id, game_id).await {
            Ok(()) | Err(Error::LotteryNotFound(_)) => {}
            Err(err) => {
                // still running, keep it recoverable
                game.deleted_at = None;
                self.persistence().save_game(&game).await?;
                return Err(err.into());
            }
        }

        Ok(json!({
            "success": true,
            "game_id": game_id,
            "message": format!("Successfully deleted game {}", game_id)
        })
        .to_string())
    }

    pub async fn participate(&self, arguments: &HashMap<String, Value>) -> Result<String> {
        let game_id = str_arg(arguments, "game_id")?;
        let user_id = str_arg(arguments, "user_id")?;
        let option_id = str_arg(arguments, "option_id")?;

        let accepted = self.registry.participate(game_id, user_id, option_id).await?;
        Ok(json!({
            "success": true,
            "accepted": accepted
        })
        .to_string())
    }

    pub async fn check_game_result(&self, arguments: &HashMap<String, Value>) -> Result<String> {
        let game_id = str_arg(arguments, "game_id")?;
        let user_id = str_arg(arguments, "user_id")?;

        let result = self.registry.check_game_result(game_id, user_id).await?;
        Ok(json!({
            "success": true,
            "reply": result.reply_content(),
            "result": result
        })
        .to_string())
    }

    pub async fn check_lottery_result(&self, arguments: &HashMap<String, Value>) -> Result<String> {
        let lottery_id = str_arg(arguments, "lottery_id")?;
        let user_id = str_arg(arguments, "user_id")?;

        let winner = self.registry.check_lottery_result(lottery_id, user_id).await?;
        Ok(json!({
            "success": true,
            "winner": winner,
            "reply": lottery_result_reply(winner)
        })
        .to_string())
    }

    pub async fn get_game(&self, arguments: &HashMap<String, Value>) -> Result<String> {
        let game_id = str_arg(arguments, "game_id")?;

        if let Some(game) = self.registry.get_game(game_id) {
            return Ok(json!({
                "success": true,
                "live": true,
                "game": game.snapshot()
            })
            .to_string());
        }
        let game = self.persistence().select_game(game_id).await?;
        Ok(json!({
            "success": game.is_some(),
            "live": false,
            "game": game
        })
        .to_string())
    }

    pub async fn get_lottery(&self, arguments: &HashMap<String, Value>) -> Result<String> {
        let lottery_id = str_arg(arguments, "lottery_id")?;

        if let Some(lottery) = self.registry.get_lottery(lottery_id) {
            return Ok(json!({
                "success": true,
                "live": true,
                "lottery": lottery.snapshot(),
                "games": lottery.game_count(),
                "pending_games": lottery.pending_games()
            })
            .to_string());
        }
        let lottery = self.persistence().select_lottery(lottery_id).await?;
        Ok(json!({
            "success": lottery.is_some(),
            "live": false,
            "lottery": lottery
        })
        .to_string())
    }
}

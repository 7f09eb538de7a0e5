use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Set of chat user identities. No ordering is ever required of it.
pub type UserSet = HashSet<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LotteryStatus {
    NotStarted,
    Finished,
}

impl LotteryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LotteryStatus::NotStarted => "not_started",
            LotteryStatus::Finished => "finished",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "not_started" => Some(LotteryStatus::NotStarted),
            "finished" => Some(LotteryStatus::Finished),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardType {
    ArcToken,
    Dragonball,
}

impl RewardType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewardType::ArcToken => "arc_token",
            RewardType::Dragonball => "dragonball",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "arc_token" => Some(RewardType::ArcToken),
            "dragonball" => Some(RewardType::Dragonball),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lottery {
    pub lottery_id: String,
    pub status: LotteryStatus,
    pub allowed_winner_num: usize,
    pub reward_type: RewardType,
    pub reward_amount: i64,
    pub total_quiz_num: usize,
    pub winner_required_correct_quiz_num: usize,
    #[serde(default)]
    pub winners: UserSet,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Lottery {
    pub fn is_finished(&self) -> bool {
        self.status == LotteryStatus::Finished
    }

    /// Takes the operator-editable fields of `update`, leaving winners and timestamps alone.
    pub fn merge_config(&mut self, update: &Lottery) {
        self.status = update.status;
        self.allowed_winner_num = update.allowed_winner_num;
        self.reward_type = update.reward_type;
        self.reward_amount = update.reward_amount;
        self.total_quiz_num = update.total_quiz_num;
        self.winner_required_correct_quiz_num = update.winner_required_correct_quiz_num;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    NotStarted,
    InProgress,
    Finished,
}

impl GameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameStatus::NotStarted => "not_started",
            GameStatus::InProgress => "in_progress",
            GameStatus::Finished => "finished",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "not_started" => Some(GameStatus::NotStarted),
            "in_progress" => Some(GameStatus::InProgress),
            "finished" => Some(GameStatus::Finished),
            _ => None,
        }
    }
}

/// Where a round posts its messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub guild_id: String,
    pub channel_id: String,
}

/// A message published through the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageHandle {
    pub channel_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Game {
    pub game_id: String,
    pub lottery_id: String,
    pub guild_id: String,
    pub channel_id: String,
    pub time_limit_sec: u64,
    pub send_quiz_at: DateTime<Utc>,
    pub status: GameStatus,
    pub question_description: String,
    pub answer_options: Vec<String>,
    pub correct_answer_option: String,
    #[serde(default)]
    pub participants: Option<UserSet>,
    #[serde(default)]
    pub winners: Option<UserSet>,
    #[serde(default)]
    pub question_message_id: Option<String>,
    #[serde(default)]
    pub answer_message_id: Option<String>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Game {
    pub fn destination(&self) -> Destination {
        Destination {
            guild_id: self.guild_id.clone(),
            channel_id: self.channel_id.clone(),
        }
    }

    pub fn question_message(&self) -> Option<MessageHandle> {
        self.question_message_id.as_ref().map(|id| MessageHandle {
            channel_id: self.channel_id.clone(),
            message_id: id.clone(),
        })
    }

    /// Instant after which votes are no longer accepted.
    /// Saturates at the latest representable instant.
    pub fn ends_at(&self) -> DateTime<Utc> {
        i64::try_from(self.time_limit_sec)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|limit| self.send_quiz_at.checked_add_signed(limit))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now > self.ends_at()
    }

    /// 1-based option id of the correct answer, as rendered in the question controls.
    pub fn correct_option_id(&self) -> Option<String> {
        self.answer_options
            .iter()
            .position(|option| *option == self.correct_answer_option)
            .map(|index| (index + 1).to_string())
    }

    pub fn answer_for_option(&self, option_id: &str) -> Option<&str> {
        let index = option_id.parse::<usize>().ok()?;
        self.answer_options
            .get(index.checked_sub(1)?)
            .map(String::as_str)
    }
}

/// A user's latest choice in a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub option_id: String,
    /// Unix millis.
    pub voted_at: i64,
}

/// Downstream reward record created when a lottery finishes.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RewardClaim {
    pub quest_id: String,
    pub quest_name: String,
    pub quest_description: String,
    pub reward_type: RewardType,
    pub reward_amount: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub claimable_duration_hours: u64,
    pub whitelist_id: String,
    pub whitelist_name: String,
    pub winners: Vec<String>,
}

impl RewardClaim {
    pub fn for_lottery(
        lottery: &Lottery,
        ended_at: DateTime<Utc>,
        claim_window: std::time::Duration,
        claimable_duration_hours: u64,
    ) -> Self {
        let date = ended_at.format("%b.%d");
        let quest_description = if lottery.total_quiz_num == lottery.winner_required_correct_quiz_num
        {
            "Answer all Q&A correctly".to_string()
        } else {
            format!(
                "Answer {} out of {} Q&A correctly",
                lottery.winner_required_correct_quiz_num, lottery.total_quiz_num
            )
        };
        let mut winners: Vec<String> = lottery.winners.iter().cloned().collect();
        winners.sort();
        let end_time = Duration::from_std(claim_window)
            .ok()
            .and_then(|window| ended_at.checked_add_signed(window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            quest_id: format!("quiz-lottery-{}", lottery.lottery_id),
            quest_name: format!("{} Q&A", date),
            quest_description,
            reward_type: lottery.reward_type,
            reward_amount: lottery.reward_amount,
            start_time: ended_at,
            end_time,
            claimable_duration_hours,
            whitelist_id: format!("quiz-lottery-{}-winners", lottery.lottery_id),
            whitelist_name: format!("{} Q&A Winners", date),
            winners,
        }
    }
}

/// What one user did in one round, for the "check your result" reply.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ParticipationResult {
    pub participated: bool,
    pub voted_at: Option<i64>,
    pub chosen_option_id: Option<String>,
    pub chosen_answer: Option<String>,
    pub correct_answer: String,
    pub win: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{game_fixture, lottery_fixture};
    use chrono::TimeZone;

    #[test]
    fn test_correct_option_id_is_one_based() {
        let mut game = game_fixture("g1", "l1");
        game.answer_options = vec!["red".into(), "green".into(), "blue".into()];
        game.correct_answer_option = "blue".into();
        assert_eq!(game.correct_option_id().as_deref(), Some("3"));
        assert_eq!(game.answer_for_option("1"), Some("red"));
        assert_eq!(game.answer_for_option("0"), None);
        assert_eq!(game.answer_for_option("4"), None);
        assert_eq!(game.answer_for_option("x"), None);
    }

    #[test]
    fn test_expiry_is_inclusive_of_the_deadline() {
        let mut game = game_fixture("g1", "l1");
        game.send_quiz_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        game.time_limit_sec = 30;
        let deadline = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 30).unwrap();
        assert!(!game.expired(deadline));
        assert!(game.expired(deadline + Duration::milliseconds(1)));
    }

    #[test]
    fn test_ends_at_saturates_on_huge_limits() {
        let mut game = game_fixture("g1", "l1");
        game.time_limit_sec = 10_000_000_000_000_000;
        assert_eq!(game.ends_at(), DateTime::<Utc>::MAX_UTC);
        assert!(!game.expired(Utc::now()));

        game.time_limit_sec = u64::MAX;
        assert_eq!(game.ends_at(), DateTime::<Utc>::MAX_UTC);

        game.time_limit_sec = 60;
        game.send_quiz_at = DateTime::<Utc>::MAX_UTC - Duration::seconds(10);
        assert_eq!(game.ends_at(), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_status_strings_round_trip() {
        for status in [GameStatus::NotStarted, GameStatus::InProgress, GameStatus::Finished] {
            assert_eq!(GameStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(LotteryStatus::parse("finished"), Some(LotteryStatus::Finished));
        assert_eq!(RewardType::parse("gold"), None);
    }

    #[test]
    fn test_reward_claim_describes_requirement() {
        let ended_at = Utc.with_ymd_and_hms(2024, 1, 5, 20, 0, 0).unwrap();
        let mut lottery = lottery_fixture("l1");
        lottery.total_quiz_num = 3;
        lottery.winner_required_correct_quiz_num = 2;
        lottery.winners = ["bob", "alice"].into_iter().map(String::from).collect();

        let claim = RewardClaim::for_lottery(
            &lottery,
            ended_at,
            std::time::Duration::from_secs(72 * 3600),
            360,
        );
        assert_eq!(claim.quest_id, "quiz-lottery-l1");
        assert_eq!(claim.quest_name, "Jan.05 Q&A");
        assert_eq!(claim.quest_description, "Answer 2 out of 3 Q&A correctly");
        assert_eq!(claim.end_time - claim.start_time, Duration::hours(72));
        assert_eq!(claim.winners, vec!["alice".to_string(), "bob".to_string()]);

        lottery.winner_required_correct_quiz_num = 3;
        let claim = RewardClaim::for_lottery(
            &lottery,
            ended_at,
            std::time::Duration::from_secs(3600),
            360,
        );
        assert_eq!(claim.quest_description, "Answer all Q&A correctly");
    }
}

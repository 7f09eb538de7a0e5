use crate::types::{Game, Lottery, MessageHandle, ParticipationResult};
use serde::Serialize;

pub const QUIZ_GAME_CUSTOM_ID_PREFIX: &str = "quiz_game_";
pub const QUIZ_GAME_CHECK_RESULT_CUSTOM_ID_PREFIX: &str = "quiz_check_";
pub const QUIZ_LOTTERY_CHECK_RESULT_CUSTOM_ID_PREFIX: &str = "quiz_lottery_check_";

const ANSWER_OPTION_EMOJIS: [&str; 9] = ["1️⃣", "2️⃣", "3️⃣", "4️⃣", "5️⃣", "6️⃣", "7️⃣", "8️⃣", "9️⃣"];

/// Platform-neutral message content handed to the gateway.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutboundMessage {
    pub content: Option<String>,
    pub embed: Option<Embed>,
    /// Empty means "no interactive controls", which also strips them on edit.
    pub controls: Vec<Control>,
    pub reply_to: Option<MessageHandle>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Embed {
    pub title: Option<String>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Control {
    Select {
        custom_id: String,
        placeholder: String,
        options: Vec<SelectOption>,
    },
    Button {
        custom_id: String,
        label: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectOption {
    pub label: String,
    pub value: String,
    pub emoji: String,
}

fn question_embed(game: &Game) -> Embed {
    Embed {
        title: Some("Let's Play The Quiz Game".to_string()),
        description: format!(
            "**Question**\n{}\n\n**Time Allowed: {} s**",
            game.question_description, game.time_limit_sec
        ),
    }
}

/// Question with the answer picker, posted when the round starts.
pub fn question(game: &Game) -> OutboundMessage {
    let options = game
        .answer_options
        .iter()
        .enumerate()
        .map(|(i, label)| SelectOption {
            label: label.clone(),
            value: (i + 1).to_string(),
            emoji: ANSWER_OPTION_EMOJIS.get(i).copied().unwrap_or_default().to_string(),
        })
        .collect();

    OutboundMessage {
        embed: Some(question_embed(game)),
        controls: vec![Control::Select {
            custom_id: format!("{}{}", QUIZ_GAME_CUSTOM_ID_PREFIX, game.game_id),
            placeholder: "Choose your answer here 👇".to_string(),
            options,
        }],
        ..Default::default()
    }
}

/// The question again, without controls, once voting is over.
pub fn closed_question(game: &Game) -> OutboundMessage {
    OutboundMessage {
        embed: Some(question_embed(game)),
        ..Default::default()
    }
}

/// Correct answer and participation counts, replying to the question.
pub fn answer(game: &Game) -> OutboundMessage {
    let participants = game.participants.as_ref().map_or(0, |p| p.len());
    let winners = game.winners.as_ref().map_or(0, |w| w.len());
    OutboundMessage {
        embed: Some(Embed {
            title: None,
            description: format!(
                "**Correct Answer**\n{}\n\n**Participation Information**\nTotal {} participants, including {} winners.",
                game.correct_answer_option, participants, winners
            ),
        }),
        controls: vec![Control::Button {
            custom_id: format!("{}{}", QUIZ_GAME_CHECK_RESULT_CUSTOM_ID_PREFIX, game.game_id),
            label: "Click this button to check your result.".to_string(),
        }],
        reply_to: game.question_message(),
        ..Default::default()
    }
}

pub fn lottery_announcement(lottery: &Lottery) -> OutboundMessage {
    OutboundMessage {
        content: Some(format!(
            "@everyone\n There are {} winners of tonight's quick quiz!  \u{1F973} \n\n\
             Please make sure that you've connected your wallet and your chat account, \
             or you will NOT receive the reward.\n\n\
             The rewards will be distributed in 3 days in the rewards page.",
            lottery.winners.len()
        )),
        controls: vec![Control::Button {
            custom_id: format!(
                "{}{}",
                QUIZ_LOTTERY_CHECK_RESULT_CUSTOM_ID_PREFIX, lottery.lottery_id
            ),
            label: "Click this button to check your result.".to_string(),
        }],
        ..Default::default()
    }
}

impl ParticipationResult {
    pub fn reply_content(&self) -> String {
        if !self.participated {
            return "`Sorry, you did not participate the quiz this time. Remember to come next time! 🖖.`".to_string();
        }
        if self.win {
            return "`Congrats! You won the quiz! \u{1F973}.`".to_string();
        }
        format!(
            "`Sorry, your choice seems not right. Better luck next time! 😢. \nWhat you've chosen: {}\nThe correct answer: {}`",
            self.chosen_answer.as_deref().unwrap_or_default(),
            self.correct_answer
        )
    }
}

pub fn lottery_result_reply(won: bool) -> &'static str {
    if won {
        "Congrats! You are one of the winners. Collect your reward on the rewards page within 15 days."
    } else {
        "Sorry, you are not among the winners this time. Better luck next time!"
    }
}

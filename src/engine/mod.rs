//! Round scheduling, lottery orchestration and the process-wide registry.

pub mod game;
pub mod lottery;
pub mod registry;
pub mod scope;
pub mod winners;

pub use game::QuizGame;
pub use lottery::{Phase, QuizLottery};
pub use registry::Registry;
pub use scope::CancelScope;

pub(crate) use crate::utils::{lock, read, write};

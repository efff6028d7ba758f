pub mod provider;
pub mod sealer;

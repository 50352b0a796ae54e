/// Errors returned when validating a [`FuzzingConfig`](crate::FuzzingConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("at least one worker is required")]
    ZeroWorkers,
    #[error("call sequence length must be non-zero")]
    ZeroCallSequenceLength,
    #[error("at least one sender address is required")]
    NoSenders,
    #[error("new sequence probability must be within [0, 1], got {0}")]
    InvalidNewSequenceProbability(f32),
}

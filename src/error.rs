use thiserror::Error;

/// Error taxonomy for the session/research core.
///
/// Propagation policy: tool failures are absorbed per sub-question,
/// orchestrator failures are absorbed only before any content has been
/// streamed, store failures are never absorbed.
#[derive(Debug, Error)]
pub enum Error {
    /// Backing medium for the session store is unreachable. Fatal for the
    /// current request; never degraded to memory-only mode.
    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),

    /// An external tool/search call failed. The affected sub-question
    /// contributes nothing; the pipeline continues.
    #[error("tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    /// The provider rejected the sampling-temperature parameter.
    /// Retried once automatically with the parameter stripped.
    #[error("provider rejected temperature parameter")]
    TemperatureRejected,

    /// LLM completion unavailable or broken mid-stream.
    #[error("completion failed: {0}")]
    CompletionFailed(String),

    /// The wall-clock budget for the whole pipeline ran out.
    #[error("research budget exhausted after {0:?}")]
    BudgetExhausted(std::time::Duration),

    /// The follow-up loop hit its iteration cap with gaps still open.
    #[error("follow-up iteration limit ({0}) reached")]
    MaxTurnsExceeded(usize),

    /// The consumer disconnected. Propagated to in-flight work,
    /// never logged as an application error.
    #[error("stream consumer disconnected")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

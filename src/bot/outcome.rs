/// Why a message was dropped before the consent gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Authored by a bot account, this one included
    FromBot,
    /// Neither a DM nor a mention of this bot
    OutOfScope,
}

/// What the pipeline did with one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Dropped silently
    Ignored(IgnoreReason),
    /// The sender has not consented; the policy notice was sent
    ConsentRequested,
    /// The sender just consented; the confirmation was sent
    ConsentGranted,
    /// Too soon after the sender's previous message; the notice was sent
    RateLimited,
    /// A generated (or fallback) reply was sent in `chunks` parts
    Replied {
        /// Number of messages the reply was split into
        chunks: usize,
    },
    /// An unexpected step failed; the apology was sent
    Failed,
    /// A reply could not be delivered; `sent` parts went out before the failure
    DispatchFailed {
        /// Parts delivered before the failure
        sent: usize,
    },
}

impl PipelineOutcome {
    /// Whether the message reached the generator
    #[must_use]
    pub const fn generated(&self) -> bool {
        matches!(self, Self::Replied { .. } | Self::DispatchFailed { .. })
    }
}

use thiserror::Error;

/// Errors surfaced by the conversation core to the presentation layer.
#[derive(Error, Debug)]
pub enum ChatError {
    /// A private conversation needs two distinct participants.
    #[error("Cannot open a private conversation with yourself")]
    SelfConversation,

    #[error("Message text cannot be empty")]
    EmptyMessage,

    #[error("Invalid user id: {0:?}")]
    InvalidUserId(String),

    #[error("No conversation selected")]
    NoConversationSelected,

    /// Writing the message failed; the draft should be kept for a resend.
    #[error("Could not send message: {0:#}")]
    Send(anyhow::Error),

    /// Creating the private conversation record failed.
    #[error("Could not create conversation: {0:#}")]
    Materialize(anyhow::Error),
}

impl ChatError {
    /// Contract violations are rejected before any I/O happens.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            ChatError::SelfConversation | ChatError::EmptyMessage | ChatError::InvalidUserId(_)
        )
    }
}

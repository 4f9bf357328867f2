use serde::{Deserialize, Serialize};

/// Represents the current state of the user dialogue
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum State {
    /// Normal operation, messages are handled according to the active mode
    #[default]
    Start,
    /// Admin is expected to send the broadcast text
    AwaitingBroadcast,
}

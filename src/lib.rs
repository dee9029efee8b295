//! Client core for the study assistant: the agent's streamed answers and the
//! text-to-speech relay.

pub mod client;
pub mod decoder;
pub mod error;
pub mod lines;
pub mod playback;
pub mod protocol;
pub mod socketio;
pub mod tts;

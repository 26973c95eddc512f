#![forbid(unsafe_code)]

// voxroom library - room & session orchestration for an audio-conference SFU

pub mod engine;
pub mod room;
pub mod signaling;

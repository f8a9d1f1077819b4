pub mod audio;
pub mod audio_io;
pub mod block;
pub mod command;
pub mod config;
pub mod demod;
pub mod dsp;
pub mod error;
pub mod queue;
pub mod spectrum;

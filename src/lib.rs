pub mod annotation;
pub mod config;
pub mod evaluate;
pub mod music;
pub mod pipeline;
pub mod recognition;
pub mod scoring;
pub mod template;
pub mod timeline;

/// Audio file extensions we can decode
pub const SUPPORTED_EXTENSIONS: &[&str] = &["wav", "flac"];

/// Application name for XDG paths
pub const APP_NAME: &str = "chordify";

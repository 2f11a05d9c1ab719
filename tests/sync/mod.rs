// Test module entry point for sync tests
// Pipeline, handler and gateway integration tests organized here

mod common;
mod engine_tests;
mod handler_tests;
mod watcher_tests;

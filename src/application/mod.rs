pub mod bootstrap;
pub mod commands;
pub mod coordinator;
pub mod reconciler;

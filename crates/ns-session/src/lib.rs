//! Terminal-driving layer: a detached tmux session wrapper and the usage
//! scraper that runs provider CLIs inside it.

pub mod scraper;
pub mod tmux;

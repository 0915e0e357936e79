pub mod add;
pub mod common;
pub mod completions;
pub mod edit;
pub mod list;
pub mod queue;
pub mod rm;
pub mod status;
pub mod sync;
pub mod watch;

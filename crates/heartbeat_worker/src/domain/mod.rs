mod compacting_handler;
mod handler_config;
mod notification_handler;
mod process_all_handler;
mod reconciler;
mod synchronous_handler;
mod updater;

pub use compacting_handler::*;
pub use handler_config::*;
pub use notification_handler::*;
pub use process_all_handler::*;
pub use reconciler::*;
pub use synchronous_handler::*;
pub use updater::*;

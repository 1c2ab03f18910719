pub mod formatters;
pub mod senders;
pub mod sink;

pub use formatters::{formatter_for, ConsoleFormatter, DataFormatter, JsonFormatter, Reading};
pub use senders::{ConsoleSender, DataSender, FileSender, LogSender};
pub use sink::{MeasurementSink, PublishingSink};

pub(crate) mod command;
pub(crate) mod connect;
pub(crate) mod scan;
pub(crate) mod ui;

pub use self::command::{Args, Command, FakeArgs, LogLevel, OutputFormat};
pub use self::connect::ConnectArgs;
pub use self::scan::ScanArgs;

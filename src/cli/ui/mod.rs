mod device_table;
mod event_line;
mod painter;
mod spinner;
mod table;

pub(crate) use self::device_table::DeviceTableView;
pub(crate) use self::event_line::EventLine;
pub(crate) use self::painter::Painter;
pub(crate) use self::spinner::Spinner;

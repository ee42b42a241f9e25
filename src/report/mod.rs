pub mod line_protocol;
pub mod sender;

pub use line_protocol::{escape_tag, format_line};
pub use sender::{resolve_endpoint, ReportSender};

pub mod market_calendar;

pub use market_calendar::resolve_as_of_date;

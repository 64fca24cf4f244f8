pub mod appender;
pub mod scrape;

use std::io;
use tracing::Level;
use tracing_appender::rolling;
use tracing_subscriber::filter::FilterFn;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Default stdout filter; `LORELINK_LOG` replaces it when set.
const STDOUT_FILTER: &str = "info,llm_request=info,web_request=warn,db_query=warn,sqlx=off";
const FILE_FILTER: &str = "info,llm_request=debug,matching=debug,checkpoint=debug,sqlx=info";

pub fn configure_logging() {
    // reqwest/hyper connection chatter drowns out the per-entity lines
    let custom_filter = FilterFn::new(|metadata| {
        !(metadata.level() == &Level::DEBUG && metadata.target().starts_with("hyper"))
    });

    let stdout_filter =
        std::env::var("LORELINK_LOG").unwrap_or_else(|_| STDOUT_FILTER.to_string());

    let stdout_log = fmt::layer()
        .with_writer(io::stdout)
        .with_filter(EnvFilter::new(stdout_filter))
        .with_filter(custom_filter);

    let log_dir = std::env::var("LORELINK_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    let file_appender = rolling::daily(log_dir, "lorelink.log");
    let file_log = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_filter(EnvFilter::new(FILE_FILTER));

    tracing_subscriber::Registry::default()
        .with(stdout_log)
        .with(file_log)
        .init();
}

use tracing_subscriber::{
    fmt::{
        format::{self, Compact, Format},
        time::ChronoLocal,
    },
    EnvFilter,
};

fn event_format() -> Format<Compact, ChronoLocal> {
    format::format()
        .with_level(true)
        .with_target(false)
        //.with_thread_ids(true)
        .with_timer(ChronoLocal::new("[%m-%d %H:%M:%S%.3f]".to_string()))
        .compact()
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::from_default_env()
        .add_directive(default.parse().expect("valid log directive"))
        .add_directive("info".parse().expect("valid log directive"))
}

pub fn init_log() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter("proxy=info"))
        .event_format(event_format())
        .init();
}

/// routes output through the test harness capture, safe to call from every test
pub fn init_test_log() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter("proxy=debug"))
        .event_format(event_format())
        .with_test_writer()
        .try_init();
}

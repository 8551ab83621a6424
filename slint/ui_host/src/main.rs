use tracing_subscriber::EnvFilter;

slint::include_modules!();

/// Logs go to stderr; stdout carries the protocol frames.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

mirror_ui_host_runtime::app_main!(AppWindow, MirrorRow, init_tracing);
